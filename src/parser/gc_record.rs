//! Typed heap sub-records found inside HEAP_DUMP / HEAP_DUMP_SEGMENT bodies.

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum FieldType {
    Object = 2,
    Bool = 4,
    Char = 5,
    Float = 6,
    Double = 7,
    Byte = 8,
    Short = 9,
    Int = 10,
    Long = 11,
}

impl FieldType {
    pub fn from_tag(v: u8) -> Option<FieldType> {
        match v {
            2 => Some(FieldType::Object),
            4 => Some(FieldType::Bool),
            5 => Some(FieldType::Char),
            6 => Some(FieldType::Float),
            7 => Some(FieldType::Double),
            8 => Some(FieldType::Byte),
            9 => Some(FieldType::Short),
            10 => Some(FieldType::Int),
            11 => Some(FieldType::Long),
            _ => None,
        }
    }

    pub fn tag(&self) -> u8 {
        *self as u8
    }

    /// Byte width of one value of this type in instance data and arrays.
    /// Object references are identifier-sized.
    pub fn byte_size(&self, id_size: u32) -> u32 {
        match self {
            FieldType::Object => id_size,
            FieldType::Byte | FieldType::Bool => 1,
            FieldType::Char | FieldType::Short => 2,
            FieldType::Float | FieldType::Int => 4,
            FieldType::Double | FieldType::Long => 8,
        }
    }

    /// The primitive array types, in tag order. Used to synthesize the
    /// `boolean[]`/`int[]`/... class-table entries deterministically.
    pub const PRIMITIVES: [FieldType; 8] = [
        FieldType::Bool,
        FieldType::Char,
        FieldType::Float,
        FieldType::Double,
        FieldType::Byte,
        FieldType::Short,
        FieldType::Int,
        FieldType::Long,
    ];

    pub fn primitive_label(&self) -> &'static str {
        match self {
            FieldType::Bool => "boolean",
            FieldType::Char => "char",
            FieldType::Float => "float",
            FieldType::Double => "double",
            FieldType::Byte => "byte",
            FieldType::Short => "short",
            FieldType::Int => "int",
            FieldType::Long => "long",
            FieldType::Object => "object",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum FieldValue {
    Bool(bool),
    Byte(i8),
    Char(u16),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Object(u64),
}

#[derive(Debug, Clone)]
pub struct FieldInfo {
    pub name_id: u64,
    pub field_type: FieldType,
}

#[derive(Debug)]
pub enum GcRecord {
    RootUnknown {
        object_id: u64,
    },
    RootThreadObject {
        thread_object_id: u64,
        thread_serial_number: u32,
        stack_trace_serial_number: u32,
    },
    RootJniGlobal {
        object_id: u64,
        jni_global_ref_id: u64,
    },
    RootJniLocal {
        object_id: u64,
        thread_serial_number: u32,
        frame_number_in_stack_trace: u32,
    },
    RootJavaFrame {
        object_id: u64,
        thread_serial_number: u32,
        frame_number_in_stack_trace: u32,
    },
    RootNativeStack {
        object_id: u64,
        thread_serial_number: u32,
    },
    RootStickyClass {
        object_id: u64,
    },
    RootThreadBlock {
        object_id: u64,
        thread_serial_number: u32,
    },
    RootMonitorUsed {
        object_id: u64,
    },
    InstanceDump {
        object_id: u64,
        stack_trace_serial_number: u32,
        class_object_id: u64,
        data_size: u32,
        field_bytes: Box<[u8]>,
    },
    ObjectArrayDump {
        object_id: u64,
        stack_trace_serial_number: u32,
        array_class_id: u64,
        elements: Box<[u64]>,
    },
    PrimitiveArrayDump {
        object_id: u64,
        stack_trace_serial_number: u32,
        element_type: FieldType,
        number_of_elements: u32,
    },
    ClassDump(Box<ClassDumpFields>), // rare enough to be boxed to avoid large variant cost
}

impl GcRecord {
    /// The identifier this sub-record assigns an ObjectId to, if it is one of
    /// the four addressable record kinds.
    pub fn addressable_id(&self) -> Option<u64> {
        match self {
            GcRecord::InstanceDump { object_id, .. }
            | GcRecord::ObjectArrayDump { object_id, .. }
            | GcRecord::PrimitiveArrayDump { object_id, .. } => Some(*object_id),
            GcRecord::ClassDump(fields) => Some(fields.class_object_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClassDumpFields {
    pub class_object_id: u64,
    pub stack_trace_serial_number: u32,
    pub super_class_object_id: u64,
    pub instance_size: u32,
    pub static_fields: Vec<(FieldInfo, FieldValue)>,
    pub instance_fields: Vec<FieldInfo>,
}

impl ClassDumpFields {
    /// Total byte footprint of the static field values, used for the class
    /// object's shallow size.
    pub fn static_data_size(&self, id_size: u32) -> u64 {
        self.static_fields
            .iter()
            .map(|(info, _)| info.field_type.byte_size(id_size) as u64)
            .sum()
    }
}
