//! Synthetic hprof dump construction for end-to-end tests.
#![allow(dead_code)]

pub const TAG_STRING: u8 = 0x01;
pub const TAG_LOAD_CLASS: u8 = 0x02;
pub const TAG_HEAP_DUMP_SEGMENT: u8 = 0x1C;
pub const TAG_HEAP_DUMP_END: u8 = 0x2C;

pub const TAG_GC_ROOT_UNKNOWN: u8 = 0xFF;
pub const TAG_GC_ROOT_STICKY_CLASS: u8 = 0x05;
pub const TAG_GC_CLASS_DUMP: u8 = 0x20;
pub const TAG_GC_INSTANCE_DUMP: u8 = 0x21;
pub const TAG_GC_OBJECT_ARRAY_DUMP: u8 = 0x22;
pub const TAG_GC_PRIMITIVE_ARRAY_DUMP: u8 = 0x23;

const OBJECT_TYPE_TAG: u8 = 2;

pub fn file_header() -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(b"JAVA PROFILE 1.0.2");
    bytes.push(0);
    bytes.extend_from_slice(&8u32.to_be_bytes());
    bytes.extend_from_slice(&0u64.to_be_bytes());
    bytes
}

pub fn record(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut bytes = vec![tag];
    bytes.extend_from_slice(&0u32.to_be_bytes());
    bytes.extend_from_slice(&(body.len() as u32).to_be_bytes());
    bytes.extend_from_slice(body);
    bytes
}

/// Builds a dump with one heap-dump segment. Heap sub-records appear in call
/// order, which fixes the ObjectId assignment.
#[derive(Default)]
pub struct DumpBuilder {
    records: Vec<u8>,
    heap: Vec<u8>,
}

impl DumpBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn string(mut self, id: u64, value: &str) -> Self {
        let mut body = id.to_be_bytes().to_vec();
        body.extend_from_slice(value.as_bytes());
        self.records.extend_from_slice(&record(TAG_STRING, &body));
        self
    }

    pub fn load_class(mut self, serial: u32, class_object_id: u64, name_id: u64) -> Self {
        let mut body = serial.to_be_bytes().to_vec();
        body.extend_from_slice(&class_object_id.to_be_bytes());
        body.extend_from_slice(&0u32.to_be_bytes());
        body.extend_from_slice(&name_id.to_be_bytes());
        self.records
            .extend_from_slice(&record(TAG_LOAD_CLASS, &body));
        self
    }

    /// CLASS_DUMP with object-typed instance fields and object-typed statics.
    pub fn class(
        mut self,
        class_object_id: u64,
        super_class_id: u64,
        instance_size: u32,
        object_field_name_ids: &[u64],
        static_fields: &[(u64, u64)], // (name id, referenced object id)
    ) -> Self {
        self.heap.push(TAG_GC_CLASS_DUMP);
        self.heap.extend_from_slice(&class_object_id.to_be_bytes());
        self.heap.extend_from_slice(&0u32.to_be_bytes());
        self.heap.extend_from_slice(&super_class_id.to_be_bytes());
        for _ in 0..5 {
            self.heap.extend_from_slice(&0u64.to_be_bytes());
        }
        self.heap.extend_from_slice(&instance_size.to_be_bytes());
        self.heap.extend_from_slice(&0u16.to_be_bytes()); // constant pool
        self.heap
            .extend_from_slice(&(static_fields.len() as u16).to_be_bytes());
        for (name_id, target) in static_fields {
            self.heap.extend_from_slice(&name_id.to_be_bytes());
            self.heap.push(OBJECT_TYPE_TAG);
            self.heap.extend_from_slice(&target.to_be_bytes());
        }
        self.heap
            .extend_from_slice(&(object_field_name_ids.len() as u16).to_be_bytes());
        for name_id in object_field_name_ids {
            self.heap.extend_from_slice(&name_id.to_be_bytes());
            self.heap.push(OBJECT_TYPE_TAG);
        }
        self
    }

    /// INSTANCE_DUMP whose data is the given object references, matching a
    /// class whose instance fields are all object-typed.
    pub fn instance(mut self, object_id: u64, class_object_id: u64, references: &[u64]) -> Self {
        self.heap.push(TAG_GC_INSTANCE_DUMP);
        self.heap.extend_from_slice(&object_id.to_be_bytes());
        self.heap.extend_from_slice(&0u32.to_be_bytes());
        self.heap.extend_from_slice(&class_object_id.to_be_bytes());
        self.heap
            .extend_from_slice(&((references.len() * 8) as u32).to_be_bytes());
        for reference in references {
            self.heap.extend_from_slice(&reference.to_be_bytes());
        }
        self
    }

    pub fn object_array(
        mut self,
        object_id: u64,
        array_class_id: u64,
        elements: &[u64],
    ) -> Self {
        self.heap.push(TAG_GC_OBJECT_ARRAY_DUMP);
        self.heap.extend_from_slice(&object_id.to_be_bytes());
        self.heap.extend_from_slice(&0u32.to_be_bytes());
        self.heap
            .extend_from_slice(&(elements.len() as u32).to_be_bytes());
        self.heap.extend_from_slice(&array_class_id.to_be_bytes());
        for element in elements {
            self.heap.extend_from_slice(&element.to_be_bytes());
        }
        self
    }

    pub fn primitive_array(mut self, object_id: u64, type_tag: u8, elements: &[u8]) -> Self {
        self.heap.push(TAG_GC_PRIMITIVE_ARRAY_DUMP);
        self.heap.extend_from_slice(&object_id.to_be_bytes());
        self.heap.extend_from_slice(&0u32.to_be_bytes());
        self.heap
            .extend_from_slice(&(elements.len() as u32).to_be_bytes());
        self.heap.push(type_tag); // byte-sized types only in tests
        self.heap.extend_from_slice(elements);
        self
    }

    pub fn root(mut self, object_id: u64) -> Self {
        self.heap.push(TAG_GC_ROOT_UNKNOWN);
        self.heap.extend_from_slice(&object_id.to_be_bytes());
        self
    }

    pub fn sticky_class_root(mut self, class_object_id: u64) -> Self {
        self.heap.push(TAG_GC_ROOT_STICKY_CLASS);
        self.heap.extend_from_slice(&class_object_id.to_be_bytes());
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut bytes = file_header();
        bytes.extend_from_slice(&self.records);
        bytes.extend_from_slice(&record(TAG_HEAP_DUMP_SEGMENT, &self.heap));
        bytes.extend_from_slice(&record(TAG_HEAP_DUMP_END, &[]));
        bytes
    }
}
