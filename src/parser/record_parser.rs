//! nom decoders for top-level record bodies and heap sub-records.
//!
//! All integer fields are big-endian. Identifier fields are 4 or 8 bytes
//! wide depending on the file header; every parser that touches one takes
//! the width as an argument.

use nom::bytes::streaming::take;
use nom::error::{Error, ErrorKind};
use nom::number::streaming::{be_i32, be_u16, be_u32, be_u64, be_u8};
use nom::IResult;

use crate::parser::gc_record::{ClassDumpFields, FieldInfo, FieldType, FieldValue, GcRecord};
use crate::parser::record::{LoadClassData, Record, StackFrameData, StackTraceData};

// Top-level record tags.
pub const TAG_STRING: u8 = 0x01;
pub const TAG_LOAD_CLASS: u8 = 0x02;
pub const TAG_UNLOAD_CLASS: u8 = 0x03;
pub const TAG_STACK_FRAME: u8 = 0x04;
pub const TAG_STACK_TRACE: u8 = 0x05;
pub const TAG_ALLOC_SITES: u8 = 0x06;
pub const TAG_HEAP_SUMMARY: u8 = 0x07;
pub const TAG_START_THREAD: u8 = 0x0A;
pub const TAG_END_THREAD: u8 = 0x0B;
pub const TAG_HEAP_DUMP: u8 = 0x0C;
pub const TAG_CPU_SAMPLES: u8 = 0x0D;
pub const TAG_CONTROL_SETTINGS: u8 = 0x0E;
pub const TAG_HEAP_DUMP_SEGMENT: u8 = 0x1C;
pub const TAG_HEAP_DUMP_END: u8 = 0x2C;

// Heap sub-record tags.
pub const TAG_GC_ROOT_UNKNOWN: u8 = 0xFF;
pub const TAG_GC_ROOT_JNI_GLOBAL: u8 = 0x01;
pub const TAG_GC_ROOT_JNI_LOCAL: u8 = 0x02;
pub const TAG_GC_ROOT_JAVA_FRAME: u8 = 0x03;
pub const TAG_GC_ROOT_NATIVE_STACK: u8 = 0x04;
pub const TAG_GC_ROOT_STICKY_CLASS: u8 = 0x05;
pub const TAG_GC_ROOT_THREAD_BLOCK: u8 = 0x06;
pub const TAG_GC_ROOT_MONITOR_USED: u8 = 0x07;
pub const TAG_GC_ROOT_THREAD_OBJECT: u8 = 0x08;
pub const TAG_GC_CLASS_DUMP: u8 = 0x20;
pub const TAG_GC_INSTANCE_DUMP: u8 = 0x21;
pub const TAG_GC_OBJECT_ARRAY_DUMP: u8 = 0x22;
pub const TAG_GC_PRIMITIVE_ARRAY_DUMP: u8 = 0x23;

fn parse_id(input: &[u8], id_size: u32) -> IResult<&[u8], u64> {
    if id_size == 8 {
        be_u64(input)
    } else {
        let (rest, v) = be_u32(input)?;
        Ok((rest, u64::from(v)))
    }
}

fn fail<T>(input: &[u8]) -> IResult<&[u8], T> {
    Err(nom::Err::Failure(Error::new(input, ErrorKind::Tag)))
}

pub fn parse_field_value(
    input: &[u8],
    field_type: FieldType,
    id_size: u32,
) -> IResult<&[u8], FieldValue> {
    match field_type {
        FieldType::Object => {
            let (rest, v) = parse_id(input, id_size)?;
            Ok((rest, FieldValue::Object(v)))
        }
        FieldType::Bool => {
            let (rest, v) = be_u8(input)?;
            Ok((rest, FieldValue::Bool(v != 0)))
        }
        FieldType::Char => {
            let (rest, v) = be_u16(input)?;
            Ok((rest, FieldValue::Char(v)))
        }
        FieldType::Float => {
            let (rest, v) = be_u32(input)?;
            Ok((rest, FieldValue::Float(f32::from_bits(v))))
        }
        FieldType::Double => {
            let (rest, v) = be_u64(input)?;
            Ok((rest, FieldValue::Double(f64::from_bits(v))))
        }
        FieldType::Byte => {
            let (rest, v) = be_u8(input)?;
            Ok((rest, FieldValue::Byte(v as i8)))
        }
        FieldType::Short => {
            let (rest, v) = be_u16(input)?;
            Ok((rest, FieldValue::Short(v as i16)))
        }
        FieldType::Int => {
            let (rest, v) = be_i32(input)?;
            Ok((rest, FieldValue::Int(v)))
        }
        FieldType::Long => {
            let (rest, v) = be_u64(input)?;
            Ok((rest, FieldValue::Long(v as i64)))
        }
    }
}

/// STRING body: identifier followed by the UTF-8 payload; the payload length
/// is the record length minus the identifier.
pub fn parse_utf8_string(input: &[u8], id_size: u32, body_len: u32) -> IResult<&[u8], Record> {
    let (rest, id) = parse_id(input, id_size)?;
    let (rest, bytes) = take(body_len.saturating_sub(id_size) as usize)(rest)?;
    let str = String::from_utf8_lossy(bytes).into_owned().into_boxed_str();
    Ok((rest, Record::Utf8String { id, str }))
}

pub fn parse_load_class(input: &[u8], id_size: u32) -> IResult<&[u8], Record> {
    let (rest, serial_number) = be_u32(input)?;
    let (rest, class_object_id) = parse_id(rest, id_size)?;
    let (rest, stack_trace_serial_number) = be_u32(rest)?;
    let (rest, class_name_id) = parse_id(rest, id_size)?;
    Ok((
        rest,
        Record::LoadClass(LoadClassData {
            serial_number,
            class_object_id,
            stack_trace_serial_number,
            class_name_id,
        }),
    ))
}

pub fn parse_unload_class(input: &[u8]) -> IResult<&[u8], Record> {
    let (rest, serial_number) = be_u32(input)?;
    Ok((rest, Record::UnloadClass { serial_number }))
}

pub fn parse_stack_frame(input: &[u8], id_size: u32) -> IResult<&[u8], Record> {
    let (rest, stack_frame_id) = parse_id(input, id_size)?;
    let (rest, method_name_id) = parse_id(rest, id_size)?;
    let (rest, method_signature_id) = parse_id(rest, id_size)?;
    let (rest, source_file_name_id) = parse_id(rest, id_size)?;
    let (rest, class_serial_number) = be_u32(rest)?;
    let (rest, line_number) = be_i32(rest)?;
    Ok((
        rest,
        Record::StackFrame(StackFrameData {
            stack_frame_id,
            method_name_id,
            method_signature_id,
            source_file_name_id,
            class_serial_number,
            line_number,
        }),
    ))
}

pub fn parse_stack_trace(input: &[u8], id_size: u32) -> IResult<&[u8], Record> {
    let (rest, serial_number) = be_u32(input)?;
    let (rest, thread_serial_number) = be_u32(rest)?;
    let (mut rest, frame_count) = be_u32(rest)?;
    let mut stack_frame_ids = Vec::with_capacity(frame_count as usize);
    for _ in 0..frame_count {
        let (r, id) = parse_id(rest, id_size)?;
        stack_frame_ids.push(id);
        rest = r;
    }
    Ok((
        rest,
        Record::StackTrace(StackTraceData {
            serial_number,
            thread_serial_number,
            stack_frame_ids,
        }),
    ))
}

pub fn parse_start_thread(input: &[u8], id_size: u32) -> IResult<&[u8], Record> {
    let (rest, thread_serial_number) = be_u32(input)?;
    let (rest, thread_object_id) = parse_id(rest, id_size)?;
    let (rest, stack_trace_serial_number) = be_u32(rest)?;
    let (rest, thread_name_id) = parse_id(rest, id_size)?;
    let (rest, thread_group_name_id) = parse_id(rest, id_size)?;
    let (rest, thread_group_parent_name_id) = parse_id(rest, id_size)?;
    Ok((
        rest,
        Record::StartThread {
            thread_serial_number,
            thread_object_id,
            stack_trace_serial_number,
            thread_name_id,
            thread_group_name_id,
            thread_group_parent_name_id,
        },
    ))
}

pub fn parse_end_thread(input: &[u8]) -> IResult<&[u8], Record> {
    let (rest, thread_serial_number) = be_u32(input)?;
    Ok((rest, Record::EndThread {
        thread_serial_number,
    }))
}

pub fn parse_heap_summary(input: &[u8]) -> IResult<&[u8], Record> {
    let (rest, total_live_bytes) = be_u32(input)?;
    let (rest, total_live_instances) = be_u32(rest)?;
    let (rest, total_bytes_allocated) = be_u64(rest)?;
    let (rest, total_instances_allocated) = be_u64(rest)?;
    Ok((
        rest,
        Record::HeapSummary {
            total_live_bytes,
            total_live_instances,
            total_bytes_allocated,
            total_instances_allocated,
        },
    ))
}

/// Decode one heap sub-record. Returns `Incomplete` when the input ends
/// before the record does and `Failure` on an unknown sub-tag or field type.
pub fn parse_gc_sub_record(input: &[u8], id_size: u32) -> IResult<&[u8], GcRecord> {
    let (rest, sub_tag) = be_u8(input)?;
    match sub_tag {
        TAG_GC_ROOT_UNKNOWN => {
            let (rest, object_id) = parse_id(rest, id_size)?;
            Ok((rest, GcRecord::RootUnknown { object_id }))
        }
        TAG_GC_ROOT_JNI_GLOBAL => {
            let (rest, object_id) = parse_id(rest, id_size)?;
            let (rest, jni_global_ref_id) = parse_id(rest, id_size)?;
            Ok((
                rest,
                GcRecord::RootJniGlobal {
                    object_id,
                    jni_global_ref_id,
                },
            ))
        }
        TAG_GC_ROOT_JNI_LOCAL => {
            let (rest, object_id) = parse_id(rest, id_size)?;
            let (rest, thread_serial_number) = be_u32(rest)?;
            let (rest, frame_number_in_stack_trace) = be_u32(rest)?;
            Ok((
                rest,
                GcRecord::RootJniLocal {
                    object_id,
                    thread_serial_number,
                    frame_number_in_stack_trace,
                },
            ))
        }
        TAG_GC_ROOT_JAVA_FRAME => {
            let (rest, object_id) = parse_id(rest, id_size)?;
            let (rest, thread_serial_number) = be_u32(rest)?;
            let (rest, frame_number_in_stack_trace) = be_u32(rest)?;
            Ok((
                rest,
                GcRecord::RootJavaFrame {
                    object_id,
                    thread_serial_number,
                    frame_number_in_stack_trace,
                },
            ))
        }
        TAG_GC_ROOT_NATIVE_STACK => {
            let (rest, object_id) = parse_id(rest, id_size)?;
            let (rest, thread_serial_number) = be_u32(rest)?;
            Ok((
                rest,
                GcRecord::RootNativeStack {
                    object_id,
                    thread_serial_number,
                },
            ))
        }
        TAG_GC_ROOT_STICKY_CLASS => {
            let (rest, object_id) = parse_id(rest, id_size)?;
            Ok((rest, GcRecord::RootStickyClass { object_id }))
        }
        TAG_GC_ROOT_THREAD_BLOCK => {
            let (rest, object_id) = parse_id(rest, id_size)?;
            let (rest, thread_serial_number) = be_u32(rest)?;
            Ok((
                rest,
                GcRecord::RootThreadBlock {
                    object_id,
                    thread_serial_number,
                },
            ))
        }
        TAG_GC_ROOT_MONITOR_USED => {
            let (rest, object_id) = parse_id(rest, id_size)?;
            Ok((rest, GcRecord::RootMonitorUsed { object_id }))
        }
        TAG_GC_ROOT_THREAD_OBJECT => {
            let (rest, thread_object_id) = parse_id(rest, id_size)?;
            let (rest, thread_serial_number) = be_u32(rest)?;
            let (rest, stack_trace_serial_number) = be_u32(rest)?;
            Ok((
                rest,
                GcRecord::RootThreadObject {
                    thread_object_id,
                    thread_serial_number,
                    stack_trace_serial_number,
                },
            ))
        }
        TAG_GC_CLASS_DUMP => parse_class_dump(rest, id_size),
        TAG_GC_INSTANCE_DUMP => parse_instance_dump(rest, id_size),
        TAG_GC_OBJECT_ARRAY_DUMP => parse_object_array_dump(rest, id_size),
        TAG_GC_PRIMITIVE_ARRAY_DUMP => parse_primitive_array_dump(rest, id_size),
        _ => fail(input),
    }
}

fn parse_class_dump(input: &[u8], id_size: u32) -> IResult<&[u8], GcRecord> {
    let (rest, class_object_id) = parse_id(input, id_size)?;
    let (rest, stack_trace_serial_number) = be_u32(rest)?;
    let (rest, super_class_object_id) = parse_id(rest, id_size)?;
    let (rest, _class_loader_object_id) = parse_id(rest, id_size)?;
    let (rest, _signers_object_id) = parse_id(rest, id_size)?;
    let (rest, _protection_domain_object_id) = parse_id(rest, id_size)?;
    let (rest, _reserved_1) = parse_id(rest, id_size)?;
    let (rest, _reserved_2) = parse_id(rest, id_size)?;
    let (rest, instance_size) = be_u32(rest)?;

    // Constant pool entries carry no graph information; decode and discard.
    let (mut rest, const_pool_size) = be_u16(rest)?;
    for _ in 0..const_pool_size {
        let (r, _const_pool_idx) = be_u16(rest)?;
        let (r, _typed_value) = parse_typed_value(r, id_size)?;
        rest = r;
    }

    let (mut rest, static_field_count) = be_u16(rest)?;
    let mut static_fields = Vec::with_capacity(static_field_count as usize);
    for _ in 0..static_field_count {
        let (r, name_id) = parse_id(rest, id_size)?;
        let (r, (field_type, value)) = parse_typed_value(r, id_size)?;
        static_fields.push((
            FieldInfo {
                name_id,
                field_type,
            },
            value,
        ));
        rest = r;
    }

    let (mut rest, instance_field_count) = be_u16(rest)?;
    let mut instance_fields = Vec::with_capacity(instance_field_count as usize);
    for _ in 0..instance_field_count {
        let (r, name_id) = parse_id(rest, id_size)?;
        let (r, type_tag) = be_u8(r)?;
        let Some(field_type) = FieldType::from_tag(type_tag) else {
            return fail(input);
        };
        instance_fields.push(FieldInfo {
            name_id,
            field_type,
        });
        rest = r;
    }

    Ok((
        rest,
        GcRecord::ClassDump(Box::new(ClassDumpFields {
            class_object_id,
            stack_trace_serial_number,
            super_class_object_id,
            instance_size,
            static_fields,
            instance_fields,
        })),
    ))
}

fn parse_typed_value(input: &[u8], id_size: u32) -> IResult<&[u8], (FieldType, FieldValue)> {
    let (rest, type_tag) = be_u8(input)?;
    let Some(field_type) = FieldType::from_tag(type_tag) else {
        return fail(input);
    };
    let (rest, value) = parse_field_value(rest, field_type, id_size)?;
    Ok((rest, (field_type, value)))
}

fn parse_instance_dump(input: &[u8], id_size: u32) -> IResult<&[u8], GcRecord> {
    let (rest, object_id) = parse_id(input, id_size)?;
    let (rest, stack_trace_serial_number) = be_u32(rest)?;
    let (rest, class_object_id) = parse_id(rest, id_size)?;
    let (rest, data_size) = be_u32(rest)?;
    let (rest, field_bytes) = take(data_size as usize)(rest)?;
    Ok((
        rest,
        GcRecord::InstanceDump {
            object_id,
            stack_trace_serial_number,
            class_object_id,
            data_size,
            field_bytes: field_bytes.to_vec().into_boxed_slice(),
        },
    ))
}

fn parse_object_array_dump(input: &[u8], id_size: u32) -> IResult<&[u8], GcRecord> {
    let (rest, object_id) = parse_id(input, id_size)?;
    let (rest, stack_trace_serial_number) = be_u32(rest)?;
    let (rest, number_of_elements) = be_u32(rest)?;
    let (mut rest, array_class_id) = parse_id(rest, id_size)?;
    let mut elements = Vec::with_capacity(number_of_elements as usize);
    for _ in 0..number_of_elements {
        let (r, element) = parse_id(rest, id_size)?;
        elements.push(element);
        rest = r;
    }
    Ok((
        rest,
        GcRecord::ObjectArrayDump {
            object_id,
            stack_trace_serial_number,
            array_class_id,
            elements: elements.into_boxed_slice(),
        },
    ))
}

fn parse_primitive_array_dump(input: &[u8], id_size: u32) -> IResult<&[u8], GcRecord> {
    let (rest, object_id) = parse_id(input, id_size)?;
    let (rest, stack_trace_serial_number) = be_u32(rest)?;
    let (rest, number_of_elements) = be_u32(rest)?;
    let (rest, type_tag) = be_u8(rest)?;
    let Some(element_type) = FieldType::from_tag(type_tag) else {
        return fail(input);
    };
    // The packed values are dead weight for graph analysis; skip them.
    let (rest, _values) =
        take(number_of_elements as usize * element_type.byte_size(id_size) as usize)(rest)?;
    Ok((
        rest,
        GcRecord::PrimitiveArrayDump {
            object_id,
            stack_trace_serial_number,
            element_type,
            number_of_elements,
        },
    ))
}
