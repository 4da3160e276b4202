//! Top-level hprof records.

use crate::parser::gc_record::GcRecord;

#[derive(Debug, Clone, Default)]
pub struct LoadClassData {
    pub serial_number: u32,
    pub class_object_id: u64,
    pub stack_trace_serial_number: u32,
    pub class_name_id: u64,
}

#[derive(Debug, Clone, Default)]
pub struct StackFrameData {
    pub stack_frame_id: u64,
    pub method_name_id: u64,
    pub method_signature_id: u64,
    pub source_file_name_id: u64,
    pub class_serial_number: u32,
    pub line_number: i32,
}

#[derive(Debug, Clone, Default)]
pub struct StackTraceData {
    pub serial_number: u32,
    pub thread_serial_number: u32,
    pub stack_frame_ids: Vec<u64>,
}

#[derive(Debug)]
pub enum Record {
    Utf8String {
        id: u64,
        str: Box<str>,
    },
    LoadClass(LoadClassData),
    UnloadClass {
        serial_number: u32,
    },
    StackFrame(StackFrameData),
    StackTrace(StackTraceData),
    StartThread {
        thread_serial_number: u32,
        thread_object_id: u64,
        stack_trace_serial_number: u32,
        thread_name_id: u64,
        thread_group_name_id: u64,
        thread_group_parent_name_id: u64,
    },
    EndThread {
        thread_serial_number: u32,
    },
    AllocationSites,
    HeapSummary {
        total_live_bytes: u32,
        total_live_instances: u32,
        total_bytes_allocated: u64,
        total_instances_allocated: u64,
    },
    ControlSettings,
    CpuSamples,
    HeapDumpStart {
        length: u32,
    },
    HeapDumpEnd,
    GcSegment(GcRecord),
}
