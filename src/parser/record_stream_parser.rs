//! Chunked streaming parse of the record stream.
//!
//! The parser owns a carry-over buffer: each prefetched chunk is appended,
//! as many complete records as possible are decoded, and the partial tail is
//! kept for the next chunk. The absolute byte offset of every record is
//! tracked so structural failures can name the exact position.

use std::thread;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};

use crate::errors::HprofRetainError;
use crate::parser::record::Record;
use crate::parser::record_parser::*;

const RECORD_HEADER_LENGTH: usize = 9; // tag + microseconds + body length

pub struct HprofRecordStreamParser {
    id_size: u32,
    file_len: u64,
    // absolute offset of the next unparsed byte
    offset: u64,
    // bytes left in the currently open HEAP_DUMP / HEAP_DUMP_SEGMENT body
    segment_remaining: u64,
    loop_buffer: Vec<u8>,
}

impl HprofRecordStreamParser {
    pub fn new(id_size: u32, file_len: u64, start_offset: u64, initial_loop_buffer: Vec<u8>) -> Self {
        HprofRecordStreamParser {
            id_size,
            file_len,
            offset: start_offset,
            segment_remaining: 0,
            loop_buffer: initial_loop_buffer,
        }
    }

    pub fn start(
        mut self,
        receive_data: Receiver<Vec<u8>>,
        send_pooled_data: Sender<Vec<u8>>,
        send_progress: Sender<u64>,
        receive_pooled_vec: Receiver<Vec<Record>>,
        send_records: Sender<Result<Vec<Record>, HprofRetainError>>,
    ) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("hprof-parser".to_string())
            .spawn(move || loop {
                match receive_data.recv() {
                    Ok(mut chunk) => {
                        self.loop_buffer.extend_from_slice(&chunk);
                        chunk.clear();
                        // pool sends are best-effort, the peer may be gone
                        send_pooled_data.send(chunk).unwrap_or_default();

                        let mut records = receive_pooled_vec.try_recv().unwrap_or_default();
                        match self.drain_records(false, &mut records) {
                            Ok(()) => {
                                if !records.is_empty()
                                    && send_records.send(Ok(records)).is_err()
                                {
                                    return;
                                }
                                send_progress.send(self.offset).unwrap_or_default();
                            }
                            Err(e) => {
                                send_records.send(Err(e)).unwrap_or_default();
                                return;
                            }
                        }
                    }
                    Err(_) => {
                        // prefetcher done: flush whatever is decodable, then
                        // apply the end-of-stream policy to the tail
                        let mut records = receive_pooled_vec.try_recv().unwrap_or_default();
                        match self.drain_records(true, &mut records) {
                            Ok(()) => {
                                if !records.is_empty() {
                                    send_records.send(Ok(records)).unwrap_or_default();
                                }
                            }
                            Err(e) => {
                                send_records.send(Err(e)).unwrap_or_default();
                            }
                        }
                        return;
                    }
                }
            })
    }

    /// Decode as many complete records as the buffer holds into `out`.
    ///
    /// With `eof` set, an undecodable tail shorter than a record header (and
    /// outside any heap segment) is a warning; anything else still pending is
    /// a structural failure at the offending record's start offset.
    pub(crate) fn drain_records(
        &mut self,
        eof: bool,
        out: &mut Vec<Record>,
    ) -> Result<(), HprofRetainError> {
        let mut pos = 0usize;
        let result = loop {
            let available = &self.loop_buffer[pos..];
            if available.is_empty() {
                break Ok(());
            }

            if self.segment_remaining > 0 {
                match parse_gc_sub_record(available, self.id_size) {
                    Ok((rest, record)) => {
                        let consumed = available.len() - rest.len();
                        if consumed as u64 > self.segment_remaining {
                            break Err(HprofRetainError::malformed(
                                self.offset,
                                "heap sub-record overruns its segment",
                            ));
                        }
                        self.segment_remaining -= consumed as u64;
                        self.offset += consumed as u64;
                        pos += consumed;
                        out.push(Record::GcSegment(record));
                    }
                    Err(nom::Err::Incomplete(_)) => {
                        if eof {
                            break Err(HprofRetainError::malformed(
                                self.offset,
                                "stream ends inside a heap sub-record",
                            ));
                        }
                        break Ok(());
                    }
                    Err(_) => {
                        break Err(HprofRetainError::malformed(
                            self.offset,
                            format!("invalid heap sub-record (tag 0x{:02x})", available[0]),
                        ));
                    }
                }
                continue;
            }

            if available.len() < RECORD_HEADER_LENGTH {
                if eof {
                    log::warn!(
                        "ignoring {} truncated trailing bytes at end of dump",
                        available.len()
                    );
                    pos += available.len();
                }
                break Ok(());
            }

            let tag = available[0];
            let length = u32::from_be_bytes([
                available[5],
                available[6],
                available[7],
                available[8],
            ]);
            let record_start = self.offset;

            if !is_known_tag(tag) {
                break Err(HprofRetainError::malformed(
                    record_start,
                    format!("unknown record tag 0x{tag:02x}"),
                ));
            }
            if record_start + RECORD_HEADER_LENGTH as u64 + length as u64 > self.file_len {
                break Err(HprofRetainError::malformed(
                    record_start,
                    format!(
                        "record (tag 0x{tag:02x}) declares {length} body bytes past the end of the stream"
                    ),
                ));
            }

            match tag {
                TAG_HEAP_DUMP | TAG_HEAP_DUMP_SEGMENT => {
                    self.segment_remaining = length as u64;
                    self.offset += RECORD_HEADER_LENGTH as u64;
                    pos += RECORD_HEADER_LENGTH;
                    out.push(Record::HeapDumpStart { length });
                }
                TAG_HEAP_DUMP_END => {
                    // the body length is normally zero; skip it if present
                    if available.len() < RECORD_HEADER_LENGTH + length as usize {
                        break Ok(());
                    }
                    self.offset += RECORD_HEADER_LENGTH as u64 + length as u64;
                    pos += RECORD_HEADER_LENGTH + length as usize;
                    out.push(Record::HeapDumpEnd);
                }
                _ => {
                    if available.len() < RECORD_HEADER_LENGTH + length as usize {
                        // length already validated against the file, so more
                        // data is still in flight
                        break Ok(());
                    }
                    let body =
                        &available[RECORD_HEADER_LENGTH..RECORD_HEADER_LENGTH + length as usize];
                    match parse_body(tag, length, body, self.id_size, record_start) {
                        Ok(record) => out.push(record),
                        Err(e) => break Err(e),
                    }
                    self.offset += RECORD_HEADER_LENGTH as u64 + length as u64;
                    pos += RECORD_HEADER_LENGTH + length as usize;
                }
            }
        };
        self.loop_buffer.drain(..pos);
        result
    }
}

fn is_known_tag(tag: u8) -> bool {
    matches!(
        tag,
        TAG_STRING
            | TAG_LOAD_CLASS
            | TAG_UNLOAD_CLASS
            | TAG_STACK_FRAME
            | TAG_STACK_TRACE
            | TAG_ALLOC_SITES
            | TAG_HEAP_SUMMARY
            | TAG_START_THREAD
            | TAG_END_THREAD
            | TAG_HEAP_DUMP
            | TAG_CPU_SAMPLES
            | TAG_CONTROL_SETTINGS
            | TAG_HEAP_DUMP_SEGMENT
            | TAG_HEAP_DUMP_END
    )
}

fn parse_body(
    tag: u8,
    length: u32,
    body: &[u8],
    id_size: u32,
    record_start: u64,
) -> Result<Record, HprofRetainError> {
    let parsed = match tag {
        TAG_STRING => parse_utf8_string(body, id_size, length).map(|(_, r)| r),
        TAG_LOAD_CLASS => parse_load_class(body, id_size).map(|(_, r)| r),
        TAG_UNLOAD_CLASS => parse_unload_class(body).map(|(_, r)| r),
        TAG_STACK_FRAME => parse_stack_frame(body, id_size).map(|(_, r)| r),
        TAG_STACK_TRACE => parse_stack_trace(body, id_size).map(|(_, r)| r),
        TAG_START_THREAD => parse_start_thread(body, id_size).map(|(_, r)| r),
        TAG_END_THREAD => parse_end_thread(body).map(|(_, r)| r),
        TAG_HEAP_SUMMARY => parse_heap_summary(body).map(|(_, r)| r),
        // bodies with no graph information are skipped wholesale
        TAG_ALLOC_SITES => Ok(Record::AllocationSites),
        TAG_CPU_SAMPLES => Ok(Record::CpuSamples),
        TAG_CONTROL_SETTINGS => Ok(Record::ControlSettings),
        _ => unreachable!("dispatch covers every known tag"),
    };
    parsed.map_err(|_| {
        HprofRetainError::malformed(record_start, format!("invalid record body (tag 0x{tag:02x})"))
    })
}

/// Synchronous convenience: parse a fully buffered stream section in one
/// call, applying the end-of-stream policy at the end of the slice.
pub fn parse_buffered(
    id_size: u32,
    file_len: u64,
    start_offset: u64,
    bytes: &[u8],
) -> Result<Vec<Record>, HprofRetainError> {
    let mut parser = HprofRecordStreamParser::new(id_size, file_len, start_offset, bytes.to_vec());
    let mut records = Vec::new();
    parser.drain_records(true, &mut records)?;
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::gc_record::GcRecord;

    fn record(tag: u8, body: &[u8]) -> Vec<u8> {
        let mut bytes = vec![tag];
        bytes.extend_from_slice(&0u32.to_be_bytes());
        bytes.extend_from_slice(&(body.len() as u32).to_be_bytes());
        bytes.extend_from_slice(body);
        bytes
    }

    fn string_record(id: u64, s: &str) -> Vec<u8> {
        let mut body = id.to_be_bytes().to_vec();
        body.extend_from_slice(s.as_bytes());
        record(TAG_STRING, &body)
    }

    #[test]
    fn parses_consecutive_records() {
        let mut stream = string_record(1, "java/lang/Object");
        stream.extend_from_slice(&string_record(2, "value"));
        let records = parse_buffered(8, stream.len() as u64, 0, &stream).unwrap();
        assert_eq!(records.len(), 2);
        assert!(matches!(&records[0], Record::Utf8String { id: 1, .. }));
        assert!(matches!(&records[1], Record::Utf8String { id: 2, .. }));
    }

    #[test]
    fn parses_heap_segment_sub_records() {
        let mut body = vec![TAG_GC_ROOT_UNKNOWN];
        body.extend_from_slice(&0x42u64.to_be_bytes());
        let mut stream = record(TAG_HEAP_DUMP_SEGMENT, &[]);
        // patch the declared segment length, then append the sub-record bytes
        let seg_len = body.len() as u32;
        stream[5..9].copy_from_slice(&seg_len.to_be_bytes());
        stream.extend_from_slice(&body);
        stream.extend_from_slice(&record(TAG_HEAP_DUMP_END, &[]));

        let records = parse_buffered(8, stream.len() as u64, 0, &stream).unwrap();
        assert_eq!(records.len(), 3);
        assert!(matches!(records[0], Record::HeapDumpStart { .. }));
        assert!(matches!(
            records[1],
            Record::GcSegment(GcRecord::RootUnknown { object_id: 0x42 })
        ));
        assert!(matches!(records[2], Record::HeapDumpEnd));
    }

    #[test]
    fn unknown_tag_reports_record_offset() {
        let mut stream = string_record(1, "x");
        let first_len = stream.len() as u64;
        stream.extend_from_slice(&record(0x99, &[]));
        let err = parse_buffered(8, stream.len() as u64, 0, &stream).unwrap_err();
        match err {
            HprofRetainError::MalformedDump { offset, .. } => assert_eq!(offset, first_len),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn overrunning_length_reports_record_offset() {
        let mut stream = string_record(1, "x");
        let first_len = stream.len() as u64;
        // claim a 100-byte body but supply 4
        let mut truncated = vec![TAG_STRING];
        truncated.extend_from_slice(&0u32.to_be_bytes());
        truncated.extend_from_slice(&100u32.to_be_bytes());
        truncated.extend_from_slice(&[0u8; 4]);
        stream.extend_from_slice(&truncated);

        let err = parse_buffered(8, stream.len() as u64, 0, &stream).unwrap_err();
        match err {
            HprofRetainError::MalformedDump { offset, .. } => assert_eq!(offset, first_len),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn short_trailing_tail_is_tolerated() {
        let mut stream = string_record(7, "ok");
        stream.extend_from_slice(&[TAG_STRING, 0, 0]); // 3 stray bytes, less than a header
        let records = parse_buffered(8, stream.len() as u64, 0, &stream).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn records_split_across_chunks_are_reassembled() {
        let stream = string_record(9, "split-me-in-two");
        let (first, second) = stream.split_at(11);
        let mut parser =
            HprofRecordStreamParser::new(8, stream.len() as u64, 0, first.to_vec());
        let mut records = Vec::new();
        parser.drain_records(false, &mut records).unwrap();
        assert!(records.is_empty());
        parser.loop_buffer.extend_from_slice(second);
        parser.drain_records(true, &mut records).unwrap();
        assert_eq!(records.len(), 1);
    }
}
