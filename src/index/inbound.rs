//! Outbound-to-inbound inversion under a fixed memory bound.
//!
//! The outbound CSR is scanned once, emitting (target, source) pairs into
//! per-partition buffers that spill to disk when full. Each partition covers
//! a contiguous target-id range and is loaded, sorted and written out on its
//! own, so peak memory is one partition regardless of heap size.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use rayon::slice::ParallelSliceMut;

use crate::config::{CancelToken, CANCEL_CHECK_INTERVAL};
use crate::errors::HprofRetainError;
use crate::index::format::*;

const PAIR_BYTES: u64 = 8;
const MAX_PARTITIONS: u64 = 1024;
const MIN_PARTITION_BUDGET: u64 = 1024 * 1024;

pub fn invert_outbound(
    dir: &Path,
    object_count: u32,
    edge_count: u64,
    memory_budget: usize,
    cancel: &CancelToken,
) -> Result<(), HprofRetainError> {
    let partition_budget = (memory_budget as u64 / 4).max(MIN_PARTITION_BUDGET);
    let partition_count = (edge_count * PAIR_BYTES)
        .div_ceil(partition_budget)
        .clamp(1, MAX_PARTITIONS) as usize;
    let span = (object_count as u64).div_ceil(partition_count as u64).max(1);
    // per-partition in-memory buffer, sized so all buffers together stay
    // within one partition budget
    let buffer_cap = ((partition_budget / partition_count as u64 / PAIR_BYTES) as usize).max(1024);

    let mut partitions: Vec<Partition> = (0..partition_count)
        .map(|p| Partition::new(dir, p))
        .collect();

    // single sequential sweep over the outbound CSR
    let outbound_path = dir.join(OUTBOUND_FILE);
    let mut offsets_reader = BufReader::new(File::open(&outbound_path)?);
    offsets_reader.seek(SeekFrom::Start(INDEX_HEADER_LENGTH))?;
    let data_base = INDEX_HEADER_LENGTH + (object_count as u64 + 1) * 8;
    let mut data_reader = BufReader::new(File::open(&outbound_path)?);
    data_reader.seek(SeekFrom::Start(data_base))?;

    let mut previous = offsets_reader.read_u64::<BigEndian>()?;
    for source in 0..object_count {
        if source as usize % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
            return Err(HprofRetainError::Cancelled);
        }
        let next = offsets_reader.read_u64::<BigEndian>()?;
        for _ in previous..next {
            let target = data_reader.read_u32::<BigEndian>()?;
            let partition = &mut partitions[(target as u64 / span) as usize];
            partition.push(target, source, buffer_cap)?;
        }
        previous = next;
    }

    // per-partition: load, sort, append runs
    let data_path = dir.join("inbound.dat.tmp");
    let mut data_writer = BufWriter::new(File::create(&data_path)?);
    let mut offsets: Vec<u64> = Vec::with_capacity(object_count as usize + 1);
    let mut written = 0u64;

    for (p, partition) in partitions.into_iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(HprofRetainError::Cancelled);
        }
        let mut pairs = partition.into_pairs(partition_budget, memory_budget)?;
        pairs.par_sort_unstable();

        let first = p as u64 * span;
        let last = ((p as u64 + 1) * span).min(object_count as u64);
        let mut cursor = 0usize;
        for target in first..last {
            offsets.push(written);
            while cursor < pairs.len() && pairs[cursor].0 as u64 == target {
                data_writer.write_u32::<BigEndian>(pairs[cursor].1)?;
                written += 1;
                cursor += 1;
            }
        }
    }
    offsets.push(written);
    data_writer.flush()?;
    drop(data_writer);

    compose_csr_file(
        &dir.join(INBOUND_FILE),
        MAGIC_INBOUND,
        object_count as u64,
        &offsets,
        &data_path,
    )
}

struct Partition {
    spill_path: PathBuf,
    spill: Option<BufWriter<File>>,
    buffer: Vec<(u32, u32)>,
}

impl Partition {
    fn new(dir: &Path, index: usize) -> Self {
        Partition {
            spill_path: dir.join(format!("inbound.part-{index}.tmp")),
            spill: None,
            buffer: Vec::new(),
        }
    }

    fn push(&mut self, target: u32, source: u32, buffer_cap: usize) -> std::io::Result<()> {
        self.buffer.push((target, source));
        if self.buffer.len() >= buffer_cap {
            let spill = match self.spill.as_mut() {
                Some(spill) => spill,
                None => self.spill.insert(BufWriter::new(
                    OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&self.spill_path)?,
                )),
            };
            for (t, s) in self.buffer.drain(..) {
                spill.write_u32::<BigEndian>(t)?;
                spill.write_u32::<BigEndian>(s)?;
            }
        }
        Ok(())
    }

    /// All pairs of this partition, spill first. Fails `ResourceExhausted`
    /// if a single partition cannot be sorted within its budget.
    fn into_pairs(
        mut self,
        partition_budget: u64,
        memory_budget: usize,
    ) -> Result<Vec<(u32, u32)>, HprofRetainError> {
        if let Some(mut spill) = self.spill.take() {
            spill.flush()?;
        }
        let spilled_bytes = if self.spill_path.exists() {
            std::fs::metadata(&self.spill_path)?.len()
        } else {
            0
        };
        let total_pairs = spilled_bytes / PAIR_BYTES + self.buffer.len() as u64;
        if total_pairs * PAIR_BYTES > partition_budget {
            return Err(HprofRetainError::ResourceExhausted {
                needed: total_pairs * PAIR_BYTES,
                budget: memory_budget as u64,
            });
        }
        let mut pairs = Vec::with_capacity(total_pairs as usize);
        if spilled_bytes > 0 {
            let mut reader = BufReader::new(File::open(&self.spill_path)?);
            for _ in 0..(spilled_bytes / PAIR_BYTES) {
                let t = reader.read_u32::<BigEndian>()?;
                let s = reader.read_u32::<BigEndian>()?;
                pairs.push((t, s));
            }
            std::fs::remove_file(&self.spill_path)?;
        }
        pairs.append(&mut self.buffer);
        Ok(pairs)
    }
}
