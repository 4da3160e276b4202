//! Index construction: two streaming passes over the dump, the inbound
//! inversion, the graph phases, and an atomic publish.
//!
//! Pass 1 assigns dense ids in stream order and collects class metadata,
//! strings and GC roots. Pass 2 re-streams the dump with the completed
//! identifier table and writes object metadata and outbound references
//! directly; forward references resolve for free. Everything is built in a
//! sibling temp directory and renamed into place only when complete, so a
//! crashed or cancelled build is never visible to readers.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use ahash::{AHashMap, AHashSet};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::config::AnalysisOptions;
use crate::errors::HprofRetainError;
use crate::graph::{dominator, retained, scc};
use crate::index::format::*;
use crate::index::id_map::IdentifierMap;
use crate::index::inbound::invert_outbound;
use crate::index::reader::IndexReader;
use crate::index::{ObjectId, NO_OBJECT};
use crate::parser::file_header_parser::{parse_file_header, FileHeader, FILE_HEADER_LENGTH, SUPPORTED_FORMATS};
use crate::parser::gc_record::{ClassDumpFields, FieldType, FieldValue, GcRecord};
use crate::parser::record::Record;
use crate::parser::record_stream_parser::HprofRecordStreamParser;
use crate::prefetch_reader::PrefetchReader;
use crate::utils::align_to_8;

const MAX_READ_BUFFER_SIZE: usize = 64 * 1024 * 1024;
const MIN_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Counters over everything the parse saw, reported by the summary.
#[derive(Debug, Default, Clone)]
pub struct RecordTallies {
    pub utf8_strings: u64,
    pub classes_loaded: u64,
    pub classes_unloaded: u64,
    pub stack_frames: u64,
    pub stack_traces: u64,
    pub start_threads: u64,
    pub end_threads: u64,
    pub heap_summaries: u64,
    pub heap_dump_segments: u64,
    pub alloc_sites: u64,
    pub control_settings: u64,
    pub cpu_samples: u64,
    pub gc_roots: u64,
    pub instances: u64,
    pub object_arrays: u64,
    pub primitive_arrays: u64,
    pub class_dumps: u64,
}

#[derive(Debug, Clone)]
pub struct BuildStats {
    pub object_count: u32,
    pub class_count: u32,
    pub root_count: u32,
    pub edge_count: u64,
    pub unresolved_references: u64,
    pub unreachable_objects: u64,
    pub unreachable_bytes: u64,
    pub total_retained_bytes: u64,
    pub tallies: RecordTallies,
}

/// Parse and validate the dump header.
pub fn read_dump_header(dump_path: &Path) -> Result<FileHeader, HprofRetainError> {
    let mut reader = BufReader::new(File::open(dump_path)?);
    let mut buffer = vec![0u8; FILE_HEADER_LENGTH];
    reader
        .read_exact(&mut buffer)
        .map_err(|_| HprofRetainError::malformed(0, "file shorter than the hprof header"))?;
    let (rest, header) = parse_file_header(&buffer)
        .map_err(|e| HprofRetainError::malformed(0, format!("invalid file header: {e:?}")))?;
    if !SUPPORTED_FORMATS.contains(&header.format.as_str()) {
        return Err(HprofRetainError::UnsupportedFormatVersion {
            found: header.format,
        });
    }
    if header.size_pointers != 4 && header.size_pointers != 8 {
        return Err(HprofRetainError::InvalidIdSize {
            size: header.size_pointers,
        });
    }
    if !rest.is_empty() {
        return Err(HprofRetainError::malformed(0, "trailing bytes in file header"));
    }
    Ok(header)
}

/// Build a complete index for `dump_path` at `index_dir`.
pub fn build_index(
    dump_path: &Path,
    index_dir: &Path,
    options: &AnalysisOptions,
    progress: Option<Sender<u64>>,
) -> Result<BuildStats, HprofRetainError> {
    let header = read_dump_header(dump_path)?;
    let tmp_dir = temp_build_dir(index_dir);
    if tmp_dir.exists() {
        fs::remove_dir_all(&tmp_dir)?;
    }
    fs::create_dir_all(&tmp_dir)?;

    match build_into(dump_path, &header, &tmp_dir, options, progress) {
        Ok(stats) => {
            if index_dir.exists() {
                fs::remove_dir_all(index_dir)?;
            }
            fs::rename(&tmp_dir, index_dir)?;
            Ok(stats)
        }
        Err(e) => {
            let _ = fs::remove_dir_all(&tmp_dir);
            Err(e)
        }
    }
}

fn temp_build_dir(index_dir: &Path) -> PathBuf {
    let mut name = index_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "index".to_string());
    name.push_str(".tmp");
    index_dir.with_file_name(name)
}

fn build_into(
    dump_path: &Path,
    header: &FileHeader,
    tmp_dir: &Path,
    options: &AnalysisOptions,
    progress: Option<Sender<u64>>,
) -> Result<BuildStats, HprofRetainError> {
    let id_size = header.size_pointers;
    let file_len = fs::metadata(dump_path)?.len();
    let chunk_size = (options.memory_budget / 8).clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);

    // ---- pass 1: assign ids, collect classes, strings, roots ----
    let identifiers_tmp = tmp_dir.join("identifiers.dat.tmp");
    let mut pass1 = Pass1 {
        id_map: IdentifierMap::new(),
        identifiers_writer: BufWriter::new(File::create(&identifiers_tmp)?),
        strings: AHashMap::new(),
        load_classes: AHashMap::new(),
        class_dumps: Vec::new(),
        referenced_class_ids: AHashSet::new(),
        raw_roots: Vec::new(),
        tallies: RecordTallies::default(),
    };
    parse_pass(
        dump_path,
        id_size,
        file_len,
        chunk_size,
        options,
        progress.as_ref().map(|tx| (tx.clone(), 0)),
        &mut pass1,
    )?;
    pass1.identifiers_writer.flush()?;
    drop(pass1.identifiers_writer);

    let object_count = pass1.id_map.len();
    if object_count as u64 > (NO_OBJECT - 2) as u64 {
        return Err(HprofRetainError::malformed(
            0,
            "dump contains more addressable objects than the index can number",
        ));
    }
    let object_count = object_count as u32;
    compose_flat_file(
        &tmp_dir.join(IDENTIFIERS_FILE),
        MAGIC_IDENTIFIERS,
        object_count as u64,
        &identifiers_tmp,
    )?;

    // the O(object-count) arrays of the later phases must fit the budget
    let graph_bytes = pass1.id_map.approximate_bytes() + 40 * object_count as u64;
    if graph_bytes > options.memory_budget as u64 {
        return Err(HprofRetainError::ResourceExhausted {
            needed: graph_bytes,
            budget: options.memory_budget as u64,
        });
    }

    let mut unresolved = 0u64;
    let registry = ClassRegistry::build(
        &pass1.id_map,
        &pass1.strings,
        &pass1.load_classes,
        pass1.class_dumps,
        &pass1.referenced_class_ids,
        &mut unresolved,
    )?;

    // roots resolve as soon as the identifier table is complete
    let mut roots: Vec<GcRootEntry> = Vec::with_capacity(pass1.raw_roots.len());
    for (identifier, kind, context) in &pass1.raw_roots {
        match pass1.id_map.resolve(*identifier) {
            Some(object_id) => roots.push(GcRootEntry {
                object_id,
                kind: *kind,
                context: *context,
            }),
            None => {
                unresolved += 1;
                log::warn!(
                    "GC root ({}) references undumped object 0x{identifier:x}",
                    kind.label()
                );
            }
        }
    }
    write_roots_file(tmp_dir, &roots)?;
    write_classes_file(tmp_dir, &registry.table)?;

    // ---- pass 2: object metadata and outbound references ----
    let outbound_tmp = tmp_dir.join("outbound.dat.tmp");
    let mut objects_writer = BufWriter::new(File::create(tmp_dir.join(OBJECTS_FILE))?);
    write_index_header(&mut objects_writer, MAGIC_OBJECTS, object_count as u64)?;
    let mut pass2 = Pass2 {
        id_size,
        id_map: &pass1.id_map,
        registry: &registry,
        objects_writer,
        out_data: BufWriter::new(File::create(&outbound_tmp)?),
        out_offsets: Vec::with_capacity(object_count as usize + 1),
        written_refs: 0,
        next_id: 0,
        unresolved: 0,
        refs: Vec::new(),
    };
    parse_pass(
        dump_path,
        id_size,
        file_len,
        chunk_size,
        options,
        progress.as_ref().map(|tx| (tx.clone(), file_len)),
        &mut pass2,
    )?;
    pass2.out_offsets.push(pass2.written_refs);
    pass2.out_data.flush()?;
    pass2.objects_writer.flush()?;
    let edge_count = pass2.written_refs;
    unresolved += pass2.unresolved;
    let out_offsets = std::mem::take(&mut pass2.out_offsets);
    drop(pass2);
    compose_csr_file(
        &tmp_dir.join(OUTBOUND_FILE),
        MAGIC_OUTBOUND,
        object_count as u64,
        &out_offsets,
        &outbound_tmp,
    )?;
    drop(out_offsets);

    // condensation edge pairs are the largest transient of the graph phases
    let edge_bytes = 16u64.saturating_mul(edge_count);
    if edge_bytes > options.memory_budget as u64 {
        return Err(HprofRetainError::ResourceExhausted {
            needed: edge_bytes,
            budget: options.memory_budget as u64,
        });
    }

    // ---- inbound inversion ----
    invert_outbound(
        tmp_dir,
        object_count,
        edge_count,
        options.memory_budget,
        &options.cancel,
    )?;

    // ---- graph phases: reachability, SCC collapse, dominators, retained ----
    let reader = IndexReader::open(tmp_dir, options.memory_budget / 4)?;
    let mut root_objects: Vec<ObjectId> = roots.iter().map(|r| r.object_id).collect();
    root_objects.sort_unstable();
    root_objects.dedup();

    let scc_graph = scc::collapse(&reader, &root_objects, &options.cancel)?;
    let tree = dominator::compute(&scc_graph, &options.cancel)?;

    let mut comp_shallow = vec![0u64; scc_graph.comp_count as usize];
    let mut unreachable_objects = 0u64;
    let mut unreachable_bytes = 0u64;
    for id in 0..object_count {
        let shallow = reader.meta(id)?.shallow_size;
        match scc_graph.comp_of[id as usize] {
            scc::UNREACHABLE => {
                unreachable_objects += 1;
                unreachable_bytes += shallow;
            }
            comp => comp_shallow[comp as usize] += shallow,
        }
    }
    let sizes = retained::aggregate(&tree, &comp_shallow);

    write_dominators_file(tmp_dir, object_count, &scc_graph, &tree)?;
    write_retained_file(tmp_dir, object_count, &scc_graph, &sizes)?;
    drop(reader);

    // ---- manifest ----
    let (source_len, source_sha) = sha256_file(dump_path)?;
    let mut files = BTreeMap::new();
    for name in INDEX_FILES {
        let (file_len, sha256) = sha256_file(&tmp_dir.join(name))?;
        files.insert(name.to_string(), FileDigest { file_len, sha256 });
    }
    let manifest = Manifest {
        layout_version: LAYOUT_VERSION,
        format: header.format.clone(),
        id_size,
        timestamp_ms: header.timestamp,
        object_count,
        class_count: registry.table.len() as u32,
        root_count: roots.len() as u32,
        edge_count,
        unresolved_references: unresolved,
        unreachable_objects,
        unreachable_bytes,
        total_retained_bytes: sizes.total_retained,
        source: SourceIdentity {
            file_len: source_len,
            sha256: source_sha,
        },
        files,
    };
    fs::write(
        tmp_dir.join(MANIFEST_FILE),
        serde_json::to_string_pretty(&manifest)?,
    )?;

    if unresolved > 0 {
        log::warn!("{unresolved} references could not be resolved and were recorded as null");
    }

    Ok(BuildStats {
        object_count,
        class_count: registry.table.len() as u32,
        root_count: roots.len() as u32,
        edge_count,
        unresolved_references: unresolved,
        unreachable_objects,
        unreachable_bytes,
        total_retained_bytes: sizes.total_retained,
        tallies: pass1.tallies,
    })
}

// ---------------------------------------------------------------------------
// streaming pass harness

trait RecordConsumer {
    fn consume(&mut self, records: &mut Vec<Record>) -> Result<(), HprofRetainError>;
}

/// Run the prefetcher + stream-parser pipeline over the dump once, feeding
/// every record batch to `consumer` on the calling thread.
fn parse_pass<C: RecordConsumer>(
    dump_path: &Path,
    id_size: u32,
    file_len: u64,
    chunk_size: usize,
    options: &AnalysisOptions,
    progress: Option<(Sender<u64>, u64)>,
    consumer: &mut C,
) -> Result<(), HprofRetainError> {
    let file = File::open(dump_path)?;
    let mut reader = BufReader::new(file);
    // position the reader past the header; the prefetcher starts at the
    // current position
    let mut header_scratch = vec![0u8; FILE_HEADER_LENGTH];
    reader.read_exact(&mut header_scratch)?;

    let (send_data, receive_data): (Sender<Vec<u8>>, Receiver<Vec<u8>>) = unbounded();
    let (send_pooled_data, receive_pooled_data): (Sender<Vec<u8>>, Receiver<Vec<u8>>) = unbounded();
    for _ in 0..2 {
        send_pooled_data
            .send(Vec::with_capacity(chunk_size))
            .expect("pre-fetcher channel should be alive");
    }
    let (send_records, receive_records) = unbounded();
    let (send_pooled_vec, receive_pooled_vec): (Sender<Vec<Record>>, Receiver<Vec<Record>>) =
        unbounded();
    send_pooled_vec
        .send(Vec::new())
        .expect("recorder channel should be alive");
    let (send_progress, receive_progress): (Sender<u64>, Receiver<u64>) = unbounded();

    let prefetcher = PrefetchReader::new(
        reader,
        file_len as usize,
        FILE_HEADER_LENGTH,
        chunk_size,
    );
    let prefetch_thread = prefetcher.start(send_data, receive_pooled_data)?;

    let stream_parser = HprofRecordStreamParser::new(
        id_size,
        file_len,
        FILE_HEADER_LENGTH as u64,
        Vec::with_capacity(chunk_size),
    );
    let parser_thread = stream_parser.start(
        receive_data,
        send_pooled_data,
        send_progress,
        receive_pooled_vec,
        send_records,
    )?;

    let mut result = Ok(());
    while let Ok(message) = receive_records.recv() {
        match message {
            Ok(mut records) => {
                if options.cancel.is_cancelled() {
                    result = Err(HprofRetainError::Cancelled);
                    break;
                }
                if let Err(e) = consumer.consume(&mut records) {
                    result = Err(e);
                    break;
                }
                records.clear();
                send_pooled_vec.send(records).unwrap_or_default();
                if let Some((tx, base)) = &progress {
                    while let Ok(position) = receive_progress.try_recv() {
                        tx.send(base + position).unwrap_or_default();
                    }
                }
            }
            Err(e) => {
                result = Err(e);
                break;
            }
        }
    }

    // closing our ends unblocks both threads if we bailed early
    drop(receive_records);
    drop(send_pooled_vec);
    drop(receive_progress);
    prefetch_thread
        .join()
        .map_err(|e| HprofRetainError::StdThreadError { e })?;
    parser_thread
        .join()
        .map_err(|e| HprofRetainError::StdThreadError { e })?;
    result
}

// ---------------------------------------------------------------------------
// pass 1

struct Pass1 {
    id_map: IdentifierMap,
    identifiers_writer: BufWriter<File>,
    strings: AHashMap<u64, Box<str>>,
    load_classes: AHashMap<u64, u64>,
    class_dumps: Vec<ClassDumpFields>,
    referenced_class_ids: AHashSet<u64>,
    raw_roots: Vec<(u64, RootKind, u32)>,
    tallies: RecordTallies,
}

impl Pass1 {
    fn assign(&mut self, identifier: u64) -> Result<(), HprofRetainError> {
        let before = self.id_map.len();
        self.id_map.assign(identifier);
        if self.id_map.len() > before {
            self.identifiers_writer.write_u64::<BigEndian>(identifier)?;
        } else {
            log::warn!("object 0x{identifier:x} dumped twice; keeping the first record");
        }
        Ok(())
    }

    fn record_root(&mut self, identifier: u64, kind: RootKind, context: u32) {
        self.tallies.gc_roots += 1;
        self.raw_roots.push((identifier, kind, context));
    }
}

impl RecordConsumer for Pass1 {
    fn consume(&mut self, records: &mut Vec<Record>) -> Result<(), HprofRetainError> {
        for record in records.drain(..) {
            match record {
                Record::Utf8String { id, str } => {
                    self.tallies.utf8_strings += 1;
                    self.strings.insert(id, str);
                }
                Record::LoadClass(data) => {
                    self.tallies.classes_loaded += 1;
                    self.load_classes
                        .insert(data.class_object_id, data.class_name_id);
                }
                Record::UnloadClass { .. } => self.tallies.classes_unloaded += 1,
                Record::StackFrame(_) => self.tallies.stack_frames += 1,
                Record::StackTrace(_) => self.tallies.stack_traces += 1,
                Record::StartThread { .. } => self.tallies.start_threads += 1,
                Record::EndThread { .. } => self.tallies.end_threads += 1,
                Record::AllocationSites => self.tallies.alloc_sites += 1,
                Record::HeapSummary { .. } => self.tallies.heap_summaries += 1,
                Record::ControlSettings => self.tallies.control_settings += 1,
                Record::CpuSamples => self.tallies.cpu_samples += 1,
                Record::HeapDumpStart { .. } => self.tallies.heap_dump_segments += 1,
                Record::HeapDumpEnd => {}
                Record::GcSegment(gc) => match gc {
                    GcRecord::RootUnknown { object_id } => {
                        self.record_root(object_id, RootKind::Unknown, 0)
                    }
                    GcRecord::RootThreadObject {
                        thread_object_id,
                        thread_serial_number,
                        ..
                    } => {
                        self.record_root(thread_object_id, RootKind::ThreadObject, thread_serial_number)
                    }
                    GcRecord::RootJniGlobal { object_id, .. } => {
                        self.record_root(object_id, RootKind::JniGlobal, 0)
                    }
                    GcRecord::RootJniLocal {
                        object_id,
                        thread_serial_number,
                        ..
                    } => self.record_root(object_id, RootKind::JniLocal, thread_serial_number),
                    GcRecord::RootJavaFrame {
                        object_id,
                        thread_serial_number,
                        ..
                    } => self.record_root(object_id, RootKind::JavaFrame, thread_serial_number),
                    GcRecord::RootNativeStack {
                        object_id,
                        thread_serial_number,
                    } => self.record_root(object_id, RootKind::NativeStack, thread_serial_number),
                    GcRecord::RootStickyClass { object_id } => {
                        self.record_root(object_id, RootKind::StickyClass, 0)
                    }
                    GcRecord::RootThreadBlock {
                        object_id,
                        thread_serial_number,
                    } => self.record_root(object_id, RootKind::ThreadBlock, thread_serial_number),
                    GcRecord::RootMonitorUsed { object_id } => {
                        self.record_root(object_id, RootKind::MonitorUsed, 0)
                    }
                    GcRecord::InstanceDump {
                        object_id,
                        class_object_id,
                        ..
                    } => {
                        self.tallies.instances += 1;
                        self.referenced_class_ids.insert(class_object_id);
                        self.assign(object_id)?;
                    }
                    GcRecord::ObjectArrayDump {
                        object_id,
                        array_class_id,
                        ..
                    } => {
                        self.tallies.object_arrays += 1;
                        self.referenced_class_ids.insert(array_class_id);
                        self.assign(object_id)?;
                    }
                    GcRecord::PrimitiveArrayDump { object_id, .. } => {
                        self.tallies.primitive_arrays += 1;
                        self.assign(object_id)?;
                    }
                    GcRecord::ClassDump(fields) => {
                        self.tallies.class_dumps += 1;
                        self.assign(fields.class_object_id)?;
                        self.class_dumps.push(*fields);
                    }
                },
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// class registry

struct ClassRegistry {
    table: Vec<ClassDefinition>,
    by_identifier: AHashMap<u64, u32>,
    /// Per table entry: flattened instance field layout, declaring class
    /// first, then the superclass chain, matching instance data order.
    layouts: Vec<Vec<FieldType>>,
    primitive_base: u32,
}

impl ClassRegistry {
    fn build(
        id_map: &IdentifierMap,
        strings: &AHashMap<u64, Box<str>>,
        load_classes: &AHashMap<u64, u64>,
        class_dumps: Vec<ClassDumpFields>,
        referenced_class_ids: &AHashSet<u64>,
        unresolved: &mut u64,
    ) -> Result<ClassRegistry, HprofRetainError> {
        let name_of = |class_object_id: u64| -> Box<str> {
            load_classes
                .get(&class_object_id)
                .and_then(|name_id| strings.get(name_id))
                .map(|name| name.replace('/', ".").into_boxed_str())
                .unwrap_or_else(|| format!("unknown class 0x{class_object_id:x}").into_boxed_str())
        };
        let field_name_of = |name_id: u64| -> Box<str> {
            strings
                .get(&name_id)
                .cloned()
                .unwrap_or_else(|| "unknown".into())
        };

        let mut by_identifier: AHashMap<u64, u32> = AHashMap::new();
        let mut table: Vec<ClassDefinition> = Vec::new();
        // raw field layouts of dumped classes, indexed like `table`
        let mut own_fields: Vec<Vec<FieldType>> = Vec::new();
        let mut supers: Vec<u64> = Vec::new();

        for dump in &class_dumps {
            let table_index = table.len() as u32;
            by_identifier.insert(dump.class_object_id, table_index);
            let mut static_refs = Vec::new();
            for (_, value) in &dump.static_fields {
                if let FieldValue::Object(identifier) = value {
                    if *identifier != 0 {
                        match id_map.resolve(*identifier) {
                            Some(object_id) => static_refs.push(object_id),
                            None => *unresolved += 1,
                        }
                    }
                }
            }
            table.push(ClassDefinition {
                object_id: id_map
                    .resolve(dump.class_object_id)
                    .expect("class dump was assigned an id in pass 1"),
                identifier: dump.class_object_id,
                super_class: None, // patched below once every class is known
                name: name_of(dump.class_object_id),
                instance_size: dump.instance_size,
                instance_fields: dump
                    .instance_fields
                    .iter()
                    .map(|f| FieldDescriptor {
                        name: field_name_of(f.name_id),
                        field_type: f.field_type,
                    })
                    .collect(),
                static_fields: dump
                    .static_fields
                    .iter()
                    .map(|(f, _)| FieldDescriptor {
                        name: field_name_of(f.name_id),
                        field_type: f.field_type,
                    })
                    .collect(),
                static_refs,
            });
            own_fields.push(dump.instance_fields.iter().map(|f| f.field_type).collect());
            supers.push(dump.super_class_object_id);
        }

        // placeholders for classes instances reference but the dump never defines
        let mut missing: Vec<u64> = referenced_class_ids
            .iter()
            .filter(|id| !by_identifier.contains_key(id))
            .copied()
            .collect();
        missing.sort_unstable();
        for identifier in missing {
            log::warn!("instances reference undefined class 0x{identifier:x}");
            let table_index = table.len() as u32;
            by_identifier.insert(identifier, table_index);
            table.push(ClassDefinition {
                object_id: NO_OBJECT,
                identifier,
                super_class: None,
                name: name_of(identifier),
                instance_size: 0,
                instance_fields: Vec::new(),
                static_fields: Vec::new(),
                static_refs: Vec::new(),
            });
            own_fields.push(Vec::new());
            supers.push(0);
        }

        // patch superclass links now that the table is complete
        let dumped_count = supers.len();
        for index in 0..dumped_count {
            let super_identifier = supers[index];
            if super_identifier != 0 {
                table[index].super_class = by_identifier.get(&super_identifier).copied();
                if table[index].super_class.is_none() {
                    log::warn!(
                        "class {} has undumped superclass 0x{super_identifier:x}",
                        table[index].name
                    );
                }
            }
        }

        // flatten field layouts along the superclass chain; a cycle in the
        // superclass relation is a structural error
        let mut layouts: Vec<Vec<FieldType>> = Vec::with_capacity(table.len());
        for start in 0..table.len() {
            let mut layout: Vec<FieldType> = Vec::new();
            let mut cursor = Some(start as u32);
            let mut steps = 0usize;
            while let Some(index) = cursor {
                if steps > table.len() {
                    return Err(HprofRetainError::malformed(
                        0,
                        format!("superclass cycle through class {}", table[start].name),
                    ));
                }
                steps += 1;
                layout.extend_from_slice(&own_fields[index as usize]);
                cursor = table[index as usize].super_class;
            }
            layouts.push(layout);
        }

        // synthesized primitive-array classes, fixed tag order
        let primitive_base = table.len() as u32;
        for field_type in FieldType::PRIMITIVES {
            table.push(ClassDefinition {
                object_id: NO_OBJECT,
                identifier: 0,
                super_class: None,
                name: format!("{}[]", field_type.primitive_label()).into_boxed_str(),
                instance_size: 0,
                instance_fields: Vec::new(),
                static_fields: Vec::new(),
                static_refs: Vec::new(),
            });
            layouts.push(Vec::new());
        }

        Ok(ClassRegistry {
            table,
            by_identifier,
            layouts,
            primitive_base,
        })
    }

    fn primitive_index(&self, element_type: FieldType) -> u32 {
        let position = FieldType::PRIMITIVES
            .iter()
            .position(|t| *t == element_type)
            .expect("primitive arrays never hold object elements");
        self.primitive_base + position as u32
    }
}

// ---------------------------------------------------------------------------
// pass 2

struct Pass2<'a> {
    id_size: u32,
    id_map: &'a IdentifierMap,
    registry: &'a ClassRegistry,
    objects_writer: BufWriter<File>,
    out_data: BufWriter<File>,
    out_offsets: Vec<u64>,
    written_refs: u64,
    next_id: u32,
    unresolved: u64,
    refs: Vec<ObjectId>,
}

impl Pass2<'_> {
    fn resolve_reference(&mut self, identifier: u64) {
        if identifier == 0 {
            return;
        }
        match self.id_map.resolve(identifier) {
            Some(object_id) => self.refs.push(object_id),
            None => self.unresolved += 1,
        }
    }

    fn object_header_size(&self) -> u64 {
        // mark word + klass pointer + alignment gap
        self.id_size as u64 + 8
    }

    fn write_object(
        &mut self,
        object_id: u64,
        class_index: u32,
        kind: ObjectKind,
        shallow: u64,
    ) -> Result<(), HprofRetainError> {
        // a duplicate dump of an already-numbered object is dropped, matching
        // the first-record-wins rule of pass 1
        if self.id_map.resolve(object_id) != Some(self.next_id) {
            self.refs.clear();
            return Ok(());
        }
        self.next_id += 1;
        self.objects_writer.write_u32::<BigEndian>(class_index)?;
        self.objects_writer.write_u8(kind.tag())?;
        self.objects_writer.write_u64::<BigEndian>(shallow)?;

        self.out_offsets.push(self.written_refs);
        for reference in &self.refs {
            self.out_data.write_u32::<BigEndian>(*reference)?;
        }
        self.written_refs += self.refs.len() as u64;
        self.refs.clear();
        Ok(())
    }
}

impl RecordConsumer for Pass2<'_> {
    fn consume(&mut self, records: &mut Vec<Record>) -> Result<(), HprofRetainError> {
        for record in records.drain(..) {
            let Record::GcSegment(gc) = record else {
                continue;
            };
            match gc {
                GcRecord::InstanceDump {
                    object_id,
                    class_object_id,
                    data_size,
                    field_bytes,
                    ..
                } => {
                    let class_index = self.registry.by_identifier[&class_object_id];
                    let layout = &self.registry.layouts[class_index as usize];
                    let id_size = self.id_size as usize;
                    let mut offset = 0usize;
                    for field_type in layout {
                        let width = field_type.byte_size(self.id_size) as usize;
                        if offset + width > field_bytes.len() {
                            log::warn!(
                                "instance 0x{object_id:x} data is shorter than its class layout"
                            );
                            break;
                        }
                        if *field_type == FieldType::Object {
                            let identifier = if id_size == 8 {
                                BigEndian::read_u64(&field_bytes[offset..offset + 8])
                            } else {
                                u64::from(BigEndian::read_u32(&field_bytes[offset..offset + 4]))
                            };
                            self.resolve_reference(identifier);
                        }
                        offset += width;
                    }
                    let shallow = align_to_8(self.object_header_size() + data_size as u64);
                    self.write_object(object_id, class_index, ObjectKind::Instance, shallow)?;
                }
                GcRecord::ObjectArrayDump {
                    object_id,
                    array_class_id,
                    elements,
                    ..
                } => {
                    let class_index = self.registry.by_identifier[&array_class_id];
                    for element in elements.iter() {
                        self.resolve_reference(*element);
                    }
                    let shallow = align_to_8(
                        self.object_header_size() + self.id_size as u64 * elements.len() as u64,
                    );
                    self.write_object(object_id, class_index, ObjectKind::ObjectArray, shallow)?;
                }
                GcRecord::PrimitiveArrayDump {
                    object_id,
                    element_type,
                    number_of_elements,
                    ..
                } => {
                    let class_index = self.registry.primitive_index(element_type);
                    let shallow = align_to_8(
                        self.object_header_size()
                            + element_type.byte_size(self.id_size) as u64
                                * number_of_elements as u64,
                    );
                    self.write_object(
                        object_id,
                        class_index,
                        ObjectKind::PrimitiveArray,
                        shallow,
                    )?;
                }
                GcRecord::ClassDump(fields) => {
                    let class_index = self.registry.by_identifier[&fields.class_object_id];
                    // static references were resolved when the registry was built
                    self.refs
                        .extend_from_slice(&self.registry.table[class_index as usize].static_refs);
                    let shallow = align_to_8(
                        self.object_header_size() + fields.static_data_size(self.id_size),
                    );
                    self.write_object(
                        fields.class_object_id,
                        class_index,
                        ObjectKind::Class,
                        shallow,
                    )?;
                }
                _ => {}
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// index file writers

fn write_roots_file(dir: &Path, roots: &[GcRootEntry]) -> Result<(), HprofRetainError> {
    let mut writer = BufWriter::new(File::create(dir.join(ROOTS_FILE))?);
    write_index_header(&mut writer, MAGIC_ROOTS, roots.len() as u64)?;
    for root in roots {
        write_root(&mut writer, root)?;
    }
    writer.flush()?;
    Ok(())
}

fn write_classes_file(dir: &Path, classes: &[ClassDefinition]) -> Result<(), HprofRetainError> {
    let mut writer = BufWriter::new(File::create(dir.join(CLASSES_FILE))?);
    write_index_header(&mut writer, MAGIC_CLASSES, classes.len() as u64)?;
    for class in classes {
        write_class(&mut writer, class)?;
    }
    writer.flush()?;
    Ok(())
}

fn write_dominators_file(
    dir: &Path,
    object_count: u32,
    scc_graph: &scc::SccGraph,
    tree: &dominator::DominatorTree,
) -> Result<(), HprofRetainError> {
    let mut writer = BufWriter::new(File::create(dir.join(DOMINATORS_FILE))?);
    write_index_header(&mut writer, MAGIC_DOMINATORS, object_count as u64)?;
    for id in 0..object_count {
        let cell = match scc_graph.comp_of[id as usize] {
            scc::UNREACHABLE => DOM_UNREACHABLE,
            comp => match tree.idom[comp as usize] {
                dominator::SYNTHETIC_ROOT => DOM_SYNTHETIC_ROOT,
                dominating_comp => scc_graph.representative[dominating_comp as usize],
            },
        };
        writer.write_u32::<BigEndian>(cell)?;
    }
    writer.flush()?;
    Ok(())
}

fn write_retained_file(
    dir: &Path,
    object_count: u32,
    scc_graph: &scc::SccGraph,
    sizes: &retained::RetainedSizes,
) -> Result<(), HprofRetainError> {
    let mut writer = BufWriter::new(File::create(dir.join(RETAINED_FILE))?);
    write_index_header(&mut writer, MAGIC_RETAINED, object_count as u64)?;
    for id in 0..object_count {
        let retained = match scc_graph.comp_of[id as usize] {
            scc::UNREACHABLE => 0,
            comp => sizes.comp_retained[comp as usize],
        };
        writer.write_u64::<BigEndian>(retained)?;
    }
    writer.flush()?;
    Ok(())
}
