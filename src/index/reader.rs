//! Offset-addressed read access to a built index directory.
//!
//! Fixed-stride files (objects, identifiers, dominators, retained) are
//! addressed directly by ObjectId; the reference files store a CSR offset
//! table ahead of the data runs. All reads go through the shared page cache.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder};

use crate::errors::HprofRetainError;
use crate::index::format::*;
use crate::index::page_cache::PageCache;
use crate::index::ObjectId;

// page-cache file ids
const FILE_IDENTIFIERS: u8 = 0;
const FILE_OBJECTS: u8 = 1;
const FILE_OUTBOUND: u8 = 2;
const FILE_INBOUND: u8 = 3;
const FILE_DOMINATORS: u8 = 4;
const FILE_RETAINED: u8 = 5;

#[derive(Debug, Clone, Copy)]
pub struct ObjectMeta {
    pub class_index: u32,
    pub kind: ObjectKind,
    pub shallow_size: u64,
}

struct IndexFile {
    file: File,
    file_len: u64,
}

impl IndexFile {
    fn open(
        dir: &Path,
        name: &str,
        magic: &[u8; 8],
        expected_count: Option<u64>,
    ) -> Result<(Self, u64), HprofRetainError> {
        let path = dir.join(name);
        let file = File::open(&path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(&file);
        let count = read_index_header(&mut reader, magic, name)?;
        if let Some(expected) = expected_count {
            if count != expected {
                return Err(HprofRetainError::corrupt(format!(
                    "{name}: entry count {count} does not match objects.idx ({expected})"
                )));
            }
        }
        Ok((IndexFile { file, file_len }, count))
    }
}

pub struct IndexReader {
    dir: PathBuf,
    object_count: u32,
    identifiers: IndexFile,
    objects: IndexFile,
    outbound: IndexFile,
    inbound: IndexFile,
    dominators: Option<IndexFile>,
    retained: Option<IndexFile>,
    classes: Vec<ClassDefinition>,
    roots: Vec<GcRootEntry>,
    cache: PageCache,
}

impl IndexReader {
    /// Open the structural index files. Dominator and retained files are
    /// optional so the builder can read the outbound graph before the graph
    /// phases have produced them.
    pub fn open(dir: &Path, cache_bytes: usize) -> Result<IndexReader, HprofRetainError> {
        let (objects, object_count) = IndexFile::open(dir, OBJECTS_FILE, MAGIC_OBJECTS, None)?;
        let (identifiers, _) =
            IndexFile::open(dir, IDENTIFIERS_FILE, MAGIC_IDENTIFIERS, Some(object_count))?;
        let (outbound, _) = IndexFile::open(dir, OUTBOUND_FILE, MAGIC_OUTBOUND, Some(object_count))?;
        let (inbound, _) = IndexFile::open(dir, INBOUND_FILE, MAGIC_INBOUND, Some(object_count))?;
        let dominators = match IndexFile::open(dir, DOMINATORS_FILE, MAGIC_DOMINATORS, Some(object_count))
        {
            Ok((f, _)) => Some(f),
            Err(HprofRetainError::StdIoError(_)) => None,
            Err(e) => return Err(e),
        };
        let retained = match IndexFile::open(dir, RETAINED_FILE, MAGIC_RETAINED, Some(object_count)) {
            Ok((f, _)) => Some(f),
            Err(HprofRetainError::StdIoError(_)) => None,
            Err(e) => return Err(e),
        };

        let classes = load_classes(dir)?;
        let roots = load_roots(dir)?;

        Ok(IndexReader {
            dir: dir.to_path_buf(),
            object_count: object_count as u32,
            identifiers,
            objects,
            outbound,
            inbound,
            dominators,
            retained,
            classes,
            roots,
            cache: PageCache::new(cache_bytes),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn object_count(&self) -> u32 {
        self.object_count
    }

    pub fn classes(&self) -> &[ClassDefinition] {
        &self.classes
    }

    pub fn roots(&self) -> &[GcRootEntry] {
        &self.roots
    }

    fn check_id(&self, id: ObjectId) -> Result<(), HprofRetainError> {
        if id >= self.object_count {
            return Err(HprofRetainError::corrupt(format!(
                "object id {id} out of range (object count {})",
                self.object_count
            )));
        }
        Ok(())
    }

    pub fn meta(&self, id: ObjectId) -> Result<ObjectMeta, HprofRetainError> {
        self.check_id(id)?;
        let mut record = [0u8; OBJECT_RECORD_LENGTH as usize];
        let offset = INDEX_HEADER_LENGTH + id as u64 * OBJECT_RECORD_LENGTH;
        self.cache.read(
            FILE_OBJECTS,
            &self.objects.file,
            self.objects.file_len,
            offset,
            &mut record,
        )?;
        let class_index = BigEndian::read_u32(&record[0..4]);
        let kind = ObjectKind::from_tag(record[4])
            .ok_or_else(|| HprofRetainError::corrupt(format!("bad object kind tag {}", record[4])))?;
        let shallow_size = BigEndian::read_u64(&record[5..13]);
        Ok(ObjectMeta {
            class_index,
            kind,
            shallow_size,
        })
    }

    pub fn identifier(&self, id: ObjectId) -> Result<u64, HprofRetainError> {
        self.check_id(id)?;
        let mut buf = [0u8; 8];
        self.cache.read(
            FILE_IDENTIFIERS,
            &self.identifiers.file,
            self.identifiers.file_len,
            INDEX_HEADER_LENGTH + id as u64 * 8,
            &mut buf,
        )?;
        Ok(BigEndian::read_u64(&buf))
    }

    fn reference_run(
        &self,
        id: ObjectId,
        file_id: u8,
        index_file: &IndexFile,
    ) -> Result<Vec<ObjectId>, HprofRetainError> {
        self.check_id(id)?;
        let mut offsets = [0u8; 16];
        self.cache.read(
            file_id,
            &index_file.file,
            index_file.file_len,
            INDEX_HEADER_LENGTH + id as u64 * 8,
            &mut offsets,
        )?;
        let start = BigEndian::read_u64(&offsets[0..8]);
        let end = BigEndian::read_u64(&offsets[8..16]);
        if end < start {
            return Err(HprofRetainError::corrupt("reference offsets not monotone"));
        }
        let data_base = INDEX_HEADER_LENGTH + (self.object_count as u64 + 1) * 8;
        let run_len = (end - start) as usize;
        let mut bytes = vec![0u8; run_len * 4];
        self.cache.read(
            file_id,
            &index_file.file,
            index_file.file_len,
            data_base + start * 4,
            &mut bytes,
        )?;
        let mut references = Vec::with_capacity(run_len);
        for chunk in bytes.chunks_exact(4) {
            references.push(BigEndian::read_u32(chunk));
        }
        Ok(references)
    }

    pub fn outbound(&self, id: ObjectId) -> Result<Vec<ObjectId>, HprofRetainError> {
        self.reference_run(id, FILE_OUTBOUND, &self.outbound)
    }

    pub fn inbound(&self, id: ObjectId) -> Result<Vec<ObjectId>, HprofRetainError> {
        self.reference_run(id, FILE_INBOUND, &self.inbound)
    }

    /// Raw dominator cell: an ObjectId, DOM_SYNTHETIC_ROOT or DOM_UNREACHABLE.
    pub fn dominator(&self, id: ObjectId) -> Result<u32, HprofRetainError> {
        self.check_id(id)?;
        let file = self.dominators.as_ref().ok_or_else(|| {
            HprofRetainError::corrupt("dominator index not present in this directory")
        })?;
        let mut buf = [0u8; 4];
        self.cache.read(
            FILE_DOMINATORS,
            &file.file,
            file.file_len,
            INDEX_HEADER_LENGTH + id as u64 * 4,
            &mut buf,
        )?;
        Ok(BigEndian::read_u32(&buf))
    }

    pub fn retained(&self, id: ObjectId) -> Result<u64, HprofRetainError> {
        self.check_id(id)?;
        let file = self.retained.as_ref().ok_or_else(|| {
            HprofRetainError::corrupt("retained-size index not present in this directory")
        })?;
        let mut buf = [0u8; 8];
        self.cache.read(
            FILE_RETAINED,
            &file.file,
            file.file_len,
            INDEX_HEADER_LENGTH + id as u64 * 8,
            &mut buf,
        )?;
        Ok(BigEndian::read_u64(&buf))
    }
}

fn load_classes(dir: &Path) -> Result<Vec<ClassDefinition>, HprofRetainError> {
    let path = dir.join(CLASSES_FILE);
    let mut reader = BufReader::new(File::open(&path)?);
    let count = read_index_header(&mut reader, MAGIC_CLASSES, CLASSES_FILE)?;
    let mut classes = Vec::with_capacity(count as usize);
    for _ in 0..count {
        classes.push(read_class(&mut reader)?);
    }
    Ok(classes)
}

fn load_roots(dir: &Path) -> Result<Vec<GcRootEntry>, HprofRetainError> {
    let path = dir.join(ROOTS_FILE);
    let mut reader = BufReader::new(File::open(&path)?);
    let count = read_index_header(&mut reader, MAGIC_ROOTS, ROOTS_FILE)?;
    let mut roots = Vec::with_capacity(count as usize);
    for _ in 0..count {
        roots.push(read_root(&mut reader)?);
    }
    Ok(roots)
}
