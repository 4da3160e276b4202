//! Binary layout of the persisted index files and the JSON manifest.
//!
//! Every `.idx` file starts with an 8-byte magic, a `u32` layout version and
//! a `u64` entry count; all integers are big-endian. The manifest records a
//! SHA-256 per file plus the source dump's identity so a later open can
//! detect both corruption and staleness.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::HprofRetainError;
use crate::index::{ObjectId, NO_OBJECT};
use crate::parser::gc_record::FieldType;

pub const LAYOUT_VERSION: u32 = 1;
pub const INDEX_HEADER_LENGTH: u64 = 8 + 4 + 8;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const IDENTIFIERS_FILE: &str = "identifiers.idx";
pub const OBJECTS_FILE: &str = "objects.idx";
pub const OUTBOUND_FILE: &str = "outbound.idx";
pub const INBOUND_FILE: &str = "inbound.idx";
pub const ROOTS_FILE: &str = "roots.idx";
pub const CLASSES_FILE: &str = "classes.idx";
pub const DOMINATORS_FILE: &str = "dominators.idx";
pub const RETAINED_FILE: &str = "retained.idx";

pub const MAGIC_IDENTIFIERS: &[u8; 8] = b"HPRIDXID";
pub const MAGIC_OBJECTS: &[u8; 8] = b"HPRIDXOB";
pub const MAGIC_OUTBOUND: &[u8; 8] = b"HPRIDXOU";
pub const MAGIC_INBOUND: &[u8; 8] = b"HPRIDXIN";
pub const MAGIC_ROOTS: &[u8; 8] = b"HPRIDXRT";
pub const MAGIC_CLASSES: &[u8; 8] = b"HPRIDXCL";
pub const MAGIC_DOMINATORS: &[u8; 8] = b"HPRIDXDM";
pub const MAGIC_RETAINED: &[u8; 8] = b"HPRIDXRS";

/// The files whose checksums the manifest tracks, in publication order.
pub const INDEX_FILES: [&str; 8] = [
    IDENTIFIERS_FILE,
    OBJECTS_FILE,
    OUTBOUND_FILE,
    INBOUND_FILE,
    ROOTS_FILE,
    CLASSES_FILE,
    DOMINATORS_FILE,
    RETAINED_FILE,
];

// class_idx u32 + kind u8 + shallow u64
pub const OBJECT_RECORD_LENGTH: u64 = 13;
// object u32 + kind u8 + context u32
pub const ROOT_RECORD_LENGTH: u64 = 9;

/// `dominators.idx` sentinel: object was not reachable from any GC root.
pub const DOM_UNREACHABLE: u32 = u32::MAX;
/// `dominators.idx` sentinel: immediately dominated by the synthetic root.
pub const DOM_SYNTHETIC_ROOT: u32 = u32::MAX - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Instance = 0,
    ObjectArray = 1,
    PrimitiveArray = 2,
    Class = 3,
}

impl ObjectKind {
    pub fn tag(&self) -> u8 {
        *self as u8
    }

    pub fn from_tag(tag: u8) -> Option<ObjectKind> {
        match tag {
            0 => Some(ObjectKind::Instance),
            1 => Some(ObjectKind::ObjectArray),
            2 => Some(ObjectKind::PrimitiveArray),
            3 => Some(ObjectKind::Class),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RootKind {
    Unknown = 0,
    JniGlobal = 1,
    JniLocal = 2,
    JavaFrame = 3,
    NativeStack = 4,
    StickyClass = 5,
    ThreadBlock = 6,
    MonitorUsed = 7,
    ThreadObject = 8,
}

impl RootKind {
    pub fn tag(&self) -> u8 {
        *self as u8
    }

    pub fn from_tag(tag: u8) -> Option<RootKind> {
        match tag {
            0 => Some(RootKind::Unknown),
            1 => Some(RootKind::JniGlobal),
            2 => Some(RootKind::JniLocal),
            3 => Some(RootKind::JavaFrame),
            4 => Some(RootKind::NativeStack),
            5 => Some(RootKind::StickyClass),
            6 => Some(RootKind::ThreadBlock),
            7 => Some(RootKind::MonitorUsed),
            8 => Some(RootKind::ThreadObject),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RootKind::Unknown => "unknown",
            RootKind::JniGlobal => "JNI global",
            RootKind::JniLocal => "JNI local",
            RootKind::JavaFrame => "Java frame",
            RootKind::NativeStack => "native stack",
            RootKind::StickyClass => "sticky class",
            RootKind::ThreadBlock => "thread block",
            RootKind::MonitorUsed => "monitor used",
            RootKind::ThreadObject => "thread object",
        }
    }
}

/// One entry of the GC-root set. `context` carries the thread serial number
/// for the root kinds that have one, zero otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcRootEntry {
    pub object_id: ObjectId,
    pub kind: RootKind,
    pub context: u32,
}

#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    pub name: Box<str>,
    pub field_type: FieldType,
}

/// Class metadata as stored in `classes.idx`. `super_class` is an index into
/// the class table, not an ObjectId. Synthesized entries (primitive array
/// classes, placeholder classes for undumped class objects) carry
/// `object_id == NO_OBJECT`.
#[derive(Debug, Clone)]
pub struct ClassDefinition {
    pub object_id: ObjectId,
    pub identifier: u64,
    pub super_class: Option<u32>,
    pub name: Box<str>,
    pub instance_size: u32,
    pub instance_fields: Vec<FieldDescriptor>,
    pub static_fields: Vec<FieldDescriptor>,
    pub static_refs: Vec<ObjectId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceIdentity {
    pub file_len: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileDigest {
    pub file_len: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub layout_version: u32,
    pub format: String,
    pub id_size: u32,
    pub timestamp_ms: u64,
    pub object_count: u32,
    pub class_count: u32,
    pub root_count: u32,
    pub edge_count: u64,
    pub unresolved_references: u64,
    pub unreachable_objects: u64,
    pub unreachable_bytes: u64,
    pub total_retained_bytes: u64,
    pub source: SourceIdentity,
    pub files: BTreeMap<String, FileDigest>,
}

pub fn write_index_header<W: Write>(
    w: &mut W,
    magic: &[u8; 8],
    count: u64,
) -> std::io::Result<()> {
    w.write_all(magic)?;
    w.write_u32::<BigEndian>(LAYOUT_VERSION)?;
    w.write_u64::<BigEndian>(count)?;
    Ok(())
}

pub fn read_index_header<R: Read>(
    r: &mut R,
    magic: &[u8; 8],
    file_name: &str,
) -> Result<u64, HprofRetainError> {
    let mut found = [0u8; 8];
    r.read_exact(&mut found)?;
    if &found != magic {
        return Err(HprofRetainError::corrupt(format!(
            "{file_name}: bad magic"
        )));
    }
    let version = r.read_u32::<BigEndian>()?;
    if version != LAYOUT_VERSION {
        return Err(HprofRetainError::corrupt(format!(
            "{file_name}: layout version {version} (expected {LAYOUT_VERSION})"
        )));
    }
    Ok(r.read_u64::<BigEndian>()?)
}

pub fn write_root<W: Write>(w: &mut W, root: &GcRootEntry) -> std::io::Result<()> {
    w.write_u32::<BigEndian>(root.object_id)?;
    w.write_u8(root.kind.tag())?;
    w.write_u32::<BigEndian>(root.context)?;
    Ok(())
}

pub fn read_root<R: Read>(r: &mut R) -> Result<GcRootEntry, HprofRetainError> {
    let object_id = r.read_u32::<BigEndian>()?;
    let kind_tag = r.read_u8()?;
    let context = r.read_u32::<BigEndian>()?;
    let kind = RootKind::from_tag(kind_tag)
        .ok_or_else(|| HprofRetainError::corrupt(format!("bad root kind tag {kind_tag}")))?;
    Ok(GcRootEntry {
        object_id,
        kind,
        context,
    })
}

fn write_str<W: Write>(w: &mut W, s: &str) -> std::io::Result<()> {
    w.write_u32::<BigEndian>(s.len() as u32)?;
    w.write_all(s.as_bytes())?;
    Ok(())
}

fn read_str<R: Read>(r: &mut R) -> Result<Box<str>, HprofRetainError> {
    let len = r.read_u32::<BigEndian>()? as usize;
    let mut bytes = vec![0u8; len];
    r.read_exact(&mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned().into_boxed_str())
}

fn write_field_descriptor<W: Write>(w: &mut W, field: &FieldDescriptor) -> std::io::Result<()> {
    write_str(w, &field.name)?;
    w.write_u8(field.field_type.tag())?;
    Ok(())
}

fn read_field_descriptor<R: Read>(r: &mut R) -> Result<FieldDescriptor, HprofRetainError> {
    let name = read_str(r)?;
    let tag = r.read_u8()?;
    let field_type = FieldType::from_tag(tag)
        .ok_or_else(|| HprofRetainError::corrupt(format!("bad field type tag {tag}")))?;
    Ok(FieldDescriptor { name, field_type })
}

pub fn write_class<W: Write>(w: &mut W, class: &ClassDefinition) -> std::io::Result<()> {
    w.write_u32::<BigEndian>(class.object_id)?;
    w.write_u64::<BigEndian>(class.identifier)?;
    w.write_u32::<BigEndian>(class.super_class.unwrap_or(NO_OBJECT))?;
    write_str(w, &class.name)?;
    w.write_u32::<BigEndian>(class.instance_size)?;
    w.write_u32::<BigEndian>(class.instance_fields.len() as u32)?;
    for field in &class.instance_fields {
        write_field_descriptor(w, field)?;
    }
    w.write_u32::<BigEndian>(class.static_fields.len() as u32)?;
    for field in &class.static_fields {
        write_field_descriptor(w, field)?;
    }
    w.write_u32::<BigEndian>(class.static_refs.len() as u32)?;
    for reference in &class.static_refs {
        w.write_u32::<BigEndian>(*reference)?;
    }
    Ok(())
}

pub fn read_class<R: Read>(r: &mut R) -> Result<ClassDefinition, HprofRetainError> {
    let object_id = r.read_u32::<BigEndian>()?;
    let identifier = r.read_u64::<BigEndian>()?;
    let super_raw = r.read_u32::<BigEndian>()?;
    let name = read_str(r)?;
    let instance_size = r.read_u32::<BigEndian>()?;
    let instance_field_count = r.read_u32::<BigEndian>()? as usize;
    let mut instance_fields = Vec::with_capacity(instance_field_count);
    for _ in 0..instance_field_count {
        instance_fields.push(read_field_descriptor(r)?);
    }
    let static_field_count = r.read_u32::<BigEndian>()? as usize;
    let mut static_fields = Vec::with_capacity(static_field_count);
    for _ in 0..static_field_count {
        static_fields.push(read_field_descriptor(r)?);
    }
    let static_ref_count = r.read_u32::<BigEndian>()? as usize;
    let mut static_refs = Vec::with_capacity(static_ref_count);
    for _ in 0..static_ref_count {
        static_refs.push(r.read_u32::<BigEndian>()?);
    }
    Ok(ClassDefinition {
        object_id,
        identifier,
        super_class: if super_raw == NO_OBJECT {
            None
        } else {
            Some(super_raw)
        },
        name,
        instance_size,
        instance_fields,
        static_fields,
        static_refs,
    })
}

/// Assemble a CSR reference file from its parts: header, `count + 1` element
/// offsets, then the data runs accumulated in `data_path` (which is consumed).
/// Everything is written sequentially; no seeking, no partially-visible file.
pub fn compose_csr_file(
    dest: &Path,
    magic: &[u8; 8],
    count: u64,
    offsets: &[u64],
    data_path: &Path,
) -> Result<(), HprofRetainError> {
    debug_assert_eq!(offsets.len() as u64, count + 1);
    let mut writer = std::io::BufWriter::new(File::create(dest)?);
    write_index_header(&mut writer, magic, count)?;
    for offset in offsets {
        writer.write_u64::<BigEndian>(*offset)?;
    }
    let mut data = BufReader::new(File::open(data_path)?);
    std::io::copy(&mut data, &mut writer)?;
    writer.flush()?;
    std::fs::remove_file(data_path)?;
    Ok(())
}

/// Assemble a fixed-stride index file: header then the raw entries
/// accumulated in `data_path` (which is consumed).
pub fn compose_flat_file(
    dest: &Path,
    magic: &[u8; 8],
    count: u64,
    data_path: &Path,
) -> Result<(), HprofRetainError> {
    let mut writer = std::io::BufWriter::new(File::create(dest)?);
    write_index_header(&mut writer, magic, count)?;
    let mut data = BufReader::new(File::open(data_path)?);
    std::io::copy(&mut data, &mut writer)?;
    writer.flush()?;
    std::fs::remove_file(data_path)?;
    Ok(())
}

/// Streaming SHA-256 of a file, returning (length, hex digest).
pub fn sha256_file(path: &Path) -> Result<(u64, String), HprofRetainError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1024 * 1024];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        total += n as u64;
    }
    Ok((total, hex_digest(hasher.finalize().as_slice())))
}

pub fn hex_digest(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_record_roundtrip() {
        let class = ClassDefinition {
            object_id: 7,
            identifier: 0xCAFE,
            super_class: Some(3),
            name: "com.example.Leaky".into(),
            instance_size: 24,
            instance_fields: vec![FieldDescriptor {
                name: "next".into(),
                field_type: FieldType::Object,
            }],
            static_fields: vec![FieldDescriptor {
                name: "INSTANCE".into(),
                field_type: FieldType::Object,
            }],
            static_refs: vec![42],
        };
        let mut bytes = Vec::new();
        write_class(&mut bytes, &class).unwrap();
        let read = read_class(&mut bytes.as_slice()).unwrap();
        assert_eq!(read.object_id, 7);
        assert_eq!(read.identifier, 0xCAFE);
        assert_eq!(read.super_class, Some(3));
        assert_eq!(&*read.name, "com.example.Leaky");
        assert_eq!(read.instance_fields.len(), 1);
        assert_eq!(read.static_refs, vec![42]);
    }

    #[test]
    fn header_rejects_wrong_magic() {
        let mut bytes = Vec::new();
        write_index_header(&mut bytes, MAGIC_OBJECTS, 5).unwrap();
        let err = read_index_header(&mut bytes.as_slice(), MAGIC_INBOUND, "inbound.idx");
        assert!(matches!(err, Err(HprofRetainError::IndexCorrupt { .. })));
        let count = read_index_header(&mut bytes.as_slice(), MAGIC_OBJECTS, "objects.idx").unwrap();
        assert_eq!(count, 5);
    }

    #[test]
    fn root_record_roundtrip() {
        let root = GcRootEntry {
            object_id: 11,
            kind: RootKind::JavaFrame,
            context: 2,
        };
        let mut bytes = Vec::new();
        write_root(&mut bytes, &root).unwrap();
        assert_eq!(bytes.len() as u64, ROOT_RECORD_LENGTH);
        assert_eq!(read_root(&mut bytes.as_slice()).unwrap(), root);
    }
}
