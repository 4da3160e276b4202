//! Read-only facade over a built index directory.
//!
//! `open` accepts either a dump file or an index directory. For a dump it
//! reuses the sibling index when the manifest still matches the dump's size
//! and content hash, and rebuilds otherwise; for a directory it verifies the
//! structural checksums and fails rather than rebuild. Any number of
//! snapshots may read one directory concurrently; nothing ever writes to a
//! published index.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use ahash::AHashMap;
use crossbeam_channel::Sender;

use crate::config::AnalysisOptions;
use crate::errors::HprofRetainError;
use crate::index::builder::{build_index, BuildStats};
use crate::index::format::{
    sha256_file, ClassDefinition, GcRootEntry, Manifest, ObjectKind, DOM_SYNTHETIC_ROOT,
    DOM_UNREACHABLE, INDEX_FILES, LAYOUT_VERSION, MANIFEST_FILE,
};
use crate::index::reader::IndexReader;
use crate::index::ObjectId;

/// Immediate dominator of an object, as exposed by the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dominator {
    /// Dominated directly by the synthetic root (GC roots and objects
    /// reachable through several independent roots).
    SyntheticRoot,
    Object(ObjectId),
    /// Not reachable from any GC root; excluded from the dominator tree.
    Unreachable,
}

/// Per-class aggregation of retained sizes, for leak-suspect reporting.
#[derive(Debug, Clone)]
pub struct ClassRetained {
    pub class_index: u32,
    pub instances: u64,
    pub shallow: u64,
    pub retained: u64,
}

pub struct Snapshot {
    reader: IndexReader,
    manifest: Manifest,
    identifier_index: OnceLock<AHashMap<u64, ObjectId>>,
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("manifest", &self.manifest)
            .finish_non_exhaustive()
    }
}

impl Snapshot {
    /// Open a dump file (building or reusing its sibling index) or an index
    /// directory (verification only, never a rebuild).
    pub fn open(path: &Path, options: &AnalysisOptions) -> Result<Snapshot, HprofRetainError> {
        Self::open_with_progress(path, options, None).map(|(snapshot, _)| snapshot)
    }

    /// Like `open`, additionally reporting byte progress of any build on the
    /// given channel and returning the build's statistics when one ran.
    pub fn open_with_progress(
        path: &Path,
        options: &AnalysisOptions,
        progress: Option<Sender<u64>>,
    ) -> Result<(Snapshot, Option<BuildStats>), HprofRetainError> {
        if path.is_dir() {
            return Ok((Self::open_index(path, options)?, None));
        }
        Self::open_dump_at(path, &default_index_dir(path), options, progress)
    }

    /// Open a dump with an explicitly chosen index directory.
    pub fn open_dump_at(
        path: &Path,
        index_dir: &Path,
        options: &AnalysisOptions,
        progress: Option<Sender<u64>>,
    ) -> Result<(Snapshot, Option<BuildStats>), HprofRetainError> {
        if !options.rebuild && index_dir.exists() {
            match Self::open_index(index_dir, options) {
                Ok(snapshot) => {
                    if snapshot.matches_source(path)? {
                        return Ok((snapshot, None));
                    }
                    log::info!(
                        "index at '{}' does not match the dump; rebuilding",
                        index_dir.display()
                    );
                }
                Err(HprofRetainError::IndexCorrupt { message }) => {
                    log::warn!("discarding unusable index: {message}; rebuilding");
                }
                Err(HprofRetainError::IndexMissing { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        let stats = build_index(path, index_dir, options, progress)?;
        let snapshot = Self::open_index(index_dir, options)?;
        Ok((snapshot, Some(stats)))
    }

    /// Open an existing index directory, verifying the manifest checksums.
    pub fn open_index(
        dir: &Path,
        options: &AnalysisOptions,
    ) -> Result<Snapshot, HprofRetainError> {
        let manifest_path = dir.join(MANIFEST_FILE);
        if !manifest_path.exists() {
            return Err(HprofRetainError::IndexMissing {
                path: dir.display().to_string(),
            });
        }
        let manifest: Manifest =
            serde_json::from_reader(BufReader::new(File::open(&manifest_path)?))
                .map_err(|e| HprofRetainError::corrupt(format!("manifest unreadable: {e}")))?;
        if manifest.layout_version != LAYOUT_VERSION {
            return Err(HprofRetainError::corrupt(format!(
                "index layout version {} (this build reads {})",
                manifest.layout_version, LAYOUT_VERSION
            )));
        }
        for name in INDEX_FILES {
            let digest = manifest.files.get(name).ok_or_else(|| {
                HprofRetainError::corrupt(format!("{name} has no manifest entry"))
            })?;
            let path = dir.join(name);
            if !path.exists() {
                return Err(HprofRetainError::corrupt(format!("{name} is missing")));
            }
            let (file_len, sha256) = sha256_file(&path)?;
            if file_len != digest.file_len || sha256 != digest.sha256 {
                return Err(HprofRetainError::corrupt(format!(
                    "checksum mismatch for {name}"
                )));
            }
        }

        let reader = IndexReader::open(dir, options.memory_budget / 4)?;
        if reader.object_count() != manifest.object_count {
            return Err(HprofRetainError::corrupt(
                "object count differs between manifest and objects.idx",
            ));
        }
        Ok(Snapshot {
            reader,
            manifest,
            identifier_index: OnceLock::new(),
        })
    }

    fn matches_source(&self, dump_path: &Path) -> Result<bool, HprofRetainError> {
        let file_len = std::fs::metadata(dump_path)?.len();
        if file_len != self.manifest.source.file_len {
            return Ok(false);
        }
        let (_, sha256) = sha256_file(dump_path)?;
        Ok(sha256 == self.manifest.source.sha256)
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn object_count(&self) -> u32 {
        self.reader.object_count()
    }

    pub fn classes(&self) -> &[ClassDefinition] {
        self.reader.classes()
    }

    pub fn gc_roots(&self) -> &[GcRootEntry] {
        self.reader.roots()
    }

    pub fn class_of(&self, id: ObjectId) -> Result<&ClassDefinition, HprofRetainError> {
        let meta = self.reader.meta(id)?;
        self.reader
            .classes()
            .get(meta.class_index as usize)
            .ok_or_else(|| {
                HprofRetainError::corrupt(format!(
                    "object {id} names class entry {} of {}",
                    meta.class_index,
                    self.reader.classes().len()
                ))
            })
    }

    pub fn object_kind(&self, id: ObjectId) -> Result<ObjectKind, HprofRetainError> {
        Ok(self.reader.meta(id)?.kind)
    }

    pub fn shallow_size(&self, id: ObjectId) -> Result<u64, HprofRetainError> {
        Ok(self.reader.meta(id)?.shallow_size)
    }

    pub fn outbound_references(&self, id: ObjectId) -> Result<Vec<ObjectId>, HprofRetainError> {
        self.reader.outbound(id)
    }

    pub fn inbound_references(&self, id: ObjectId) -> Result<Vec<ObjectId>, HprofRetainError> {
        self.reader.inbound(id)
    }

    pub fn immediate_dominator(&self, id: ObjectId) -> Result<Dominator, HprofRetainError> {
        Ok(match self.reader.dominator(id)? {
            DOM_UNREACHABLE => Dominator::Unreachable,
            DOM_SYNTHETIC_ROOT => Dominator::SyntheticRoot,
            object => Dominator::Object(object),
        })
    }

    pub fn retained_size(&self, id: ObjectId) -> Result<u64, HprofRetainError> {
        self.reader.retained(id)
    }

    pub fn identifier_of(&self, id: ObjectId) -> Result<u64, HprofRetainError> {
        self.reader.identifier(id)
    }

    /// Reverse lookup from raw heap identifier to ObjectId. The lookup table
    /// is materialized from `identifiers.idx` on first use.
    pub fn object_id_of(&self, identifier: u64) -> Result<Option<ObjectId>, HprofRetainError> {
        if self.identifier_index.get().is_none() {
            let mut map = AHashMap::with_capacity(self.object_count() as usize);
            for id in 0..self.object_count() {
                map.insert(self.reader.identifier(id)?, id);
            }
            let _ = self.identifier_index.set(map);
        }
        Ok(self
            .identifier_index
            .get()
            .expect("initialized above")
            .get(&identifier)
            .copied())
    }

    pub fn unresolved_reference_count(&self) -> u64 {
        self.manifest.unresolved_references
    }

    pub fn unreachable_count(&self) -> u64 {
        self.manifest.unreachable_objects
    }

    pub fn unreachable_bytes(&self) -> u64 {
        self.manifest.unreachable_bytes
    }

    pub fn total_retained_bytes(&self) -> u64 {
        self.manifest.total_retained_bytes
    }

    /// Retained sizes aggregated per class-table entry, every object visited
    /// once through the paged metadata.
    pub fn retained_by_class(&self) -> Result<Vec<ClassRetained>, HprofRetainError> {
        let mut per_class: Vec<ClassRetained> = self
            .reader
            .classes()
            .iter()
            .enumerate()
            .map(|(class_index, _)| ClassRetained {
                class_index: class_index as u32,
                instances: 0,
                shallow: 0,
                retained: 0,
            })
            .collect();
        for id in 0..self.object_count() {
            let meta = self.reader.meta(id)?;
            let entry = per_class.get_mut(meta.class_index as usize).ok_or_else(|| {
                HprofRetainError::corrupt(format!("object {id} names an unknown class entry"))
            })?;
            entry.instances += 1;
            entry.shallow += meta.shallow_size;
            entry.retained += self.reader.retained(id)?;
        }
        Ok(per_class)
    }

    /// Release cached pages and file handles.
    pub fn close(self) {}
}

/// `heap.hprof` gets its index at `heap.hpridx` next to it.
pub fn default_index_dir(dump_path: &Path) -> PathBuf {
    dump_path.with_extension("hpridx")
}
