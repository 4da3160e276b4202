pub mod builder;
pub mod format;
pub mod id_map;
pub mod inbound;
pub mod page_cache;
pub mod reader;

/// Dense object id, assigned in stream order. The canonical key for every
/// index structure.
pub type ObjectId = u32;

/// Sentinel for "no object": unresolved references, missing superclasses,
/// synthesized class-table entries.
pub const NO_OBJECT: u32 = u32::MAX;
