//! Dense ObjectId assignment over raw heap identifiers.

use ahash::AHashMap;

use crate::index::ObjectId;

/// Maps raw identifiers to dense ids in first-encounter order. Pass 1 of the
/// build feeds every addressable record through `assign`; pass 2 (and root
/// resolution) only ever calls `resolve`, so forward references seen during
/// pass 1 become resolvable once the table is complete.
#[derive(Debug, Default)]
pub struct IdentifierMap {
    by_identifier: AHashMap<u64, ObjectId>,
}

impl IdentifierMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the next dense id to `identifier`, or return the id it already
    /// holds (a dump may contain duplicate dumps of one object; the first
    /// wins, matching the record the metadata pass keeps).
    pub fn assign(&mut self, identifier: u64) -> ObjectId {
        let next = self.by_identifier.len() as ObjectId;
        *self.by_identifier.entry(identifier).or_insert(next)
    }

    pub fn resolve(&self, identifier: u64) -> Option<ObjectId> {
        self.by_identifier.get(&identifier).copied()
    }

    pub fn len(&self) -> usize {
        self.by_identifier.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_identifier.is_empty()
    }

    /// Rough in-memory footprint, charged against the working-set budget.
    pub fn approximate_bytes(&self) -> u64 {
        // key + value + hash-table slot overhead
        self.by_identifier.len() as u64 * 24
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_dense_and_first_encounter_ordered() {
        let mut map = IdentifierMap::new();
        assert_eq!(map.assign(0xAAAA), 0);
        assert_eq!(map.assign(0x10), 1);
        assert_eq!(map.assign(0xFFFF_FFFF_FFFF), 2);
        // re-assigning an identifier keeps its first id
        assert_eq!(map.assign(0x10), 1);
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn unseen_identifiers_do_not_resolve() {
        let mut map = IdentifierMap::new();
        map.assign(1);
        assert_eq!(map.resolve(1), Some(0));
        assert_eq!(map.resolve(2), None);
    }
}
