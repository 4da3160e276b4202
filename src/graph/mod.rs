pub mod dominator;
pub mod retained;
pub mod scc;

use crate::errors::HprofRetainError;
use crate::index::reader::IndexReader;

/// Adjacency access for the batch graph phases. Implemented by the index
/// reader (paged disk access) and by plain adjacency lists in tests.
pub trait GraphOps {
    fn node_count(&self) -> u32;
    fn successors(&self, node: u32) -> Result<Vec<u32>, HprofRetainError>;
}

impl GraphOps for IndexReader {
    fn node_count(&self) -> u32 {
        self.object_count()
    }

    fn successors(&self, node: u32) -> Result<Vec<u32>, HprofRetainError> {
        self.outbound(node)
    }
}

#[cfg(test)]
impl GraphOps for Vec<Vec<u32>> {
    fn node_count(&self) -> u32 {
        self.len() as u32
    }

    fn successors(&self, node: u32) -> Result<Vec<u32>, HprofRetainError> {
        Ok(self[node as usize].clone())
    }
}
