//! Retained-size aggregation over the dominator tree.
//!
//! One bottom-up pass in reverse RPO: every component is finalized before its
//! dominator reads it, because dominators precede dominated in RPO. Members
//! of a collapsed cycle all report the component's total — each one keeps the
//! whole cycle alive.

use crate::graph::dominator::{DominatorTree, SYNTHETIC_ROOT};

pub struct RetainedSizes {
    /// Per component: shallow total of its members plus everything it
    /// exclusively keeps alive.
    pub comp_retained: Vec<u64>,
    /// Retained by the synthetic root: all reachable bytes.
    pub total_retained: u64,
}

pub fn aggregate(tree: &DominatorTree, comp_shallow: &[u64]) -> RetainedSizes {
    let mut comp_retained = comp_shallow.to_vec();
    let mut total_retained = 0u64;
    for &comp in tree.rpo.iter().rev() {
        let retained = comp_retained[comp as usize];
        match tree.idom[comp as usize] {
            SYNTHETIC_ROOT => total_retained += retained,
            dominator => comp_retained[dominator as usize] += retained,
        }
    }
    RetainedSizes {
        comp_retained,
        total_retained,
    }
}
