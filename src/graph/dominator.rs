//! Immediate dominators over the condensed component DAG.
//!
//! Fixed-point iteration over a reverse-postorder numbering with pairwise
//! intersection through the idom links — the iterative formulation that
//! handles million-node graphs without touching the call stack. The synthetic
//! root is vertex 0 internally; it directly dominates every component that
//! holds a GC root. Acyclicity of the input is verified during the DFS that
//! computes the postorder; a back edge is an internal invariant violation.

use crate::config::{CancelToken, CANCEL_CHECK_INTERVAL};
use crate::errors::HprofRetainError;
use crate::graph::scc::SccGraph;

/// idom value for components dominated directly by the synthetic root.
pub const SYNTHETIC_ROOT: u32 = u32::MAX;

const UNDEFINED: u32 = u32::MAX;

pub struct DominatorTree {
    /// Per component: dominating component id, or SYNTHETIC_ROOT.
    pub idom: Vec<u32>,
    /// Component ids in reverse postorder; dominators precede dominated.
    pub rpo: Vec<u32>,
}

pub fn compute(scc: &SccGraph, cancel: &CancelToken) -> Result<DominatorTree, HprofRetainError> {
    // internal vertex space: 0 is the synthetic root, component c is c + 1
    let vertex_count = scc.comp_count as usize + 1;

    let postorder = depth_first_postorder(scc, vertex_count, cancel)?;
    if postorder.len() != vertex_count {
        // a component unreachable from the root set slipped through collapse
        return Err(HprofRetainError::CycleUnresolved);
    }
    let mut rpo_number = vec![0u32; vertex_count];
    for (position, &vertex) in postorder.iter().rev().enumerate() {
        rpo_number[vertex as usize] = position as u32;
    }

    let mut idom = vec![UNDEFINED; vertex_count];
    idom[0] = 0;

    let mut changed = true;
    while changed {
        changed = false;
        if cancel.is_cancelled() {
            return Err(HprofRetainError::Cancelled);
        }
        for (processed, &vertex) in postorder.iter().rev().enumerate() {
            if processed % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
                return Err(HprofRetainError::Cancelled);
            }
            if vertex == 0 {
                continue;
            }
            let comp = vertex - 1;
            let mut new_idom = UNDEFINED;
            if scc.is_root_comp(comp) {
                new_idom = 0;
            }
            for &pred_comp in scc.predecessors(comp) {
                let pred_vertex = pred_comp + 1;
                if idom[pred_vertex as usize] == UNDEFINED {
                    continue;
                }
                new_idom = if new_idom == UNDEFINED {
                    pred_vertex
                } else {
                    intersect(&idom, &rpo_number, pred_vertex, new_idom)
                };
            }
            if new_idom != UNDEFINED && idom[vertex as usize] != new_idom {
                idom[vertex as usize] = new_idom;
                changed = true;
            }
        }
    }

    if idom.iter().any(|&v| v == UNDEFINED) {
        return Err(HprofRetainError::CycleUnresolved);
    }

    let idom_external: Vec<u32> = (0..scc.comp_count)
        .map(|comp| {
            let internal = idom[comp as usize + 1];
            if internal == 0 {
                SYNTHETIC_ROOT
            } else {
                internal - 1
            }
        })
        .collect();
    let rpo_external: Vec<u32> = postorder
        .iter()
        .rev()
        .filter(|&&vertex| vertex != 0)
        .map(|&vertex| vertex - 1)
        .collect();

    Ok(DominatorTree {
        idom: idom_external,
        rpo: rpo_external,
    })
}

/// Iterative DFS from the synthetic root over the condensed DAG, verifying
/// acyclicity (a gray-to-gray edge means the collapse left a cycle behind).
fn depth_first_postorder(
    scc: &SccGraph,
    vertex_count: usize,
    cancel: &CancelToken,
) -> Result<Vec<u32>, HprofRetainError> {
    const WHITE: u8 = 0;
    const GRAY: u8 = 1;
    const BLACK: u8 = 2;

    let mut color = vec![WHITE; vertex_count];
    let mut postorder = Vec::with_capacity(vertex_count);
    let mut stack: Vec<(u32, usize)> = vec![(0, 0)];
    color[0] = GRAY;
    let mut processed = 0usize;

    loop {
        processed += 1;
        if processed % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
            return Err(HprofRetainError::Cancelled);
        }
        let (vertex, step) = {
            let Some((vertex, child)) = stack.last_mut() else { break };
            let outgoing = successors_of(scc, *vertex);
            if *child < outgoing.len() {
                let next_comp = outgoing[*child];
                *child += 1;
                (*vertex, Some(next_comp))
            } else {
                (*vertex, None)
            }
        };
        match step {
            Some(next_comp) => {
                let next_vertex = next_comp + 1;
                match color[next_vertex as usize] {
                    WHITE => {
                        color[next_vertex as usize] = GRAY;
                        stack.push((next_vertex, 0));
                    }
                    GRAY => return Err(HprofRetainError::CycleUnresolved),
                    _ => {}
                }
            }
            None => {
                color[vertex as usize] = BLACK;
                postorder.push(vertex);
                stack.pop();
            }
        }
    }
    Ok(postorder)
}

fn successors_of<'a>(scc: &'a SccGraph, vertex: u32) -> &'a [u32] {
    if vertex == 0 {
        &scc.root_comps
    } else {
        scc.successors(vertex - 1)
    }
}

fn intersect(idom: &[u32], rpo_number: &[u32], mut a: u32, mut b: u32) -> u32 {
    while a != b {
        while rpo_number[a as usize] > rpo_number[b as usize] {
            a = idom[a as usize];
        }
        while rpo_number[b as usize] > rpo_number[a as usize] {
            b = idom[b as usize];
        }
    }
    a
}
