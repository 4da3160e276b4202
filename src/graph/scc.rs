//! Strongly connected components over the reachable object graph.
//!
//! Iterative Tarjan with an explicit frame stack: recursion depth is bounded
//! by the heap's reference-chain length, which routinely exceeds the call
//! stack. Components are numbered in completion order of a traversal seeded
//! by ascending ObjectId, so numbering is reproducible for identical input.

use std::collections::VecDeque;

use crate::config::{CancelToken, CANCEL_CHECK_INTERVAL};
use crate::errors::HprofRetainError;
use crate::graph::GraphOps;

pub const UNREACHABLE: u32 = u32::MAX;
const UNVISITED: u32 = u32::MAX;

/// Compact bit set keyed by ObjectId.
pub struct Bitset {
    words: Vec<u64>,
}

impl Bitset {
    pub fn new(len: usize) -> Self {
        Bitset {
            words: vec![0; len.div_ceil(64)],
        }
    }

    pub fn set(&mut self, index: u32) {
        self.words[index as usize / 64] |= 1 << (index % 64);
    }

    pub fn get(&self, index: u32) -> bool {
        self.words[index as usize / 64] & (1 << (index % 64)) != 0
    }
}

/// The condensation of the reachable subgraph: a DAG over component ids with
/// both edge directions in CSR form.
pub struct SccGraph {
    /// Per object: component id, or UNREACHABLE.
    pub comp_of: Vec<u32>,
    pub comp_count: u32,
    /// Per component: its lowest member ObjectId.
    pub representative: Vec<u32>,
    pub member_count: Vec<u32>,
    pub reachable_count: u64,
    pub succ_offsets: Vec<usize>,
    pub succ: Vec<u32>,
    pub pred_offsets: Vec<usize>,
    pub pred: Vec<u32>,
    /// Components containing at least one GC-rooted object, deduplicated.
    pub root_comps: Vec<u32>,
}

impl SccGraph {
    pub fn successors(&self, comp: u32) -> &[u32] {
        &self.succ[self.succ_offsets[comp as usize]..self.succ_offsets[comp as usize + 1]]
    }

    pub fn predecessors(&self, comp: u32) -> &[u32] {
        &self.pred[self.pred_offsets[comp as usize]..self.pred_offsets[comp as usize + 1]]
    }

    pub fn is_root_comp(&self, comp: u32) -> bool {
        self.root_comps.binary_search(&comp).is_ok()
    }
}

/// Worklist sweep marking everything reachable from the root objects.
pub fn mark_reachable(
    graph: &impl GraphOps,
    root_objects: &[u32],
    cancel: &CancelToken,
) -> Result<(Bitset, u64), HprofRetainError> {
    let node_count = graph.node_count();
    let mut reachable = Bitset::new(node_count as usize);
    let mut queue: VecDeque<u32> = VecDeque::new();
    let mut marked = 0u64;
    for &root in root_objects {
        if !reachable.get(root) {
            reachable.set(root);
            marked += 1;
            queue.push_back(root);
        }
    }
    let mut processed = 0usize;
    while let Some(node) = queue.pop_front() {
        processed += 1;
        if processed % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
            return Err(HprofRetainError::Cancelled);
        }
        for target in graph.successors(node)? {
            if !reachable.get(target) {
                reachable.set(target);
                marked += 1;
                queue.push_back(target);
            }
        }
    }
    Ok((reachable, marked))
}

struct Frame {
    node: u32,
    successors: Vec<u32>,
    next: usize,
}

/// Collapse cycles among the reachable objects into components and build the
/// condensed DAG. `root_objects` must be sorted ascending and deduplicated.
pub fn collapse(
    graph: &impl GraphOps,
    root_objects: &[u32],
    cancel: &CancelToken,
) -> Result<SccGraph, HprofRetainError> {
    let node_count = graph.node_count();
    let (reachable, reachable_count) = mark_reachable(graph, root_objects, cancel)?;

    let mut index: Vec<u32> = vec![UNVISITED; node_count as usize];
    let mut lowlink: Vec<u32> = vec![0; node_count as usize];
    let mut comp_of: Vec<u32> = vec![UNREACHABLE; node_count as usize];
    let mut on_stack = Bitset::new(node_count as usize);
    let mut tarjan_stack: Vec<u32> = Vec::new();
    let mut frames: Vec<Frame> = Vec::new();

    let mut next_index = 0u32;
    let mut comp_count = 0u32;
    let mut representative: Vec<u32> = Vec::new();
    let mut member_count: Vec<u32> = Vec::new();
    let mut processed = 0usize;

    // ascending-ObjectId seeding keeps component numbering deterministic
    for seed in 0..node_count {
        if !reachable.get(seed) || index[seed as usize] != UNVISITED {
            continue;
        }
        push_frame(graph, &mut frames, seed)?;
        index[seed as usize] = next_index;
        lowlink[seed as usize] = next_index;
        next_index += 1;
        on_stack.set(seed);
        tarjan_stack.push(seed);

        loop {
            processed += 1;
            if processed % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
                return Err(HprofRetainError::Cancelled);
            }
            // step the top frame, releasing its borrow before the stack moves
            let (node, step) = {
                let Some(frame) = frames.last_mut() else { break };
                if frame.next < frame.successors.len() {
                    let target = frame.successors[frame.next];
                    frame.next += 1;
                    (frame.node, Some(target))
                } else {
                    (frame.node, None)
                }
            };
            match step {
                Some(target) => {
                    if !reachable.get(target) {
                        continue;
                    }
                    if index[target as usize] == UNVISITED {
                        index[target as usize] = next_index;
                        lowlink[target as usize] = next_index;
                        next_index += 1;
                        on_stack.set(target);
                        tarjan_stack.push(target);
                        push_frame(graph, &mut frames, target)?;
                    } else if on_stack.get(target) {
                        lowlink[node as usize] =
                            lowlink[node as usize].min(index[target as usize]);
                    }
                }
                None => {
                    frames.pop();
                    if let Some(parent) = frames.last() {
                        let parent_node = parent.node;
                        lowlink[parent_node as usize] =
                            lowlink[parent_node as usize].min(lowlink[node as usize]);
                    }
                    if lowlink[node as usize] == index[node as usize] {
                        // `node` is the root of a finished component
                        let comp = comp_count;
                        comp_count += 1;
                        let mut lowest = u32::MAX;
                        let mut members = 0u32;
                        loop {
                            let member = tarjan_stack.pop().expect("component member on stack");
                            comp_of[member as usize] = comp;
                            // the bit must clear eagerly: later lowlink checks
                            // consult it
                            clear_bit(&mut on_stack, member);
                            lowest = lowest.min(member);
                            members += 1;
                            if member == node {
                                break;
                            }
                        }
                        representative.push(lowest);
                        member_count.push(members);
                    }
                }
            }
        }
    }

    build_condensation(
        graph,
        &reachable,
        reachable_count,
        comp_of,
        comp_count,
        representative,
        member_count,
        root_objects,
        cancel,
    )
}

fn push_frame(
    graph: &impl GraphOps,
    frames: &mut Vec<Frame>,
    node: u32,
) -> Result<(), HprofRetainError> {
    frames.push(Frame {
        node,
        successors: graph.successors(node)?,
        next: 0,
    });
    Ok(())
}

fn clear_bit(bits: &mut Bitset, index: u32) {
    bits.words[index as usize / 64] &= !(1 << (index % 64));
}

#[allow(clippy::too_many_arguments)]
fn build_condensation(
    graph: &impl GraphOps,
    reachable: &Bitset,
    reachable_count: u64,
    comp_of: Vec<u32>,
    comp_count: u32,
    representative: Vec<u32>,
    member_count: Vec<u32>,
    root_objects: &[u32],
    cancel: &CancelToken,
) -> Result<SccGraph, HprofRetainError> {
    // cross-component edges, deduplicated; intra-component edges vanish here
    let mut edges: Vec<(u32, u32)> = Vec::new();
    for node in 0..graph.node_count() {
        if node as usize % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
            return Err(HprofRetainError::Cancelled);
        }
        if !reachable.get(node) {
            continue;
        }
        let from = comp_of[node as usize];
        for target in graph.successors(node)? {
            if !reachable.get(target) {
                continue;
            }
            let to = comp_of[target as usize];
            if from != to {
                edges.push((from, to));
            }
        }
    }
    edges.sort_unstable();
    edges.dedup();

    let mut succ_offsets = vec![0usize; comp_count as usize + 1];
    for &(from, _) in &edges {
        succ_offsets[from as usize + 1] += 1;
    }
    for i in 1..succ_offsets.len() {
        succ_offsets[i] += succ_offsets[i - 1];
    }
    let succ: Vec<u32> = edges.iter().map(|&(_, to)| to).collect();

    let mut pred_offsets = vec![0usize; comp_count as usize + 1];
    for &(_, to) in &edges {
        pred_offsets[to as usize + 1] += 1;
    }
    for i in 1..pred_offsets.len() {
        pred_offsets[i] += pred_offsets[i - 1];
    }
    let mut pred = vec![0u32; edges.len()];
    let mut cursor = pred_offsets.clone();
    for &(from, to) in &edges {
        pred[cursor[to as usize]] = from;
        cursor[to as usize] += 1;
    }

    let mut root_comps: Vec<u32> = root_objects
        .iter()
        .map(|&root| comp_of[root as usize])
        .collect();
    root_comps.sort_unstable();
    root_comps.dedup();

    Ok(SccGraph {
        comp_of,
        comp_count,
        representative,
        member_count,
        reachable_count,
        succ_offsets,
        succ,
        pred_offsets,
        pred,
        root_comps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collapse_graph(adjacency: Vec<Vec<u32>>, roots: &[u32]) -> SccGraph {
        collapse(&adjacency, roots, &CancelToken::new()).unwrap()
    }

    #[test]
    fn three_cycle_collapses_to_one_component() {
        // 0 -> 1 -> 2 -> 0, rooted at 0
        let scc = collapse_graph(vec![vec![1], vec![2], vec![0]], &[0]);
        assert_eq!(scc.comp_count, 1);
        assert_eq!(scc.comp_of, vec![0, 0, 0]);
        assert_eq!(scc.representative, vec![0]);
        assert_eq!(scc.member_count, vec![3]);
        assert!(scc.successors(0).is_empty());
    }

    #[test]
    fn acyclic_graph_collapses_to_singletons() {
        // 0 -> {1, 2}, 1 -> 3, 2 -> 3
        let scc = collapse_graph(vec![vec![1, 2], vec![3], vec![3], vec![]], &[0]);
        assert_eq!(scc.comp_count, 4);
        assert!(scc.member_count.iter().all(|&m| m == 1));
        // every object is its own representative: collapsing changed nothing
        for node in 0..4u32 {
            let comp = scc.comp_of[node as usize];
            assert_eq!(scc.representative[comp as usize], node);
        }
        assert_eq!(scc.reachable_count, 4);
    }

    #[test]
    fn unreachable_objects_get_no_component() {
        // 1 is rooted; 0 dangles unreachable
        let scc = collapse_graph(vec![vec![], vec![]], &[1]);
        assert_eq!(scc.comp_of[0], UNREACHABLE);
        assert_ne!(scc.comp_of[1], UNREACHABLE);
        assert_eq!(scc.reachable_count, 1);
    }

    #[test]
    fn mutual_pair_under_shared_referrer() {
        // 0 -> {1, 2}; 1 <-> 2
        let scc = collapse_graph(vec![vec![1, 2], vec![2], vec![1]], &[0]);
        assert_eq!(scc.comp_count, 2);
        let pair_comp = scc.comp_of[1];
        assert_eq!(scc.comp_of[2], pair_comp);
        assert_eq!(scc.member_count[pair_comp as usize], 2);
        assert_eq!(scc.representative[pair_comp as usize], 1);
        let single = scc.comp_of[0];
        assert_eq!(scc.successors(single), &[pair_comp]);
        assert_eq!(scc.predecessors(pair_comp), &[single]);
    }

    #[test]
    fn numbering_is_deterministic() {
        let adjacency = vec![vec![1, 3], vec![2], vec![1], vec![]];
        let a = collapse_graph(adjacency.clone(), &[0]);
        let b = collapse_graph(adjacency, &[0]);
        assert_eq!(a.comp_of, b.comp_of);
        assert_eq!(a.representative, b.representative);
        assert_eq!(a.succ, b.succ);
    }

    #[test]
    fn self_edges_vanish_in_condensation() {
        let scc = collapse_graph(vec![vec![0, 1], vec![]], &[0]);
        assert_eq!(scc.comp_count, 2);
        assert!(scc.successors(scc.comp_of[0]).len() == 1);
    }
}
