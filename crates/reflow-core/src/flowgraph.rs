//! Generic flow graph: reverse postorder, edge classification and
//! dominators.
//!
//! Everything is computed once at construction. Two depth-first passes
//! establish a deterministic reverse postorder and classify every reachable
//! edge; the first pass orders successors by node id, the second re-orders
//! them by the first pass's ranks, which stabilizes the ordering across
//! input permutations. Immediate dominators then come from the iterative
//! Cooper-Harvey-Kennedy fixed point over that order. The value is
//! immutable afterwards; containers that allow edge mutation rebuild the
//! whole graph.

use indexmap::{IndexMap, IndexSet};

use crate::error::Error;
use crate::node::NodeId;

/// Depth-first-search classification of one edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EdgeFlavor {
    /// First visit of the target.
    Tree,
    /// Target still open on the visit stack; closes a loop.
    Back,
    /// Target is a finished descendant of the source.
    Forward,
    /// Target finished in another subtree.
    Cross,
}

impl std::fmt::Display for EdgeFlavor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tree => write!(f, "tree"),
            Self::Back => write!(f, "back"),
            Self::Forward => write!(f, "forward"),
            Self::Cross => write!(f, "cross"),
        }
    }
}

/// A directed graph over node ids with dominance information.
#[derive(Debug, Clone)]
pub struct FlowGraph {
    nodes: Vec<NodeId>,
    edges: IndexMap<NodeId, Vec<NodeId>>,
    start: NodeId,
    rev_edges: IndexMap<NodeId, Vec<NodeId>>,
    rpo_sorted: Vec<NodeId>,
    rpo: IndexMap<NodeId, usize>,
    edge_flavors: IndexMap<(NodeId, NodeId), EdgeFlavor>,
    idoms: IndexMap<NodeId, NodeId>,
}

impl FlowGraph {
    /// Builds the graph and computes its analyses.
    ///
    /// Fails if the node list or edge table is malformed, or if some listed
    /// node cannot be reached from `start`: dominators are total over the
    /// node list, so an unreachable node has no valid answer.
    pub fn new(
        nodes: Vec<NodeId>,
        edges: IndexMap<NodeId, Vec<NodeId>>,
        start: NodeId,
    ) -> Result<Self, Error> {
        let node_set: IndexSet<NodeId> = nodes.iter().copied().collect();
        if node_set.len() != nodes.len() {
            let mut seen = IndexSet::new();
            for &n in &nodes {
                if !seen.insert(n) {
                    return Err(Error::DuplicateNode(n));
                }
            }
        }
        if !node_set.contains(&start) {
            return Err(Error::StartNodeMissing(start));
        }
        for (src, tgts) in &edges {
            if !node_set.contains(src) {
                return Err(Error::UnknownEdgeEndpoint(*src));
            }
            let mut seen = IndexSet::new();
            for tgt in tgts {
                if !node_set.contains(tgt) {
                    return Err(Error::UnknownEdgeEndpoint(*tgt));
                }
                if !seen.insert(*tgt) {
                    return Err(Error::DuplicateEdge(*src, *tgt));
                }
            }
        }

        let mut graph = Self {
            nodes,
            edges,
            start,
            rev_edges: IndexMap::new(),
            rpo_sorted: Vec::new(),
            rpo: IndexMap::new(),
            edge_flavors: IndexMap::new(),
            idoms: IndexMap::new(),
        };
        graph.compute_rev_edges();
        graph.compute_dfs();
        graph.compute_dfs();
        graph.compute_doms()?;
        Ok(graph)
    }

    fn compute_rev_edges(&mut self) {
        let mut rev: IndexMap<NodeId, Vec<NodeId>> = IndexMap::new();
        for (&src, tgts) in &self.edges {
            for &tgt in tgts {
                rev.entry(tgt).or_default().push(src);
            }
        }
        self.rev_edges = rev;
    }

    fn compute_dfs(&mut self) {
        // Ranks of the previous pass, empty on the first one.
        let prev_rpo = std::mem::take(&mut self.rpo);

        #[allow(clippy::too_many_arguments)]
        fn visit(
            edges: &IndexMap<NodeId, Vec<NodeId>>,
            prev_rpo: &IndexMap<NodeId, usize>,
            node: NodeId,
            vtime: &mut usize,
            start_time: &mut IndexMap<NodeId, usize>,
            end_time: &mut IndexMap<NodeId, usize>,
            flavors: &mut IndexMap<(NodeId, NodeId), EdgeFlavor>,
            postorder: &mut Vec<NodeId>,
        ) {
            start_time.insert(node, *vtime);
            *vtime += 1;

            let mut succs: Vec<NodeId> = edges.get(&node).cloned().unwrap_or_default();
            if prev_rpo.is_empty() {
                succs.sort();
            } else {
                succs.sort_by_key(|s| prev_rpo.get(s).copied().unwrap_or(usize::MAX));
            }

            for tgt in succs {
                if !start_time.contains_key(&tgt) {
                    flavors.insert((node, tgt), EdgeFlavor::Tree);
                    visit(
                        edges, prev_rpo, tgt, vtime, start_time, end_time, flavors, postorder,
                    );
                } else if !end_time.contains_key(&tgt) {
                    flavors.insert((node, tgt), EdgeFlavor::Back);
                } else {
                    let started_later = start_time.get(&tgt).copied().unwrap_or(0)
                        > start_time.get(&node).copied().unwrap_or(0);
                    let flavor = if started_later {
                        EdgeFlavor::Forward
                    } else {
                        EdgeFlavor::Cross
                    };
                    flavors.insert((node, tgt), flavor);
                }
            }

            end_time.insert(node, *vtime);
            *vtime += 1;
            postorder.push(node);
        }

        let mut vtime = 0usize;
        let mut start_time = IndexMap::new();
        let mut end_time = IndexMap::new();
        let mut flavors = IndexMap::new();
        let mut postorder = Vec::new();
        visit(
            &self.edges,
            &prev_rpo,
            self.start,
            &mut vtime,
            &mut start_time,
            &mut end_time,
            &mut flavors,
            &mut postorder,
        );

        postorder.reverse();
        self.rpo = postorder.iter().enumerate().map(|(i, &n)| (n, i)).collect();
        self.rpo_sorted = postorder;
        self.edge_flavors = flavors;
    }

    fn compute_doms(&mut self) -> Result<(), Error> {
        let mut idoms: IndexMap<NodeId, Option<NodeId>> =
            self.nodes.iter().map(|&n| (n, None)).collect();
        idoms.insert(self.start, Some(self.start));

        let mut changed = true;
        while changed {
            changed = false;
            for &node in &self.rpo_sorted {
                if node == self.start {
                    continue;
                }
                let mut new_idom: Option<NodeId> = None;
                for &pred in self.predecessors(node) {
                    // Only predecessors that already have an answer take
                    // part in this round.
                    if idoms.get(&pred).copied().flatten().is_none() {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => pred,
                        Some(current) => intersect(&idoms, &self.rpo, pred, current)?,
                    });
                }
                let new_idom = new_idom.ok_or(Error::UnreachableNode(node))?;
                if idoms.get(&node).copied().flatten() != Some(new_idom) {
                    idoms.insert(node, Some(new_idom));
                    changed = true;
                }
            }
        }

        // Dominators are total over the node list; a leftover hole means
        // the start node cannot reach that node.
        let mut result = IndexMap::with_capacity(idoms.len());
        for (node, idom) in idoms {
            match idom {
                Some(d) => {
                    result.insert(node, d);
                }
                None => return Err(Error::UnreachableNode(node)),
            }
        }
        self.idoms = result;
        Ok(())
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn start_node(&self) -> NodeId {
        self.start
    }

    pub fn edges(&self) -> &IndexMap<NodeId, Vec<NodeId>> {
        &self.edges
    }

    /// Successors in edge-list order.
    pub fn successors(&self, node: NodeId) -> &[NodeId] {
        self.edges.get(&node).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn predecessors(&self, node: NodeId) -> &[NodeId] {
        self.rev_edges.get(&node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All nodes reachable from the start, in reverse postorder.
    pub fn rpo_sorted(&self) -> &[NodeId] {
        &self.rpo_sorted
    }

    /// Rank of `node` in the reverse postorder.
    pub fn rpo_number(&self, node: NodeId) -> Result<usize, Error> {
        self.rpo
            .get(&node)
            .copied()
            .ok_or(Error::UnreachableNode(node))
    }

    /// Classification of the edge `src -> tgt`.
    pub fn edge_flavor(&self, src: NodeId, tgt: NodeId) -> Result<EdgeFlavor, Error> {
        self.edge_flavors
            .get(&(src, tgt))
            .copied()
            .ok_or(Error::MissingEdgeFlavor(src, tgt))
    }

    pub fn edge_flavors(&self) -> &IndexMap<(NodeId, NodeId), EdgeFlavor> {
        &self.edge_flavors
    }

    /// Immediate dominator of `node`. The start node is its own.
    pub fn idom(&self, node: NodeId) -> Result<NodeId, Error> {
        self.idoms.get(&node).copied().ok_or(Error::MissingIdom(node))
    }

    pub fn idoms(&self) -> &IndexMap<NodeId, NodeId> {
        &self.idoms
    }

    /// A node where two or more edges meet.
    pub fn is_merge_node(&self, node: NodeId) -> bool {
        self.predecessors(node).len() >= 2
    }

    /// Nodes without outgoing edges.
    pub fn sink_nodes(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .copied()
            .filter(|&n| self.successors(n).is_empty())
            .collect()
    }

    /// True if `a` lies on every path from the start node to `b`.
    pub fn dominates(&self, a: NodeId, b: NodeId) -> bool {
        if a == b {
            return true;
        }
        let mut finger = b;
        while finger != self.start {
            if finger == a {
                return true;
            }
            match self.idoms.get(&finger) {
                Some(&d) => finger = d,
                None => return false,
            }
        }
        finger == a
    }

    /// The reverse graph, augmented with a phantom exit node that fans out
    /// to every sink, and started at that phantom.
    ///
    /// Fails when the graph has no sink at all (every node is inside some
    /// endless loop): nothing is reachable backwards from the phantom then.
    pub fn inverse_with_phantom_exit_node(&self) -> Result<FlowGraph, Error> {
        let phantom = NodeId::Phantom(self.nodes.len() as u32);
        let mut aug_edges = self.rev_edges.clone();
        aug_edges.insert(phantom, self.sink_nodes());
        let mut aug_nodes = self.nodes.clone();
        aug_nodes.push(phantom);
        FlowGraph::new(aug_nodes, aug_edges, phantom)
    }

    /// Immediate postdominators. Sink nodes map to the phantom exit; the
    /// phantom itself does not appear as a key.
    pub fn ipostdoms(&self) -> Result<IndexMap<NodeId, NodeId>, Error> {
        let reverse = self.inverse_with_phantom_exit_node()?;
        let mut idoms = reverse.idoms.clone();
        idoms.shift_remove(&reverse.start);
        Ok(idoms)
    }
}

/// Nearest common dominator of two already-processed nodes, walking idom
/// chains. Ranks are reverse postorder, so the comparison is flipped
/// relative to the postorder formulation in the paper.
fn intersect(
    idoms: &IndexMap<NodeId, Option<NodeId>>,
    rpo: &IndexMap<NodeId, usize>,
    b1: NodeId,
    b2: NodeId,
) -> Result<NodeId, Error> {
    let idom_of = |n: NodeId| -> Result<NodeId, Error> {
        idoms.get(&n).copied().flatten().ok_or(Error::MissingIdom(n))
    };
    let rank_of =
        |n: NodeId| -> Result<usize, Error> { rpo.get(&n).copied().ok_or(Error::UnreachableNode(n)) };

    let mut finger1 = b1;
    let mut finger2 = b2;
    while finger1 != finger2 {
        while rank_of(finger1)? > rank_of(finger2)? {
            finger1 = idom_of(finger1)?;
        }
        while rank_of(finger2)? > rank_of(finger1)? {
            finger2 = idom_of(finger2)?;
        }
    }
    Ok(finger1)
}
