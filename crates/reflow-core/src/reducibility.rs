//! Interval analysis and the derived graph sequence.
//!
//! Based on Frances E. Allen, Control Flow Analysis, SIGPLAN Notices, 1970:
//! a graph is reducible exactly when repeatedly collapsing its intervals
//! ends in a single node. The structurer itself does not need the verdict
//! (its goto fallback covers irreducible graphs); callers use it to pick a
//! lowering strategy, and the interval hierarchy yields a reverse postorder
//! over the original nodes.

use indexmap::{IndexMap, IndexSet};

use crate::node::NodeId;

/// Follow-node assignment for two-way conditionals, after Cifuentes,
/// Structuring Decompiled Graphs, CC'96.
#[derive(Debug, Clone, Default)]
pub struct TwoWayConditionals {
    /// Conditional head to follow node.
    pub follows: IndexMap<NodeId, NodeId>,
    /// Conditional heads no follow node was found for.
    pub unresolved: Vec<NodeId>,
}

/// Maximal single-entry subgraph in which every closed path passes through
/// the header.
#[derive(Debug, Clone)]
pub struct GraphInterval {
    header: NodeId,
    nodes: IndexSet<NodeId>,
    edges: IndexMap<NodeId, Vec<NodeId>>,
    rev_edges: IndexMap<NodeId, Vec<NodeId>>,
    rpo: IndexMap<NodeId, usize>,
}

impl GraphInterval {
    fn new(header: NodeId) -> Self {
        let mut nodes = IndexSet::new();
        nodes.insert(header);
        Self {
            header,
            nodes,
            edges: IndexMap::new(),
            rev_edges: IndexMap::new(),
            rpo: IndexMap::new(),
        }
    }

    pub fn header(&self) -> NodeId {
        self.header
    }

    pub fn nodes(&self) -> &IndexSet<NodeId> {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, n: NodeId) -> bool {
        self.nodes.contains(&n)
    }

    fn contains_all<'a>(&self, mut ns: impl Iterator<Item = &'a NodeId>) -> bool {
        ns.all(|n| self.nodes.contains(n))
    }

    fn add_node(&mut self, n: NodeId) {
        self.nodes.insert(n);
    }

    fn add_edge(&mut self, src: NodeId, tgt: NodeId) {
        self.edges.entry(src).or_default().push(tgt);
        self.rev_edges.entry(tgt).or_default().push(src);
    }

    /// Distinct interval-internal successors, ascending.
    fn post(&self, n: NodeId) -> Vec<NodeId> {
        let mut out: Vec<NodeId> = self
            .edges
            .get(&n)
            .map(|v| v.iter().copied().collect::<IndexSet<_>>().into_iter().collect())
            .unwrap_or_default();
        out.sort();
        out
    }

    /// Distinct interval-internal predecessors, ascending.
    fn pre(&self, n: NodeId) -> Vec<NodeId> {
        let mut out: Vec<NodeId> = self
            .rev_edges
            .get(&n)
            .map(|v| v.iter().copied().collect::<IndexSet<_>>().into_iter().collect())
            .unwrap_or_default();
        out.sort();
        out
    }

    /// Visit order over the interval using the two-stack trick: a node's
    /// position keeps being pushed back until its last visit, which yields
    /// a topological order over the acyclic part (back edges all target the
    /// header and are ignored).
    fn compute_rpo(&mut self) {
        let mut s1: Vec<NodeId> = vec![self.header];
        let mut s2: Vec<NodeId> = Vec::new();
        while let Some(node) = s1.pop() {
            if let Some(pos) = s2.iter().position(|&n| n == node) {
                s2.remove(pos);
            }
            s2.push(node);
            for t in self.post(node) {
                if t != self.header {
                    s1.push(t);
                }
            }
        }
        self.rpo = s2.into_iter().enumerate().map(|(i, n)| (n, i)).collect();
    }

    /// Interval-local rank, header first.
    pub fn rpo(&self) -> &IndexMap<NodeId, usize> {
        &self.rpo
    }

    pub fn rpo_sorted_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.nodes.iter().copied().collect();
        nodes.sort_by_key(|n| self.rpo.get(n).copied().unwrap_or(usize::MAX));
        nodes
    }

    pub fn rpo_revsorted_nodes(&self) -> Vec<NodeId> {
        let mut nodes = self.rpo_sorted_nodes();
        nodes.reverse();
        nodes
    }

    /// Dominator sets. A single forward pass suffices: the interval is
    /// acyclic apart from back edges into the header, which contribute
    /// nothing new.
    pub fn dominators(&self) -> IndexMap<NodeId, IndexSet<NodeId>> {
        let mut dom: IndexMap<NodeId, IndexSet<NodeId>> = IndexMap::new();
        dom.insert(self.header, IndexSet::from([self.header]));
        for n in self.rpo_sorted_nodes() {
            if n == self.header {
                continue;
            }
            let mut acc: Option<IndexSet<NodeId>> = None;
            for p in self.pre(n) {
                if let Some(dp) = dom.get(&p) {
                    acc = Some(match acc {
                        None => dp.clone(),
                        Some(cur) => cur.intersection(dp).copied().collect(),
                    });
                }
            }
            let mut dn: IndexSet<NodeId> = acc
                .unwrap_or_default()
                .into_iter()
                .filter(|k| self.nodes.contains(k))
                .collect();
            dn.insert(n);
            dom.insert(n, dn);
        }
        dom
    }

    /// Immediate dominator of every non-header node: its highest-ranked
    /// strict dominator.
    pub fn immediate_dominators(&self) -> IndexMap<NodeId, NodeId> {
        let dom = self.dominators();
        let mut idom = IndexMap::new();
        for (&n, dn) in &dom {
            if n == self.header {
                continue;
            }
            let best = dn
                .iter()
                .filter(|&&k| k != n)
                .max_by_key(|&&k| self.rpo.get(&k).copied().unwrap_or(0));
            if let Some(&d) = best {
                idom.insert(n, d);
            }
        }
        idom
    }

    /// True if `child` is reachable from `parent` along interval edges.
    fn is_descendant(&self, child: NodeId, parent: NodeId) -> bool {
        let mut seen: IndexSet<NodeId> = IndexSet::new();
        let mut stack = vec![parent];
        while let Some(n) = stack.pop() {
            for t in self.post(n) {
                if t == child {
                    return true;
                }
                if seen.insert(t) {
                    stack.push(t);
                }
            }
        }
        false
    }

    /// Two-way conditional heads and their follow nodes.
    ///
    /// A head qualifies when it has exactly two successors, is not a loop
    /// header and is not a latching node. Its follow is the highest-ranked
    /// merge node it immediately dominates; heads without one stay
    /// unresolved until a later (earlier-ranked) head resolves, provided
    /// its follow is reachable from them.
    pub fn two_way_conditionals(&self) -> TwoWayConditionals {
        let idom = self.immediate_dominators();
        let find_follow = |m: NodeId| -> Option<NodeId> {
            self.nodes
                .iter()
                .copied()
                .filter(|&i| {
                    i != self.header && idom.get(&i) == Some(&m) && self.pre(i).len() >= 2
                })
                .max_by_key(|&i| self.rpo.get(&i).copied().unwrap_or(0))
        };

        let mut follows: IndexMap<NodeId, NodeId> = IndexMap::new();
        let mut unresolved: IndexSet<NodeId> = IndexSet::new();
        for m in self.rpo_revsorted_nodes() {
            let post = self.post(m);
            let not_loop_header = m != self.header || self.pre(m).is_empty();
            if post.len() == 2 && not_loop_header && !post.contains(&self.header) {
                match find_follow(m) {
                    Some(follow) => {
                        follows.insert(m, follow);
                        let resolved: Vec<NodeId> = unresolved
                            .iter()
                            .copied()
                            .filter(|&k| self.is_descendant(follow, k))
                            .collect();
                        for k in resolved {
                            follows.insert(k, follow);
                            unresolved.shift_remove(&k);
                        }
                    }
                    None => {
                        unresolved.insert(m);
                    }
                }
            }
        }
        TwoWayConditionals {
            follows,
            unresolved: unresolved.into_iter().collect(),
        }
    }
}

impl std::fmt::Display for GraphInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut nodes: Vec<NodeId> = self.nodes.iter().copied().collect();
        nodes.sort();
        let rendered: Vec<String> = nodes.iter().map(|n| n.to_string()).collect();
        write!(
            f,
            "{} ({}): {{{}}}",
            self.header,
            self.nodes.len(),
            rendered.join(", ")
        )
    }
}

/// One level of the derived sequence: a graph partitioned into intervals.
/// The first node is assumed to be the unique entry.
#[derive(Debug, Clone)]
pub struct IntervalGraph {
    entry: NodeId,
    nodes: Vec<NodeId>,
    edges: IndexMap<NodeId, Vec<NodeId>>,
    rev_edges: IndexMap<NodeId, Vec<NodeId>>,
    intervals: IndexMap<NodeId, GraphInterval>,
}

impl IntervalGraph {
    pub fn new(entry: NodeId, nodes: Vec<NodeId>, edges: IndexMap<NodeId, Vec<NodeId>>) -> Self {
        let mut rev_edges: IndexMap<NodeId, Vec<NodeId>> = IndexMap::new();
        for (&src, tgts) in &edges {
            for &tgt in tgts {
                rev_edges.entry(tgt).or_default().push(src);
            }
        }
        let mut graph = Self {
            entry,
            nodes,
            edges,
            rev_edges,
            intervals: IndexMap::new(),
        };
        graph.construct_intervals();
        graph
    }

    pub fn entry(&self) -> NodeId {
        self.entry
    }

    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn edges(&self) -> &IndexMap<NodeId, Vec<NodeId>> {
        &self.edges
    }

    pub fn intervals(&self) -> &IndexMap<NodeId, GraphInterval> {
        &self.intervals
    }

    /// Interval header covering `n`.
    pub fn interval_of(&self, n: NodeId) -> Option<NodeId> {
        self.intervals
            .iter()
            .find(|(_, i)| i.contains(n))
            .map(|(&h, _)| h)
    }

    fn successors(&self, n: NodeId) -> &[NodeId] {
        self.edges.get(&n).map(Vec::as_slice).unwrap_or(&[])
    }

    fn predecessors(&self, n: NodeId) -> &[NodeId] {
        self.rev_edges.get(&n).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Total node count over all intervals.
    pub fn interval_node_count(&self) -> usize {
        self.intervals.values().map(GraphInterval::len).sum()
    }

    /// Extends the ranks of the next-coarser level down to this level's
    /// nodes: each node gets its interval header's rank plus its own
    /// interval-local rank.
    pub fn hrpo(&self, prev: &IndexMap<NodeId, Vec<usize>>) -> IndexMap<NodeId, Vec<usize>> {
        let mut result = IndexMap::new();
        for (header, ranks) in prev {
            if let Some(interval) = self.intervals.get(header) {
                for (&n, &local) in interval.rpo() {
                    let mut extended = ranks.clone();
                    extended.push(local);
                    result.insert(n, extended);
                }
            }
        }
        result
    }

    /// Nodes and edges of the coarsened graph: one node per interval
    /// header, one edge per interval boundary crossing.
    pub fn interval_graph(&self) -> (Vec<NodeId>, IndexMap<NodeId, Vec<NodeId>>) {
        let headers: Vec<NodeId> = self.intervals.keys().copied().collect();
        if headers.len() == 1 {
            return (headers, IndexMap::new());
        }

        let mut pairs: IndexSet<(NodeId, NodeId)> = IndexSet::new();
        for (&header, interval) in &self.intervals {
            let mut external: IndexSet<NodeId> = IndexSet::new();
            for &n in interval.nodes() {
                for &j in self.successors(n) {
                    if !interval.contains(j) {
                        external.insert(j);
                    }
                }
            }
            // External successors are always headers of other intervals.
            for &other in &headers {
                if other != header && external.contains(&other) {
                    pairs.insert((header, other));
                }
            }
        }

        let mut edges: IndexMap<NodeId, Vec<NodeId>> = IndexMap::new();
        for (src, tgt) in pairs {
            edges.entry(src).or_default().push(tgt);
        }
        (headers, edges)
    }

    fn construct_intervals(&mut self) {
        use std::collections::VecDeque;

        let mut headers: VecDeque<NodeId> = VecDeque::from([self.entry]);
        let mut covered: IndexSet<NodeId> = IndexSet::new();
        let mut intervals: IndexMap<NodeId, GraphInterval> = IndexMap::new();

        while let Some(h) = headers.pop_front() {
            let mut interval = GraphInterval::new(h);
            covered.insert(h);
            let mut worklist: VecDeque<NodeId> = VecDeque::from([h]);
            while let Some(c) = worklist.pop_front() {
                for &tgt in self.successors(c) {
                    // A node joins once all of its predecessors are in;
                    // members never re-enter the worklist.
                    if !interval.contains(tgt)
                        && interval.contains_all(self.predecessors(tgt).iter())
                    {
                        interval.add_node(tgt);
                        worklist.push_back(tgt);
                        covered.insert(tgt);
                    }
                }
            }

            for (&src, tgts) in &self.edges {
                if !interval.contains(src) {
                    continue;
                }
                for &tgt in tgts {
                    if interval.contains(tgt) {
                        interval.add_edge(src, tgt);
                    }
                }
            }
            interval.compute_rpo();

            for &n in interval.nodes() {
                for &tgt in self.successors(n) {
                    if !interval.contains(tgt) && !covered.contains(&tgt) && !headers.contains(&tgt)
                    {
                        headers.push_back(tgt);
                    }
                }
            }

            intervals.insert(h, interval);
        }
        self.intervals = intervals;
    }
}

impl std::fmt::Display for IntervalGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Intervals ({})", self.intervals.len())?;
        for interval in self.intervals.values() {
            writeln!(f, "{}", interval)?;
        }
        Ok(())
    }
}

/// Successively coarsened interval graphs over one control flow graph.
#[derive(Debug, Clone)]
pub struct DerivedGraphSequence {
    entry: NodeId,
    nodes: Vec<NodeId>,
    edges: IndexMap<NodeId, Vec<NodeId>>,
    graphs: Vec<IntervalGraph>,
}

impl DerivedGraphSequence {
    pub fn new(entry: NodeId, nodes: Vec<NodeId>, edges: IndexMap<NodeId, Vec<NodeId>>) -> Self {
        let mut seq = Self {
            entry,
            nodes,
            edges,
            graphs: Vec::new(),
        };
        if !seq.nodes.is_empty() {
            seq.construct();
        }
        seq
    }

    fn construct(&mut self) {
        let g = IntervalGraph::new(self.entry, self.nodes.clone(), self.edges.clone());
        let (mut gnodes, mut gedges) = g.interval_graph();
        let mut prev_count = self.nodes.len() + 1;
        let mut interval_count = g.interval_node_count();
        self.graphs.push(g);

        while gnodes.len() > 1 && interval_count < prev_count {
            let g = IntervalGraph::new(self.entry, gnodes, gedges);
            let (next_nodes, next_edges) = g.interval_graph();
            gnodes = next_nodes;
            gedges = next_edges;
            prev_count = interval_count;
            interval_count = g.interval_node_count();
            self.graphs.push(g);
        }
        if gnodes.len() == 1 {
            self.graphs.push(IntervalGraph::new(self.entry, gnodes, gedges));
        }
    }

    /// Nodes of the original graph.
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    /// Edge table of the original graph.
    pub fn edges(&self) -> &IndexMap<NodeId, Vec<NodeId>> {
        &self.edges
    }

    pub fn graphs(&self) -> &[IntervalGraph] {
        &self.graphs
    }

    /// True when interval coarsening ends in a single node.
    pub fn is_reducible(&self) -> bool {
        self.graphs.last().map(|g| g.size() == 1).unwrap_or(false)
    }

    /// The single node of the final graph, when reducible. Structuring
    /// starts there.
    pub fn effective_start(&self) -> Option<NodeId> {
        self.graphs.last().and_then(|g| g.nodes().first().copied())
    }

    /// Hierarchical reverse postorder over the original nodes, built by
    /// unfolding interval-local ranks from the coarsest level down. Empty
    /// when the graph is irreducible.
    pub fn hrpo(&self) -> IndexMap<NodeId, Vec<usize>> {
        let mut prev: IndexMap<NodeId, Vec<usize>> = IndexMap::new();
        if let Some(last) = self.graphs.last() {
            if last.size() == 1 {
                if let Some(&header) = last.nodes().first() {
                    prev.insert(header, vec![0]);
                    for g in self.graphs[..self.graphs.len() - 1].iter().rev() {
                        prev = g.hrpo(&prev);
                    }
                }
            }
        }
        prev
    }

    /// Original nodes sorted by hierarchical rank; `None` when the graph
    /// is irreducible.
    pub fn rpo_sorted_nodes(&self) -> Option<Vec<NodeId>> {
        let hrpo = self.hrpo();
        if hrpo.is_empty() {
            return None;
        }
        let mut nodes: Vec<NodeId> = self.nodes.clone();
        nodes.sort_by(|a, b| hrpo.get(a).cmp(&hrpo.get(b)));
        Some(nodes)
    }

    /// Follow-node analysis over the entry interval of the original graph.
    pub fn two_way_conditionals(&self) -> Option<TwoWayConditionals> {
        self.graphs
            .first()
            .and_then(|g| g.intervals().values().next())
            .map(GraphInterval::two_way_conditionals)
    }
}

impl std::fmt::Display for DerivedGraphSequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Derived graph sequence for {} nodes", self.nodes.len())?;
        for g in &self.graphs {
            writeln!(f, "\n{}", g)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_sequence(edges: &[(u64, u64)], entry: u64) -> DerivedGraphSequence {
        let mut nodes: Vec<NodeId> = vec![NodeId::Block(entry)];
        let mut table: IndexMap<NodeId, Vec<NodeId>> = IndexMap::new();
        for &(src, tgt) in edges {
            for n in [NodeId::Block(src), NodeId::Block(tgt)] {
                if !nodes.contains(&n) {
                    nodes.push(n);
                }
            }
            table
                .entry(NodeId::Block(src))
                .or_default()
                .push(NodeId::Block(tgt));
        }
        DerivedGraphSequence::new(NodeId::Block(entry), nodes, table)
    }

    // --- Interval Construction Tests ---

    #[test]
    fn test_linear_chain_is_one_interval() {
        let seq = make_sequence(&[(1, 2), (2, 3)], 1);
        let g0 = &seq.graphs()[0];
        assert_eq!(g0.intervals().len(), 1);
        let interval = &g0.intervals()[&NodeId::Block(1)];
        assert_eq!(interval.len(), 3);
        assert!(interval.contains(NodeId::Block(3)));
    }

    #[test]
    fn test_loop_body_starts_its_own_interval() {
        // The loop header has an uncovered back-edge predecessor, so it
        // cannot join the entry interval.
        let seq = make_sequence(&[(1, 2), (2, 3), (3, 2), (2, 4)], 1);
        let g0 = &seq.graphs()[0];
        assert_eq!(g0.intervals().len(), 2);
        assert_eq!(g0.intervals()[&NodeId::Block(1)].len(), 1);
        let loop_interval = &g0.intervals()[&NodeId::Block(2)];
        assert_eq!(loop_interval.len(), 3);
        assert_eq!(g0.interval_of(NodeId::Block(4)), Some(NodeId::Block(2)));
    }

    #[test]
    fn test_entry_cycle_terminates() {
        // All of the entry's predecessors sit inside its own interval.
        let seq = make_sequence(&[(1, 2), (2, 1)], 1);
        let g0 = &seq.graphs()[0];
        assert_eq!(g0.intervals().len(), 1);
        assert_eq!(g0.intervals()[&NodeId::Block(1)].len(), 2);
        assert!(seq.is_reducible());
    }

    // --- Reducibility Tests ---

    #[test]
    fn test_structured_loop_is_reducible() {
        let seq = make_sequence(&[(1, 2), (2, 3), (3, 2), (2, 4)], 1);
        assert!(seq.is_reducible());
        assert_eq!(seq.effective_start(), Some(NodeId::Block(1)));
        // G0, the collapsed two-node graph, and the final single node.
        assert_eq!(seq.graphs().len(), 3);
    }

    #[test]
    fn test_two_entry_loop_is_irreducible() {
        let seq = make_sequence(&[(1, 2), (1, 3), (2, 3), (3, 2)], 1);
        assert!(!seq.is_reducible());
        assert!(seq.hrpo().is_empty());
        assert_eq!(seq.rpo_sorted_nodes(), None);
    }

    // --- Hierarchical RPO Tests ---

    #[test]
    fn test_hrpo_linear_chain() {
        let seq = make_sequence(&[(1, 2), (2, 3)], 1);
        let order = seq.rpo_sorted_nodes().unwrap();
        assert_eq!(
            order,
            vec![NodeId::Block(1), NodeId::Block(2), NodeId::Block(3)]
        );
    }

    #[test]
    fn test_hrpo_orders_loop_exit_before_latch() {
        let seq = make_sequence(&[(1, 2), (2, 3), (3, 2), (2, 4)], 1);
        let order = seq.rpo_sorted_nodes().unwrap();
        assert_eq!(
            order,
            vec![
                NodeId::Block(1),
                NodeId::Block(2),
                NodeId::Block(4),
                NodeId::Block(3)
            ]
        );
    }

    // --- Two-Way Conditional Tests ---

    #[test]
    fn test_diamond_follow_node() {
        let seq = make_sequence(&[(1, 2), (1, 3), (2, 4), (3, 4)], 1);
        let conditionals = seq.two_way_conditionals().unwrap();
        assert_eq!(
            conditionals.follows.get(&NodeId::Block(1)),
            Some(&NodeId::Block(4))
        );
        assert!(conditionals.unresolved.is_empty());
    }

    #[test]
    fn test_latching_branch_is_not_a_conditional_head() {
        // Node 3 branches back to the interval header, so it is latching
        // and gets no follow entry.
        let seq = make_sequence(&[(1, 2), (2, 3), (3, 1), (3, 4)], 1);
        let conditionals = seq.two_way_conditionals().unwrap();
        assert!(!conditionals.follows.contains_key(&NodeId::Block(3)));
    }

    // --- Interval Graph Tests ---

    #[test]
    fn test_interval_graph_edges() {
        let seq = make_sequence(&[(1, 2), (2, 3), (3, 2), (2, 4)], 1);
        let (nodes, edges) = seq.graphs()[0].interval_graph();
        assert_eq!(nodes, vec![NodeId::Block(1), NodeId::Block(2)]);
        assert_eq!(edges.get(&NodeId::Block(1)), Some(&vec![NodeId::Block(2)]));
        assert!(!edges.contains_key(&NodeId::Block(2)));
    }

    #[test]
    fn test_interval_node_count_partitions() {
        let seq = make_sequence(&[(1, 2), (2, 3), (3, 2), (2, 4)], 1);
        assert_eq!(seq.graphs()[0].interval_node_count(), 4);
    }
}
