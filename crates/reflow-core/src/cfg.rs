//! Control flow graph container with cached structural analyses.

use std::collections::BTreeSet;

use indexmap::IndexMap;
use once_cell::unsync::OnceCell;

use crate::block::CfgBlock;
use crate::error::Error;
use crate::flowgraph::FlowGraph;
use crate::jumptable::JumpTable;
use crate::node::NodeId;
use crate::reducibility::DerivedGraphSequence;

/// A natural loop: the header plus every node of the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NaturalLoop {
    pub header: NodeId,
    pub body: Vec<NodeId>,
}

/// A function's control flow graph.
///
/// Blocks and edges are ordered: a two-way branch lists its false
/// (fallthrough) successor first and the branch target second, a multiway
/// dispatch lists its default destination first. The derived graph sequence
/// and the flow graph are built lazily on first use and dropped together
/// whenever the tables change.
#[derive(Debug, Clone)]
pub struct Cfg {
    faddr: u64,
    blocks: IndexMap<NodeId, CfgBlock>,
    edges: IndexMap<NodeId, Vec<NodeId>>,
    jump_tables: IndexMap<u64, JumpTable>,
    graph_seq: OnceCell<DerivedGraphSequence>,
    flowgraph: OnceCell<FlowGraph>,
}

impl Cfg {
    pub fn new(faddr: u64) -> Self {
        Self {
            faddr,
            blocks: IndexMap::new(),
            edges: IndexMap::new(),
            jump_tables: IndexMap::new(),
            graph_seq: OnceCell::new(),
            flowgraph: OnceCell::new(),
        }
    }

    /// Address of the function this graph belongs to.
    pub fn faddr(&self) -> u64 {
        self.faddr
    }

    fn invalidate(&mut self) {
        self.graph_seq = OnceCell::new();
        self.flowgraph = OnceCell::new();
    }

    pub fn add_block(&mut self, id: NodeId, block: CfgBlock) {
        self.blocks.insert(id, block);
        self.invalidate();
    }

    /// Adds an edge unless it already exists.
    pub fn add_edge(&mut self, src: NodeId, tgt: NodeId) {
        let entry = self.edges.entry(src).or_default();
        if !entry.contains(&tgt) {
            entry.push(tgt);
            self.invalidate();
        }
    }

    pub fn blocks(&self) -> &IndexMap<NodeId, CfgBlock> {
        &self.blocks
    }

    pub fn block(&self, id: NodeId) -> Result<&CfgBlock, Error> {
        self.blocks.get(&id).ok_or(Error::MissingBlock(id))
    }

    pub fn has_block(&self, id: NodeId) -> bool {
        self.blocks.contains_key(&id)
    }

    pub fn edges(&self) -> &IndexMap<NodeId, Vec<NodeId>> {
        &self.edges
    }

    /// Successors in edge order.
    pub fn successors(&self, src: NodeId) -> &[NodeId] {
        self.edges.get(&src).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Predecessors, derived from the edge table.
    pub fn predecessors(&self, tgt: NodeId) -> Vec<NodeId> {
        let mut preds = Vec::new();
        for (&src, tgts) in &self.edges {
            if tgts.contains(&tgt) {
                preds.push(src);
            }
        }
        preds
    }

    /// The edge table flattened into a set of pairs.
    pub fn edges_as_set(&self) -> BTreeSet<(NodeId, NodeId)> {
        let mut set = BTreeSet::new();
        for (&src, tgts) in &self.edges {
            for &tgt in tgts {
                set.insert((src, tgt));
            }
        }
        set
    }

    /// Edge-list surgery. Every derived analysis hangs off the edge table,
    /// so both caches drop together.
    pub fn modify_edges(&mut self, remove: &[(NodeId, NodeId)], add: &[(NodeId, NodeId)]) {
        for &(src, tgt) in remove {
            if let Some(tgts) = self.edges.get_mut(&src) {
                tgts.retain(|&t| t != tgt);
            }
        }
        for &(src, tgt) in add {
            let entry = self.edges.entry(src).or_default();
            if !entry.contains(&tgt) {
                entry.push(tgt);
            }
        }
        self.invalidate();
    }

    pub fn add_jump_table(&mut self, table: JumpTable) {
        self.jump_tables.insert(table.addr, table);
    }

    /// Jump table attached to the dispatching instruction at `addr`.
    pub fn jump_table(&self, addr: u64) -> Option<&JumpTable> {
        self.jump_tables.get(&addr)
    }

    /// Interval coarsening over the block/edge tables.
    pub fn derived_graph_sequence(&self) -> Result<&DerivedGraphSequence, Error> {
        self.graph_seq.get_or_try_init(|| {
            let entry = self
                .blocks
                .keys()
                .next()
                .copied()
                .ok_or(Error::MissingBlock(NodeId::Block(self.faddr)))?;
            Ok(DerivedGraphSequence::new(
                entry,
                self.blocks.keys().copied().collect(),
                self.edges.clone(),
            ))
        })
    }

    pub fn is_reducible(&self) -> Result<bool, Error> {
        Ok(self.derived_graph_sequence()?.is_reducible())
    }

    /// The flow graph over this CFG's nodes and edges, started at the
    /// derived sequence's effective start node.
    pub fn flowgraph(&self) -> Result<&FlowGraph, Error> {
        self.flowgraph.get_or_try_init(|| {
            let seq = self.derived_graph_sequence()?;
            let start = seq
                .effective_start()
                .ok_or(Error::MissingBlock(NodeId::Block(self.faddr)))?;
            FlowGraph::new(seq.nodes().to_vec(), seq.edges().clone(), start)
        })
    }

    /// Blocks in reverse postorder.
    pub fn rpo_sorted_nodes(&self) -> Result<&[NodeId], Error> {
        Ok(self.flowgraph()?.rpo_sorted())
    }

    /// Natural loops: one entry per back-edge target, bodies merged.
    pub fn find_loops(&self) -> Result<Vec<NaturalLoop>, Error> {
        let graph = self.flowgraph()?;
        let mut loops: IndexMap<NodeId, NaturalLoop> = IndexMap::new();
        for &node in graph.rpo_sorted() {
            for &succ in graph.successors(node) {
                if !graph.dominates(succ, node) {
                    continue;
                }
                let body = natural_loop_body(graph, succ, node);
                let entry = loops.entry(succ).or_insert_with(|| NaturalLoop {
                    header: succ,
                    body: Vec::new(),
                });
                for n in body {
                    if !entry.body.contains(&n) {
                        entry.body.push(n);
                    }
                }
            }
        }
        Ok(loops.into_values().collect())
    }

    /// Recomputes every block's loop membership, outermost loop first.
    pub fn compute_loop_levels(&mut self) -> Result<(), Error> {
        let mut loops = self.find_loops()?;
        // Outer loops have strictly larger bodies than the loops they nest.
        loops.sort_by(|a, b| b.body.len().cmp(&a.body.len()));
        for block in self.blocks.values_mut() {
            block.loop_levels.clear();
        }
        for l in &loops {
            for &n in &l.body {
                if let Some(block) = self.blocks.get_mut(&n) {
                    block.loop_levels.push(l.header);
                }
            }
        }
        Ok(())
    }

    /// Loop headers the block at `id` belongs to, outermost first.
    pub fn loop_levels(&self, id: NodeId) -> Result<&[NodeId], Error> {
        Ok(&self.block(id)?.loop_levels)
    }

    pub fn has_loop_level(&self, id: NodeId) -> bool {
        self.blocks
            .get(&id)
            .map(|b| !b.loop_levels.is_empty())
            .unwrap_or(false)
    }

    /// Deepest loop nesting over all blocks.
    pub fn max_loop_level(&self) -> usize {
        self.blocks
            .values()
            .map(|b| b.loop_levels.len())
            .max()
            .unwrap_or(0)
    }

    pub fn has_loops(&self) -> bool {
        self.max_loop_level() > 0
    }
}

fn natural_loop_body(graph: &FlowGraph, header: NodeId, latch: NodeId) -> Vec<NodeId> {
    let mut body = vec![header];
    let mut stack = vec![latch];
    while let Some(n) = stack.pop() {
        if !body.contains(&n) {
            body.push(n);
            for &p in graph.predecessors(n) {
                stack.push(p);
            }
        }
    }
    body
}

impl std::fmt::Display for Cfg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Basic blocks:")?;
        for (id, block) in &self.blocks {
            writeln!(f, "  {} ({} instructions)", id, block.instruction_count())?;
        }
        writeln!(f, "Edges:")?;
        for (src, tgts) in &self.edges {
            for tgt in tgts {
                writeln!(f, "  {} -> {}", src, tgt)?;
            }
        }
        Ok(())
    }
}
