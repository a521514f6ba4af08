//! Control flow graph construction.
//!
//! Carves a flat instruction listing into basic blocks using the classic
//! leader algorithm: every branch target, every conditional fallthrough,
//! and every instruction following a terminator starts a new block. Edges
//! follow [`Instruction::successor_addrs`], so the false arm of a
//! conditional branch is always listed before the true arm and an indirect
//! branch lists its default destination first.

use crate::config::StructuringConfig;
use crate::error::StructuringError;
use crate::trampoline::TrampolineComposer;
use indexmap::IndexMap;
use reflow_core::{Cfg, CfgBlock, Instruction, NodeId, Operation, PatchEvent};
use std::collections::BTreeSet;
use tracing::debug;

/// Builds control flow graphs from decoded instructions.
pub struct CfgBuilder;

impl CfgBuilder {
    /// Builds a CFG from a sequence of instructions.
    ///
    /// The instructions should be from a single function or code region.
    /// Blocks that cannot be reached from `entry` are dropped, as are
    /// edges whose destination lies outside the decoded region.
    pub fn build(instructions: &[Instruction], entry: u64) -> Cfg {
        let (blocks, edges) = Self::carve(instructions, entry);
        Self::assemble(entry, blocks, edges)
    }

    /// Builds a CFG and collapses patched trampolines in it.
    ///
    /// `events` maps the in-code address of each patch wrapper to its patch
    /// record. Trampoline composition runs on the raw block and edge tables,
    /// before assembly, so the returned graph already carries one collapsed
    /// trampoline block per event.
    pub fn build_with_patches(
        instructions: &[Instruction],
        entry: u64,
        events: IndexMap<u64, PatchEvent>,
        config: &StructuringConfig,
    ) -> Result<Cfg, StructuringError> {
        let (mut blocks, mut edges) = Self::carve(instructions, entry);
        if !events.is_empty() {
            let composer = TrampolineComposer::new(events, config.max_payload_chain);
            composer.compose(&mut blocks, &mut edges)?;
        }
        Ok(Self::assemble(entry, blocks, edges))
    }

    /// Splits the instruction stream into blocks and computes the edge table.
    fn carve(
        instructions: &[Instruction],
        entry: u64,
    ) -> (IndexMap<NodeId, CfgBlock>, IndexMap<NodeId, Vec<NodeId>>) {
        if instructions.is_empty() {
            let mut blocks = IndexMap::new();
            blocks.insert(NodeId::Block(entry), CfgBlock::new(entry));
            return (blocks, IndexMap::new());
        }

        // Step 1: find all leaders (block start addresses). The sorted index
        // is built once and reused for the block carving below.
        let mut sorted_indices: Vec<usize> = (0..instructions.len()).collect();
        sorted_indices.sort_by_key(|&i| instructions[i].address);

        let mut leaders = BTreeSet::new();
        leaders.insert(entry);

        for (pos, &idx) in sorted_indices.iter().enumerate() {
            let inst = &instructions[idx];
            match &inst.operation {
                Operation::Branch { target } => {
                    leaders.insert(*target);
                }
                Operation::ConditionalBranch {
                    target,
                    fallthrough,
                    ..
                } => {
                    leaders.insert(*target);
                    leaders.insert(*fallthrough);
                }
                Operation::IndirectBranch { targets, .. } => {
                    for &target in targets {
                        leaders.insert(target);
                    }
                }
                _ => {}
            }
            // Calls do not end a block: control resumes at the following
            // instruction, so only real terminators force a split here.
            if inst.is_terminator() {
                if let Some(&next_idx) = sorted_indices.get(pos + 1) {
                    leaders.insert(instructions[next_idx].address);
                }
            }
        }

        // Step 2: carve blocks, leader to leader. A leader pointing outside
        // the decoded region covers no instructions and produces no block;
        // edges aimed at it are dropped in step 3.
        let leaders_vec: Vec<u64> = leaders.iter().copied().collect();
        let mut blocks: IndexMap<NodeId, CfgBlock> = IndexMap::new();

        for (i, &leader) in leaders_vec.iter().enumerate() {
            let start_idx =
                sorted_indices.partition_point(|&idx| instructions[idx].address < leader);
            let end_idx = if let Some(&next_leader) = leaders_vec.get(i + 1) {
                sorted_indices.partition_point(|&idx| instructions[idx].address < next_leader)
            } else {
                sorted_indices.len()
            };
            if start_idx >= end_idx {
                debug!("leader {:#x} covers no decoded instructions, skipping", leader);
                continue;
            }

            let first_addr = instructions[sorted_indices[start_idx]].address;
            let mut block = CfgBlock::new(first_addr);
            for &idx in &sorted_indices[start_idx..end_idx] {
                block.push_instruction(instructions[idx].clone());
            }
            blocks.insert(NodeId::Block(first_addr), block);
        }

        // The entry block leads the table so the graph sequence starts there.
        if let Some(pos) = blocks.get_index_of(&NodeId::Block(entry)) {
            blocks.move_index(pos, 0);
        }

        // Step 3: edges, in successor order. The false arm of a conditional
        // branch precedes the true arm and an indirect branch lists its
        // default destination first.
        let mut edges: IndexMap<NodeId, Vec<NodeId>> = IndexMap::new();
        for (&id, block) in &blocks {
            if let Some(last) = block.last_instruction() {
                for addr in last.successor_addrs() {
                    let target = NodeId::Block(addr);
                    if blocks.contains_key(&target) {
                        let succs = edges.entry(id).or_default();
                        if !succs.contains(&target) {
                            succs.push(target);
                        }
                    } else {
                        debug!(
                            "dropping edge {} -> {:#x} outside the decoded region",
                            id, addr
                        );
                    }
                }
            }
        }

        // Step 4: drop blocks the entry cannot reach. Dead carve fragments
        // (alignment padding, unreferenced literals) would otherwise show up
        // as extra roots in the flow graph.
        Self::prune_unreachable(&mut blocks, &mut edges);

        (blocks, edges)
    }

    fn prune_unreachable(
        blocks: &mut IndexMap<NodeId, CfgBlock>,
        edges: &mut IndexMap<NodeId, Vec<NodeId>>,
    ) {
        let start = match blocks.keys().next() {
            Some(&start) => start,
            None => return,
        };

        let mut reachable: BTreeSet<NodeId> = BTreeSet::new();
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            if !reachable.insert(node) {
                continue;
            }
            if let Some(succs) = edges.get(&node) {
                for &succ in succs {
                    if !reachable.contains(&succ) {
                        stack.push(succ);
                    }
                }
            }
        }

        let before = blocks.len();
        blocks.retain(|id, _| reachable.contains(id));
        edges.retain(|id, _| reachable.contains(id));
        if blocks.len() < before {
            debug!("pruned {} unreachable blocks", before - blocks.len());
        }
    }

    fn assemble(
        entry: u64,
        blocks: IndexMap<NodeId, CfgBlock>,
        edges: IndexMap<NodeId, Vec<NodeId>>,
    ) -> Cfg {
        let mut cfg = Cfg::new(entry);
        for (id, block) in blocks {
            cfg.add_block(id, block);
        }
        for (src, succs) in edges {
            for succ in succs {
                cfg.add_edge(src, succ);
            }
        }
        cfg
    }
}
