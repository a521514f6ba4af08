//! CFG block representation, including composed trampoline nodes.

use indexmap::IndexMap;

use crate::error::Error;
use crate::instruction::Instruction;
use crate::node::NodeId;
use crate::patch::{PatchEvent, TrampolineCase};

/// Role one raw block plays inside a composed trampoline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TrampolineRole {
    /// Saves state and enters the detour; its address names the composed
    /// node.
    Setup,
    /// The payload body.
    Payload,
    /// One block of a multi-block payload chain.
    PayloadPart(u32),
    /// Two-way block choosing between takedown and breakout.
    Decision,
    /// Restores state and leaves the patched region.
    Breakout,
    /// Restores state and rejoins the original code.
    Takedown,
    /// The original-code block execution rejoins.
    Fallthrough,
}

impl std::fmt::Display for TrampolineRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Setup => write!(f, "setupblock"),
            Self::Payload => write!(f, "payload"),
            Self::PayloadPart(n) => write!(f, "payload-{}", n),
            Self::Decision => write!(f, "decisionblock"),
            Self::Breakout => write!(f, "breakout"),
            Self::Takedown => write!(f, "takedown"),
            Self::Fallthrough => write!(f, "fallthrough"),
        }
    }
}

/// Internal structure of a composed trampoline node.
///
/// Composition removes the member blocks from the graph, so the info keeps
/// each member's instructions for payload pattern matching.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TrampolineInfo {
    event: PatchEvent,
    roles: IndexMap<TrampolineRole, NodeId>,
    internal_edges: IndexMap<NodeId, Vec<NodeId>>,
    member_code: IndexMap<NodeId, Vec<Instruction>>,
}

impl TrampolineInfo {
    pub fn new(event: PatchEvent) -> Self {
        Self {
            event,
            roles: IndexMap::new(),
            internal_edges: IndexMap::new(),
            member_code: IndexMap::new(),
        }
    }

    pub fn event(&self) -> &PatchEvent {
        &self.event
    }

    pub fn add_role(&mut self, role: TrampolineRole, node: NodeId) {
        self.roles.insert(role, node);
    }

    pub fn has_role(&self, role: TrampolineRole) -> bool {
        self.roles.contains_key(&role)
    }

    pub fn role_node(&self, role: TrampolineRole) -> Option<NodeId> {
        self.roles.get(&role).copied()
    }

    pub fn roles(&self) -> &IndexMap<TrampolineRole, NodeId> {
        &self.roles
    }

    /// Address execution enters the trampoline: the setup block.
    pub fn first_node(&self) -> Result<NodeId, Error> {
        self.role_node(TrampolineRole::Setup)
            .ok_or(Error::MissingSetupBlock(self.event_node()))
    }

    fn event_node(&self) -> NodeId {
        NodeId::Block(self.event.wrapper_va)
    }

    pub fn add_internal_edge(&mut self, src: NodeId, tgt: NodeId) {
        let entry = self.internal_edges.entry(src).or_default();
        if !entry.contains(&tgt) {
            entry.push(tgt);
        }
    }

    pub fn internal_edges(&self) -> &IndexMap<NodeId, Vec<NodeId>> {
        &self.internal_edges
    }

    pub fn add_member_code(&mut self, node: NodeId, instructions: Vec<Instruction>) {
        self.member_code.insert(node, instructions);
    }

    /// Instructions of one spliced member block.
    pub fn member_code(&self, node: NodeId) -> Option<&[Instruction]> {
        self.member_code.get(&node).map(Vec::as_slice)
    }

    /// Payload-role blocks, chain order.
    pub fn payload_nodes(&self) -> Vec<NodeId> {
        self.roles
            .iter()
            .filter(|(role, _)| {
                matches!(role, TrampolineRole::Payload | TrampolineRole::PayloadPart(_))
            })
            .map(|(_, &n)| n)
            .collect()
    }

    pub fn cases(&self) -> &[TrampolineCase] {
        &self.event.cases
    }

    pub fn fallthrough_destination(&self) -> Option<u64> {
        self.event.fallthrough_destination
    }
}

impl std::fmt::Display for TrampolineInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "trampoline at {:#x}", self.event.wrapper_va)?;
        for (role, node) in &self.roles {
            writeln!(f, "  {}: {}", role, node)?;
        }
        for (src, tgts) in &self.internal_edges {
            for tgt in tgts {
                writeln!(f, "  edge {} -> {}", src, tgt)?;
            }
        }
        Ok(())
    }
}

/// What a CFG node holds.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BlockKind {
    /// Ordinary basic block.
    Basic,
    /// Several raw blocks composed into one opaque node.
    Trampoline(TrampolineInfo),
}

/// One node of a CFG: a run of instructions plus structural annotations.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CfgBlock {
    /// Address of the first instruction.
    pub first_addr: u64,
    /// Address of the last instruction.
    pub last_addr: u64,
    /// Instructions keyed by address, in address order.
    pub instructions: IndexMap<u64, Instruction>,
    /// Headers of the loops this block belongs to, outermost first.
    pub loop_levels: Vec<NodeId>,
    /// Basic or trampoline.
    pub kind: BlockKind,
}

impl CfgBlock {
    pub fn new(first_addr: u64) -> Self {
        Self {
            first_addr,
            last_addr: first_addr,
            instructions: IndexMap::new(),
            loop_levels: Vec::new(),
            kind: BlockKind::Basic,
        }
    }

    /// A composed trampoline node keyed by its setup block's address.
    pub fn trampoline(first_addr: u64, info: TrampolineInfo) -> Self {
        Self {
            first_addr,
            last_addr: first_addr,
            instructions: IndexMap::new(),
            loop_levels: Vec::new(),
            kind: BlockKind::Trampoline(info),
        }
    }

    /// Appends an instruction; instructions arrive in address order.
    pub fn push_instruction(&mut self, inst: Instruction) {
        self.last_addr = inst.address;
        self.instructions.insert(inst.address, inst);
    }

    pub fn is_trampoline(&self) -> bool {
        matches!(self.kind, BlockKind::Trampoline(_))
    }

    pub fn trampoline_info(&self) -> Option<&TrampolineInfo> {
        match &self.kind {
            BlockKind::Trampoline(info) => Some(info),
            BlockKind::Basic => None,
        }
    }

    pub fn last_instruction(&self) -> Option<&Instruction> {
        self.instructions.values().last()
    }

    pub fn instruction_count(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Instructions as an ordered slice-friendly list.
    pub fn instruction_list(&self) -> Vec<Instruction> {
        self.instructions.values().cloned().collect()
    }

    /// True when the block sits inside at least one loop.
    pub fn in_loop(&self) -> bool {
        !self.loop_levels.is_empty()
    }
}
