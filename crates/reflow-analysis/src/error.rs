//! Error types for control flow structuring.

use reflow_core::{NodeId, TrampolineCase};
use thiserror::Error;

/// Fragment partitioning violations.
///
/// Fragments are monomorphic by construction; mixing predicated and plain
/// instructions in one fragment means an upstream invariant was broken, so
/// these abort the function instead of guessing.
#[derive(Error, Debug)]
pub enum FragmentError {
    /// A predicated instruction was pushed into a linear fragment.
    #[error("predicated instruction at {0:#x} pushed into a linear fragment")]
    PredicatedIntoLinear(u64),

    /// A plain instruction was pushed into a predicated fragment.
    #[error("plain instruction at {0:#x} pushed into a predicated fragment")]
    LinearIntoPredicated(u64),

    /// The instruction's predicate matches neither arm of the fragment.
    #[error(
        "instruction at {addr:#x} carries a third predicate for a fragment set by {setter:#x}"
    )]
    SetterMismatch { addr: u64, setter: u64 },

    /// `push_predicated` was called with an unpredicated instruction.
    #[error("instruction at {0:#x} has no predicate")]
    MissingPredicate(u64),
}

/// Trampoline composition violations.
#[derive(Error, Debug)]
pub enum TrampolineError {
    /// The declared case set matches no known trampoline shape.
    #[error("unrecognized trampoline shape at {wrapper:#x}: cases {cases:?}")]
    UnrecognizedShape {
        wrapper: u64,
        cases: Vec<TrampolineCase>,
    },

    /// A member block has the wrong number of successors for its role.
    #[error("trampoline block {block} has {found} successors, expected {expected}")]
    Arity {
        block: NodeId,
        expected: usize,
        found: usize,
    },

    /// The patch event does not declare where execution rejoins.
    #[error("trampoline at {0:#x} declares no fallthrough destination")]
    MissingFallthrough(u64),

    /// The payload chain never reached the fallthrough destination.
    #[error("trampoline at {wrapper:#x} payload chain exceeds {limit} blocks")]
    PayloadChain { wrapper: u64, limit: usize },

    /// An outside edge targets a member block other than the setup block.
    #[error("edge {src} -> {member} enters a trampoline interior")]
    EntersInterior { src: NodeId, member: NodeId },

    /// A role points at a block absent from the block table.
    #[error("trampoline member block {0} not found")]
    MissingMember(NodeId),

    /// Neither decision arm leads to the declared fallthrough destination.
    #[error("cannot tell takedown from breakout at decision block {0}")]
    AmbiguousDecision(NodeId),

    /// The setup block reaches the fallthrough destination directly.
    #[error("trampoline at {0:#x} has no payload block")]
    MissingPayload(u64),
}

/// Error type for the structuring passes.
#[derive(Error, Debug)]
pub enum StructuringError {
    /// Graph-level failure from the core data model.
    #[error(transparent)]
    Core(#[from] reflow_core::Error),

    /// Fragment partitioning failure.
    #[error(transparent)]
    Fragment(#[from] FragmentError),

    /// Trampoline composition failure.
    #[error(transparent)]
    Trampoline(#[from] TrampolineError),

    /// A two-way block whose terminal instruction yields no condition.
    #[error("block {0} ends a two-way branch without a condition")]
    MissingCondition(NodeId),

    /// A switch successor with no jump-table entry and no derivable case value.
    #[error("no case value for switch edge {src} -> {tgt}")]
    MissingCaseValue { src: NodeId, tgt: NodeId },

    /// A node reached during structuring has no prepared block statement.
    #[error("no block statement for node {0}")]
    MissingBlockStatement(NodeId),
}
