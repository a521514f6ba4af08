//! # reflow-core
//!
//! Core abstractions for the reflow control flow structurer. This crate
//! defines architecture-agnostic types for instructions, basic blocks,
//! control flow graphs, dominator trees, and the interval-based
//! reducibility analysis the structurer is driven by.

pub mod ast;
pub mod block;
pub mod cfg;
pub mod domtree;
pub mod error;
pub mod expr;
pub mod flowgraph;
pub mod instruction;
pub mod jumptable;
pub mod node;
pub mod output;
pub mod patch;
pub mod reducibility;

pub use ast::{AstBuilder, Stmt, StmtKind, StmtLabel};
pub use block::{BlockKind, CfgBlock, TrampolineInfo, TrampolineRole};
pub use cfg::{Cfg, NaturalLoop};
pub use domtree::DominatorTree;
pub use error::Error;
pub use expr::{CondExpr, Condition, Expr};
pub use flowgraph::{EdgeFlavor, FlowGraph};
pub use instruction::{Instruction, Operation, Predicate};
pub use jumptable::JumpTable;
pub use node::NodeId;
pub use output::{escape_dot_string, DotConfig};
pub use patch::{PatchEvent, PatchKind, TrampolineCase};
pub use reducibility::{
    DerivedGraphSequence, GraphInterval, IntervalGraph, TwoWayConditionals,
};
