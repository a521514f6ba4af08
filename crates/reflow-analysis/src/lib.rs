//! # reflow-analysis
//!
//! Control flow structuring passes for reflow.
//!
//! This crate provides:
//! - CFG construction from decoded instructions
//! - Trampoline composition for patched binaries
//! - Payload pattern recognition and lowering
//! - Predicated block fragment partitioning
//! - Structured control flow recovery (loops, branches, switches, gotos)
//! - A flat, label-per-block lowering for irreducible or raw output

pub mod cfg_builder;
pub mod config;
pub mod error;
pub mod fragments;
pub mod payload;
pub mod structurer;
pub mod trampoline;

pub use cfg_builder::CfgBuilder;
pub use config::{LoweringMode, StructuringConfig};
pub use error::{FragmentError, StructuringError, TrampolineError};
pub use fragments::{block_has_control_flow, lower_fragments, partition_block, BlockFragment};
pub use payload::PayloadPattern;
pub use structurer::{ControlFlowContext, StructuredAst, Structurer};
pub use trampoline::TrampolineComposer;
