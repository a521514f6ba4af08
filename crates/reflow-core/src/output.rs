//! Output format utilities for reflow.
//!
//! This module provides utilities for exporting control flow data to various
//! output formats:
//! - DOT (Graphviz) format for CFG and flow graph visualization

pub mod dot;

pub use dot::{escape_dot_string, render_cfg, render_flowgraph, DotConfig};
