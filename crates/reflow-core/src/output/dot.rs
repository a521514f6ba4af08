//! DOT (Graphviz) output utilities.
//!
//! Provides shared utilities for generating Graphviz DOT format output,
//! used for visualizing control flow graphs before and after structuring.

use crate::cfg::Cfg;
use crate::flowgraph::FlowGraph;

/// Escape special characters for DOT format strings.
///
/// DOT format requires escaping:
/// - `\` → `\\` (backslash)
/// - `"` → `\"` (double quote)
/// - `<` → `\<` (less than, for HTML-like labels)
/// - `>` → `\>` (greater than, for HTML-like labels)
///
/// # Example
/// ```
/// use reflow_core::output::escape_dot_string;
/// assert_eq!(escape_dot_string("mov x0, \"hello\""), "mov x0, \\\"hello\\\"");
/// assert_eq!(escape_dot_string("cmp <ptr>"), "cmp \\<ptr\\>");
/// ```
pub fn escape_dot_string(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('<', "\\<")
        .replace('>', "\\>")
}

/// Configuration for DOT output generation.
#[derive(Debug, Clone)]
pub struct DotConfig {
    /// Font name for nodes and edges.
    pub font_name: String,
    /// Font size for node labels.
    pub node_font_size: u32,
    /// Font size for edge labels.
    pub edge_font_size: u32,
    /// Graph direction: "TB" (top-bottom), "LR" (left-right), etc.
    pub rankdir: String,
    /// Node shape: "box", "ellipse", etc.
    pub node_shape: String,
    /// Label edges with their DFS flavor when rendering flow graphs.
    pub edge_flavors: bool,
}

impl Default for DotConfig {
    fn default() -> Self {
        Self {
            font_name: "Courier".to_string(),
            node_font_size: 10,
            edge_font_size: 9,
            rankdir: "TB".to_string(),
            node_shape: "box".to_string(),
            edge_flavors: false,
        }
    }
}

impl DotConfig {
    /// Create a config suited for CFG visualization.
    pub fn cfg() -> Self {
        Self::default()
    }

    /// Create a config suited for flow graph visualization.
    pub fn flowgraph() -> Self {
        Self {
            edge_flavors: true,
            ..Self::default()
        }
    }

    /// Generate the DOT header (digraph declaration and attributes).
    pub fn header(&self, name: &str) -> String {
        let escaped_name = escape_dot_string(name);
        format!(
            "digraph \"{}\" {{\n    rankdir={};\n    node [shape={}, fontname=\"{}\", fontsize={}];\n    edge [fontname=\"{}\", fontsize={}];\n",
            escaped_name,
            self.rankdir,
            self.node_shape,
            self.font_name,
            self.node_font_size,
            self.font_name,
            self.edge_font_size
        )
    }

    /// Generate the DOT footer.
    pub fn footer(&self) -> &'static str {
        "}\n"
    }
}

/// Format a DOT node with the given ID and label.
pub fn format_node(id: &str, label: &str) -> String {
    format!("    \"{}\" [label=\"{}\"];\n", escape_dot_string(id), label)
}

/// Format a DOT edge between two nodes.
pub fn format_edge(from: &str, to: &str) -> String {
    format!(
        "    \"{}\" -> \"{}\";\n",
        escape_dot_string(from),
        escape_dot_string(to)
    )
}

/// Format a DOT edge with a label.
pub fn format_edge_labeled(from: &str, to: &str, label: &str) -> String {
    format!(
        "    \"{}\" -> \"{}\" [label=\"{}\"];\n",
        escape_dot_string(from),
        escape_dot_string(to),
        escape_dot_string(label)
    )
}

/// Render a CFG as a DOT digraph.
///
/// Node labels list the block's instructions one per line; trampolines are
/// rendered with their composed role map instead.
pub fn render_cfg(cfg: &Cfg, name: &str, config: &DotConfig) -> String {
    let mut out = config.header(name);
    for (id, block) in cfg.blocks() {
        let mut label = format!("{}\\l", id);
        if let Some(info) = block.trampoline_info() {
            for (role, node) in info.roles() {
                label.push_str(&escape_dot_string(&format!("{}: {}", role, node)));
                label.push_str("\\l");
            }
        } else {
            for instr in block.instruction_list() {
                label.push_str(&escape_dot_string(&format!(
                    "{:#x}  {}",
                    instr.address, instr.mnemonic
                )));
                label.push_str("\\l");
            }
        }
        out.push_str(&format_node(&id.to_string(), &label));
    }
    for (src, tgts) in cfg.edges() {
        for tgt in tgts {
            out.push_str(&format_edge(&src.to_string(), &tgt.to_string()));
        }
    }
    out.push_str(config.footer());
    out
}

/// Render a flow graph as a DOT digraph.
///
/// Node labels carry the reverse postorder rank; edge labels carry the DFS
/// flavor when the config asks for it.
pub fn render_flowgraph(graph: &FlowGraph, name: &str, config: &DotConfig) -> String {
    let mut out = config.header(name);
    for (rank, &node) in graph.rpo_sorted().iter().enumerate() {
        let label = format!("{}\\lrpo {}\\l", node, rank);
        out.push_str(&format_node(&node.to_string(), &label));
    }
    for (&(src, tgt), flavor) in graph.edge_flavors() {
        if config.edge_flavors {
            out.push_str(&format_edge_labeled(
                &src.to_string(),
                &tgt.to_string(),
                &flavor.to_string(),
            ));
        } else {
            out.push_str(&format_edge(&src.to_string(), &tgt.to_string()));
        }
    }
    out.push_str(config.footer());
    out
}
