//! Error types for reflow-core.

use thiserror::Error;

use crate::node::NodeId;

/// Core error type.
#[derive(Error, Debug)]
pub enum Error {
    /// The start node is not part of the node list.
    #[error("start node {0} is not in the node list")]
    StartNodeMissing(NodeId),

    /// The node list names the same node twice.
    #[error("duplicate node {0} in node list")]
    DuplicateNode(NodeId),

    /// The edge table names two identical edges from the same source.
    #[error("duplicate edge {0} -> {1}")]
    DuplicateEdge(NodeId, NodeId),

    /// An edge endpoint is not a known node.
    #[error("edge endpoint {0} is not in the node list")]
    UnknownEdgeEndpoint(NodeId),

    /// A node in the node list is unreachable from the start node.
    #[error("node {0} is unreachable from the start node")]
    UnreachableNode(NodeId),

    /// A block id with no block behind it.
    #[error("block {0} not found")]
    MissingBlock(NodeId),

    /// An edge the depth-first search never classified.
    #[error("edge {0} -> {1} has no classification")]
    MissingEdgeFlavor(NodeId, NodeId),

    /// An immediate-dominator lookup miss.
    #[error("node {0} has no immediate dominator")]
    MissingIdom(NodeId),

    /// Trampoline metadata without a setup block role.
    #[error("trampoline {0} has no setup block role")]
    MissingSetupBlock(NodeId),
}
