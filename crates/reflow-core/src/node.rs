//! Graph node identity.

/// Identifies one node of a flow graph.
///
/// Real blocks are keyed by their start address. Blocks belonging to an
/// inlined callee additionally carry the call site that pulled them in, so
/// the same callee address can occur once per call site. Phantom nodes are
/// fabricated (for example the synthetic exit used for postdominator
/// computation) and can never collide with a real id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum NodeId {
    /// A basic block at the given start address.
    Block(u64),
    /// A block of an inlined callee.
    Inlined { addr: u64, call_site: u64 },
    /// A synthetic node with no address of its own.
    Phantom(u32),
}

impl NodeId {
    /// Creates a block id from a start address.
    pub fn block(addr: u64) -> Self {
        Self::Block(addr)
    }

    /// Returns the concrete address of a real or inlined block.
    pub fn addr(&self) -> Option<u64> {
        match self {
            Self::Block(addr) | Self::Inlined { addr, .. } => Some(*addr),
            Self::Phantom(_) => None,
        }
    }

    /// Returns true for fabricated nodes.
    pub fn is_phantom(&self) -> bool {
        matches!(self, Self::Phantom(_))
    }
}

impl From<u64> for NodeId {
    fn from(addr: u64) -> Self {
        Self::Block(addr)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Block(addr) => write!(f, "{:#x}", addr),
            Self::Inlined { addr, call_site } => write!(f, "F_{:#x}_{:#x}", call_site, addr),
            Self::Phantom(n) => write!(f, "__{}", n),
        }
    }
}
