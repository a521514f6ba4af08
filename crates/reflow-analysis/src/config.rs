//! Structuring configuration.

/// Which lowering the structurer produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoweringMode {
    /// Structured lowering, with the reducibility verdict reported alongside.
    #[default]
    Auto,
    /// Structured lowering.
    Structured,
    /// One labeled block plus explicit terminator per basic block.
    Flat,
}

impl LoweringMode {
    /// Parses a lowering mode from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "auto" | "default" => Some(Self::Auto),
            "structured" | "ast" => Some(Self::Structured),
            "flat" | "cfg" => Some(Self::Flat),
            _ => None,
        }
    }

    /// Returns the name of the mode.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Structured => "structured",
            Self::Flat => "flat",
        }
    }
}

/// Configuration for control flow structuring.
#[derive(Debug, Clone)]
pub struct StructuringConfig {
    /// The lowering mode.
    pub mode: LoweringMode,
    /// Longest accepted trampoline payload chain.
    pub max_payload_chain: usize,
}

impl Default for StructuringConfig {
    fn default() -> Self {
        Self {
            mode: LoweringMode::Auto,
            max_payload_chain: 8,
        }
    }
}

impl StructuringConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the lowering mode.
    pub fn with_mode(mut self, mode: LoweringMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the payload chain bound.
    pub fn with_max_payload_chain(mut self, limit: usize) -> Self {
        self.max_payload_chain = limit;
        self
    }
}
