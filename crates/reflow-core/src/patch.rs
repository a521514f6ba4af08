//! Patch-event metadata describing inserted trampolines.
//!
//! A patching tool that rewrites a binary in place records, for every patch
//! site, where the detour enters, where its wrapper and payload code live,
//! and which control-flow cases the payload can take. Composition consumes
//! these events explicitly; there is no global patch registry.

use std::collections::BTreeSet;

/// A control-flow case a trampoline payload can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TrampolineCase {
    /// Execution rejoins the original code after the patch site.
    Fallthrough,
    /// Execution leaves the patched region, e.g. out of a loop.
    Break,
}

impl std::fmt::Display for TrampolineCase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fallthrough => write!(f, "fallthrough"),
            Self::Break => write!(f, "break"),
        }
    }
}

/// Kind of patch applied at one location.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PatchKind {
    /// Detour through wrapper and payload code.
    Trampoline,
    /// In-place replacement with no detour.
    Replacement,
    /// Anything else the patch tool reports.
    Other(String),
}

/// One patch event.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PatchEvent {
    /// Patch classification.
    pub kind: PatchKind,
    /// Address in the original function from which execution enters the
    /// patch.
    pub logical_va: u64,
    /// Start of the wrapper (setup) code.
    pub wrapper_va: u64,
    /// Start of the payload code, if the patch has one.
    pub payload_va: Option<u64>,
    /// Control-flow cases the payload declares.
    pub cases: Vec<TrampolineCase>,
    /// Where the patched flow rejoins the original code.
    pub fallthrough_destination: Option<u64>,
}

impl PatchEvent {
    /// A trampoline event with no cases declared yet.
    pub fn trampoline(logical_va: u64, wrapper_va: u64, payload_va: u64) -> Self {
        Self {
            kind: PatchKind::Trampoline,
            logical_va,
            wrapper_va,
            payload_va: Some(payload_va),
            cases: Vec::new(),
            fallthrough_destination: None,
        }
    }

    pub fn with_cases(mut self, cases: Vec<TrampolineCase>) -> Self {
        self.cases = cases;
        self
    }

    pub fn with_fallthrough_destination(mut self, addr: u64) -> Self {
        self.fallthrough_destination = Some(addr);
        self
    }

    pub fn is_trampoline(&self) -> bool {
        self.kind == PatchKind::Trampoline
    }

    /// Case set normalized for shape classification: deduplicated and
    /// order-independent.
    pub fn case_set(&self) -> BTreeSet<TrampolineCase> {
        self.cases.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_set_normalizes() {
        let event = PatchEvent::trampoline(0x1000, 0x9000, 0x9010).with_cases(vec![
            TrampolineCase::Fallthrough,
            TrampolineCase::Break,
            TrampolineCase::Fallthrough,
        ]);
        let cases = event.case_set();
        assert_eq!(cases.len(), 2);
        assert!(cases.contains(&TrampolineCase::Break));
        assert!(cases.contains(&TrampolineCase::Fallthrough));
    }

    #[test]
    fn test_trampoline_classification() {
        let event = PatchEvent::trampoline(0x1000, 0x9000, 0x9010);
        assert!(event.is_trampoline());

        let other = PatchEvent {
            kind: PatchKind::Other("nop-fill".to_string()),
            ..event
        };
        assert!(!other.is_trampoline());
    }
}
