//! Instruction representation, reduced to control-flow behavior.

use crate::expr::{CondExpr, Expr};

/// What an instruction does to control flow.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Operation {
    /// Ordinary computation with no control-flow effect.
    Linear,
    /// Unconditional branch.
    Branch { target: u64 },
    /// Two-way conditional branch. `fallthrough` is the false arm.
    ConditionalBranch {
        condition: CondExpr,
        target: u64,
        fallthrough: u64,
    },
    /// Multiway dispatch. `targets` lists the out-of-range (default)
    /// destination first, table destinations after it.
    IndirectBranch {
        scrutinee: Option<Expr>,
        targets: Vec<u64>,
    },
    /// Call; control resumes at the following instruction.
    Call { target: Option<u64> },
    /// Function return.
    Return { value: Option<Expr> },
    /// Predicated return: returns only when the condition holds.
    ConditionalReturn { condition: CondExpr },
}

/// Architectural predication of an instruction.
///
/// `setter` is the address of the instruction that produced the flags this
/// predicate reads; the predicate's condition carries the same address as
/// its provenance. Fragment partitioning groups predicated instructions by
/// setter.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Predicate {
    /// Condition under which the instruction executes.
    pub condition: CondExpr,
    /// Address of the flag-setting instruction.
    pub setter: u64,
}

impl Predicate {
    pub fn new(condition: CondExpr, setter: u64) -> Self {
        Self { condition, setter }
    }
}

/// A single decoded instruction.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Instruction {
    /// Address of this instruction.
    pub address: u64,
    /// Size in bytes.
    pub size: usize,
    /// Raw encoding.
    pub bytes: Vec<u8>,
    /// Mnemonic text.
    pub mnemonic: String,
    /// Control-flow classification.
    pub operation: Operation,
    /// Architectural predication, if any. A predicated return carries both
    /// the `ConditionalReturn` operation and its predicate.
    pub predicate: Option<Predicate>,
}

impl Instruction {
    pub fn new(address: u64, size: usize, bytes: Vec<u8>, mnemonic: impl Into<String>) -> Self {
        Self {
            address,
            size,
            bytes,
            mnemonic: mnemonic.into(),
            operation: Operation::Linear,
            predicate: None,
        }
    }

    /// Sets the control-flow classification.
    pub fn with_operation(mut self, operation: Operation) -> Self {
        self.operation = operation;
        self
    }

    /// Sets the predication.
    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// Address of the next sequential instruction.
    pub fn next_address(&self) -> u64 {
        self.address + self.size as u64
    }

    pub fn is_predicated(&self) -> bool {
        self.predicate.is_some()
    }

    pub fn is_branch(&self) -> bool {
        matches!(
            self.operation,
            Operation::Branch { .. }
                | Operation::ConditionalBranch { .. }
                | Operation::IndirectBranch { .. }
        )
    }

    pub fn is_call(&self) -> bool {
        matches!(self.operation, Operation::Call { .. })
    }

    pub fn is_return(&self) -> bool {
        matches!(
            self.operation,
            Operation::Return { .. } | Operation::ConditionalReturn { .. }
        )
    }

    pub fn is_conditional_return(&self) -> bool {
        matches!(self.operation, Operation::ConditionalReturn { .. })
    }

    /// Ends the containing basic block.
    pub fn is_terminator(&self) -> bool {
        matches!(
            self.operation,
            Operation::Branch { .. }
                | Operation::ConditionalBranch { .. }
                | Operation::IndirectBranch { .. }
                | Operation::Return { .. }
                | Operation::ConditionalReturn { .. }
        )
    }

    /// Condition carried by a conditional branch or predicated return,
    /// reversed on request.
    pub fn condition(&self, reverse: bool) -> Option<CondExpr> {
        let cond = match &self.operation {
            Operation::ConditionalBranch { condition, .. } => condition,
            Operation::ConditionalReturn { condition } => condition,
            _ => return None,
        };
        Some(if reverse { cond.reversed() } else { cond.clone() })
    }

    /// Scrutinee of a multiway dispatch.
    pub fn switch_expr(&self) -> Option<Expr> {
        match &self.operation {
            Operation::IndirectBranch { scrutinee, .. } => scrutinee.clone(),
            _ => None,
        }
    }

    /// Case value steering a multiway dispatch toward `target`, derived
    /// from the target's position in the dispatch list. The implicit
    /// default destination has no case value.
    pub fn case_expression(&self, target: u64) -> Option<Expr> {
        match &self.operation {
            Operation::IndirectBranch { targets, .. } => targets
                .iter()
                .position(|&t| t == target)
                .and_then(|i| i.checked_sub(1))
                .map(|i| Expr::Const(i as i64)),
            _ => None,
        }
    }

    /// Successor addresses implied by the operation. For a two-way branch
    /// the false (fallthrough) successor comes first.
    pub fn successor_addrs(&self) -> Vec<u64> {
        match &self.operation {
            Operation::Linear | Operation::Call { .. } => vec![self.next_address()],
            Operation::Branch { target } => vec![*target],
            Operation::ConditionalBranch {
                target, fallthrough, ..
            } => vec![*fallthrough, *target],
            Operation::IndirectBranch { targets, .. } => {
                let mut out = Vec::new();
                for &t in targets {
                    if !out.contains(&t) {
                        out.push(t);
                    }
                }
                out
            }
            Operation::Return { .. } => Vec::new(),
            Operation::ConditionalReturn { .. } => vec![self.next_address()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Condition;

    fn make_instruction(address: u64, mnemonic: &str) -> Instruction {
        Instruction::new(address, 4, vec![0; 4], mnemonic)
    }

    // --- Classification Tests ---

    #[test]
    fn test_default_operation_is_linear() {
        let inst = make_instruction(0x1000, "mov");
        assert_eq!(inst.operation, Operation::Linear);
        assert!(!inst.is_branch());
        assert!(!inst.is_return());
        assert!(!inst.is_terminator());
    }

    #[test]
    fn test_branch_classification() {
        let inst = make_instruction(0x1000, "b")
            .with_operation(Operation::Branch { target: 0x2000 });
        assert!(inst.is_branch());
        assert!(inst.is_terminator());
        assert_eq!(inst.successor_addrs(), vec![0x2000]);
    }

    #[test]
    fn test_conditional_return_is_return_and_terminator() {
        let inst = make_instruction(0x1000, "bxeq").with_operation(Operation::ConditionalReturn {
            condition: CondExpr::new(Condition::Equal, 0xffc),
        });
        assert!(inst.is_return());
        assert!(inst.is_conditional_return());
        assert!(inst.is_terminator());
        assert_eq!(inst.successor_addrs(), vec![0x1004]);
    }

    #[test]
    fn test_call_falls_through() {
        let inst = make_instruction(0x1000, "bl")
            .with_operation(Operation::Call { target: Some(0x8000) });
        assert!(!inst.is_terminator());
        assert_eq!(inst.successor_addrs(), vec![0x1004]);
    }

    // --- Condition Tests ---

    #[test]
    fn test_condition_reversal() {
        let inst = make_instruction(0x1000, "bne").with_operation(Operation::ConditionalBranch {
            condition: CondExpr::new(Condition::NotEqual, 0xffc),
            target: 0x2000,
            fallthrough: 0x1004,
        });
        assert_eq!(inst.condition(false).map(|c| c.cond), Some(Condition::NotEqual));
        assert_eq!(inst.condition(true).map(|c| c.cond), Some(Condition::Equal));
        assert!(make_instruction(0x1000, "mov").condition(false).is_none());
    }

    #[test]
    fn test_conditional_branch_successors_false_arm_first() {
        let inst = make_instruction(0x1000, "beq").with_operation(Operation::ConditionalBranch {
            condition: CondExpr::new(Condition::Equal, 0xffc),
            target: 0x2000,
            fallthrough: 0x1004,
        });
        assert_eq!(inst.successor_addrs(), vec![0x1004, 0x2000]);
    }

    // --- Multiway Tests ---

    #[test]
    fn test_case_expression_skips_default() {
        let inst = make_instruction(0x1000, "br").with_operation(Operation::IndirectBranch {
            scrutinee: Some(Expr::reg("x0")),
            targets: vec![0x3000, 0x2000, 0x2100, 0x2200],
        });
        // 0x3000 is the default destination, so it has no case value.
        assert_eq!(inst.case_expression(0x3000), None);
        assert_eq!(inst.case_expression(0x2000), Some(Expr::Const(0)));
        assert_eq!(inst.case_expression(0x2200), Some(Expr::Const(2)));
        assert_eq!(inst.case_expression(0x9999), None);
    }

    #[test]
    fn test_indirect_successors_deduplicated() {
        let inst = make_instruction(0x1000, "br").with_operation(Operation::IndirectBranch {
            scrutinee: None,
            targets: vec![0x3000, 0x2000, 0x3000, 0x2000],
        });
        assert_eq!(inst.successor_addrs(), vec![0x3000, 0x2000]);
    }

    // --- Predication Tests ---

    #[test]
    fn test_predicate_carries_setter() {
        let inst = make_instruction(0x1004, "moveq").with_predicate(Predicate::new(
            CondExpr::new(Condition::Equal, 0x1000),
            0x1000,
        ));
        assert!(inst.is_predicated());
        assert_eq!(inst.predicate.as_ref().map(|p| p.setter), Some(0x1000));
    }
}
