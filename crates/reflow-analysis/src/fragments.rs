//! Basic block partitioning for predicated instruction runs.
//!
//! Architecturally predicated instructions (ARM IT blocks, conditional
//! moves lowered as predication) do not split basic blocks at CFG
//! construction time. Before such a block can be lowered to statements it
//! is partitioned into fragments: unpredicated runs stay flat, predicated
//! runs become small if/else statements keyed by the flag-setting
//! instruction that established the condition.

use reflow_core::{AstBuilder, Instruction, Predicate, Stmt};

use crate::error::FragmentError;

/// One partition of a basic block's instruction sequence.
///
/// A fragment is monomorphic: it holds either plain instructions or
/// instructions predicated on one condition (with at most one opposite
/// arm). The push operations reject anything else.
#[derive(Debug, Clone)]
pub enum BlockFragment {
    /// Unpredicated straight-line run.
    Linear(Vec<Instruction>),
    /// Run guarded by one predicate, with an optional opposite arm.
    Predicated {
        predicate: Predicate,
        then_branch: Vec<Instruction>,
        else_branch: Vec<Instruction>,
    },
}

impl BlockFragment {
    pub fn linear() -> Self {
        Self::Linear(Vec::new())
    }

    pub fn predicated(predicate: Predicate) -> Self {
        Self::Predicated {
            predicate,
            then_branch: Vec::new(),
            else_branch: Vec::new(),
        }
    }

    pub fn is_linear(&self) -> bool {
        matches!(self, Self::Linear(_))
    }

    pub fn is_predicated(&self) -> bool {
        matches!(self, Self::Predicated { .. })
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total instruction count across all arms.
    pub fn len(&self) -> usize {
        match self {
            Self::Linear(instrs) => instrs.len(),
            Self::Predicated {
                then_branch,
                else_branch,
                ..
            } => then_branch.len() + else_branch.len(),
        }
    }

    /// Whether this fragment can absorb an instruction carrying `pred`:
    /// either the predicate matches the then arm, or the else arm is still
    /// open, or the predicate matches the committed else arm.
    fn accepts_predicate(&self, pred: &Predicate) -> bool {
        match self {
            Self::Linear(_) => false,
            Self::Predicated {
                predicate,
                else_branch,
                ..
            } => {
                *pred == *predicate
                    || else_branch.is_empty()
                    || else_branch.first().map(|i| i.predicate.as_ref()) == Some(Some(pred))
            }
        }
    }

    /// Appends a plain instruction.
    pub fn push_linear(&mut self, instr: Instruction) -> Result<(), FragmentError> {
        match self {
            Self::Linear(instrs) => {
                instrs.push(instr);
                Ok(())
            }
            Self::Predicated { .. } => Err(FragmentError::LinearIntoPredicated(instr.address)),
        }
    }

    /// Appends a predicated instruction to the matching arm.
    pub fn push_predicated(&mut self, instr: Instruction) -> Result<(), FragmentError> {
        let pred = instr
            .predicate
            .clone()
            .ok_or(FragmentError::MissingPredicate(instr.address))?;
        match self {
            Self::Linear(_) => Err(FragmentError::PredicatedIntoLinear(instr.address)),
            Self::Predicated {
                predicate,
                then_branch,
                else_branch,
            } => {
                if pred == *predicate {
                    then_branch.push(instr);
                    Ok(())
                } else if else_branch.is_empty()
                    || else_branch.first().map(|i| i.predicate.as_ref()) == Some(Some(&pred))
                {
                    else_branch.push(instr);
                    Ok(())
                } else {
                    Err(FragmentError::SetterMismatch {
                        addr: instr.address,
                        setter: predicate.setter,
                    })
                }
            }
        }
    }
}

/// Partitions one basic block's instructions into monomorphic fragments.
///
/// Plain instructions extend the current linear fragment; a predicated
/// instruction extends the current predicated fragment when its predicate
/// fits (then arm, or one opposite arm), and otherwise starts a new one.
/// Crossing between plain and predicated always starts a new fragment, so
/// a predicate re-appearing after a plain run gets a fresh fragment rather
/// than an arm of the earlier one.
pub fn partition_block(instrs: &[Instruction]) -> Result<Vec<BlockFragment>, FragmentError> {
    let mut fragments: Vec<BlockFragment> = Vec::new();
    for instr in instrs {
        match &instr.predicate {
            None => match fragments.last_mut() {
                Some(frag) if frag.is_linear() => frag.push_linear(instr.clone())?,
                _ => {
                    let mut frag = BlockFragment::linear();
                    frag.push_linear(instr.clone())?;
                    fragments.push(frag);
                }
            },
            Some(pred) => match fragments.last_mut() {
                Some(frag) if frag.accepts_predicate(pred) => {
                    frag.push_predicated(instr.clone())?;
                }
                _ => {
                    let mut frag = BlockFragment::predicated(pred.clone());
                    frag.push_predicated(instr.clone())?;
                    fragments.push(frag);
                }
            },
        }
    }
    Ok(fragments)
}

/// Whether the block needs fragment partitioning before lowering.
///
/// True iff any instruction is predicated, except when the only predicated
/// instruction is the block's own trailing conditional return. That case is
/// already represented by the CFG edge out of the block and lowers flat.
/// A conditional return sharing the block with other predicated
/// instructions is not exempted; the whole block partitions.
pub fn block_has_control_flow(instrs: &[Instruction]) -> bool {
    let predicated = instrs.iter().filter(|i| i.is_predicated()).count();
    if predicated == 0 {
        return false;
    }
    if predicated == 1 {
        if let Some(last) = instrs.last() {
            if last.is_conditional_return() && last.is_predicated() {
                return false;
            }
        }
    }
    true
}

/// Lowers fragments to statements: linear fragments become instruction
/// sequences, predicated fragments become if/else on the predicate.
pub fn lower_fragments(fragments: Vec<BlockFragment>, builder: &AstBuilder) -> Vec<Stmt> {
    let mut stmts = Vec::new();
    for fragment in fragments {
        match fragment {
            BlockFragment::Linear(instrs) => stmts.push(builder.mk_instr_seq(instrs)),
            BlockFragment::Predicated {
                predicate,
                then_branch,
                else_branch,
            } => {
                let then_stmt = builder.mk_instr_seq(then_branch);
                let else_stmt = if else_branch.is_empty() {
                    builder.mk_block(Vec::new())
                } else {
                    builder.mk_instr_seq(else_branch)
                };
                stmts.push(builder.mk_branch(
                    predicate.condition,
                    then_stmt,
                    else_stmt,
                    None,
                    None,
                ));
            }
        }
    }
    stmts
}

#[cfg(test)]
mod tests {
    use super::*;
    use reflow_core::{CondExpr, Condition, Operation, StmtKind};

    fn plain(addr: u64) -> Instruction {
        Instruction::new(addr, 4, vec![0; 4], "mov")
    }

    fn predicated(addr: u64, cond: Condition, setter: u64) -> Instruction {
        Instruction::new(addr, 4, vec![0; 4], "moveq")
            .with_predicate(Predicate::new(CondExpr::new(cond, setter), setter))
    }

    fn cond_return(addr: u64, cond: Condition, setter: u64) -> Instruction {
        Instruction::new(addr, 4, vec![0; 4], "bxeq")
            .with_operation(Operation::ConditionalReturn {
                condition: CondExpr::new(cond, setter),
            })
            .with_predicate(Predicate::new(CondExpr::new(cond, setter), setter))
    }

    // --- Partition Tests ---

    #[test]
    fn test_unpredicated_block_is_one_linear_fragment() {
        let instrs = vec![plain(0x100), plain(0x104), plain(0x108)];
        let fragments = partition_block(&instrs).unwrap();
        assert_eq!(fragments.len(), 1);
        assert!(fragments[0].is_linear());
        assert_eq!(fragments[0].len(), 3);
    }

    #[test]
    fn test_partition_alternating_runs() {
        // {2,3} predicated on setter S, {5} on setter T, {1,4,6} plain.
        let s = 0x100;
        let t = 0x110;
        let instrs = vec![
            plain(0x100),
            predicated(0x104, Condition::Equal, s),
            predicated(0x108, Condition::Equal, s),
            plain(0x10c),
            predicated(0x110, Condition::AboveOrEqual, t),
            plain(0x114),
        ];
        let fragments = partition_block(&instrs).unwrap();
        assert_eq!(fragments.len(), 5);
        assert!(fragments[0].is_linear());
        match &fragments[1] {
            BlockFragment::Predicated {
                predicate,
                then_branch,
                else_branch,
            } => {
                assert_eq!(predicate.setter, s);
                assert_eq!(then_branch.len(), 2);
                assert!(else_branch.is_empty());
            }
            other => panic!("expected predicated fragment, got {:?}", other),
        }
        assert!(fragments[2].is_linear());
        match &fragments[3] {
            BlockFragment::Predicated {
                predicate,
                then_branch,
                else_branch,
            } => {
                assert_eq!(predicate.setter, t);
                assert_eq!(then_branch.len(), 1);
                assert!(else_branch.is_empty());
            }
            other => panic!("expected predicated fragment, got {:?}", other),
        }
        assert!(fragments[4].is_linear());
    }

    #[test]
    fn test_opposite_condition_fills_else_arm() {
        let s = 0x200;
        let instrs = vec![
            predicated(0x204, Condition::Equal, s),
            predicated(0x208, Condition::Equal, s),
            predicated(0x20c, Condition::NotEqual, s),
        ];
        let fragments = partition_block(&instrs).unwrap();
        assert_eq!(fragments.len(), 1);
        match &fragments[0] {
            BlockFragment::Predicated {
                then_branch,
                else_branch,
                ..
            } => {
                assert_eq!(then_branch.len(), 2);
                assert_eq!(else_branch.len(), 1);
            }
            other => panic!("expected predicated fragment, got {:?}", other),
        }
    }

    #[test]
    fn test_third_condition_starts_new_fragment() {
        let s = 0x300;
        let instrs = vec![
            predicated(0x304, Condition::Equal, s),
            predicated(0x308, Condition::NotEqual, s),
            predicated(0x30c, Condition::Greater, s),
        ];
        let fragments = partition_block(&instrs).unwrap();
        assert_eq!(fragments.len(), 2);
        assert!(fragments[1].is_predicated());
        assert_eq!(fragments[1].len(), 1);
    }

    // --- Push API Tests ---

    #[test]
    fn test_push_type_violations() {
        let mut linear = BlockFragment::linear();
        let err = linear
            .push_predicated(predicated(0x400, Condition::Equal, 0x3fc))
            .unwrap_err();
        assert!(matches!(err, FragmentError::PredicatedIntoLinear(0x400)));

        let mut pred = BlockFragment::predicated(Predicate::new(
            CondExpr::new(Condition::Equal, 0x3fc),
            0x3fc,
        ));
        let err = pred.push_linear(plain(0x404)).unwrap_err();
        assert!(matches!(err, FragmentError::LinearIntoPredicated(0x404)));

        let err = pred.push_predicated(plain(0x408)).unwrap_err();
        assert!(matches!(err, FragmentError::MissingPredicate(0x408)));
    }

    #[test]
    fn test_push_third_predicate_is_mismatch() {
        let mut frag = BlockFragment::predicated(Predicate::new(
            CondExpr::new(Condition::Equal, 0x500),
            0x500,
        ));
        frag.push_predicated(predicated(0x504, Condition::Equal, 0x500))
            .unwrap();
        frag.push_predicated(predicated(0x508, Condition::NotEqual, 0x500))
            .unwrap();
        let err = frag
            .push_predicated(predicated(0x50c, Condition::Greater, 0x500))
            .unwrap_err();
        assert!(matches!(
            err,
            FragmentError::SetterMismatch {
                addr: 0x50c,
                setter: 0x500
            }
        ));
    }

    // --- Control Flow Test ---

    #[test]
    fn test_block_has_control_flow() {
        assert!(!block_has_control_flow(&[plain(0x600), plain(0x604)]));
        assert!(block_has_control_flow(&[
            plain(0x600),
            predicated(0x604, Condition::Equal, 0x600),
            plain(0x608),
        ]));
    }

    #[test]
    fn test_trailing_conditional_return_is_exempt() {
        let instrs = vec![plain(0x700), cond_return(0x704, Condition::Equal, 0x700)];
        assert!(!block_has_control_flow(&instrs));
    }

    #[test]
    fn test_conditional_return_with_other_predication_is_not_exempt() {
        let instrs = vec![
            predicated(0x700, Condition::Equal, 0x6fc),
            cond_return(0x704, Condition::Equal, 0x6fc),
        ];
        assert!(block_has_control_flow(&instrs));
    }

    // --- Lowering Tests ---

    #[test]
    fn test_lower_fragments_shapes() {
        let s = 0x800;
        let instrs = vec![
            plain(0x800),
            predicated(0x804, Condition::Equal, s),
            predicated(0x808, Condition::NotEqual, s),
            plain(0x80c),
        ];
        let builder = AstBuilder::new();
        let fragments = partition_block(&instrs).unwrap();
        let stmts = lower_fragments(fragments, &builder);
        assert_eq!(stmts.len(), 3);
        assert!(stmts[0].is_instr_seq());
        match &stmts[1].kind {
            StmtKind::Branch {
                then_branch,
                else_branch,
                ..
            } => {
                assert!(!then_branch.is_empty());
                assert!(!else_branch.is_empty());
            }
            other => panic!("expected branch, got {:?}", other),
        }
        assert!(stmts[2].is_instr_seq());
    }

    #[test]
    fn test_lower_predicated_without_else_keeps_empty_arm() {
        let builder = AstBuilder::new();
        let fragments =
            partition_block(&[predicated(0x900, Condition::Equal, 0x8fc)]).unwrap();
        let stmts = lower_fragments(fragments, &builder);
        assert_eq!(stmts.len(), 1);
        match &stmts[0].kind {
            StmtKind::Branch { else_branch, .. } => assert!(else_branch.is_empty()),
            other => panic!("expected branch, got {:?}", other),
        }
    }
}
