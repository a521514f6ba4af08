//! Trampoline payload pattern recognition.
//!
//! Patch payloads follow a small number of fixed shapes emitted by the
//! patch tool, so payload lowering is a closed set of pattern matches
//! against the trailing instructions of the payload chain, not a general
//! decompilation. An unrecognized payload is reported loudly and lowered
//! as a flat instruction sequence; the lowering never guesses semantics.

use reflow_core::{AstBuilder, Instruction, Stmt, TrampolineInfo, TrampolineRole};
use tracing::error;

use crate::fragments::{partition_block, BlockFragment};

/// The closed set of payload shapes the patch tool emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadPattern {
    /// Payload ends in a conditional return.
    ConditionalReturn,
    /// Single-path payload ending in a conditional branch back to the
    /// fallthrough destination (the patch tool records the target shifted
    /// by one byte).
    ConditionalContinue,
    /// Two to four predicated runs OR-ing conditions into one flag read
    /// by the decision block.
    CompoundOr,
    /// Payload loops internally; the decision block breaks out.
    ConditionalLoopBreak,
}

impl PayloadPattern {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConditionalReturn => "conditional-return",
            Self::ConditionalContinue => "conditional-continue",
            Self::CompoundOr => "compound-or",
            Self::ConditionalLoopBreak => "conditional-loop-break",
        }
    }
}

impl std::fmt::Display for PayloadPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// All payload-chain instructions in chain order.
fn payload_instructions(info: &TrampolineInfo) -> Vec<Instruction> {
    let mut instrs = Vec::new();
    for node in info.payload_nodes() {
        if let Some(code) = info.member_code(node) {
            instrs.extend_from_slice(code);
        }
    }
    instrs
}

/// Matches the payload against the closed pattern set.
pub fn recognize(info: &TrampolineInfo) -> Option<PayloadPattern> {
    let instrs = payload_instructions(info);
    let last = instrs.last()?;
    let has_decision = info.has_role(TrampolineRole::Decision);

    if last.is_conditional_return() {
        return Some(PayloadPattern::ConditionalReturn);
    }

    if !has_decision {
        if let reflow_core::Operation::ConditionalBranch { target, .. } = &last.operation {
            if let Some(ft) = info.fallthrough_destination() {
                if *target == ft || *target == ft + 1 {
                    return Some(PayloadPattern::ConditionalContinue);
                }
            }
        }
        return None;
    }

    let has_branch = instrs.iter().any(|i| i.is_branch());
    if !has_branch {
        let fragments = partition_block(&instrs).ok()?;
        let predicated = fragments.iter().filter(|f| f.is_predicated()).count();
        if (2..=4).contains(&predicated) {
            return Some(PayloadPattern::CompoundOr);
        }
        return None;
    }

    let loops_back = instrs.iter().any(|i| {
        matches!(
            &i.operation,
            reflow_core::Operation::ConditionalBranch { target, .. } if *target <= i.address
        )
    });
    if loops_back {
        return Some(PayloadPattern::ConditionalLoopBreak);
    }
    None
}

/// Lowers a composed trampoline node to statements.
///
/// A matched pattern produces the corresponding structured shape; no match
/// produces the untransformed payload instruction sequence after an
/// error-level diagnostic. Setup and takedown scaffolding is state
/// save/restore inserted by the patch tool and is not part of the lowered
/// program.
pub fn lower(info: &TrampolineInfo, builder: &AstBuilder) -> Vec<Stmt> {
    let instrs = payload_instructions(info);
    match recognize(info) {
        Some(PayloadPattern::ConditionalReturn) => lower_trailing_jump(instrs, builder, true),
        Some(PayloadPattern::ConditionalContinue) => lower_trailing_jump(instrs, builder, false),
        Some(PayloadPattern::CompoundOr) => lower_compound_or(instrs, builder),
        Some(PayloadPattern::ConditionalLoopBreak) => lower_loop_break(info, instrs, builder),
        None => {
            error!(
                "unrecognized trampoline payload at {:#x}, lowering as flat sequence",
                info.event().wrapper_va
            );
            vec![builder.mk_instr_seq(instrs)]
        }
    }
}

/// Shared shape for conditional-return and conditional-continue: the lead
/// instructions stay flat, the trailing conditional becomes an `if` around
/// a return or continue.
fn lower_trailing_jump(mut instrs: Vec<Instruction>, builder: &AstBuilder, returns: bool) -> Vec<Stmt> {
    let mut stmts = Vec::new();
    if let Some(last) = instrs.pop() {
        if !instrs.is_empty() {
            stmts.push(builder.mk_instr_seq(instrs));
        }
        if let Some(cond) = last.condition(false) {
            let body = if returns {
                builder.mk_return(None)
            } else {
                builder.mk_continue()
            };
            stmts.push(builder.mk_branch(cond, body, builder.mk_block(Vec::new()), None, None));
        } else {
            stmts.push(builder.mk_instr_seq(vec![last]));
        }
    }
    stmts
}

/// `c1 || c2 || ...` accumulated by predicated runs: each run becomes an
/// early `break`, which preserves the short-circuit evaluation order.
fn lower_compound_or(instrs: Vec<Instruction>, builder: &AstBuilder) -> Vec<Stmt> {
    let fragments = match partition_block(&instrs) {
        Ok(fragments) => fragments,
        Err(_) => return vec![builder.mk_instr_seq(instrs)],
    };
    let mut stmts = Vec::new();
    for fragment in fragments {
        match fragment {
            BlockFragment::Linear(run) => stmts.push(builder.mk_instr_seq(run)),
            BlockFragment::Predicated { predicate, .. } => {
                stmts.push(builder.mk_branch(
                    predicate.condition,
                    builder.mk_break(),
                    builder.mk_block(Vec::new()),
                    None,
                    None,
                ));
            }
        }
    }
    stmts
}

/// Payload loops until its exit condition, then the decision block either
/// breaks out of the patched region or falls through.
fn lower_loop_break(
    info: &TrampolineInfo,
    instrs: Vec<Instruction>,
    builder: &AstBuilder,
) -> Vec<Stmt> {
    let mut stmts = vec![builder.mk_loop(builder.mk_instr_seq(instrs), None)];
    let decision_cond = info
        .role_node(TrampolineRole::Decision)
        .and_then(|d| info.member_code(d))
        .and_then(|code| code.last())
        .and_then(|last| last.condition(false));
    if let Some(cond) = decision_cond {
        stmts.push(builder.mk_branch(
            cond,
            builder.mk_break(),
            builder.mk_block(Vec::new()),
            None,
            None,
        ));
    }
    stmts
}
