//! Structured-statement AST produced by control-flow lowering.
//!
//! Statements form a small C-like language: instruction runs, blocks,
//! two-way branches, endless loops exited via break, switches, gotos and
//! returns. Loop and branch statements remember the merge node both arms
//! rejoin at, when one is known, so later passes can re-associate
//! statements with graph structure.

use crate::expr::{CondExpr, Expr};
use crate::instruction::Instruction;
use crate::node::NodeId;

/// A label attached to a statement.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StmtLabel {
    /// Goto target, named after its block.
    Node(NodeId),
    /// Case arm of a switch.
    Case(Expr),
    /// Default arm of a switch.
    Default,
}

impl std::fmt::Display for StmtLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Node(n) => write!(f, "L_{}:", n),
            Self::Case(v) => write!(f, "case {}:", v),
            Self::Default => write!(f, "default:"),
        }
    }
}

/// Statement payload.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StmtKind {
    /// Flat run of instructions.
    Instrs(Vec<Instruction>),
    /// Statement sequence.
    Block(Vec<Stmt>),
    /// Two-way conditional.
    Branch {
        condition: CondExpr,
        then_branch: Box<Stmt>,
        else_branch: Box<Stmt>,
        /// Address of the block the true arm targets.
        target_addr: Option<u64>,
        /// Node where both arms rejoin, when known.
        merge: Option<NodeId>,
    },
    /// Endless loop; exits happen via break or goto inside the body.
    Loop {
        body: Box<Stmt>,
        /// Node a break lands on, when known.
        merge: Option<NodeId>,
    },
    /// Multiway dispatch.
    Switch {
        scrutinee: Expr,
        body: Box<Stmt>,
        /// Node a break lands on, when known.
        merge: Option<NodeId>,
    },
    Goto { target: NodeId },
    Break,
    Continue,
    Return { value: Option<Expr> },
}

/// One structured statement with its labels and provenance.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Stmt {
    /// Labels in front of the statement.
    pub labels: Vec<StmtLabel>,
    /// Provenance address, when one exists.
    pub addr: Option<u64>,
    /// Payload.
    pub kind: StmtKind,
}

impl Stmt {
    fn new(kind: StmtKind) -> Self {
        Self {
            labels: Vec::new(),
            addr: None,
            kind,
        }
    }

    pub fn add_label(&mut self, label: StmtLabel) {
        self.labels.push(label);
    }

    /// True for a flat instruction run.
    pub fn is_instr_seq(&self) -> bool {
        matches!(self.kind, StmtKind::Instrs(_))
    }

    /// Emptiness of the payload alone, labels ignored.
    pub fn body_is_empty(&self) -> bool {
        match &self.kind {
            StmtKind::Instrs(instrs) => instrs.is_empty(),
            StmtKind::Block(stmts) => stmts.iter().all(Stmt::is_empty),
            _ => false,
        }
    }

    /// True if the statement renders to nothing at all.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty() && self.body_is_empty()
    }

    /// Pre-order walk over this statement and everything below it.
    pub fn for_each(&self, f: &mut impl FnMut(&Stmt)) {
        f(self);
        match &self.kind {
            StmtKind::Block(stmts) => {
                for s in stmts {
                    s.for_each(f);
                }
            }
            StmtKind::Branch {
                then_branch,
                else_branch,
                ..
            } => {
                then_branch.for_each(f);
                else_branch.for_each(f);
            }
            StmtKind::Loop { body, .. } | StmtKind::Switch { body, .. } => body.for_each(f),
            _ => {}
        }
    }

    /// Number of goto statements in this subtree.
    pub fn count_gotos(&self) -> usize {
        let mut count = 0;
        self.for_each(&mut |s| {
            if matches!(s.kind, StmtKind::Goto { .. }) {
                count += 1;
            }
        });
        count
    }

    /// Number of loop statements in this subtree.
    pub fn count_loops(&self) -> usize {
        let mut count = 0;
        self.for_each(&mut |s| {
            if matches!(s.kind, StmtKind::Loop { .. }) {
                count += 1;
            }
        });
        count
    }

    /// Node labels attached anywhere in this subtree.
    pub fn collect_labels(&self) -> Vec<NodeId> {
        let mut labels = Vec::new();
        self.for_each(&mut |s| {
            for l in &s.labels {
                if let StmtLabel::Node(n) = l {
                    labels.push(*n);
                }
            }
        });
        labels
    }

    fn fmt_indented(&self, f: &mut std::fmt::Formatter<'_>, indent: usize) -> std::fmt::Result {
        let pad = "  ".repeat(indent);
        for label in &self.labels {
            writeln!(f, "{}{}", pad, label)?;
        }
        match &self.kind {
            StmtKind::Instrs(instrs) => {
                for inst in instrs {
                    writeln!(f, "{}{:#x}  {}", pad, inst.address, inst.mnemonic)?;
                }
                Ok(())
            }
            StmtKind::Block(stmts) => {
                for s in stmts {
                    s.fmt_indented(f, indent)?;
                }
                Ok(())
            }
            StmtKind::Branch {
                condition,
                then_branch,
                else_branch,
                ..
            } => {
                writeln!(f, "{}if ({}) {{", pad, condition)?;
                then_branch.fmt_indented(f, indent + 1)?;
                if else_branch.is_empty() {
                    writeln!(f, "{}}}", pad)
                } else {
                    writeln!(f, "{}}} else {{", pad)?;
                    else_branch.fmt_indented(f, indent + 1)?;
                    writeln!(f, "{}}}", pad)
                }
            }
            StmtKind::Loop { body, .. } => {
                writeln!(f, "{}while (true) {{", pad)?;
                body.fmt_indented(f, indent + 1)?;
                writeln!(f, "{}}}", pad)
            }
            StmtKind::Switch {
                scrutinee, body, ..
            } => {
                writeln!(f, "{}switch ({}) {{", pad, scrutinee)?;
                body.fmt_indented(f, indent + 1)?;
                writeln!(f, "{}}}", pad)
            }
            StmtKind::Goto { target } => writeln!(f, "{}goto L_{};", pad, target),
            StmtKind::Break => writeln!(f, "{}break;", pad),
            StmtKind::Continue => writeln!(f, "{}continue;", pad),
            StmtKind::Return { value } => match value {
                Some(v) => writeln!(f, "{}return {};", pad, v),
                None => writeln!(f, "{}return;", pad),
            },
        }
    }
}

impl std::fmt::Display for Stmt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.fmt_indented(f, 0)
    }
}

/// Constructors for structured statements.
///
/// Kept as a value so richer builders (symbol tables, live variable hints)
/// can slot in without touching the lowering code.
#[derive(Debug, Clone, Copy, Default)]
pub struct AstBuilder;

impl AstBuilder {
    pub fn new() -> Self {
        Self
    }

    /// A flat instruction run.
    pub fn mk_instr_seq(&self, instrs: Vec<Instruction>) -> Stmt {
        let addr = instrs.first().map(|i| i.address);
        let mut stmt = Stmt::new(StmtKind::Instrs(instrs));
        stmt.addr = addr;
        stmt
    }

    /// Wraps statements into a block. A single statement that is not an
    /// instruction run stands on its own instead.
    pub fn mk_block(&self, mut stmts: Vec<Stmt>) -> Stmt {
        if stmts.len() == 1 && !stmts[0].is_instr_seq() {
            return stmts.remove(0);
        }
        Stmt::new(StmtKind::Block(stmts))
    }

    pub fn mk_branch(
        &self,
        condition: CondExpr,
        then_branch: Stmt,
        else_branch: Stmt,
        target_addr: Option<u64>,
        merge: Option<NodeId>,
    ) -> Stmt {
        let addr = condition.addr;
        let mut stmt = Stmt::new(StmtKind::Branch {
            condition,
            then_branch: Box::new(then_branch),
            else_branch: Box::new(else_branch),
            target_addr,
            merge,
        });
        stmt.addr = Some(addr);
        stmt
    }

    pub fn mk_loop(&self, body: Stmt, merge: Option<NodeId>) -> Stmt {
        Stmt::new(StmtKind::Loop {
            body: Box::new(body),
            merge,
        })
    }

    pub fn mk_switch(&self, scrutinee: Expr, body: Stmt, merge: Option<NodeId>) -> Stmt {
        Stmt::new(StmtKind::Switch {
            scrutinee,
            body: Box::new(body),
            merge,
        })
    }

    pub fn mk_goto(&self, target: NodeId) -> Stmt {
        let mut stmt = Stmt::new(StmtKind::Goto { target });
        stmt.addr = target.addr();
        stmt
    }

    pub fn mk_break(&self) -> Stmt {
        Stmt::new(StmtKind::Break)
    }

    pub fn mk_continue(&self) -> Stmt {
        Stmt::new(StmtKind::Continue)
    }

    pub fn mk_return(&self, value: Option<Expr>) -> Stmt {
        Stmt::new(StmtKind::Return { value })
    }
}
