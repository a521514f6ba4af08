//! Dominator-tree-driven control-flow structuring.
//!
//! Implements Ramsey's translation of unstructured control flow into
//! structured statements ("Beyond Relooper", 2022). The lowering walks the
//! dominator tree with children in descending reverse-postorder rank,
//! threading an explicit break/continue/fallthrough context through the
//! recursion, and runs twice over the same tree: the first pass only
//! records which jump targets end up needing an explicit label, the second
//! attaches those labels while emitting the final statements. Irreducible
//! graphs still lower to a valid program; the leftover jumps come out as
//! labelled gotos rather than structured statements.

use std::collections::BTreeSet;

use indexmap::IndexMap;
use reflow_core::{
    AstBuilder, Cfg, CfgBlock, DominatorTree, EdgeFlavor, Expr, FlowGraph, NodeId, Operation,
    Stmt, StmtLabel,
};
use tracing::{debug, warn};

use crate::config::{LoweringMode, StructuringConfig};
use crate::error::StructuringError;
use crate::fragments::{block_has_control_flow, lower_fragments, partition_block};
use crate::payload;

/// Break, continue and fallthrough targets in effect at one point of the
/// lowering recursion. Threaded by value; every derived context leaves its
/// parent untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlFlowContext {
    /// Node a `break` lands on.
    pub break_to: Option<NodeId>,
    /// Node a `continue` lands on.
    pub continue_to: Option<NodeId>,
    /// Node execution reaches when the current statement falls off its end.
    pub fallthrough: Option<NodeId>,
}

impl ControlFlowContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context for the body of a loop headed at `header`: continue and
    /// fallthrough both return to the header.
    pub fn in_loop(self, header: NodeId, break_to: Option<NodeId>) -> Self {
        Self {
            break_to,
            continue_to: Some(header),
            fallthrough: Some(header),
        }
    }

    /// Context for one switch case: falling off the case body continues
    /// into `next_case`; continue still refers to the enclosing loop.
    pub fn in_switch(self, break_to: Option<NodeId>, next_case: Option<NodeId>) -> Self {
        Self {
            break_to,
            continue_to: self.continue_to,
            fallthrough: next_case,
        }
    }

    /// Same targets with a new fallthrough. A loop body can never fall
    /// through to its own break point, so a fallthrough equal to the
    /// current break target becomes the continue target instead.
    pub fn with_fallthrough(self, fallthrough: Option<NodeId>) -> Self {
        let fallthrough = if fallthrough.is_some() && fallthrough == self.break_to {
            self.continue_to
        } else {
            fallthrough
        };
        Self { fallthrough, ..self }
    }
}

/// Result of structuring one function.
#[derive(Debug, Clone)]
pub struct StructuredAst {
    /// The lowered statement tree.
    pub body: Stmt,
    /// Nodes that needed an explicit goto label, ascending.
    pub goto_labels: Vec<NodeId>,
    /// Verdict of the interval-based reducibility test. Structured output
    /// for an irreducible graph is correct but carries gotos.
    pub reducible: bool,
}

/// CFG-to-statement lowering driver.
#[derive(Debug, Clone, Default)]
pub struct Structurer {
    builder: AstBuilder,
    config: StructuringConfig,
}

impl Structurer {
    pub fn new(config: StructuringConfig) -> Self {
        Self {
            builder: AstBuilder::new(),
            config,
        }
    }

    /// Lowers the CFG to statements according to the configured mode.
    pub fn structure(&self, cfg: &Cfg) -> Result<StructuredAst, StructuringError> {
        let reducible = cfg.is_reducible()?;
        match self.config.mode {
            LoweringMode::Flat => {
                let body = flat_ast(cfg, &self.builder)?;
                Ok(StructuredAst {
                    body,
                    goto_labels: Vec::new(),
                    reducible,
                })
            }
            LoweringMode::Auto | LoweringMode::Structured => {
                if !reducible {
                    debug!(
                        "irreducible control flow at {:#x}, structured output will carry gotos",
                        cfg.faddr()
                    );
                }
                let graph = cfg.flowgraph()?;
                let domtree = DominatorTree::from_flowgraph(graph)?;
                let block_stmts = prepare_block_stmts(cfg, &self.builder, true)?;

                // Pass one discovers the goto targets, pass two attaches
                // their labels. The second pass must not start before the
                // first finishes.
                let no_labels = BTreeSet::new();
                let (_, labels) =
                    StructurePass::new(cfg, graph, &domtree, &block_stmts, &no_labels).run()?;
                let (body, _) =
                    StructurePass::new(cfg, graph, &domtree, &block_stmts, &labels).run()?;

                Ok(StructuredAst {
                    body,
                    goto_labels: labels.into_iter().collect(),
                    reducible,
                })
            }
        }
    }
}

/// One full recursion over the dominator tree.
///
/// Statements are cloned out of the shared per-block table on emission, so
/// a pass never mutates state the other pass reads.
struct StructurePass<'a> {
    cfg: &'a Cfg,
    graph: &'a FlowGraph,
    domtree: &'a DominatorTree,
    block_stmts: &'a IndexMap<NodeId, Stmt>,
    builder: AstBuilder,
    labels_in: &'a BTreeSet<NodeId>,
    labels_out: BTreeSet<NodeId>,
}

impl<'a> StructurePass<'a> {
    fn new(
        cfg: &'a Cfg,
        graph: &'a FlowGraph,
        domtree: &'a DominatorTree,
        block_stmts: &'a IndexMap<NodeId, Stmt>,
        labels_in: &'a BTreeSet<NodeId>,
    ) -> Self {
        Self {
            cfg,
            graph,
            domtree,
            block_stmts,
            builder: AstBuilder::new(),
            labels_in,
            labels_out: BTreeSet::new(),
        }
    }

    fn run(mut self) -> Result<(Stmt, BTreeSet<NodeId>), StructuringError> {
        let root = self.domtree.root();
        let stmts = self.do_tree(root, ControlFlowContext::new())?;
        Ok((self.builder.mk_block(stmts), self.labels_out))
    }

    /// True if any in-edge of `x` is a back edge.
    fn is_loop_header(&self, x: NodeId) -> Result<bool, StructuringError> {
        let graph = self.graph;
        for &p in graph.predecessors(x) {
            if graph.edge_flavor(p, x)? == EdgeFlavor::Back {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Lowers the dominator subtree rooted at `x`.
    fn do_tree(
        &mut self,
        x: NodeId,
        ctx: ControlFlowContext,
    ) -> Result<Vec<Stmt>, StructuringError> {
        let graph = self.graph;
        let domtree = self.domtree;
        let merges: Vec<NodeId> = domtree
            .children(x)
            .iter()
            .copied()
            .filter(|&c| graph.is_merge_node(c))
            .collect();

        if !self.is_loop_header(x)? {
            return self.node_within(x, &merges, ctx);
        }

        if let [merge] = merges[..] {
            // The single merge child is the loop exit: it follows the loop
            // as a sibling rather than being consumed inside the body.
            let body = self.node_within(x, &[], ctx.in_loop(x, Some(merge)))?;
            let mut stmts = vec![self.builder.mk_loop(self.builder.mk_block(body), Some(merge))];
            stmts.extend(self.do_tree(merge, ctx)?);
            Ok(stmts)
        } else {
            let body = self.node_within(x, &merges, ctx.in_loop(x, ctx.fallthrough))?;
            Ok(vec![self
                .builder
                .mk_loop(self.builder.mk_block(body), ctx.fallthrough)])
        }
    }

    /// Peels merge children off the head of `merges`, then emits `x`'s own
    /// statements and its control-flow continuation.
    fn node_within(
        &mut self,
        x: NodeId,
        merges: &[NodeId],
        ctx: ControlFlowContext,
    ) -> Result<Vec<Stmt>, StructuringError> {
        if let Some((&y, rest)) = merges.split_first() {
            // Everything between x and y becomes the fallthrough body; y
            // itself lowers under the unmodified context so it never nests
            // deeper than its true position.
            let mut stmts = self.node_within(x, rest, ctx.with_fallthrough(Some(y)))?;
            stmts.extend(self.do_tree(y, ctx)?);
            return Ok(stmts);
        }

        let mut stmt = self
            .block_stmts
            .get(&x)
            .cloned()
            .ok_or(StructuringError::MissingBlockStatement(x))?;
        if self.labels_in.contains(&x) {
            stmt.add_label(StmtLabel::Node(x));
        }

        let succs: Vec<NodeId> = self.graph.successors(x).to_vec();
        let mut stmts = vec![stmt];
        match succs.len() {
            0 => {}
            1 => stmts.extend(self.do_branch(x, succs[0], ctx)?),
            2 => stmts.extend(self.two_way(x, &succs, ctx)?),
            _ => stmts.push(self.multiway(x, &succs, ctx)?),
        }
        Ok(stmts)
    }

    /// Two-way continuation. The first successor is the false arm, the
    /// second the true arm.
    fn two_way(
        &mut self,
        x: NodeId,
        succs: &[NodeId],
        ctx: ControlFlowContext,
    ) -> Result<Vec<Stmt>, StructuringError> {
        let cfg = self.cfg;
        let block = cfg.block(x)?;
        if block.is_trampoline() {
            // A composed trampoline's exits are already encoded in its
            // payload statement; continue on the fallthrough side.
            return self.do_branch(x, succs[1], ctx);
        }

        let cond = block
            .last_instruction()
            .and_then(|i| i.condition(false))
            .ok_or(StructuringError::MissingCondition(x))?;
        if cond.is_always_true() {
            return self.do_branch(x, succs[1], ctx);
        }

        let then_stmts = self.do_branch(x, succs[1], ctx)?;
        let else_stmts = self.do_branch(x, succs[0], ctx)?;
        let then_branch = self.builder.mk_block(then_stmts);
        let else_branch = self.builder.mk_block(else_stmts);

        // An empty then-arm beside a populated else-arm reads poorly, so
        // present the reversed condition with the arms swapped.
        let stmt = if then_branch.is_empty() {
            self.builder.mk_branch(
                cond.reversed(),
                else_branch,
                self.builder.mk_block(Vec::new()),
                succs[0].addr(),
                ctx.fallthrough,
            )
        } else {
            self.builder.mk_branch(
                cond,
                then_branch,
                else_branch,
                succs[1].addr(),
                ctx.fallthrough,
            )
        };
        Ok(vec![stmt])
    }

    /// Multiway continuation: a switch whose first successor is the
    /// implicit default, emitted last.
    fn multiway(
        &mut self,
        x: NodeId,
        succs: &[NodeId],
        ctx: ControlFlowContext,
    ) -> Result<Stmt, StructuringError> {
        let cfg = self.cfg;
        let last = cfg
            .block(x)?
            .last_instruction()
            .cloned()
            .ok_or(StructuringError::MissingCondition(x))?;
        let table = cfg.jump_table(last.address);
        let scrutinee = last
            .switch_expr()
            .or_else(|| table.and_then(|t| t.scrutinee.clone()))
            .ok_or(StructuringError::MissingCondition(x))?;

        let default_tgt = succs[0];
        let cases = &succs[1..];

        let mut arms: Vec<(Vec<StmtLabel>, Vec<Stmt>)> = Vec::with_capacity(cases.len());
        for (i, &tgt) in cases.iter().enumerate() {
            let next_case = cases.get(i + 1).copied().unwrap_or(default_tgt);
            let case_ctx = ctx.in_switch(ctx.fallthrough, Some(next_case));
            let body = self.do_branch(x, tgt, case_ctx)?;

            let indices = tgt.addr().and_then(|a| table.and_then(|t| t.get_target(a)));
            let mut labels = Vec::new();
            match indices {
                Some(indices) => {
                    for &v in indices {
                        labels.push(StmtLabel::Case(Expr::Const(v)));
                    }
                }
                None => {
                    warn!(
                        "no jump table entry for switch edge {} -> {}, deriving case value",
                        x, tgt
                    );
                    let expr = tgt
                        .addr()
                        .and_then(|a| last.case_expression(a))
                        .ok_or(StructuringError::MissingCaseValue { src: x, tgt })?;
                    labels.push(StmtLabel::Case(expr));
                }
            }
            arms.push((labels, body));
        }

        let default_ctx = ctx.in_switch(ctx.fallthrough, ctx.fallthrough);
        let default_body = self.do_branch(x, default_tgt, default_ctx)?;
        let default_empty = default_body.iter().all(Stmt::is_empty);

        let mut body_stmts = Vec::with_capacity(arms.len() + 1);
        let arm_count = arms.len();
        for (i, (labels, mut stmts)) in arms.into_iter().enumerate() {
            // A trailing case label with no statement before the closing
            // brace is not legal, so the last case of a default-less switch
            // gets a synthetic break.
            if default_empty && i + 1 == arm_count && stmts.iter().all(Stmt::is_empty) {
                stmts.push(self.builder.mk_break());
            }
            let mut arm = self.builder.mk_block(stmts);
            for label in labels {
                arm.add_label(label);
            }
            body_stmts.push(arm);
        }
        if !default_empty {
            let mut arm = self.builder.mk_block(default_body);
            arm.add_label(StmtLabel::Default);
            body_stmts.push(arm);
        }

        Ok(self.builder.mk_switch(
            scrutinee,
            self.builder.mk_block(body_stmts),
            ctx.fallthrough,
        ))
    }

    /// The goto/continue/break/fallthrough decision point for one edge.
    fn do_branch(
        &mut self,
        src: NodeId,
        tgt: NodeId,
        ctx: ControlFlowContext,
    ) -> Result<Vec<Stmt>, StructuringError> {
        let flavor = self.graph.edge_flavor(src, tgt)?;
        if flavor != EdgeFlavor::Back && !self.graph.is_merge_node(tgt) {
            // Wholly dominated by src: inline it here.
            return self.do_tree(tgt, ctx);
        }
        if Some(tgt) == ctx.fallthrough {
            return Ok(Vec::new());
        }
        if Some(tgt) == ctx.continue_to {
            return Ok(vec![self.builder.mk_continue()]);
        }
        if Some(tgt) == ctx.break_to {
            return Ok(vec![self.builder.mk_break()]);
        }
        self.labels_out.insert(tgt);
        Ok(vec![self.builder.mk_goto(tgt)])
    }
}

/// Builds the per-block base statement each pass clones from.
///
/// Predicated blocks partition into fragments first; trampoline nodes lower
/// through payload pattern matching. With `with_returns`, a block ending in
/// an unconditional return gets an explicit return statement.
fn prepare_block_stmts(
    cfg: &Cfg,
    builder: &AstBuilder,
    with_returns: bool,
) -> Result<IndexMap<NodeId, Stmt>, StructuringError> {
    let mut stmts = IndexMap::new();
    for (&id, block) in cfg.blocks() {
        stmts.insert(id, block_statement(block, builder, with_returns)?);
    }
    Ok(stmts)
}

fn block_statement(
    block: &CfgBlock,
    builder: &AstBuilder,
    with_returns: bool,
) -> Result<Stmt, StructuringError> {
    if let Some(info) = block.trampoline_info() {
        let mut stmt = builder.mk_block(payload::lower(info, builder));
        stmt.addr = Some(block.first_addr);
        return Ok(stmt);
    }

    let instrs = block.instruction_list();
    let ret_value = if with_returns {
        match instrs.last().map(|i| &i.operation) {
            Some(Operation::Return { value }) => Some(value.clone()),
            _ => None,
        }
    } else {
        None
    };

    let base = if block_has_control_flow(&instrs) {
        let fragments = partition_block(&instrs)?;
        builder.mk_block(lower_fragments(fragments, builder))
    } else {
        builder.mk_instr_seq(instrs)
    };

    match ret_value {
        Some(value) => Ok(builder.mk_block(vec![base, builder.mk_return(value)])),
        None => Ok(base),
    }
}

/// The legacy direct block-to-statement mode: one labelled block statement
/// per basic block plus an explicit terminator, no structuring at all.
fn flat_ast(cfg: &Cfg, builder: &AstBuilder) -> Result<Stmt, StructuringError> {
    let mut ids: Vec<NodeId> = cfg.blocks().keys().copied().collect();
    ids.sort();

    let mut stmts = Vec::new();
    for id in ids {
        let block = cfg.block(id)?;
        let mut stmt = block_statement(block, builder, false)?;
        stmt.add_label(StmtLabel::Node(id));
        stmts.push(stmt);

        let succs = cfg.successors(id);
        match succs.len() {
            0 => stmts.push(builder.mk_return(None)),
            1 => stmts.push(builder.mk_goto(succs[0])),
            2 => {
                if block.is_trampoline() {
                    stmts.push(builder.mk_goto(succs[1]));
                    continue;
                }
                let cond = block
                    .last_instruction()
                    .and_then(|i| i.condition(false))
                    .ok_or(StructuringError::MissingCondition(id))?;
                stmts.push(builder.mk_branch(
                    cond,
                    builder.mk_goto(succs[1]),
                    builder.mk_goto(succs[0]),
                    succs[1].addr(),
                    None,
                ));
            }
            _ => {
                let last = block
                    .last_instruction()
                    .ok_or(StructuringError::MissingCondition(id))?;
                for (i, &tgt) in succs.iter().enumerate() {
                    let mut goto = builder.mk_goto(tgt);
                    if i == 0 {
                        goto.add_label(StmtLabel::Default);
                    } else {
                        let expr = tgt
                            .addr()
                            .and_then(|a| last.case_expression(a))
                            .ok_or(StructuringError::MissingCaseValue { src: id, tgt })?;
                        goto.add_label(StmtLabel::Case(expr));
                    }
                    stmts.push(goto);
                }
            }
        }
    }
    Ok(builder.mk_block(stmts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reflow_core::{
        CondExpr, Condition, Instruction, JumpTable, PatchEvent, Predicate, StmtKind,
        TrampolineCase, TrampolineInfo, TrampolineRole,
    };

    fn instr(addr: u64, mnemonic: &str) -> Instruction {
        Instruction::new(addr, 4, vec![0; 4], mnemonic)
    }

    fn cond_branch(addr: u64, cond: Condition, target: u64) -> Instruction {
        instr(addr, "b.cc").with_operation(Operation::ConditionalBranch {
            condition: CondExpr::new(cond, addr),
            target,
            fallthrough: addr + 4,
        })
    }

    fn ret(addr: u64) -> Instruction {
        instr(addr, "ret").with_operation(Operation::Return { value: None })
    }

    fn block_with(instrs: Vec<Instruction>) -> CfgBlock {
        let mut block = CfgBlock::new(instrs[0].address);
        for i in instrs {
            block.push_instruction(i);
        }
        block
    }

    fn build_cfg(blocks: Vec<CfgBlock>, edges: &[(u64, u64)]) -> Cfg {
        let mut cfg = Cfg::new(blocks[0].first_addr);
        for b in blocks {
            let id = NodeId::Block(b.first_addr);
            cfg.add_block(id, b);
        }
        for &(s, t) in edges {
            cfg.add_edge(NodeId::Block(s), NodeId::Block(t));
        }
        cfg
    }

    fn structure(cfg: &Cfg) -> StructuredAst {
        Structurer::new(StructuringConfig::default())
            .structure(cfg)
            .unwrap()
    }

    fn count_branches(stmt: &Stmt) -> usize {
        let mut n = 0;
        stmt.for_each(&mut |s| {
            if matches!(s.kind, StmtKind::Branch { .. }) {
                n += 1;
            }
        });
        n
    }

    // --- Context Tests ---

    #[test]
    fn test_context_in_loop() {
        let ctx = ControlFlowContext::new().in_loop(NodeId::Block(1), Some(NodeId::Block(9)));
        assert_eq!(ctx.break_to, Some(NodeId::Block(9)));
        assert_eq!(ctx.continue_to, Some(NodeId::Block(1)));
        assert_eq!(ctx.fallthrough, Some(NodeId::Block(1)));
    }

    #[test]
    fn test_context_in_switch_keeps_continue() {
        let ctx = ControlFlowContext::new()
            .in_loop(NodeId::Block(1), Some(NodeId::Block(9)))
            .in_switch(Some(NodeId::Block(9)), Some(NodeId::Block(5)));
        assert_eq!(ctx.break_to, Some(NodeId::Block(9)));
        assert_eq!(ctx.continue_to, Some(NodeId::Block(1)));
        assert_eq!(ctx.fallthrough, Some(NodeId::Block(5)));
    }

    #[test]
    fn test_context_fallthrough_to_break_becomes_continue() {
        let ctx = ControlFlowContext::new().in_loop(NodeId::Block(1), Some(NodeId::Block(9)));
        let guarded = ctx.with_fallthrough(Some(NodeId::Block(9)));
        assert_eq!(guarded.fallthrough, Some(NodeId::Block(1)));
        let plain = ctx.with_fallthrough(Some(NodeId::Block(7)));
        assert_eq!(plain.fallthrough, Some(NodeId::Block(7)));
    }

    // --- Structured Lowering Tests ---

    #[test]
    fn test_straight_line_has_no_gotos() {
        let cfg = build_cfg(
            vec![
                block_with(vec![instr(0x1000, "mov")]),
                block_with(vec![ret(0x1004)]),
            ],
            &[(0x1000, 0x1004)],
        );
        let ast = structure(&cfg);
        assert!(ast.reducible);
        assert!(ast.goto_labels.is_empty());
        assert_eq!(ast.body.count_gotos(), 0);
        assert!(format!("{}", ast.body).ends_with("return;\n"));
    }

    #[test]
    fn test_diamond_lowers_to_if_else() {
        let cfg = build_cfg(
            vec![
                block_with(vec![
                    instr(0x1000, "cmp"),
                    cond_branch(0x1004, Condition::NotEqual, 0x100c),
                ]),
                block_with(vec![instr(0x1008, "mov")]),
                block_with(vec![instr(0x100c, "mov")]),
                block_with(vec![ret(0x1010)]),
            ],
            &[
                (0x1000, 0x1008),
                (0x1000, 0x100c),
                (0x1008, 0x1010),
                (0x100c, 0x1010),
            ],
        );
        let ast = structure(&cfg);
        assert_eq!(ast.body.count_gotos(), 0);
        assert_eq!(count_branches(&ast.body), 1);

        let mut arms_filled = false;
        ast.body.for_each(&mut |s| {
            if let StmtKind::Branch {
                condition,
                then_branch,
                else_branch,
                ..
            } = &s.kind
            {
                assert_eq!(condition.cond, Condition::NotEqual);
                arms_filled = !then_branch.is_empty() && !else_branch.is_empty();
            }
        });
        assert!(arms_filled);
        // The merge block follows the branch exactly once.
        assert_eq!(format!("{}", ast.body).matches("return;").count(), 1);
    }

    #[test]
    fn test_empty_then_arm_swaps_condition() {
        // The true edge jumps straight to the merge, so the natural then
        // arm is empty and the branch presents the reversed condition.
        let cfg = build_cfg(
            vec![
                block_with(vec![
                    instr(0x1000, "cmp"),
                    cond_branch(0x1004, Condition::NotEqual, 0x100c),
                ]),
                block_with(vec![instr(0x1008, "mov")]),
                block_with(vec![ret(0x100c)]),
            ],
            &[(0x1000, 0x1008), (0x1000, 0x100c), (0x1008, 0x100c)],
        );
        let ast = structure(&cfg);
        assert_eq!(ast.body.count_gotos(), 0);

        let mut seen = None;
        ast.body.for_each(&mut |s| {
            if let StmtKind::Branch {
                condition,
                else_branch,
                ..
            } = &s.kind
            {
                seen = Some((condition.cond, else_branch.is_empty()));
            }
        });
        assert_eq!(seen, Some((Condition::Equal, true)));
    }

    #[test]
    fn test_self_loop_lowers_to_single_loop() {
        let cfg = build_cfg(
            vec![
                block_with(vec![
                    instr(0x1000, "add"),
                    cond_branch(0x1004, Condition::NotEqual, 0x1000),
                ]),
                block_with(vec![ret(0x1008)]),
            ],
            &[(0x1000, 0x1008), (0x1000, 0x1000)],
        );
        let ast = structure(&cfg);
        assert!(ast.reducible);
        assert_eq!(ast.body.count_loops(), 1);
        assert_eq!(ast.body.count_gotos(), 0);
    }

    #[test]
    fn test_loop_merge_child_follows_as_sibling() {
        // H branches to its body B or to the exit M; B loops back to H or
        // exits to M. M is the loop's single merge child.
        let cfg = build_cfg(
            vec![
                block_with(vec![
                    instr(0x1000, "cmp"),
                    cond_branch(0x1004, Condition::Equal, 0x1010),
                ]),
                block_with(vec![
                    instr(0x1008, "add"),
                    cond_branch(0x100c, Condition::NotEqual, 0x1000),
                ]),
                block_with(vec![ret(0x1010)]),
            ],
            &[
                (0x1000, 0x1008),
                (0x1000, 0x1010),
                (0x1008, 0x1010),
                (0x1008, 0x1000),
            ],
        );
        let ast = structure(&cfg);
        assert_eq!(ast.body.count_loops(), 1);
        assert_eq!(ast.body.count_gotos(), 0);
        let rendered = format!("{}", ast.body);
        assert!(rendered.contains("break;"));
        // The merge block renders after the loop closes, not inside it.
        assert!(rendered.ends_with("return;\n"));
    }

    #[test]
    fn test_irreducible_graph_falls_back_to_gotos() {
        // B and C jump into each other without a common dominator-ordered
        // entry, so the output keeps labelled gotos.
        let cfg = build_cfg(
            vec![
                block_with(vec![
                    instr(0x1000, "cmp"),
                    cond_branch(0x1004, Condition::NotEqual, 0x100c),
                ]),
                block_with(vec![instr(0x1008, "mov")]),
                block_with(vec![instr(0x100c, "mov")]),
            ],
            &[
                (0x1000, 0x1008),
                (0x1000, 0x100c),
                (0x1008, 0x100c),
                (0x100c, 0x1008),
            ],
        );
        let ast = structure(&cfg);
        assert!(!ast.reducible);
        assert_eq!(
            ast.goto_labels,
            vec![NodeId::Block(0x1008), NodeId::Block(0x100c)]
        );
        assert_eq!(ast.body.count_gotos(), 2);
        assert_eq!(
            ast.body.collect_labels(),
            vec![NodeId::Block(0x1008), NodeId::Block(0x100c)]
        );
    }

    // --- Switch Tests ---

    fn switch_cfg(default_is_join: bool) -> Cfg {
        let join = if default_is_join { 0x3000 } else { 0x2000 };
        let dispatch = instr(0x1004, "br").with_operation(Operation::IndirectBranch {
            scrutinee: Some(Expr::reg("r0")),
            targets: vec![join, 0x1010, 0x1020],
        });
        let mut blocks = vec![
            block_with(vec![instr(0x1000, "mov"), dispatch]),
            block_with(vec![instr(0x1010, "mov")]),
            block_with(vec![instr(0x1020, "mov")]),
            block_with(vec![ret(0x3000)]),
        ];
        let mut edges = vec![
            (0x1000, join),
            (0x1000, 0x1010),
            (0x1000, 0x1020),
            (0x1010, 0x3000),
            (0x1020, 0x3000),
        ];
        if !default_is_join {
            blocks.push(block_with(vec![instr(0x2000, "mov")]));
            edges.push((0x2000, 0x3000));
        }
        build_cfg(blocks, &edges)
    }

    #[test]
    fn test_switch_with_jump_table_aliases() {
        let mut cfg = switch_cfg(false);
        let mut table = JumpTable::new(0x1004);
        table.add_case(0, 0x1010);
        table.add_case(1, 0x1010);
        table.add_case(2, 0x1020);
        cfg.add_jump_table(table);

        let ast = structure(&cfg);
        assert_eq!(ast.body.count_gotos(), 0);
        let rendered = format!("{}", ast.body);
        assert!(rendered.contains("switch (r0) {"));
        assert!(rendered.contains("case 2:"));
        assert!(rendered.contains("default:"));
        assert_eq!(rendered.matches("break;").count(), 2);

        // Indices 0 and 1 alias onto one case body.
        let mut first_arm_labels = None;
        ast.body.for_each(&mut |s| {
            if let StmtKind::Switch { body, .. } = &s.kind {
                if let StmtKind::Block(arms) = &body.kind {
                    first_arm_labels = Some(arms[0].labels.clone());
                }
            }
        });
        assert_eq!(
            first_arm_labels,
            Some(vec![
                StmtLabel::Case(Expr::Const(0)),
                StmtLabel::Case(Expr::Const(1)),
            ])
        );
    }

    #[test]
    fn test_switch_empty_default_is_omitted() {
        // The default destination is the join itself, so the default body
        // is empty and the arm disappears.
        let mut cfg = switch_cfg(true);
        let mut table = JumpTable::new(0x1004);
        table.add_case(0, 0x1010);
        table.add_case(1, 0x1020);
        cfg.add_jump_table(table);

        let ast = structure(&cfg);
        let rendered = format!("{}", ast.body);
        assert!(rendered.contains("case 0:"));
        assert!(rendered.contains("case 1:"));
        assert!(!rendered.contains("default:"));
        assert_eq!(ast.body.count_gotos(), 0);
    }

    #[test]
    fn test_switch_without_table_derives_case_values() {
        let cfg = switch_cfg(false);
        let ast = structure(&cfg);
        let rendered = format!("{}", ast.body);
        // Position-derived values: target index 1 -> case 0, index 2 -> 1.
        assert!(rendered.contains("case 0:"));
        assert!(rendered.contains("case 1:"));
        assert!(rendered.contains("default:"));
    }

    // --- Block Preparation Tests ---

    #[test]
    fn test_trailing_conditional_return_stays_flat() {
        let cond_ret = instr(0x1004, "bxeq")
            .with_operation(Operation::ConditionalReturn {
                condition: CondExpr::new(Condition::Equal, 0x1000),
            })
            .with_predicate(Predicate::new(CondExpr::new(Condition::Equal, 0x1000), 0x1000));
        let cfg = build_cfg(
            vec![
                block_with(vec![instr(0x1000, "cmp"), cond_ret]),
                block_with(vec![ret(0x1008)]),
            ],
            &[(0x1000, 0x1008)],
        );
        let ast = structure(&cfg);
        assert_eq!(count_branches(&ast.body), 0);
        assert!(format!("{}", ast.body).contains("bxeq"));
    }

    #[test]
    fn test_predicated_block_partitions_into_branch() {
        let predicated = instr(0x1004, "moveq").with_predicate(Predicate::new(
            CondExpr::new(Condition::Equal, 0x1000),
            0x1000,
        ));
        let cfg = build_cfg(
            vec![
                block_with(vec![instr(0x1000, "cmp"), predicated, instr(0x1008, "mov")]),
                block_with(vec![ret(0x100c)]),
            ],
            &[(0x1000, 0x100c)],
        );
        let ast = structure(&cfg);
        assert_eq!(count_branches(&ast.body), 1);
        assert!(format!("{}", ast.body).contains("moveq"));
    }

    #[test]
    fn test_trampoline_node_lowers_payload_and_continues() {
        let event = PatchEvent::trampoline(0x1000, 0x1004, 0x1100)
            .with_cases(vec![TrampolineCase::Fallthrough])
            .with_fallthrough_destination(0x1010);
        let mut info = TrampolineInfo::new(event);
        info.add_role(TrampolineRole::Setup, NodeId::Block(0x1004));
        info.add_role(TrampolineRole::Payload, NodeId::Block(0x1100));
        info.add_role(TrampolineRole::Takedown, NodeId::Block(0x1108));
        info.add_role(TrampolineRole::Fallthrough, NodeId::Block(0x1010));
        info.add_member_code(
            NodeId::Block(0x1100),
            vec![
                instr(0x1100, "mov"),
                instr(0x1104, "bxeq").with_operation(Operation::ConditionalReturn {
                    condition: CondExpr::new(Condition::Equal, 0x1100),
                }),
            ],
        );

        let mut cfg = Cfg::new(0x1004);
        cfg.add_block(
            NodeId::Block(0x1004),
            CfgBlock::trampoline(0x1004, info),
        );
        cfg.add_block(NodeId::Block(0x1010), block_with(vec![ret(0x1010)]));
        cfg.add_edge(NodeId::Block(0x1004), NodeId::Block(0x1010));

        let ast = structure(&cfg);
        assert_eq!(ast.body.count_gotos(), 0);
        let mut saw_conditional_return = false;
        ast.body.for_each(&mut |s| {
            if let StmtKind::Branch { then_branch, .. } = &s.kind {
                if matches!(then_branch.kind, StmtKind::Return { .. }) {
                    saw_conditional_return = true;
                }
            }
        });
        assert!(saw_conditional_return);
        assert!(format!("{}", ast.body).ends_with("return;\n"));
    }

    // --- Flat Mode Tests ---

    #[test]
    fn test_flat_mode_labels_every_block() {
        let cfg = build_cfg(
            vec![
                block_with(vec![
                    instr(0x1000, "cmp"),
                    cond_branch(0x1004, Condition::NotEqual, 0x100c),
                ]),
                block_with(vec![instr(0x1008, "mov")]),
                block_with(vec![instr(0x100c, "mov")]),
                block_with(vec![ret(0x1010)]),
            ],
            &[
                (0x1000, 0x1008),
                (0x1000, 0x100c),
                (0x1008, 0x1010),
                (0x100c, 0x1010),
            ],
        );
        let ast = Structurer::new(StructuringConfig::new().with_mode(LoweringMode::Flat))
            .structure(&cfg)
            .unwrap();
        assert!(ast.goto_labels.is_empty());
        // Two gotos from the branch, one each from the straight-line blocks.
        assert_eq!(ast.body.count_gotos(), 4);
        let rendered = format!("{}", ast.body);
        for addr in [0x1000u64, 0x1008, 0x100c, 0x1010] {
            assert!(rendered.contains(&format!("L_{:#x}:", addr)));
        }
        assert!(rendered.contains("return;"));
    }

    #[test]
    fn test_flat_mode_multiway_emits_case_labelled_gotos() {
        let cfg = switch_cfg(false);
        let ast = Structurer::new(StructuringConfig::new().with_mode(LoweringMode::Flat))
            .structure(&cfg)
            .unwrap();
        let rendered = format!("{}", ast.body);
        assert!(rendered.contains("default:"));
        assert!(rendered.contains("case 0:"));
        assert!(rendered.contains("case 1:"));
        assert!(rendered.contains("goto L_0x1010;"));
        assert!(rendered.contains("goto L_0x2000;"));
    }
}
