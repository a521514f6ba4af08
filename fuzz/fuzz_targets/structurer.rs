#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use reflow_analysis::{LoweringMode, Structurer, StructuringConfig};
use reflow_core::{
    Cfg, CfgBlock, CondExpr, Condition, Expr, Instruction, JumpTable, NodeId, Operation, StmtKind,
};
use std::collections::BTreeSet;

/// Connected graph description; blocks get instructions matching their
/// out-degree so every structuring path stays well-formed.
#[derive(Arbitrary, Debug)]
struct GraphSpec {
    node_count: u8,
    parents: Vec<u8>,
    extras: Vec<(u8, u8)>,
    flat: bool,
}

fn node_addr(i: usize) -> u64 {
    0x1000 + (i as u64) * 0x20
}

fn build_cfg(spec: &GraphSpec) -> Cfg {
    let n = (spec.node_count as usize % 20).max(2);

    let mut succs: Vec<Vec<usize>> = vec![Vec::new(); n];
    for i in 1..n {
        let parent = spec.parents.get(i - 1).map(|&p| p as usize % i).unwrap_or(0);
        if !succs[parent].contains(&i) {
            succs[parent].push(i);
        }
    }
    for &(a, b) in &spec.extras {
        let (src, tgt) = (a as usize % n, b as usize % n);
        if !succs[src].contains(&tgt) {
            succs[src].push(tgt);
        }
    }

    let mut cfg = Cfg::new(node_addr(0));
    let mut tables = Vec::new();
    for (i, node_succs) in succs.iter().enumerate() {
        let addr = node_addr(i);
        let last_addr = addr + 4;
        let mut block = CfgBlock::new(addr);
        block.push_instruction(Instruction::new(addr, 4, vec![0; 4], "mov"));
        let last = match node_succs.len() {
            0 => Instruction::new(last_addr, 4, vec![0; 4], "ret")
                .with_operation(Operation::Return { value: None }),
            1 => Instruction::new(last_addr, 4, vec![0; 4], "b").with_operation(
                Operation::Branch {
                    target: node_addr(node_succs[0]),
                },
            ),
            2 => Instruction::new(last_addr, 4, vec![0; 4], "b.ne").with_operation(
                Operation::ConditionalBranch {
                    condition: CondExpr::compare(
                        Condition::NotEqual,
                        Expr::reg("r0"),
                        Expr::Const(0),
                        last_addr,
                    ),
                    target: node_addr(node_succs[1]),
                    fallthrough: node_addr(node_succs[0]),
                },
            ),
            _ => {
                let targets: Vec<u64> = node_succs.iter().map(|&t| node_addr(t)).collect();
                let mut table = JumpTable::new(last_addr).with_scrutinee(Expr::reg("r0"));
                for (case, &target) in targets.iter().enumerate().skip(1) {
                    table.add_case(case as i64 - 1, target);
                }
                tables.push(table);
                Instruction::new(last_addr, 4, vec![0; 4], "br").with_operation(
                    Operation::IndirectBranch {
                        scrutinee: Some(Expr::reg("r0")),
                        targets,
                    },
                )
            }
        };
        block.push_instruction(last);
        cfg.add_block(NodeId::Block(addr), block);
    }
    for table in tables {
        cfg.add_jump_table(table);
    }
    for (i, node_succs) in succs.iter().enumerate() {
        for &t in node_succs {
            cfg.add_edge(NodeId::Block(node_addr(i)), NodeId::Block(node_addr(t)));
        }
    }
    cfg
}

fuzz_target!(|spec: GraphSpec| {
    let cfg = build_cfg(&spec);
    let mode = if spec.flat {
        LoweringMode::Flat
    } else {
        LoweringMode::Auto
    };
    let structurer = Structurer::new(StructuringConfig::new().with_mode(mode));

    let structured = structurer.structure(&cfg).expect("well-formed input");

    // Labels and gotos must pair exactly, and the render must not panic.
    let mut targets: BTreeSet<NodeId> = BTreeSet::new();
    structured.body.for_each(&mut |s| {
        if let StmtKind::Goto { target } = &s.kind {
            targets.insert(*target);
        }
    });
    let reported: BTreeSet<NodeId> = structured.goto_labels.iter().copied().collect();
    if mode == LoweringMode::Auto {
        assert_eq!(targets, reported);
    }
    let _ = structured.body.to_string();
});
