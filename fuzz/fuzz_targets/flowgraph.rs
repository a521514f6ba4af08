#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use reflow_core::{Cfg, CfgBlock, DominatorTree, Instruction, NodeId, Operation};

/// Compact graph description the fuzzer mutates directly: a spanning
/// parent per non-entry node keeps every node reachable, extra edges are
/// free-form.
#[derive(Arbitrary, Debug)]
struct GraphSpec {
    node_count: u8,
    parents: Vec<u8>,
    extras: Vec<(u8, u8)>,
}

fn node_addr(i: usize) -> u64 {
    0x1000 + (i as u64) * 0x10
}

fn build_cfg(spec: &GraphSpec) -> Cfg {
    let n = (spec.node_count as usize % 24).max(2);

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
    for (i, _) in succs.iter().enumerate() {
        let addr = node_addr(i);
        let mut block = CfgBlock::new(addr);
        block.push_instruction(
            Instruction::new(addr, 4, vec![0; 4], "ret")
                .with_operation(Operation::Return { value: None }),
        );
        cfg.add_block(NodeId::Block(addr), block);
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

    // Every node is reachable by construction, so graph analysis must
    // succeed and its invariants must hold on arbitrary shapes.
    let graph = cfg.flowgraph().expect("connected graph must analyze");
    let start = graph.start_node();

    let edge_count: usize = cfg.edges().values().map(Vec::len).sum();
    assert_eq!(graph.edge_flavors().len(), edge_count);

    for &node in graph.rpo_sorted() {
        assert!(graph.dominates(start, node));
        if node != start {
            let idom = graph.idom(node).expect("reachable node has an idom");
            assert!(idom != node);
            assert!(graph.dominates(idom, node));
        }
    }

    let domtree = DominatorTree::from_flowgraph(graph).expect("domtree construction");
    let mut child_total = 0usize;
    for &node in graph.rpo_sorted() {
        child_total += domtree.children(node).len();
    }
    assert_eq!(child_total, graph.rpo_sorted().len() - 1);

    let _ = cfg.is_reducible();
    let _ = cfg.find_loops();
});
