//! Dominator tree derived from the immediate-dominator map.

use indexmap::IndexMap;

use crate::error::Error;
use crate::flowgraph::FlowGraph;
use crate::node::NodeId;

/// Children-adjacency view of the dominance relation.
///
/// Children are kept in descending reverse-postorder rank: lowering
/// recurses into high-rank children first and peels merge candidates off
/// the head of the list.
#[derive(Debug, Clone)]
pub struct DominatorTree {
    root: NodeId,
    children: IndexMap<NodeId, Vec<NodeId>>,
}

impl DominatorTree {
    /// Inverts the graph's idom map into a children adjacency. The root's
    /// self-entry is skipped.
    pub fn from_flowgraph(graph: &FlowGraph) -> Result<Self, Error> {
        let mut children: IndexMap<NodeId, Vec<NodeId>> = IndexMap::new();
        for (&node, &idom) in graph.idoms() {
            if node == idom {
                continue;
            }
            children.entry(idom).or_default().push(node);
        }
        for kids in children.values_mut() {
            let mut ranked = Vec::with_capacity(kids.len());
            for &k in kids.iter() {
                ranked.push((graph.rpo_number(k)?, k));
            }
            ranked.sort_by(|a, b| b.0.cmp(&a.0));
            *kids = ranked.into_iter().map(|(_, k)| k).collect();
        }
        Ok(Self {
            root: graph.start_node(),
            children,
        })
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Nodes immediately dominated by `node`, highest rank first.
    pub fn children(&self, node: NodeId) -> &[NodeId] {
        self.children.get(&node).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_graph(edges: &[(u64, u64)], start: u64) -> FlowGraph {
        let mut nodes: Vec<NodeId> = vec![NodeId::Block(start)];
        let mut table: IndexMap<NodeId, Vec<NodeId>> = IndexMap::new();
        for &(src, tgt) in edges {
            for n in [NodeId::Block(src), NodeId::Block(tgt)] {
                if !nodes.contains(&n) {
                    nodes.push(n);
                }
            }
            table
                .entry(NodeId::Block(src))
                .or_default()
                .push(NodeId::Block(tgt));
        }
        FlowGraph::new(nodes, table, NodeId::Block(start)).unwrap()
    }

    #[test]
    fn test_diamond_children_descend_by_rank() {
        let graph = make_graph(&[(1, 2), (1, 3), (2, 4), (3, 4)], 1);
        let tree = DominatorTree::from_flowgraph(&graph).unwrap();
        assert_eq!(tree.root(), NodeId::Block(1));
        assert_eq!(
            tree.children(NodeId::Block(1)),
            &[NodeId::Block(4), NodeId::Block(3), NodeId::Block(2)]
        );
        assert!(tree.children(NodeId::Block(4)).is_empty());
    }

    #[test]
    fn test_loop_children() {
        let graph = make_graph(&[(1, 2), (2, 3), (3, 2), (2, 4)], 1);
        let tree = DominatorTree::from_flowgraph(&graph).unwrap();
        assert_eq!(tree.children(NodeId::Block(1)), &[NodeId::Block(2)]);
        assert_eq!(
            tree.children(NodeId::Block(2)),
            &[NodeId::Block(4), NodeId::Block(3)]
        );
    }

    #[test]
    fn test_root_has_no_self_child() {
        let graph = make_graph(&[(1, 2)], 1);
        let tree = DominatorTree::from_flowgraph(&graph).unwrap();
        assert!(!tree.children(NodeId::Block(1)).contains(&NodeId::Block(1)));
    }
}
