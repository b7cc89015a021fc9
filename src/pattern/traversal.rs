//! Graph traversal utilities
//!
//! Breadth-first walks along consumer edges, and the convexity check that
//! keeps region fusion from creating cycles.

use std::collections::VecDeque;

use rustc_hash::FxHashSet;

use crate::graph::{Graph, Node, NodeId};

/// Breadth-first walk over consumers, starting node first
pub struct Downstream<'a> {
    graph: &'a Graph,
    queue: VecDeque<NodeId>,
    visited: FxHashSet<NodeId>,
}

impl<'a> Downstream<'a> {
    /// Walk everything reachable from `start`
    pub fn new(graph: &'a Graph, start: NodeId) -> Self {
        let mut queue = VecDeque::new();
        let mut visited = FxHashSet::default();
        if graph.contains(start) {
            queue.push_back(start);
            visited.insert(start);
        }
        Self {
            graph,
            queue,
            visited,
        }
    }
}

impl<'a> Iterator for Downstream<'a> {
    type Item = &'a Node;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.queue.pop_front()?;
        let node = self.graph.node(id)?;
        for input in self.graph.all_consumers(id) {
            if self.visited.insert(input.node) {
                self.queue.push_back(input.node);
            }
        }
        Some(node)
    }
}

/// First region node whose value leaves the region and comes back
///
/// Collapsing a region with such an escape would make the fused node read
/// its own output.
pub fn region_escape(graph: &Graph, nodes: &[NodeId]) -> Option<NodeId> {
    let members: FxHashSet<NodeId> = nodes.iter().copied().collect();
    nodes.iter().copied().find(|&id| {
        graph
            .all_consumers(id)
            .iter()
            .filter(|input| !members.contains(&input.node))
            .any(|input| Downstream::new(graph, input.node).any(|n| members.contains(&n.id)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Op, Output};
    use crate::tensor::{PartialShape, TensorDesc};

    // a -> relu -> add -> out
    //   \-> neg ---^
    fn make_test_graph() -> (Graph, Vec<NodeId>) {
        let mut graph = Graph::new();
        let desc = TensorDesc::f32(PartialShape::from_static(&[4]));
        let a = graph.add_parameter(desc, "a");
        let relu = graph.add_node(Op::Relu, vec![Output::new(a, 0)], "relu").unwrap();
        let neg = graph.add_node(Op::Negative, vec![Output::new(a, 0)], "neg").unwrap();
        let add = graph
            .add_node(Op::Add, vec![Output::new(relu, 0), Output::new(neg, 0)], "add")
            .unwrap();
        let out = graph.add_result(Output::new(add, 0), "out").unwrap();
        (graph, vec![a, relu, neg, add, out])
    }

    #[test]
    fn test_downstream_order() {
        let (graph, ids) = make_test_graph();
        let visited: Vec<_> = Downstream::new(&graph, ids[0]).map(|n| n.id).collect();
        assert_eq!(visited, ids);
        assert_eq!(Downstream::new(&graph, ids[4]).count(), 1);
    }

    #[test]
    fn test_region_escape() {
        let (graph, ids) = make_test_graph();
        // a and add without relu: a -> relu -> add leaves and re-enters
        assert_eq!(region_escape(&graph, &[ids[0], ids[2], ids[3]]), Some(ids[0]));
        assert_eq!(region_escape(&graph, &[ids[1], ids[2], ids[3]]), None);
        assert_eq!(region_escape(&graph, &[ids[1]]), None);
    }
}
