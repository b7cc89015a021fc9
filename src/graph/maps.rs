//! Graph map types and builders
//!
//! Defines the core data structures for efficient graph traversal.

use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use super::node::{Input, Node, NodeId, Output};

/// Type alias for node map: id → Node (insertion order preserved)
pub type NodeMap = IndexMap<NodeId, Node>;

/// Type alias for consumer map: producer output → consuming inputs
/// SmallVec optimized for common case of 1-4 consumers
pub type ConsumerMap = FxHashMap<Output, SmallVec<[Input; 4]>>;

/// Type alias for in-degree map: node → number of inputs with a pending producer
pub type InDegreeMap = FxHashMap<NodeId, usize>;

/// Build consumer map from the node map
///
/// Maps each producer output to the inputs that read it, in node order.
pub fn build_consumer_map(nodes: &NodeMap) -> ConsumerMap {
    let mut map: ConsumerMap = FxHashMap::default();

    for node in nodes.values() {
        for (port, source) in node.inputs.iter().enumerate() {
            map.entry(*source)
                .or_default()
                .push(Input::new(node.id, port));
        }
    }

    map
}

/// Build in-degree map from the node map
///
/// Every input edge counts once, so a node reading the same output twice
/// has in-degree two.
pub fn build_in_degree_map(nodes: &NodeMap) -> InDegreeMap {
    nodes
        .values()
        .map(|node| (node.id, node.inputs.len()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::node::{Op, RtInfo};
    use crate::tensor::{PartialShape, TensorDesc};

    fn make_node(id: u32, op: Op, inputs: Vec<Output>) -> Node {
        Node {
            id: NodeId(id),
            name: format!("n{}", id),
            op,
            inputs,
            outputs: vec![TensorDesc::f32(PartialShape::from_static(&[2, 2]))],
            rt_info: RtInfo::default(),
        }
    }

    fn make_test_nodes() -> NodeMap {
        let mut nodes = NodeMap::new();
        let a = make_node(0, Op::Parameter, vec![]);
        let b = make_node(1, Op::Parameter, vec![]);
        let mm = make_node(
            2,
            Op::matmul(),
            vec![Output::new(NodeId(0), 0), Output::new(NodeId(1), 0)],
        );
        let add = make_node(
            3,
            Op::Add,
            vec![Output::new(NodeId(2), 0), Output::new(NodeId(2), 0)],
        );
        for node in [a, b, mm, add] {
            nodes.insert(node.id, node);
        }
        nodes
    }

    #[test]
    fn test_build_consumer_map() {
        let nodes = make_test_nodes();
        let map = build_consumer_map(&nodes);

        let mm_out = Output::new(NodeId(2), 0);
        let consumers = map.get(&mm_out).unwrap();
        assert_eq!(consumers.len(), 2);
        assert_eq!(consumers[0], Input::new(NodeId(3), 0));
        assert_eq!(consumers[1], Input::new(NodeId(3), 1));

        assert!(map.get(&Output::new(NodeId(3), 0)).is_none());
    }

    #[test]
    fn test_build_in_degree_map() {
        let nodes = make_test_nodes();
        let map = build_in_degree_map(&nodes);
        assert_eq!(map[&NodeId(0)], 0);
        assert_eq!(map[&NodeId(3)], 2);
    }

    #[test]
    fn test_node_map_preserves_order() {
        let nodes = make_test_nodes();
        let ids: Vec<_> = nodes.keys().copied().collect();
        assert_eq!(ids, vec![NodeId(0), NodeId(1), NodeId(2), NodeId(3)]);
    }
}
