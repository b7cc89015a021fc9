//! Node elimination transformations
//!
//! Handles the elimination of nodes from the graph while maintaining connectivity.

use crate::error::TokenizeResult;
use crate::graph::{Graph, Node, NodeId};

use super::bridge::bridge_around;

/// Result of an elimination operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EliminationResult {
    /// Name of the eliminated node
    pub node_name: String,
    /// Number of connections bridged
    pub bridged_connections: usize,
}

/// Check if a node can be bridged away
///
/// The node must exist, have at least one input and exactly one output,
/// and must not be a parameter or result.
pub fn can_eliminate(graph: &Graph, id: NodeId) -> bool {
    match graph.node(id) {
        Some(node) => {
            !node.is_parameter()
                && !node.is_result()
                && !node.inputs.is_empty()
                && node.outputs.len() == 1
        }
        None => false,
    }
}

/// Eliminate a single node and bridge connections
///
/// # Arguments
/// * `graph` - The graph
/// * `id` - Node to eliminate
/// * `bridge_input_idx` - Which input to use for bridging
pub fn eliminate_node(
    graph: &mut Graph,
    id: NodeId,
    bridge_input_idx: usize,
) -> TokenizeResult<EliminationResult> {
    let bridged = bridge_around(graph, id, bridge_input_idx)?;
    let node = graph.remove_node(id)?;
    Ok(EliminationResult {
        node_name: node.name,
        bridged_connections: bridged,
    })
}

/// Eliminate every node matching `predicate`, bridging through input 0
pub fn eliminate_nodes_where<F>(graph: &mut Graph, predicate: F) -> TokenizeResult<Vec<EliminationResult>>
where
    F: Fn(&Node, &Graph) -> bool,
{
    let targets: Vec<NodeId> = graph
        .nodes()
        .filter(|n| can_eliminate(graph, n.id) && predicate(n, graph))
        .map(|n| n.id)
        .collect();

    targets
        .into_iter()
        .map(|id| eliminate_node(graph, id, 0))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::GraphBuilder;
    use crate::graph::Op;

    #[test]
    fn test_eliminate_node() {
        let mut b = GraphBuilder::new();
        let x = b.input(&[2, 3]);
        let r = b.reshape(x, &[2, 3]).unwrap();
        let e = b.relu(r).unwrap();
        b.result(e).unwrap();
        let mut graph = b.build().unwrap();

        let result = eliminate_node(&mut graph, r.node, 0).unwrap();
        assert_eq!(result.bridged_connections, 1);
        assert!(!graph.contains(r.node));
        assert_eq!(graph.node(e.node).unwrap().inputs[0], x);
        graph.validate().unwrap();
    }

    #[test]
    fn test_parameters_cannot_be_eliminated() {
        let mut b = GraphBuilder::new();
        let x = b.input(&[2, 3]);
        let t = b.transpose(x, &[1, 0]).unwrap();
        b.result(t).unwrap();
        let graph = b.build().unwrap();

        assert!(can_eliminate(&graph, t.node));
        assert!(!can_eliminate(&graph, x.node));
    }

    #[test]
    fn test_eliminate_nodes_where() {
        let mut b = GraphBuilder::new();
        let x = b.input(&[4]);
        let r1 = b.reshape(x, &[4]).unwrap();
        let r2 = b.reshape(r1, &[4]).unwrap();
        b.result(r2).unwrap();
        let mut graph = b.build().unwrap();

        let results =
            eliminate_nodes_where(&mut graph, |n, _| matches!(n.op, Op::Reshape { .. })).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(graph.node_count(), 2);
        graph.validate().unwrap();
    }
}
