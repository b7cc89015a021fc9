//! Advanced graph accessor methods
//!
//! High-level methods for pattern matching and graph analysis.

use std::collections::BTreeSet;

use rustc_hash::FxHashSet;

use crate::error::{TokenizeError, TokenizeResult};

use super::context::Graph;
use super::maps::build_in_degree_map;
use super::node::{Node, NodeId, Output};

impl Graph {
    // ========================================================================
    // Pattern matching helpers
    // ========================================================================

    /// Find nodes by op type name
    pub fn find_nodes_by_op(&self, op_type: &str) -> Vec<&Node> {
        self.nodes().filter(|n| n.op.type_name() == op_type).collect()
    }

    /// Find nodes matching a predicate
    pub fn find_nodes(&self, pred: impl Fn(&Node) -> bool) -> Vec<&Node> {
        self.nodes().filter(|n| pred(n)).collect()
    }

    /// Count nodes of an op type
    pub fn count_ops(&self, op_type: &str) -> usize {
        self.nodes().filter(|n| n.op.type_name() == op_type).count()
    }

    /// Check if an output is read by exactly one input
    pub fn is_single_use(&self, output: Output) -> bool {
        self.consumers(output).len() == 1
    }

    /// Check if no input reads an output
    pub fn is_unused(&self, output: Output) -> bool {
        self.consumers(output).is_empty()
    }

    /// Check if `second` reads an output of `first`
    pub fn are_adjacent(&self, first: NodeId, second: NodeId) -> bool {
        self.node(second)
            .map(|n| n.inputs.iter().any(|src| src.node == first))
            .unwrap_or(false)
    }

    // ========================================================================
    // Region boundaries
    // ========================================================================

    /// Outputs read by `region` but produced outside it
    ///
    /// Ordered by first use (node order, then input port) and deduplicated.
    /// Producers listed in `excluded` are skipped.
    pub fn region_inputs(&self, region: &[NodeId], excluded: &FxHashSet<NodeId>) -> Vec<Output> {
        let members: FxHashSet<NodeId> = region.iter().copied().collect();
        let mut inputs = Vec::new();
        for node in region.iter().filter_map(|id| self.node(*id)) {
            for source in &node.inputs {
                if members.contains(&source.node) || excluded.contains(&source.node) {
                    continue;
                }
                if !inputs.contains(source) {
                    inputs.push(*source);
                }
            }
        }
        inputs
    }

    /// Outputs of `region` read by at least one node outside it
    pub fn region_outputs(&self, region: &[NodeId]) -> Vec<Output> {
        let members: FxHashSet<NodeId> = region.iter().copied().collect();
        let mut outputs = Vec::new();
        for node in region.iter().filter_map(|id| self.node(*id)) {
            for port in 0..node.outputs.len() {
                let output = node.output(port);
                if self
                    .consumers(output)
                    .iter()
                    .any(|input| !members.contains(&input.node))
                {
                    outputs.push(output);
                }
            }
        }
        outputs
    }

    /// Get the topological order of nodes (using Kahn's algorithm)
    ///
    /// Ties between ready nodes are broken by creation order, so the result is
    /// deterministic for a given graph.
    pub fn topological_order(&self) -> TokenizeResult<Vec<NodeId>> {
        let mut in_degree = build_in_degree_map(&self.nodes);

        for node in self.nodes() {
            for (port, source) in node.inputs.iter().enumerate() {
                let exists = self
                    .node(source.node)
                    .map(|p| source.port < p.outputs.len())
                    .unwrap_or(false);
                if !exists {
                    return Err(TokenizeError::DanglingEdge {
                        node: node.id,
                        port,
                        producer: *source,
                    });
                }
            }
        }

        // Ready set keyed by creation index
        let mut ready: BTreeSet<usize> = self
            .nodes
            .values()
            .enumerate()
            .filter(|(_, n)| n.inputs.is_empty())
            .map(|(idx, _)| idx)
            .collect();

        let mut order = Vec::with_capacity(self.node_count());
        while let Some(idx) = ready.pop_first() {
            let Some((&id, _)) = self.nodes.get_index(idx) else {
                continue;
            };
            order.push(id);

            for input in self.all_consumers(id) {
                if let Some(count) = in_degree.get_mut(&input.node) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        if let Some(consumer_idx) = self.creation_index(input.node) {
                            ready.insert(consumer_idx);
                        }
                    }
                }
            }
        }

        if order.len() != self.node_count() {
            return Err(TokenizeError::Cycle {
                ordered: order.len(),
                total: self.node_count(),
            });
        }

        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Input, Op};
    use crate::tensor::{PartialShape, TensorDesc};

    fn desc() -> TensorDesc {
        TensorDesc::f32(PartialShape::from_static(&[2, 2]))
    }

    #[test]
    fn test_find_nodes_by_op() {
        let mut graph = Graph::new();
        let a = graph.add_parameter(desc(), "a");
        let b = graph.add_parameter(desc(), "b");
        let mm = graph
            .add_node(Op::matmul(), vec![Output::new(a, 0), Output::new(b, 0)], "mm")
            .unwrap();
        graph.add_result(Output::new(mm, 0), "out").unwrap();

        assert_eq!(graph.find_nodes_by_op("MatMul").len(), 1);
        assert_eq!(graph.count_ops("Parameter"), 2);
        assert_eq!(graph.find_nodes_by_op("MatMul")[0].id, mm);
    }

    #[test]
    fn test_region_boundaries() {
        let mut graph = Graph::new();
        let a = graph.add_parameter(desc(), "a");
        let b = graph.add_parameter(desc(), "b");
        let add = graph
            .add_node(Op::Add, vec![Output::new(a, 0), Output::new(b, 0)], "add")
            .unwrap();
        let mul = graph
            .add_node(Op::Multiply, vec![Output::new(add, 0), Output::new(a, 0)], "mul")
            .unwrap();
        graph.add_result(Output::new(mul, 0), "out").unwrap();

        let region = [add, mul];
        assert_eq!(
            graph.region_inputs(&region, &FxHashSet::default()),
            vec![Output::new(a, 0), Output::new(b, 0)]
        );
        let excluded: FxHashSet<_> = [b].into_iter().collect();
        assert_eq!(graph.region_inputs(&region, &excluded), vec![Output::new(a, 0)]);
        assert_eq!(graph.region_outputs(&region), vec![Output::new(mul, 0)]);
    }

    #[test]
    fn test_topological_order_tie_break() {
        let mut graph = Graph::new();
        let a = graph.add_parameter(desc(), "a");
        let b = graph.add_parameter(desc(), "b");
        let rb = graph.add_node(Op::Relu, vec![Output::new(b, 0)], "rb").unwrap();
        let ra = graph.add_node(Op::Relu, vec![Output::new(a, 0)], "ra").unwrap();
        let add = graph
            .add_node(Op::Add, vec![Output::new(ra, 0), Output::new(rb, 0)], "add")
            .unwrap();

        let order = graph.topological_order().unwrap();
        assert_eq!(order, vec![a, b, rb, ra, add]);
    }

    #[test]
    fn test_topological_order_detects_cycle() {
        let mut graph = Graph::new();
        let a = graph.add_parameter(desc(), "a");
        let r1 = graph.add_node(Op::Relu, vec![Output::new(a, 0)], "r1").unwrap();
        let r2 = graph.add_node(Op::Relu, vec![Output::new(r1, 0)], "r2").unwrap();
        graph
            .replace_input(Input::new(r1, 0), Output::new(r2, 0))
            .unwrap();

        let err = graph.topological_order().unwrap_err();
        assert!(err.is_invariant_violation());
        assert_eq!(
            err,
            TokenizeError::Cycle {
                ordered: 1,
                total: 3
            }
        );
    }
}
