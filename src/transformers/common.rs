//! Common utilities for transformers
//!
//! Shared helper functions and types used across multiple transformers.

use crate::config::TokenizationConfig;
use crate::error::{TokenizeError, TokenizeResult};
use crate::graph::{Graph, Node, NodeId, Op, Output, Subgraph};
use crate::pattern::{is_binary_op, TransposeRole};

/// Transformation result for statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TransformResult {
    /// Number of patterns matched
    pub patterns_matched: usize,
    /// Number of transformations applied
    pub transforms_applied: usize,
    /// Number of nodes eliminated
    pub nodes_eliminated: usize,
    /// Names of transformed nodes
    pub transformed_nodes: Vec<String>,
}

impl TransformResult {
    /// Create empty result
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful transformation
    pub fn record(&mut self, node_name: &str) {
        self.transforms_applied += 1;
        self.transformed_nodes.push(node_name.to_string());
    }

    /// Record elimination
    pub fn record_elimination(&mut self, node_name: &str) {
        self.nodes_eliminated += 1;
        self.transformed_nodes.push(node_name.to_string());
    }

    /// Merge with another result
    pub fn merge(&mut self, other: TransformResult) {
        self.patterns_matched += other.patterns_matched;
        self.transforms_applied += other.transforms_applied;
        self.nodes_eliminated += other.nodes_eliminated;
        self.transformed_nodes.extend(other.transformed_nodes);
    }

    /// Check if anything changed
    pub fn is_changed(&self) -> bool {
        self.transforms_applied + self.nodes_eliminated > 0
    }
}

/// Trait for individual passes
///
/// Passes mutate the graph in place and read policy from the config they
/// are handed; none of them keeps global state.
pub trait GraphTransformer {
    /// Name of the transformer
    fn name(&self) -> &'static str;

    /// Apply the transformation
    fn transform(&self, graph: &mut Graph, config: &TokenizationConfig) -> TokenizeResult<TransformResult>;

    /// Check if this transformer is applicable to the graph
    fn is_applicable(&self, _graph: &Graph, _config: &TokenizationConfig) -> bool {
        true
    }
}

/// Run multiple transformers in sequence
pub fn run_transformers(
    graph: &mut Graph,
    config: &TokenizationConfig,
    transformers: &[&dyn GraphTransformer],
) -> TokenizeResult<TransformResult> {
    let mut total = TransformResult::new();

    for transformer in transformers {
        if transformer.is_applicable(graph, config) {
            let result = transformer.transform(graph, config)?;
            log::debug!(
                "{}: {} applied, {} eliminated",
                transformer.name(),
                result.transforms_applied,
                result.nodes_eliminated
            );
            total.merge(result);
        }
    }

    Ok(total)
}

// ============================================================================
// Fused node helpers
// ============================================================================

/// Top-level fused nodes that common optimizations have not finalized yet
pub fn pending_subgraphs(graph: &Graph) -> Vec<NodeId> {
    graph
        .nodes()
        .filter(|n| n.op.as_subgraph().map(|s| !s.finalized).unwrap_or(false))
        .map(|n| n.id)
        .collect()
}

/// Mutable payload of a fused node
pub fn subgraph_mut(graph: &mut Graph, id: NodeId) -> TokenizeResult<&mut Subgraph> {
    graph
        .get_mut(id)?
        .op
        .as_subgraph_mut()
        .ok_or_else(|| TokenizeError::InvalidNode(format!("{} is not a fused node", id)))
}

/// Data input port of a binary node whose other operand is a scalar-like
/// constant or parameter
pub fn scalar_side_data_port(graph: &Graph, node: &Node) -> Option<usize> {
    if !is_binary_op(&node.op) {
        return None;
    }
    let is_scalar = |port: usize| {
        graph
            .input_producer(node.id, port)
            .map(|p| {
                (p.is_constant() || p.is_parameter())
                    && p.output_desc().map(|d| d.shape.is_scalar_like()).unwrap_or(false)
            })
            .unwrap_or(false)
    };
    if is_scalar(1) {
        Some(0)
    } else if is_scalar(0) {
        Some(1)
    } else {
        None
    }
}

/// Data port of an op that passes a single operand through without changing
/// its layout
pub fn passthrough_port(graph: &Graph, node: &Node) -> Option<usize> {
    match &node.op {
        Op::Convert { .. }
        | Op::Quantize { .. }
        | Op::Dequantize { .. }
        | Op::Relu
        | Op::Exp
        | Op::Negative => Some(0),
        op if is_binary_op(op) => scalar_side_data_port(graph, node),
        _ => None,
    }
}

/// Operand position reached from `value` inside a fused body
///
/// Follows single readers through layout-preserving ops until a MatMul input
/// or a result. Returns the role and, for MatMul operands, whether that
/// MatMul treats the operand as transposed.
pub fn operand_role(body: &Graph, matmuls: &[NodeId], value: Output) -> Option<(TransposeRole, bool)> {
    let mut current = value;
    loop {
        let [input] = body.consumers(current) else {
            return None;
        };
        let reader = body.node(input.node)?;
        match &reader.op {
            Op::Result => return Some((TransposeRole::Output, false)),
            Op::MatMul { transpose_b, .. } => {
                let index = matmuls.iter().position(|id| *id == reader.id)?;
                return match (index, input.port) {
                    (0, 0) => Some((TransposeRole::Query, false)),
                    (0, 1) => Some((TransposeRole::Key, *transpose_b)),
                    (1, 1) => Some((TransposeRole::Value, *transpose_b)),
                    _ => None,
                };
            }
            _ => {
                if passthrough_port(body, reader) != Some(input.port) {
                    return None;
                }
                current = reader.output(0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::GraphBuilder;

    struct CountingTransformer;

    impl GraphTransformer for CountingTransformer {
        fn name(&self) -> &'static str {
            "CountingTransformer"
        }

        fn transform(
            &self,
            graph: &mut Graph,
            _config: &TokenizationConfig,
        ) -> TokenizeResult<TransformResult> {
            let mut result = TransformResult::new();
            for node in graph.nodes() {
                result.patterns_matched += 1;
                if node.is_parameter() {
                    result.record(&node.name);
                }
            }
            Ok(result)
        }
    }

    #[test]
    fn test_transform_result() {
        let mut result = TransformResult::new();

        result.record("node_1");
        result.record_elimination("node_2");

        assert_eq!(result.transforms_applied, 1);
        assert_eq!(result.nodes_eliminated, 1);
        assert_eq!(result.transformed_nodes.len(), 2);
        assert!(result.is_changed());
        assert!(!TransformResult::new().is_changed());
    }

    #[test]
    fn test_run_transformers() {
        let mut b = GraphBuilder::new();
        let x = b.input(&[2]);
        b.result(x).unwrap();
        let mut graph = b.build().unwrap();

        let config = TokenizationConfig::default();
        let total = run_transformers(
            &mut graph,
            &config,
            &[&CountingTransformer, &CountingTransformer],
        )
        .unwrap();
        assert_eq!(total.patterns_matched, 4);
        assert_eq!(total.transforms_applied, 2);
    }

    #[test]
    fn test_operand_role() {
        let mut b = GraphBuilder::new();
        let q = b.input(&[2, 4, 8]);
        let k = b.input(&[2, 8, 4]);
        let v = b.input(&[2, 4, 8]);
        let s = b.scalar(0.5).unwrap();
        let qs = b.multiply(q, s).unwrap();
        let qk = b.matmul(qs, k).unwrap();
        let sm = b.softmax(qk, -1).unwrap();
        let out = b.matmul(sm, v).unwrap();
        b.result(out).unwrap();
        let graph = b.build().unwrap();

        let matmuls = vec![qk.node, out.node];
        assert_eq!(
            operand_role(&graph, &matmuls, q),
            Some((TransposeRole::Query, false))
        );
        assert_eq!(
            operand_role(&graph, &matmuls, k),
            Some((TransposeRole::Key, false))
        );
        assert_eq!(
            operand_role(&graph, &matmuls, v),
            Some((TransposeRole::Value, false))
        );
        assert_eq!(
            operand_role(&graph, &matmuls, out),
            Some((TransposeRole::Output, false))
        );
        assert_eq!(operand_role(&graph, &matmuls, qk), None);
    }
}
