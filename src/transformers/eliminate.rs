//! Elimination transformers
//!
//! Transformers that remove operations which do not change their input.

use crate::config::TokenizationConfig;
use crate::error::TokenizeResult;
use crate::graph::{Graph, Node, Op};
use crate::tensor::is_identity_order;
use crate::transform::eliminate_nodes_where;

use super::common::{GraphTransformer, TransformResult};

fn record_all(result: &mut TransformResult, removed: Vec<crate::transform::EliminationResult>) {
    result.patterns_matched += removed.len();
    for entry in removed {
        result.record_elimination(&entry.node_name);
    }
}

/// Eliminate Transposes with an identity order
#[derive(Debug, Default)]
pub struct EliminateNopTranspose;

impl EliminateNopTranspose {
    /// Create the pass
    pub fn new() -> Self {
        Self
    }

    fn is_nop(node: &Node, _graph: &Graph) -> bool {
        matches!(&node.op, Op::Transpose { order } if is_identity_order(order))
    }
}

impl GraphTransformer for EliminateNopTranspose {
    fn name(&self) -> &'static str {
        "EliminateNopTranspose"
    }

    fn transform(&self, graph: &mut Graph, _config: &TokenizationConfig) -> TokenizeResult<TransformResult> {
        let mut result = TransformResult::new();
        record_all(&mut result, eliminate_nodes_where(graph, Self::is_nop)?);
        Ok(result)
    }
}

/// Eliminate Reshapes whose static output shape equals their input shape
#[derive(Debug, Default)]
pub struct EliminateNopReshape;

impl EliminateNopReshape {
    /// Create the pass
    pub fn new() -> Self {
        Self
    }

    fn is_nop(node: &Node, graph: &Graph) -> bool {
        if !matches!(node.op, Op::Reshape { .. }) {
            return false;
        }
        match (graph.input_desc(node.id, 0), node.output_desc()) {
            (Some(input), Some(output)) => input.shape.is_static() && input == output,
            _ => false,
        }
    }
}

impl GraphTransformer for EliminateNopReshape {
    fn name(&self) -> &'static str {
        "EliminateNopReshape"
    }

    fn transform(&self, graph: &mut Graph, _config: &TokenizationConfig) -> TokenizeResult<TransformResult> {
        let mut result = TransformResult::new();
        record_all(&mut result, eliminate_nodes_where(graph, Self::is_nop)?);
        Ok(result)
    }
}

/// Eliminate Converts to the type their input already has
#[derive(Debug, Default)]
pub struct EliminateNopConvert;

impl EliminateNopConvert {
    /// Create the pass
    pub fn new() -> Self {
        Self
    }

    fn is_nop(node: &Node, graph: &Graph) -> bool {
        match &node.op {
            Op::Convert { to } => graph
                .input_desc(node.id, 0)
                .map(|d| d.element_type == *to)
                .unwrap_or(false),
            _ => false,
        }
    }
}

impl GraphTransformer for EliminateNopConvert {
    fn name(&self) -> &'static str {
        "EliminateNopConvert"
    }

    fn transform(&self, graph: &mut Graph, _config: &TokenizationConfig) -> TokenizeResult<TransformResult> {
        let mut result = TransformResult::new();
        record_all(&mut result, eliminate_nodes_where(graph, Self::is_nop)?);
        Ok(result)
    }
}

/// Run all elimination transformers
#[derive(Debug, Default)]
pub struct EliminateAll;

impl EliminateAll {
    /// Create the pass
    pub fn new() -> Self {
        Self
    }
}

impl GraphTransformer for EliminateAll {
    fn name(&self) -> &'static str {
        "EliminateAll"
    }

    fn transform(&self, graph: &mut Graph, config: &TokenizationConfig) -> TokenizeResult<TransformResult> {
        let mut result = TransformResult::new();
        result.merge(EliminateNopTranspose::new().transform(graph, config)?);
        result.merge(EliminateNopReshape::new().transform(graph, config)?);
        result.merge(EliminateNopConvert::new().transform(graph, config)?);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::GraphBuilder;
    use crate::tensor::ElementType;

    #[test]
    fn test_eliminate_nop_transpose() {
        let mut b = GraphBuilder::new();
        let x = b.input(&[2, 3, 4]);
        let t = b.transpose(x, &[0, 1, 2]).unwrap();
        let kept = b.transpose(t, &[0, 2, 1]).unwrap();
        b.result(kept).unwrap();
        let mut graph = b.build().unwrap();

        let config = TokenizationConfig::default();
        let result = EliminateNopTranspose::new()
            .transform(&mut graph, &config)
            .unwrap();

        assert_eq!(result.nodes_eliminated, 1);
        assert_eq!(graph.count_ops("Transpose"), 1);
        assert_eq!(graph.node(kept.node).unwrap().inputs[0], x);
    }

    #[test]
    fn test_eliminate_nop_reshape() {
        let mut b = GraphBuilder::new();
        let x = b.input(&[2, 6]);
        let same = b.reshape(x, &[2, 6]).unwrap();
        let changed = b.reshape(same, &[3, 4]).unwrap();
        b.result(changed).unwrap();
        let dynamic = b.input(&[-1, 6]);
        let r = b.reshape(dynamic, &[-1, 6]).unwrap();
        b.result(r).unwrap();
        let mut graph = b.build().unwrap();

        let config = TokenizationConfig::default();
        let result = EliminateNopReshape::new()
            .transform(&mut graph, &config)
            .unwrap();

        assert_eq!(result.nodes_eliminated, 1);
        assert_eq!(graph.count_ops("Reshape"), 2);
    }

    #[test]
    fn test_eliminate_all() {
        let mut b = GraphBuilder::new();
        let x = b.input(&[4, 4]);
        let c = b.convert(x, ElementType::F32).unwrap();
        let t = b.transpose(c, &[0, 1]).unwrap();
        let r = b.reshape(t, &[4, 4]).unwrap();
        let q = b.convert(r, ElementType::I8).unwrap();
        b.result(q).unwrap();
        let mut graph = b.build().unwrap();

        let config = TokenizationConfig::default();
        let result = EliminateAll::new().transform(&mut graph, &config).unwrap();
        graph.validate().unwrap();

        assert_eq!(result.nodes_eliminated, 3);
        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.node(q.node).unwrap().inputs[0], x);
    }
}
