//! Fold transposes into MatMul flags
//!
//! A Transpose that only swaps the last two axes and feeds the second MatMul
//! operand is expressed by toggling `transpose_b`. The tokenizer turns the
//! flag back into an explicit Transpose inside the fused body, where it can
//! merge with the operand's head-swapping Transpose.

use log::debug;

use crate::config::TokenizationConfig;
use crate::error::TokenizeResult;
use crate::graph::{Graph, Input, NodeId, Op};
use crate::pattern::is_last_two_swap;
use crate::transform::eliminate_node;

use super::common::{GraphTransformer, TransformResult};

/// Fold a last-two-axes Transpose into the consuming MatMul
#[derive(Debug, Default)]
pub struct FoldTransposeIntoMatMul;

impl FoldTransposeIntoMatMul {
    /// Create the pass
    pub fn new() -> Self {
        Self
    }

    /// `(transpose, matmul)` pairs eligible for folding
    fn candidates(graph: &Graph) -> Vec<(NodeId, NodeId)> {
        graph
            .nodes()
            .filter_map(|node| {
                let Op::Transpose { order } = &node.op else {
                    return None;
                };
                if !is_last_two_swap(order) {
                    return None;
                }
                let [reader] = graph.consumers(node.output(0)) else {
                    return None;
                };
                let matmul = graph.node(reader.node)?;
                match (&matmul.op, reader.port) {
                    (Op::MatMul { .. }, 1) => Some((node.id, matmul.id)),
                    _ => None,
                }
            })
            .collect()
    }
}

impl GraphTransformer for FoldTransposeIntoMatMul {
    fn name(&self) -> &'static str {
        "FoldTransposeIntoMatMul"
    }

    fn transform(&self, graph: &mut Graph, _config: &TokenizationConfig) -> TokenizeResult<TransformResult> {
        let mut result = TransformResult::new();
        let candidates = Self::candidates(graph);
        result.patterns_matched = candidates.len();

        for (transpose, matmul) in candidates {
            if let Op::MatMul { transpose_b, .. } = &mut graph.get_mut(matmul)?.op {
                *transpose_b = !*transpose_b;
            }
            let eliminated = eliminate_node(graph, transpose, 0)?;
            debug!(
                "Folded {} into second operand of {}",
                eliminated.node_name, matmul
            );
            result.record_elimination(&eliminated.node_name);
        }

        Ok(result)
    }

    fn is_applicable(&self, graph: &Graph, config: &TokenizationConfig) -> bool {
        config.enable_transpose_extraction && graph.count_ops("Transpose") > 0
    }
}

/// Check if `input` of a MatMul is read as transposed
pub fn reads_transposed(graph: &Graph, input: Input) -> bool {
    match graph.node(input.node).map(|n| &n.op) {
        Some(Op::MatMul {
            transpose_a,
            transpose_b,
        }) => match input.port {
            0 => *transpose_a,
            1 => *transpose_b,
            _ => false,
        },
        _ => false,
    }
}
