//! Transpose optimization transformers

use crate::config::TokenizationConfig;
use crate::error::TokenizeResult;
use crate::graph::{Graph, NodeId, Op};
use crate::tensor::{compose_orders, inverse_order, is_identity_order};
use crate::transform::{can_fuse, eliminate_node};

use super::common::{GraphTransformer, TransformResult};

/// Merge consecutive Transpose operations
///
/// `T2(T1(x))` becomes a single Transpose with the composed order when `T1`
/// has no other reader. A composition that is the identity removes both.
#[derive(Debug, Default)]
pub struct MergeTranspose;

impl MergeTranspose {
    /// Create the pass
    pub fn new() -> Self {
        Self
    }

    /// Next `(first, second)` Transpose pair that can be merged
    fn next_pair(graph: &Graph) -> Option<(NodeId, NodeId)> {
        graph.nodes().find_map(|second| {
            let Op::Transpose { order: outer } = &second.op else {
                return None;
            };
            let first = graph.input_producer(second.id, 0)?;
            match &first.op {
                Op::Transpose { order: inner }
                    if inner.len() == outer.len() && can_fuse(graph, first.id, second.id) =>
                {
                    Some((first.id, second.id))
                }
                _ => None,
            }
        })
    }

    fn try_merge(graph: &mut Graph, first: NodeId, second: NodeId, result: &mut TransformResult) -> TokenizeResult<()> {
        let (Op::Transpose { order: inner }, Op::Transpose { order: outer }) =
            (&graph.get(first)?.op, &graph.get(second)?.op)
        else {
            return Ok(());
        };
        let combined = compose_orders(inner, outer);

        let removed = eliminate_node(graph, first, 0)?;
        result.record_elimination(&removed.node_name);

        if is_identity_order(&combined) {
            let removed = eliminate_node(graph, second, 0)?;
            result.record_elimination(&removed.node_name);
        } else if let Op::Transpose { order } = &mut graph.get_mut(second)?.op {
            *order = combined;
        }
        Ok(())
    }
}

impl GraphTransformer for MergeTranspose {
    fn name(&self) -> &'static str {
        "MergeTranspose"
    }

    fn transform(&self, graph: &mut Graph, _config: &TokenizationConfig) -> TokenizeResult<TransformResult> {
        let mut result = TransformResult::new();

        while let Some((first, second)) = Self::next_pair(graph) {
            result.patterns_matched += 1;
            Self::try_merge(graph, first, second, &mut result)?;
        }
        Ok(result)
    }

    fn is_applicable(&self, graph: &Graph, _config: &TokenizationConfig) -> bool {
        graph.count_ops("Transpose") >= 2
    }
}

/// Check if two orders undo each other
pub fn are_inverse(first: &[usize], second: &[usize]) -> bool {
    first.len() == second.len() && inverse_order(first) == second
}
