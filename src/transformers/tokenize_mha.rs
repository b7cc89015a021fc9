//! MHA tokenization
//!
//! Scans anchors in topological order and collapses every matched attention
//! region into one fused [`Subgraph`](crate::graph::Subgraph) node. Matching is
//! greedy: the outermost anchor that matches wins and its nodes are no longer
//! available to later anchors.

use log::{debug, info};
use rustc_hash::FxHashSet;

use crate::config::TokenizationConfig;
use crate::error::TokenizeResult;
use crate::graph::{Graph, Input, NodeId, Op};
use crate::pattern::{last_two_swap, MhaMatcher};
use crate::transform::{fuse_region, insert_before, Region};

use super::common::{subgraph_mut, GraphTransformer, TransformResult};
use super::enumerate_nodes::EnumerateNodes;

/// Collapse attention regions into fused nodes
#[derive(Debug, Default)]
pub struct TokenizeMhaSnippets;

impl TokenizeMhaSnippets {
    /// Create the pass
    pub fn new() -> Self {
        Self
    }

    /// First unvisited anchor in topological order
    fn next_anchor(graph: &Graph, visited: &FxHashSet<NodeId>) -> TokenizeResult<Option<NodeId>> {
        Ok(graph.topological_order()?.into_iter().find(|id| {
            !visited.contains(id)
                && graph
                    .node(*id)
                    .map(MhaMatcher::is_anchor)
                    .unwrap_or(false)
        }))
    }

    /// Replace `transpose_b` on body MatMuls by an explicit Transpose
    ///
    /// Returns the number of materialized transposes.
    pub fn materialize_transposed_operands(body: &mut Graph) -> TokenizeResult<usize> {
        let targets: Vec<(NodeId, usize)> = body
            .nodes()
            .filter(|n| matches!(n.op, Op::MatMul { transpose_b: true, .. }))
            .filter_map(|n| body.input_desc(n.id, 1).map(|d| (n.id, d.rank())))
            .collect();

        for &(matmul, rank) in &targets {
            let name = format!("{}/transpose_b", body.get(matmul)?.name);
            insert_before(
                body,
                Input::new(matmul, 1),
                Op::Transpose {
                    order: last_two_swap(rank),
                },
                name,
            )?;
            if let Op::MatMul { transpose_b, .. } = &mut body.get_mut(matmul)?.op {
                *transpose_b = false;
            }
        }
        Ok(targets.len())
    }
}

impl GraphTransformer for TokenizeMhaSnippets {
    fn name(&self) -> &'static str {
        "TokenizeMhaSnippets"
    }

    fn transform(&self, graph: &mut Graph, config: &TokenizationConfig) -> TokenizeResult<TransformResult> {
        let mut result = TransformResult::new();
        let mut visited = FxHashSet::default();
        let mut fused_count = 0;

        EnumerateNodes::enumerate(graph)?;

        while fused_count < config.max_subgraph_count {
            let Some(anchor) = Self::next_anchor(graph, &visited)? else {
                break;
            };
            visited.insert(anchor);

            let Some(found) = MhaMatcher::new(graph, config).find_match(anchor) else {
                continue;
            };
            result.patterns_matched += 1;

            let name = format!("{}/mha", graph.get(anchor)?.name);
            let fusion = fuse_region(graph, &Region::from(&found), &name)?;

            let subgraph = subgraph_mut(graph, fusion.fused)?;
            subgraph.mixed_precision = found.mixed_precision;
            if config.enable_transpose_extraction {
                Self::materialize_transposed_operands(&mut subgraph.body)?;
            }

            info!(
                "Tokenized {}: {} ops, {} inputs{}{}",
                name,
                found.token_count(),
                found.inputs.len(),
                if found.mixed_precision { ", mixed precision" } else { "" },
                if found.is_dynamic { ", dynamic" } else { "" }
            );
            result.record(&name);
            result.nodes_eliminated += fusion.eliminated_nodes.len();
            fused_count += 1;

            // Renumber the outer graph and the new body
            EnumerateNodes::enumerate(graph)?;
        }

        if fused_count == config.max_subgraph_count {
            debug!("Subgraph limit {} reached", config.max_subgraph_count);
        }
        Ok(result)
    }

    fn is_applicable(&self, graph: &Graph, _config: &TokenizationConfig) -> bool {
        graph.count_ops("MatMul") >= 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::GraphBuilder;
    use crate::graph::Output;

    fn mha(b: &mut GraphBuilder, dims: &[i64]) -> Output {
        let q = b.input(dims);
        let k = b.input(dims);
        let v = b.input(dims);
        let qk = b.matmul_t(q, k, false, true).unwrap();
        let sm = b.softmax(qk, -1).unwrap();
        b.matmul(sm, v).unwrap()
    }

    #[test]
    fn test_tokenize_single_region() {
        let mut b = GraphBuilder::new();
        let out = mha(&mut b, &[12, 128, 64]);
        b.result(out).unwrap();
        let mut graph = b.build().unwrap();

        let config = TokenizationConfig::default();
        let result = TokenizeMhaSnippets::new()
            .transform(&mut graph, &config)
            .unwrap();
        graph.validate().unwrap();

        assert_eq!(result.transforms_applied, 1);
        assert_eq!(result.nodes_eliminated, 3);
        assert_eq!(graph.count_ops("Subgraph"), 1);
        assert_eq!(graph.count_ops("MatMul"), 0);

        let fused = graph.find_nodes_by_op("Subgraph")[0];
        let subgraph = fused.op.as_subgraph().unwrap();
        assert_eq!(subgraph.input_count(), 3);
        assert_eq!(subgraph.body.count_ops("Transpose"), 1);
        assert!(!subgraph.mixed_precision);
        assert!(subgraph
            .body
            .nodes()
            .all(|n| !matches!(n.op, Op::MatMul { transpose_b: true, .. })));
        assert!(subgraph.body.nodes().all(|n| n.order().is_some()));
    }

    #[test]
    fn test_transposed_flag_kept_without_extraction() {
        let mut b = GraphBuilder::new();
        let out = mha(&mut b, &[12, 128, 64]);
        b.result(out).unwrap();
        let mut graph = b.build().unwrap();

        let config = TokenizationConfig::default().with_transpose_extraction(false);
        TokenizeMhaSnippets::new()
            .transform(&mut graph, &config)
            .unwrap();

        let fused = graph.find_nodes_by_op("Subgraph")[0];
        let body = &fused.op.as_subgraph().unwrap().body;
        assert_eq!(body.count_ops("Transpose"), 0);
    }

    #[test]
    fn test_subgraph_limit() {
        let mut b = GraphBuilder::new();
        let first = mha(&mut b, &[4, 16, 8]);
        let second = mha(&mut b, &[4, 16, 8]);
        b.result(first).unwrap();
        b.result(second).unwrap();
        let graph = b.build().unwrap();

        let config = TokenizationConfig::default();
        let mut all = graph.clone();
        let result = TokenizeMhaSnippets::new().transform(&mut all, &config).unwrap();
        assert_eq!(result.transforms_applied, 2);
        assert_eq!(all.count_ops("Subgraph"), 2);

        let limited_config = config.with_max_subgraph_count(1);
        let mut limited = graph;
        let result = TokenizeMhaSnippets::new()
            .transform(&mut limited, &limited_config)
            .unwrap();
        assert_eq!(result.transforms_applied, 1);
        assert_eq!(limited.count_ops("Subgraph"), 1);
        assert_eq!(limited.count_ops("MatMul"), 2);
    }

    #[test]
    fn test_chained_regions_are_both_tokenized() {
        let mut b = GraphBuilder::new();
        let first = mha(&mut b, &[4, 16, 8]);
        let k = b.input(&[4, 8, 16]);
        let v = b.input(&[4, 16, 8]);
        let qk = b.matmul(first, k).unwrap();
        let sm = b.softmax(qk, -1).unwrap();
        let out = b.matmul(sm, v).unwrap();
        b.result(out).unwrap();
        let mut graph = b.build().unwrap();

        let config = TokenizationConfig::default();
        let result = TokenizeMhaSnippets::new()
            .transform(&mut graph, &config)
            .unwrap();
        graph.validate().unwrap();
        assert_eq!(result.transforms_applied, 2);

        let fused: Vec<_> = graph.find_nodes_by_op("Subgraph");
        let (outer, inner) = if graph.input_producer(fused[1].id, 0).map(|p| p.id) == Some(fused[0].id) {
            (fused[0], fused[1])
        } else {
            (fused[1], fused[0])
        };
        assert_eq!(inner.inputs[0], Output::new(outer.id, 0));
    }
}
