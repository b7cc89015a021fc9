//! Common optimizations on fused bodies
//!
//! Runs once per fused node after tokenization:
//!
//! 1. merge consecutive body Transposes and drop identity Transposes,
//!    Reshapes and Converts
//! 2. move transposes the body cannot execute out of the fused node
//! 3. split the M dimension for the target concurrency
//!
//! The node is then marked finalized so a later run leaves it alone.

use log::debug;

use crate::config::TokenizationConfig;
use crate::error::TokenizeResult;
use crate::graph::{Graph, NodeId};

use super::common::{pending_subgraphs, subgraph_mut, GraphTransformer, TransformResult};
use super::eliminate::EliminateAll;
use super::extract_transposes::ExtractUnsupportedTransposes;
use super::optimize_transpose::MergeTranspose;
use super::split_dimension_m::SplitDimensionM;

/// Finalize every pending fused node
#[derive(Debug, Default)]
pub struct CommonOptimizations;

impl CommonOptimizations {
    /// Create the pass
    pub fn new() -> Self {
        Self
    }

    /// Optimize one fused node
    pub fn optimize(graph: &mut Graph, id: NodeId, config: &TokenizationConfig) -> TokenizeResult<TransformResult> {
        let mut result = TransformResult::new();

        {
            let body = &mut subgraph_mut(graph, id)?.body;
            result.merge(MergeTranspose::new().transform(body, config)?);
            result.merge(EliminateAll::new().transform(body, config)?);
            body.infer_shapes()?;
        }

        if config.enable_transpose_extraction {
            let extracted = ExtractUnsupportedTransposes::extract(graph, id, config)?;
            result.patterns_matched += extracted;
        }

        if let Some(split) = SplitDimensionM::apply_to(graph, id, config)? {
            result.patterns_matched += 1;
            debug!("{} split as {}", id, split);
        }

        subgraph_mut(graph, id)?.finalized = true;
        Ok(result)
    }
}

impl GraphTransformer for CommonOptimizations {
    fn name(&self) -> &'static str {
        "CommonOptimizations"
    }

    fn transform(&self, graph: &mut Graph, config: &TokenizationConfig) -> TokenizeResult<TransformResult> {
        let mut result = TransformResult::new();
        for id in pending_subgraphs(graph) {
            result.merge(Self::optimize(graph, id, config)?);
            result.record(&graph.get(id)?.name);
        }
        Ok(result)
    }

    fn is_applicable(&self, graph: &Graph, _config: &TokenizationConfig) -> bool {
        !pending_subgraphs(graph).is_empty()
    }
}
