//! Node enumeration
//!
//! Stamps every node with its position in the deterministic topological
//! order. The matcher sorts captured nodes by this index, so fused bodies are
//! built in the same order on every run.

use log::trace;

use crate::config::TokenizationConfig;
use crate::error::TokenizeResult;
use crate::graph::{Graph, Op};

use super::common::{GraphTransformer, TransformResult};

/// Assign `rt_info.topological_order` to every node, fused bodies included
#[derive(Debug, Default)]
pub struct EnumerateNodes;

impl EnumerateNodes {
    /// Create the pass
    pub fn new() -> Self {
        Self
    }

    /// Enumerate `graph` and every nested body
    pub fn enumerate(graph: &mut Graph) -> TokenizeResult<usize> {
        let order = graph.topological_order()?;
        let mut changed = 0;

        for (index, id) in order.into_iter().enumerate() {
            let node = graph.get_mut(id)?;
            if node.rt_info.topological_order != Some(index) {
                node.rt_info.topological_order = Some(index);
                changed += 1;
            }
            trace!("{} ({}) -> {}", node.name, node.op.type_name(), index);
            if let Op::Subgraph(subgraph) = &mut node.op {
                changed += Self::enumerate(&mut subgraph.body)?;
            }
        }

        Ok(changed)
    }
}

impl GraphTransformer for EnumerateNodes {
    fn name(&self) -> &'static str {
        "EnumerateNodes"
    }

    fn transform(&self, graph: &mut Graph, _config: &TokenizationConfig) -> TokenizeResult<TransformResult> {
        let mut result = TransformResult::new();
        result.patterns_matched = graph.node_count();
        result.transforms_applied = Self::enumerate(graph)?;
        Ok(result)
    }
}
