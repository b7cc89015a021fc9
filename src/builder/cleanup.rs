//! Graph cleanup utilities
//!
//! Removes unread nodes and merges duplicate constants.

use rustc_hash::FxHashMap;

use crate::error::TokenizeResult;
use crate::graph::{Graph, NodeId, Op, Output};
use crate::tensor::TensorDesc;

/// Statistics from cleanup operations
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupStats {
    /// Number of unread nodes removed
    pub dead_nodes_removed: usize,
    /// Number of duplicate constants merged into an earlier twin
    pub constants_deduplicated: usize,
}

impl CleanupStats {
    /// Total number of removed nodes
    pub fn total_removed(&self) -> usize {
        self.dead_nodes_removed + self.constants_deduplicated
    }
}

/// Redirect readers of duplicate constants to the first identical one
///
/// Constants are identical when descriptor and values match bit for bit.
pub fn deduplicate_constants(graph: &mut Graph) -> TokenizeResult<usize> {
    let mut seen: FxHashMap<(TensorDesc, Vec<u32>), NodeId> = FxHashMap::default();
    let mut duplicates = Vec::new();

    for node in graph.nodes() {
        let Op::Constant(data) = &node.op else {
            continue;
        };
        let Some(desc) = node.output_desc() else {
            continue;
        };
        let key = (
            desc.clone(),
            data.values.iter().map(|v| v.to_bits()).collect(),
        );
        match seen.get(&key) {
            Some(&first) => duplicates.push((node.id, first)),
            None => {
                seen.insert(key, node.id);
            }
        }
    }

    for (duplicate, first) in &duplicates {
        graph.replace_all_uses(Output::new(*duplicate, 0), Output::new(*first, 0))?;
        graph.remove_node(*duplicate)?;
    }
    Ok(duplicates.len())
}

/// Full cleanup: merge duplicate constants, then drop unread nodes
pub fn cleanup_graph(graph: &mut Graph) -> TokenizeResult<CleanupStats> {
    let constants_deduplicated = deduplicate_constants(graph)?;
    let dead_nodes_removed = graph.remove_dead_nodes()?;
    Ok(CleanupStats {
        dead_nodes_removed,
        constants_deduplicated,
    })
}
