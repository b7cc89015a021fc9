//! Graph invariant checks
//!
//! Validates the structural invariants every pass must preserve: inputs
//! resolve to existing producers, the consumer map mirrors node inputs,
//! op arities hold and the graph is acyclic.

use crate::error::{TokenizeError, TokenizeResult};

use super::context::Graph;
use super::maps::build_consumer_map;

impl Graph {
    /// Check every structural invariant
    pub fn validate(&self) -> TokenizeResult<()> {
        for node in self.nodes() {
            if node.inputs.len() != node.op.arity() {
                return Err(TokenizeError::InvalidNode(format!(
                    "{} ({}) has {} inputs, expected {}",
                    node.name,
                    node.op.type_name(),
                    node.inputs.len(),
                    node.op.arity()
                )));
            }
            if !node.is_result() && node.outputs.is_empty() {
                return Err(TokenizeError::InvalidNode(format!(
                    "{} ({}) has no outputs",
                    node.name,
                    node.op.type_name()
                )));
            }
            if let Some(subgraph) = node.op.as_subgraph() {
                if subgraph.output_count() != node.outputs.len() {
                    return Err(TokenizeError::InvalidNode(format!(
                        "Subgraph {} has {} outputs but its body has {} results",
                        node.name,
                        node.outputs.len(),
                        subgraph.output_count()
                    )));
                }
                subgraph.body.validate()?;
            }
        }

        // Dangling edges and cycles
        self.topological_order()?;

        let expected = build_consumer_map(&self.nodes);
        let mut keys: Vec<_> = expected.keys().chain(self.consumer_map.keys()).collect();
        keys.sort();
        keys.dedup();
        for key in keys {
            let mut want: Vec<_> = expected.get(key).map(|v| v.to_vec()).unwrap_or_default();
            let mut have: Vec<_> = self
                .consumer_map
                .get(key)
                .map(|v| v.to_vec())
                .unwrap_or_default();
            want.sort();
            have.sort();
            if want != have {
                return Err(TokenizeError::Internal(format!(
                    "Consumer map out of sync for {:?}: expected {:?}, found {:?}",
                    key, want, have
                )));
            }
        }

        Ok(())
    }
}
