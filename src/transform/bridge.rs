//! Edge bridging
//!
//! Reconnects consumers around a node that is about to disappear, and splices
//! new single-input nodes onto existing edges.

use crate::error::{TokenizeError, TokenizeResult};
use crate::graph::{Graph, Input, NodeId, Op, Output};

/// Redirect every reader of `node`'s first output to its input `input_idx`
///
/// Graph outputs reading the node are redirected too. Returns the number of
/// rewired inputs.
pub fn bridge_around(graph: &mut Graph, node: NodeId, input_idx: usize) -> TokenizeResult<usize> {
    let current = graph.get(node)?;
    let source = current.input(input_idx).ok_or_else(|| {
        TokenizeError::InvalidNode(format!("{} has no input {} to bridge from", node, input_idx))
    })?;
    let output = current.output(0);
    graph.replace_all_uses(output, source)
}

/// Insert a single-input node reading `source` and move all other readers of
/// `source` onto it
///
/// Returns the inserted node.
pub fn insert_after(
    graph: &mut Graph,
    source: Output,
    op: Op,
    name: impl Into<String>,
) -> TokenizeResult<NodeId> {
    let inserted = graph.add_node(op, vec![source], name)?;
    graph.replace_all_uses(source, Output::new(inserted, 0))?;
    Ok(inserted)
}

/// Insert a single-input node on the edge feeding `input`
///
/// Only `input` is moved; other readers of the same producer are untouched.
pub fn insert_before(
    graph: &mut Graph,
    input: Input,
    op: Op,
    name: impl Into<String>,
) -> TokenizeResult<NodeId> {
    let source = graph
        .get(input.node)?
        .input(input.port)
        .ok_or_else(|| {
            TokenizeError::InvalidNode(format!("{} has no input port {}", input.node, input.port))
        })?;
    let inserted = graph.add_node(op, vec![source], name)?;
    graph.replace_input(input, Output::new(inserted, 0))?;
    Ok(inserted)
}
