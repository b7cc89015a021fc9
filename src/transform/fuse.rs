//! Region fusion
//!
//! Collapses a connected set of nodes into one [`Op::Subgraph`] node. The
//! region's boundary inputs become the fused node's input ports (in order) and
//! its boundary outputs become output ports; readers outside the region are
//! rewired and the original nodes are removed.

use std::collections::BTreeSet;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::{TokenizeError, TokenizeResult};
use crate::graph::{Graph, NodeId, Op, Output, Subgraph};
use crate::pattern::{region_escape, MhaMatch};

/// A set of nodes to collapse, with its boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    /// Captured nodes
    pub nodes: Vec<NodeId>,
    /// Constants copied into the body instead of becoming input ports
    pub cloned_constants: Vec<NodeId>,
    /// Boundary inputs, in port order
    pub inputs: Vec<Output>,
    /// Boundary outputs, in port order
    pub outputs: Vec<Output>,
}

impl Region {
    /// Region of `nodes`, computing its boundary from the graph
    pub fn new(graph: &Graph, nodes: Vec<NodeId>, cloned_constants: Vec<NodeId>) -> Self {
        let excluded: FxHashSet<NodeId> = cloned_constants.iter().copied().collect();
        let inputs = graph.region_inputs(&nodes, &excluded);
        let outputs = graph.region_outputs(&nodes);
        Self {
            nodes,
            cloned_constants,
            inputs,
            outputs,
        }
    }
}

impl From<&MhaMatch> for Region {
    fn from(found: &MhaMatch) -> Self {
        Self {
            nodes: found.nodes.clone(),
            cloned_constants: found.cloned_constants.clone(),
            inputs: found.inputs.clone(),
            outputs: vec![found.output],
        }
    }
}

/// Result of a fusion operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FusionResult {
    /// The new fused node
    pub fused: NodeId,
    /// Names of the removed region nodes
    pub eliminated_nodes: Vec<String>,
    /// Cloned constants that became unused and were removed
    pub removed_constants: usize,
}

/// Order region nodes so producers precede consumers
///
/// Ties are broken by creation order.
fn region_order(graph: &Graph, nodes: &[NodeId]) -> TokenizeResult<Vec<NodeId>> {
    let members: FxHashSet<NodeId> = nodes.iter().copied().collect();
    let mut pending: FxHashMap<NodeId, usize> = FxHashMap::default();
    let mut ready = BTreeSet::new();

    for &id in nodes {
        let node = graph.get(id)?;
        let internal = node
            .inputs
            .iter()
            .filter(|src| members.contains(&src.node))
            .count();
        if internal == 0 {
            ready.insert((graph.creation_index(id).unwrap_or(usize::MAX), id));
        } else {
            pending.insert(id, internal);
        }
    }

    let mut order = Vec::with_capacity(nodes.len());
    while let Some((_, id)) = ready.pop_first() {
        order.push(id);
        for input in graph.all_consumers(id) {
            if let Some(count) = pending.get_mut(&input.node) {
                *count -= 1;
                if *count == 0 {
                    pending.remove(&input.node);
                    ready.insert((
                        graph.creation_index(input.node).unwrap_or(usize::MAX),
                        input.node,
                    ));
                }
            }
        }
    }

    if order.len() != nodes.len() {
        return Err(TokenizeError::Cycle {
            ordered: order.len(),
            total: nodes.len(),
        });
    }
    Ok(order)
}

/// Build the body graph of a region
fn build_body(graph: &Graph, region: &Region, order: &[NodeId], name: &str) -> TokenizeResult<Graph> {
    let mut body = Graph::new();
    let mut mapping: FxHashMap<Output, Output> = FxHashMap::default();

    for (port, input) in region.inputs.iter().enumerate() {
        let desc = graph
            .desc(*input)
            .cloned()
            .ok_or(TokenizeError::UnknownNode(input.node))?;
        let param = body.add_parameter(desc, format!("{}/in{}", name, port));
        mapping.insert(*input, Output::new(param, 0));
    }

    for &id in &region.cloned_constants {
        let constant = graph.get(id)?;
        let copy = body.add_node_with_outputs(
            constant.op.clone(),
            Vec::new(),
            constant.outputs.clone(),
            constant.name.clone(),
        )?;
        mapping.insert(constant.output(0), Output::new(copy, 0));
    }

    for &id in order {
        let node = graph.get(id)?;
        let inputs = node
            .inputs
            .iter()
            .map(|src| {
                mapping.get(src).copied().ok_or_else(|| {
                    TokenizeError::Internal(format!(
                        "{} reads {:?}, which is neither captured nor a boundary input",
                        node.name, src
                    ))
                })
            })
            .collect::<TokenizeResult<Vec<_>>>()?;
        let copy = body.add_node_with_outputs(
            node.op.clone(),
            inputs,
            node.outputs.clone(),
            node.name.clone(),
        )?;
        if let Some(copied) = body.node_mut(copy) {
            copied.rt_info = node.rt_info.clone();
        }
        for port in 0..node.outputs.len() {
            mapping.insert(node.output(port), Output::new(copy, port));
        }
    }

    for (port, output) in region.outputs.iter().enumerate() {
        let source = mapping
            .get(output)
            .copied()
            .ok_or(TokenizeError::UnknownNode(output.node))?;
        body.add_result(source, format!("{}/out{}", name, port))?;
    }

    Ok(body)
}

/// Collapse `region` into one fused node named `name`
///
/// Every intermediate state stays a valid DAG: the fused node is added first,
/// outside readers are rewired to it, then region nodes are removed in
/// reverse order.
pub fn fuse_region(graph: &mut Graph, region: &Region, name: &str) -> TokenizeResult<FusionResult> {
    if let Some(id) = region_escape(graph, &region.nodes) {
        return Err(TokenizeError::InvalidNode(format!(
            "cannot fuse {}: a value of {} re-enters the region",
            name, id
        )));
    }
    let order = region_order(graph, &region.nodes)?;
    let body = build_body(graph, region, &order, name)?;

    let output_descs = region
        .outputs
        .iter()
        .map(|out| {
            graph
                .desc(*out)
                .cloned()
                .ok_or(TokenizeError::UnknownNode(out.node))
        })
        .collect::<TokenizeResult<Vec<_>>>()?;

    let fused = graph.add_node_with_outputs(
        Op::Subgraph(Box::new(Subgraph::new(body))),
        region.inputs.clone(),
        output_descs,
        name,
    )?;

    let members: FxHashSet<NodeId> = region.nodes.iter().copied().collect();
    for (port, output) in region.outputs.iter().enumerate() {
        let external: Vec<_> = graph
            .consumers(*output)
            .iter()
            .copied()
            .filter(|input| !members.contains(&input.node) && input.node != fused)
            .collect();
        for input in external {
            graph.replace_input(input, Output::new(fused, port))?;
        }
    }

    let mut eliminated_nodes = Vec::with_capacity(order.len());
    for id in order.into_iter().rev() {
        eliminated_nodes.push(graph.remove_node(id)?.name);
    }

    let mut removed_constants = 0;
    for &id in &region.cloned_constants {
        if graph.contains(id) && graph.all_consumers(id).is_empty() {
            graph.remove_node(id)?;
            removed_constants += 1;
        }
    }

    Ok(FusionResult {
        fused,
        eliminated_nodes,
        removed_constants,
    })
}

/// Check if two nodes can be fused
///
/// Conditions:
/// 1. Nodes must be adjacent
/// 2. Every output of the producer must be read only by the consumer
pub fn can_fuse(graph: &Graph, producer: NodeId, consumer: NodeId) -> bool {
    if !graph.are_adjacent(producer, consumer) {
        return false;
    }
    graph
        .all_consumers(producer)
        .iter()
        .all(|input| input.node == consumer)
}
