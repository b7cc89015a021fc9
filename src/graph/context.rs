//! Arena graph for tokenization passes
//!
//! `Graph` is the central structure the passes work on. Nodes live in an
//! insertion-ordered arena addressed by [`NodeId`]; the reverse edge relation
//! is kept in a consumer map so producer and consumer queries are O(1).

use crate::error::{TokenizeError, TokenizeResult};
use crate::tensor::TensorDesc;

use super::maps::{build_consumer_map, ConsumerMap, NodeMap};
use super::node::{Input, Node, NodeId, Output};

/// Dataflow graph with stable node handles
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Graph {
    /// Maps node id → Node (preserves creation order)
    pub(crate) nodes: NodeMap,

    /// Maps producer output → consuming inputs
    pub(crate) consumer_map: ConsumerMap,

    /// Graph inputs in declaration order
    pub(crate) parameters: Vec<NodeId>,

    /// Graph outputs in declaration order
    pub(crate) results: Vec<NodeId>,

    /// Next id to hand out
    pub(crate) next_id: u32,
}

impl Graph {
    /// Create an empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild derived maps after bulk edits of the node arena
    pub fn rebuild_maps(&mut self) {
        self.consumer_map = build_consumer_map(&self.nodes);
    }

    // ========================================================================
    // Node accessors
    // ========================================================================

    /// Get a node by id
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    /// Get a mutable node by id
    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    /// Get a node by id, failing if it does not exist
    pub fn get(&self, id: NodeId) -> TokenizeResult<&Node> {
        self.nodes.get(&id).ok_or(TokenizeError::UnknownNode(id))
    }

    /// Get a mutable node by id, failing if it does not exist
    pub fn get_mut(&mut self, id: NodeId) -> TokenizeResult<&mut Node> {
        self.nodes.get_mut(&id).ok_or(TokenizeError::UnknownNode(id))
    }

    /// Check if a node exists
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Get the number of nodes
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Iterate over all nodes in creation order
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Position of a node in creation order
    pub fn creation_index(&self, id: NodeId) -> Option<usize> {
        self.nodes.get_index_of(&id)
    }

    /// Graph inputs in declaration order
    pub fn parameters(&self) -> &[NodeId] {
        &self.parameters
    }

    /// Graph outputs in declaration order
    pub fn results(&self) -> &[NodeId] {
        &self.results
    }

    // ========================================================================
    // Graph traversal
    // ========================================================================

    /// Get the node producing an output
    pub fn producer(&self, output: Output) -> Option<&Node> {
        self.nodes.get(&output.node)
    }

    /// Get the producer of input `port` of `node`
    pub fn input_producer(&self, node: NodeId, port: usize) -> Option<&Node> {
        self.nodes
            .get(&node)
            .and_then(|n| n.input(port))
            .and_then(|out| self.producer(out))
    }

    /// Get the inputs reading an output
    pub fn consumers(&self, output: Output) -> &[Input] {
        self.consumer_map
            .get(&output)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Get the nodes reading an output (deduplicated, in edge order)
    pub fn consumer_nodes(&self, output: Output) -> Vec<&Node> {
        let mut seen: Vec<NodeId> = Vec::new();
        self.consumers(output)
            .iter()
            .filter(|input| {
                if seen.contains(&input.node) {
                    false
                } else {
                    seen.push(input.node);
                    true
                }
            })
            .filter_map(|input| self.node(input.node))
            .collect()
    }

    /// Get every input reading any output of `node`
    pub fn all_consumers(&self, node: NodeId) -> Vec<Input> {
        let ports = self.nodes.get(&node).map(|n| n.outputs.len()).unwrap_or(0);
        (0..ports)
            .flat_map(|port| self.consumers(Output::new(node, port)).iter().copied())
            .collect()
    }

    /// Descriptor of an output
    pub fn desc(&self, output: Output) -> Option<&TensorDesc> {
        self.nodes
            .get(&output.node)
            .and_then(|n| n.outputs.get(output.port))
    }

    /// Descriptor of the value read by input `port` of `node`
    pub fn input_desc(&self, node: NodeId, port: usize) -> Option<&TensorDesc> {
        self.nodes
            .get(&node)
            .and_then(|n| n.input(port))
            .and_then(|out| self.desc(out))
    }
}
