//! Graph manipulation module
//!
//! This module provides the core infrastructure the tokenization passes work on:
//!
//! - [`Graph`]: arena of nodes with O(1) producer and consumer lookups
//! - [`Node`], [`Op`], [`Output`], [`Input`]: nodes, operations and edges
//! - [`Subgraph`]: body and annotations of a fused snippet node
//! - [`maps`]: type definitions and builders for graph maps
//!
//! # Example
//!
//! ```ignore
//! use mha_tokenizer::graph::{Graph, Op, Output};
//!
//! let mut graph = Graph::new();
//! let q = graph.add_parameter(desc.clone(), "q");
//! let k = graph.add_parameter(desc, "k");
//! let mm = graph.add_node(Op::matmul(), vec![Output::new(q, 0), Output::new(k, 0)], "qk")?;
//!
//! // Traverse graph
//! let producer = graph.input_producer(mm, 0);
//! let consumers = graph.consumers(Output::new(mm, 0));
//! ```
//!
//! # Maps
//!
//! | Map | Description |
//! |-----|-------------|
//! | `nodes` | id → Node (creation order preserved) |
//! | `consumer_map` | producer output → consuming inputs |

pub mod accessors;
pub mod context;
pub mod infer;
pub mod maps;
pub mod mutators;
pub mod node;
pub mod subgraph;
pub mod validation;

// Re-export main types
pub use context::Graph;
pub use infer::{infer_matmul_shape, infer_op, infer_reshape_shape};
pub use maps::{ConsumerMap, InDegreeMap, NodeMap};
pub use node::{ConstantData, Input, Node, NodeId, Op, Output, RtInfo};
pub use subgraph::{SplitM, Subgraph};
