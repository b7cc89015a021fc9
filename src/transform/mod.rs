//! Graph transformation module
//!
//! This module provides the graph surgery primitives the passes are built on:
//!
//! - [`fuse`]: collapsing a region into one fused node
//! - [`eliminate`]: removing a node while keeping its readers connected
//! - [`bridge`]: rewiring readers and splicing nodes onto edges
//!
//! # Overview
//!
//! Every primitive works on a `Graph` in place and leaves it a valid DAG
//! with a consistent consumer map.
//!
//! # Example
//!
//! ```ignore
//! use mha_tokenizer::transform::{fuse_region, Region};
//!
//! let region = Region::from(&found);
//! let result = fuse_region(&mut graph, &region, "mha_0")?;
//! println!("Fused {} nodes into {}", result.eliminated_nodes.len(), result.fused);
//! ```

pub mod bridge;
pub mod eliminate;
pub mod fuse;

// Re-export main types and functions
pub use bridge::{bridge_around, insert_after, insert_before};
pub use eliminate::{can_eliminate, eliminate_node, eliminate_nodes_where, EliminationResult};
pub use fuse::{can_fuse, fuse_region, FusionResult, Region};
