//! Graph builder module
//!
//! This module provides utilities for assembling graphs:
//!
//! - [`GraphBuilder`]: Fluent builder that infers descriptors op by op
//! - [`cleanup`]: Dead node removal and constant deduplication
//!
//! # Example
//!
//! ```ignore
//! use mha_tokenizer::builder::GraphBuilder;
//!
//! let mut b = GraphBuilder::new();
//! let q = b.input(&[1, 12, 128, 64]);
//! let k = b.input(&[1, 12, 64, 128]);
//! let v = b.input(&[1, 12, 128, 64]);
//! let qk = b.matmul(q, k)?;
//! let sm = b.softmax(qk, -1)?;
//! let out = b.matmul(sm, v)?;
//! b.result(out)?;
//! let graph = b.build()?;
//! ```
//!
//! # Cleanup
//!
//! ```ignore
//! use mha_tokenizer::builder::cleanup;
//!
//! let stats = cleanup::cleanup_graph(&mut graph)?;
//! println!("Removed {} nodes", stats.total_removed());
//! ```

pub mod cleanup;
pub mod graph;

// Re-export main types and functions
pub use cleanup::{cleanup_graph, deduplicate_constants, CleanupStats};
pub use graph::GraphBuilder;
