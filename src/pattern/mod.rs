//! Pattern matching module for attention tokenization
//!
//! This module provides tools for identifying attention regions in a graph:
//!
//! - [`ops`]: op categories and the transpose support table
//! - [`matcher`]: the MHA matcher producing [`MhaMatch`] records
//! - [`traversal`]: downstream walks and the region convexity check
//!
//! # Overview
//!
//! Matching starts at an anchor MatMul and walks forward to the second MatMul
//! through elementwise ops and a Softmax. Operands and the output are then
//! extended with transposes and quantization ops the fused body can execute.
//!
//! # Example
//!
//! ```ignore
//! use mha_tokenizer::pattern::MhaMatcher;
//!
//! let matcher = MhaMatcher::new(&graph, &config);
//! if let Some(m) = matcher.find_match(anchor) {
//!     println!("Region of {} ops with {} ports", m.token_count(), m.port_count());
//! }
//! ```
//!
//! # Traversal
//!
//! ```ignore
//! use mha_tokenizer::pattern::traversal::Downstream;
//!
//! for node in Downstream::new(&graph, start) {
//!     println!("Visiting: {}", node.name);
//! }
//! ```

pub mod matcher;
pub mod ops;
pub mod traversal;

// Re-export main types
pub use matcher::{MhaMatch, MhaMatcher, Rejection, MAX_MATMUL_RANK, MIN_MATMUL_RANK};
pub use ops::{
    categorize_op, head_swap, is_binary_op, is_last_two_swap, is_supported_transpose,
    last_two_swap, OpCategory, TransposeRole, HEAD_SWAP_3D, HEAD_SWAP_4D, KEY_DECOMPOSED_3D,
    KEY_DECOMPOSED_4D,
};
pub use traversal::{region_escape, Downstream};
