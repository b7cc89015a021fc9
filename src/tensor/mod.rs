//! Tensor metadata
//!
//! This module provides the descriptors that travel along graph edges:
//! - Element types (`dtype`)
//! - Shapes with static or dynamic dimensions (`shape`)
//! - The combined edge descriptor (`desc`)
//!
//! # Example
//!
//! ```ignore
//! use mha_tokenizer::tensor::{ElementType, PartialShape, TensorDesc};
//!
//! // Batch and sequence length unknown, heads and head size fixed
//! let q = TensorDesc::new(ElementType::F32, PartialShape::from_i64(&[-1, -1, 12, 64]));
//! assert!(q.is_dynamic());
//! ```

pub mod desc;
pub mod dtype;
pub mod shape;

// Re-export commonly used items
pub use desc::TensorDesc;
pub use dtype::ElementType;
pub use shape::{
    broadcast_shape, compose_orders, inverse_order, is_identity_order,
    is_permutation, is_prime, normalize_axis, numel, Dim, PartialShape,
};
