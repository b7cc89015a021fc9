//! # MHA Tokenizer
//!
//! Multi-head-attention tokenization for tensor dataflow graphs.
//!
//! This crate finds attention regions (`MatMul -> [elementwise] -> Softmax ->
//! MatMul`) in a graph and collapses each into a single fused snippet node,
//! then prepares the fused body for a tiled kernel generator.
//!
//! ## Features
//!
//! - **Pattern Matching**: Locate MHA regions and the layout ops around them
//! - **Tokenization**: Fuse each region into a Subgraph node, preserving edges
//! - **Common Optimizations**: Move unsupported transposes out of fused bodies
//!   and split the M dimension for parallel execution
//! - **Reference Evaluation**: Run any graph on ndarray data to check rewrites
//!
//! ## Example
//!
//! ```ignore
//! use mha_tokenizer::prelude::*;
//!
//! let config = TokenizationConfig::default().with_concurrency(24);
//! let result = TokenizationPipeline::new(config).run(&mut graph)?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

// ============================================================================
// Module declarations
// ============================================================================

pub mod builder;
pub mod config;
pub mod error;
pub mod eval;
pub mod graph;
pub mod pattern;
pub mod tensor;
pub mod traits;
pub mod transform;
pub mod transformers;

// ============================================================================
// Prelude module for convenient imports
// ============================================================================

/// Prelude module - import commonly used types with `use mha_tokenizer::prelude::*`
pub mod prelude {
    pub use crate::builder::GraphBuilder;
    pub use crate::config::TokenizationConfig;
    pub use crate::error::{TokenizeError, TokenizeResult};
    pub use crate::graph::{Graph, Input, Node, NodeId, Op, Output, SplitM, Subgraph};
    pub use crate::pattern::{MhaMatch, MhaMatcher};
    pub use crate::tensor::{Dim, ElementType, PartialShape, TensorDesc};
    pub use crate::traits::Transformer;
    pub use crate::transformers::{GraphTransformer, TokenizationPipeline, TransformResult};
}

// ============================================================================
// Crate-level re-exports
// ============================================================================

pub use error::{TokenizeError, TokenizeResult};
pub use traits::Transformer;

// ============================================================================
// Version information
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
