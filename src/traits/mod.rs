//! Core traits for mha-tokenizer
//!
//! Defines the capability queries the matcher dispatches on and the
//! fundamental interface for whole-graph transformation.

use crate::error::TokenizeResult;
use crate::graph::Graph;

/// Capability queries over operation kinds
///
/// The matcher and the extractors only ask these questions, so a new op kind
/// becomes matchable by answering them instead of by editing the passes.
pub trait OpCapabilities {
    /// Each output element depends only on the same-index input elements
    /// after broadcasting
    fn is_elementwise(&self) -> bool;

    /// The op commutes with merging, splitting and permuting axes of its
    /// inputs (elementwise and broadcast-compatible)
    fn is_layout_invariant(&self) -> bool;

    /// The op converts between quantized and float domains
    fn is_quantization(&self) -> bool;
}

/// Transformer trait for whole-graph transformations
///
/// This is the core abstraction for all graph-level transformations.
/// Implementations take ownership of a graph and return the transformed graph.
///
/// # Example
///
/// ```ignore
/// struct MyTransformer;
///
/// impl Transformer for MyTransformer {
///     fn transform(&self, graph: Graph) -> TokenizeResult<Graph> {
///         // Transform the graph
///         Ok(graph)
///     }
/// }
/// ```
pub trait Transformer {
    /// Transform the given graph
    ///
    /// # Arguments
    /// * `graph` - The input graph
    ///
    /// # Returns
    /// * `TokenizeResult<Graph>` - The transformed graph or an error
    fn transform(&self, graph: Graph) -> TokenizeResult<Graph>;
}

/// Chainable transformer that applies multiple transformers in sequence
pub struct TransformerChain {
    transformers: Vec<Box<dyn Transformer>>,
}

impl TransformerChain {
    /// Create a new empty transformer chain
    pub fn new() -> Self {
        Self {
            transformers: Vec::new(),
        }
    }

    /// Add a transformer to the chain
    #[allow(clippy::should_implement_trait)]
    pub fn add<T: Transformer + 'static>(mut self, transformer: T) -> Self {
        self.transformers.push(Box::new(transformer));
        self
    }

    /// Number of transformers in the chain
    pub fn len(&self) -> usize {
        self.transformers.len()
    }

    /// Check if the chain is empty
    pub fn is_empty(&self) -> bool {
        self.transformers.is_empty()
    }
}

impl Default for TransformerChain {
    fn default() -> Self {
        Self::new()
    }
}

impl Transformer for TransformerChain {
    fn transform(&self, mut graph: Graph) -> TokenizeResult<Graph> {
        for transformer in &self.transformers {
            graph = transformer.transform(graph)?;
        }
        Ok(graph)
    }
}
