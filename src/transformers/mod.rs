//! Tokenization passes
//!
//! This module provides the passes that turn attention regions of a graph into
//! fused snippet nodes:
//!
//! - **Pre-passes**: move layout-only Reshapes out of attention chains, fold
//!   last-two-axis Transposes into MatMul flags
//! - **Enumeration**: stamp topological indices on every node
//! - **Tokenization**: collapse each matched region into one fused node
//! - **Common optimizations**: clean up fused bodies, move unsupported
//!   transposes out of them, split the M dimension
//!
//! # Overview
//!
//! Each pass implements the [`GraphTransformer`] trait and can be applied
//! individually or combined.
//!
//! # Example
//!
//! ```ignore
//! use mha_tokenizer::config::TokenizationConfig;
//! use mha_tokenizer::transformers::{GraphTransformer, TokenizeMhaSnippets};
//!
//! let config = TokenizationConfig::default();
//! let result = TokenizeMhaSnippets::new().transform(&mut graph, &config)?;
//! println!("Fused {} regions", result.transforms_applied);
//! ```
//!
//! # Using TokenizationPipeline
//!
//! For the full sequence, use [`TokenizationPipeline`]:
//!
//! ```ignore
//! use mha_tokenizer::transformers::TokenizationPipeline;
//!
//! let pipeline = TokenizationPipeline::new(config.with_concurrency(24));
//! let result = pipeline.run(&mut graph)?;
//! ```

/// Common utilities and types
pub mod common;
/// Common optimizations on fused bodies
pub mod common_optimizations;
/// Elimination transformers
pub mod eliminate;
/// Node enumeration
pub mod enumerate_nodes;
/// Reshape extraction around attention chains
pub mod extract_reshapes;
/// Transpose extraction from fused bodies
pub mod extract_transposes;
/// Transpose folding into MatMul flags
pub mod fold_transposes;
/// Optimize Transpose chains
pub mod optimize_transpose;
/// M dimension splitting
pub mod split_dimension_m;
/// MHA tokenization
pub mod tokenize_mha;

// Re-export common types
pub use common::{run_transformers, GraphTransformer, TransformResult};

// Re-export elimination transformers
pub use eliminate::{EliminateAll, EliminateNopConvert, EliminateNopReshape, EliminateNopTranspose};

// Re-export the passes
pub use common_optimizations::CommonOptimizations;
pub use enumerate_nodes::EnumerateNodes;
pub use extract_reshapes::ExtractReshapesFromMha;
pub use extract_transposes::{ExtractUnsupportedTransposes, ExtractedTranspose};
pub use fold_transposes::FoldTransposeIntoMatMul;
pub use optimize_transpose::MergeTranspose;
pub use split_dimension_m::{compute_split, SplitDimensionM};
pub use tokenize_mha::TokenizeMhaSnippets;

use log::info;

use crate::config::TokenizationConfig;
use crate::error::TokenizeResult;
use crate::graph::Graph;
use crate::traits::Transformer;

/// The full tokenization sequence under one config
///
/// Runs reshape extraction, transpose folding, enumeration, tokenization and
/// common optimizations, then enumerates again so nodes inserted by the later
/// passes carry an index. Passes whose config flag is off are skipped.
#[derive(Debug, Clone, Default)]
pub struct TokenizationPipeline {
    /// Policy shared by every pass
    pub config: TokenizationConfig,
}

impl TokenizationPipeline {
    /// Create a pipeline with the given config
    pub fn new(config: TokenizationConfig) -> Self {
        Self { config }
    }

    /// Run the pipeline
    pub fn run(&self, graph: &mut Graph) -> TokenizeResult<TransformResult> {
        graph.validate()?;

        let total = run_transformers(
            graph,
            &self.config,
            &[
                &ExtractReshapesFromMha::new(),
                &FoldTransposeIntoMatMul::new(),
                &EnumerateNodes::new(),
                &TokenizeMhaSnippets::new(),
                &CommonOptimizations::new(),
                &EnumerateNodes::new(),
            ],
        )?;

        info!(
            "Tokenization finished: {} fused nodes, {} nodes eliminated",
            graph.count_ops("Subgraph"),
            total.nodes_eliminated
        );
        Ok(total)
    }
}

impl Transformer for TokenizationPipeline {
    fn transform(&self, mut graph: Graph) -> TokenizeResult<Graph> {
        self.run(&mut graph)?;
        Ok(graph)
    }
}
