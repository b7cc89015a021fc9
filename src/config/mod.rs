//! Tokenization configuration
//!
//! [`TokenizationConfig`] is an immutable-after-construction policy object
//! passed by reference into every pass. There is no process-wide state.
//!
//! # Example
//!
//! ```ignore
//! use mha_tokenizer::config::TokenizationConfig;
//!
//! let config = TokenizationConfig::default()
//!     .with_concurrency(24)
//!     .with_max_token_count(16);
//! ```

use std::collections::BTreeSet;

/// Policy knobs for the tokenization pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizationConfig {
    /// Target number of parallel work units for the compiled kernel
    pub concurrency: usize,
    /// Maximum number of operations captured in one fused region
    pub max_token_count: usize,
    /// Maximum number of fused nodes created in one run
    pub max_subgraph_count: usize,
    /// Maximum number of data ports (inputs + outputs) of one fused node
    pub max_port_count: usize,
    /// Partition the M dimension across work units after tokenization
    pub split_m_dimension: bool,
    /// Allow absorbing a Transpose that follows the second MatMul
    pub enable_transpose_on_output: bool,
    /// Tokenize regions that carry dynamic dimensions
    pub tokenize_dynamic_mha: bool,
    /// Ranks at which Transposes may live inside a fused body
    pub supported_transpose_ranks: BTreeSet<usize>,
    /// Run the reshape extraction pre-pass
    pub enable_reshape_extraction: bool,
    /// Fold MatMul-adjacent transposes into MatMul flags and back into bodies
    pub enable_transpose_extraction: bool,
}

impl Default for TokenizationConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            max_token_count: usize::MAX,
            max_subgraph_count: usize::MAX,
            max_port_count: usize::MAX,
            split_m_dimension: true,
            enable_transpose_on_output: true,
            tokenize_dynamic_mha: true,
            supported_transpose_ranks: [3, 4].into_iter().collect(),
            enable_reshape_extraction: true,
            enable_transpose_extraction: true,
        }
    }
}

impl TokenizationConfig {
    /// Create a config from the six core policy values
    ///
    /// # Arguments
    /// * `concurrency` - Target parallel work units
    /// * `max_port_count` - Data port budget of one fused node
    /// * `split_m_dimension` - Enable SplitM
    /// * `enable_transpose_on_output` - Allow an output Transpose inside bodies
    /// * `tokenize_dynamic_mha` - Allow regions with dynamic dimensions
    /// * `supported_transpose_ranks` - Ranks of Transposes allowed inside bodies
    pub fn new(
        concurrency: usize,
        max_port_count: usize,
        split_m_dimension: bool,
        enable_transpose_on_output: bool,
        tokenize_dynamic_mha: bool,
        supported_transpose_ranks: impl IntoIterator<Item = usize>,
    ) -> Self {
        Self {
            concurrency: concurrency.max(1),
            max_port_count,
            split_m_dimension,
            enable_transpose_on_output,
            tokenize_dynamic_mha,
            supported_transpose_ranks: supported_transpose_ranks.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Set the target concurrency in place
    pub fn set_concurrency(&mut self, concurrency: usize) {
        self.concurrency = concurrency.max(1);
    }

    /// Set the target concurrency
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.set_concurrency(concurrency);
        self
    }

    /// Set the maximum captured op count
    pub fn with_max_token_count(mut self, count: usize) -> Self {
        self.max_token_count = count;
        self
    }

    /// Set the maximum fused node count
    pub fn with_max_subgraph_count(mut self, count: usize) -> Self {
        self.max_subgraph_count = count;
        self
    }

    /// Set the data port budget
    pub fn with_max_port_count(mut self, count: usize) -> Self {
        self.max_port_count = count;
        self
    }

    /// Enable or disable SplitM
    pub fn with_split_m_dimension(mut self, enabled: bool) -> Self {
        self.split_m_dimension = enabled;
        self
    }

    /// Enable or disable output transpose absorption
    pub fn with_transpose_on_output(mut self, enabled: bool) -> Self {
        self.enable_transpose_on_output = enabled;
        self
    }

    /// Enable or disable tokenization of dynamic regions
    pub fn with_dynamic_mha(mut self, enabled: bool) -> Self {
        self.tokenize_dynamic_mha = enabled;
        self
    }

    /// Replace the set of supported transpose ranks
    pub fn with_transpose_ranks(mut self, ranks: impl IntoIterator<Item = usize>) -> Self {
        self.supported_transpose_ranks = ranks.into_iter().collect();
        self
    }

    /// Enable or disable the reshape extraction pre-pass
    pub fn with_reshape_extraction(mut self, enabled: bool) -> Self {
        self.enable_reshape_extraction = enabled;
        self
    }

    /// Enable or disable transpose folding and extraction
    pub fn with_transpose_extraction(mut self, enabled: bool) -> Self {
        self.enable_transpose_extraction = enabled;
        self
    }

    /// Check if a Transpose of `rank` may live inside a body
    pub fn is_transpose_rank_supported(&self, rank: usize) -> bool {
        self.supported_transpose_ranks.contains(&rank)
    }
}
