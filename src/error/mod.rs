//! Error types for mha-tokenizer
//!
//! This module defines all error types used throughout the crate.
//!
//! Only broken graph invariants (cycles, dangling edges) and malformed nodes are
//! errors. A region that does not look like attention is a normal "no match"
//! outcome and never produces a [`TokenizeError`].

use thiserror::Error;

use crate::graph::{NodeId, Output};

/// Main error type for tokenization passes
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TokenizeError {
    /// The graph contains a cycle
    #[error("Graph contains a cycle ({ordered} of {total} nodes could be ordered)")]
    Cycle {
        /// Nodes placed before the cycle blocked the sort
        ordered: usize,
        /// Total node count
        total: usize,
    },

    /// A node input refers to a producer that does not exist
    #[error("Dangling edge: input {port} of node {node:?} refers to missing producer {producer:?}")]
    DanglingEdge {
        /// Consumer node
        node: NodeId,
        /// Consumer input port
        port: usize,
        /// The producer output that could not be resolved
        producer: Output,
    },

    /// Node handle not present in the graph
    #[error("Unknown node: {0:?}")]
    UnknownNode(NodeId),

    /// Invalid node configuration
    #[error("Invalid node: {0}")]
    InvalidNode(String),

    /// Shape inference failed
    #[error("Shape inference failed: {0}")]
    ShapeInferenceFailed(String),

    /// Reference evaluation failed
    #[error("Evaluation failed: {0}")]
    EvaluationFailed(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TokenizeError {
    /// Whether this error reports a broken graph invariant (cycle or dangling edge).
    ///
    /// These indicate a bug in an earlier pass and abort the pipeline.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            TokenizeError::Cycle { .. } | TokenizeError::DanglingEdge { .. }
        )
    }
}

/// Result type alias for tokenization operations
pub type TokenizeResult<T> = Result<T, TokenizeError>;
