//! Fused snippet subgraphs
//!
//! A [`Subgraph`] is the payload of an [`Op::Subgraph`](super::Op::Subgraph)
//! node. Its body is an ordinary [`Graph`] whose parameters map one-to-one onto
//! the node's input ports and whose results map onto its output ports.

use std::fmt;

use crate::error::{TokenizeError, TokenizeResult};
use crate::tensor::TensorDesc;

use super::context::Graph;
use super::node::{NodeId, Output};

/// Partitioning of the M dimension across parallel work units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SplitM {
    /// Number of M blocks exposed as an extra batch axis
    pub batch_m: usize,
    /// Rows of M left to each kernel invocation
    pub kernel_m: usize,
    /// Target parallel unit count the split was chosen for
    pub concurrency: usize,
}

impl SplitM {
    /// Original M extent
    pub fn m(&self) -> usize {
        self.batch_m * self.kernel_m
    }
}

impl fmt::Display for SplitM {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "M={}x{} (concurrency {})",
            self.batch_m, self.kernel_m, self.concurrency
        )
    }
}

/// Body and annotations of a fused node
#[derive(Debug, Clone, PartialEq)]
pub struct Subgraph {
    /// Captured operations
    pub body: Graph,
    /// Chosen M partitioning, if any
    pub split: Option<SplitM>,
    /// The body mixes quantized and float arithmetic
    pub mixed_precision: bool,
    /// Common optimizations have already run on this body
    pub finalized: bool,
}

impl Subgraph {
    /// Wrap a body graph
    pub fn new(body: Graph) -> Self {
        Self {
            body,
            split: None,
            mixed_precision: false,
            finalized: false,
        }
    }

    /// Number of input ports
    pub fn input_count(&self) -> usize {
        self.body.parameters().len()
    }

    /// Number of output ports
    pub fn output_count(&self) -> usize {
        self.body.results().len()
    }

    /// Total number of data ports
    pub fn port_count(&self) -> usize {
        self.input_count() + self.output_count()
    }

    /// Number of compute operations in the body
    pub fn op_count(&self) -> usize {
        self.body
            .nodes()
            .filter(|n| !n.is_parameter() && !n.is_result() && !n.is_constant())
            .count()
    }

    /// Body MatMuls in topological order
    pub fn matmuls(&self) -> TokenizeResult<Vec<NodeId>> {
        Ok(self
            .body
            .topological_order()?
            .into_iter()
            .filter(|id| self.body.node(*id).map(|n| n.is_matmul()).unwrap_or(false))
            .collect())
    }

    /// Descriptors of the body results
    pub fn output_descs(&self) -> TokenizeResult<Vec<TensorDesc>> {
        self.body
            .results()
            .iter()
            .map(|id| {
                self.body
                    .get(*id)?
                    .output_desc()
                    .cloned()
                    .ok_or_else(|| TokenizeError::Internal(format!("Result {} has no output", id)))
            })
            .collect()
    }

    /// Propagate new input descriptors through the body
    pub fn reinfer(&mut self, inputs: &[TensorDesc]) -> TokenizeResult<Vec<TensorDesc>> {
        if inputs.len() != self.input_count() {
            return Err(TokenizeError::InvalidNode(format!(
                "Subgraph expects {} inputs, got {}",
                self.input_count(),
                inputs.len()
            )));
        }
        let params = self.body.parameters().to_vec();
        for (param, desc) in params.into_iter().zip(inputs) {
            self.body.set_output_desc(Output::new(param, 0), desc.clone())?;
        }
        self.body.infer_shapes()?;
        self.output_descs()
    }

    /// Output descriptors for the given inputs, leaving the body untouched
    pub fn infer_outputs(&self, inputs: &[TensorDesc]) -> TokenizeResult<Vec<TensorDesc>> {
        self.clone().reinfer(inputs)
    }
}
