//! MHA pattern matcher
//!
//! Recognizes the attention topology around an anchor MatMul:
//!
//! ```text
//!   Q ─[T]─┐
//!          MatMul0 ─ Add/Multiply/Select/Softmax/Convert/... ─ MatMul1 ─[T]─ out
//!   K ─[T]─┘                                              V ─[T]─┘
//! ```
//!
//! The chain between the two MatMuls is walked forward from the anchor. Each
//! step must have exactly one consumer, so no value escapes the region except
//! through its single exit. Operands are then extended upward with
//! single-consumer Transposes, quantization ops and scalar-scaled binary ops.
//!
//! A region that does not fit is reported as a [`Rejection`]; it is never an
//! error.

use log::debug;
use rustc_hash::FxHashSet;
use thiserror::Error;

use crate::config::TokenizationConfig;
use crate::graph::{Graph, Input, Node, NodeId, Op, Output};
use crate::tensor::{compose_orders, normalize_axis};
use crate::traits::OpCapabilities;

use super::ops::{is_binary_op, is_supported_transpose, last_two_swap, TransposeRole};

/// Smallest MatMul operand rank the matcher accepts
pub const MIN_MATMUL_RANK: usize = 2;

/// Largest MatMul operand rank the matcher accepts
pub const MAX_MATMUL_RANK: usize = 5;

/// Reason an anchor did not produce a match
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Anchor is missing, not a MatMul, or has a transposed first operand
    #[error("{0} is not a MatMul anchor")]
    NotAnchor(NodeId),

    /// A MatMul operand rank is outside the supported range
    #[error("{node} has an operand of unsupported rank {rank}")]
    UnsupportedRank {
        /// Offending MatMul
        node: NodeId,
        /// Operand rank
        rank: usize,
    },

    /// A chain value is read by more than one node
    #[error("output of {0} does not have exactly one reader")]
    Branching(NodeId),

    /// An op kind that cannot live in the body
    #[error("{node} ({op}) cannot be fused")]
    UnsupportedOp {
        /// Offending node
        node: NodeId,
        /// Its op type
        op: &'static str,
    },

    /// Softmax along an axis other than the last
    #[error("Softmax {0} does not reduce the last axis")]
    SoftmaxAxis(NodeId),

    /// The chain reached the second MatMul without a Softmax
    #[error("no Softmax between the MatMuls")]
    MissingSoftmax,

    /// Dynamic dimensions while dynamic tokenization is disabled
    #[error("region has dynamic dimensions")]
    DynamicShape,

    /// Too many captured ops
    #[error("region captures {count} ops, limit is {max}")]
    TooManyTokens {
        /// Captured op count
        count: usize,
        /// Configured limit
        max: usize,
    },

    /// Too many data ports
    #[error("region needs {count} ports, limit is {max}")]
    TooManyPorts {
        /// Required port count
        count: usize,
        /// Configured limit
        max: usize,
    },
}

/// An accepted MHA region
#[derive(Debug, Clone, PartialEq)]
pub struct MhaMatch {
    /// QK MatMul (the anchor)
    pub matmul0: NodeId,
    /// Weighted-value MatMul
    pub matmul1: NodeId,
    /// Captured ops in enumeration order
    pub nodes: Vec<NodeId>,
    /// Scalar constants copied into the body instead of becoming ports
    pub cloned_constants: Vec<NodeId>,
    /// Boundary inputs in port order
    pub inputs: Vec<Output>,
    /// The single boundary output
    pub output: Output,
    /// Region contains quantization ops or quantized MatMul operands
    pub mixed_precision: bool,
    /// Some captured value has a dynamic dimension
    pub is_dynamic: bool,
}

impl MhaMatch {
    /// Number of captured ops
    pub fn token_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of data ports of the fused node
    pub fn port_count(&self) -> usize {
        self.inputs.len() + 1
    }

    /// Check if the region captured `id`
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains(&id)
    }
}

/// Matcher for attention regions
///
/// Holds shared references only; one matcher serves any number of anchors
/// as long as the graph is not mutated in between.
pub struct MhaMatcher<'a> {
    graph: &'a Graph,
    config: &'a TokenizationConfig,
}

impl<'a> MhaMatcher<'a> {
    /// Create a matcher over `graph`
    pub fn new(graph: &'a Graph, config: &'a TokenizationConfig) -> Self {
        Self { graph, config }
    }

    /// Check if a node can start a match
    pub fn is_anchor(node: &Node) -> bool {
        matches!(
            node.op,
            Op::MatMul {
                transpose_a: false,
                ..
            }
        )
    }

    /// Try to match at `anchor`, logging the reason on failure
    pub fn find_match(&self, anchor: NodeId) -> Option<MhaMatch> {
        match self.match_at(anchor) {
            Ok(found) => Some(found),
            Err(reason) => {
                debug!("MHA anchor {} rejected: {}", anchor, reason);
                None
            }
        }
    }

    /// Try to match at `anchor`
    pub fn match_at(&self, anchor: NodeId) -> Result<MhaMatch, Rejection> {
        let matmul0 = self
            .graph
            .node(anchor)
            .filter(|n| Self::is_anchor(n))
            .ok_or(Rejection::NotAnchor(anchor))?;
        self.check_ranks(matmul0)?;

        let mut nodes = vec![anchor];
        let mut cloned = FxHashSet::default();

        let matmul1 = self.walk_chain(matmul0, &mut nodes, &mut cloned)?;
        self.check_ranks(matmul1)?;
        nodes.push(matmul1.id);

        self.absorb_operand(Input::new(anchor, 0), TransposeRole::Query, &mut nodes, &mut cloned);
        self.absorb_operand(Input::new(anchor, 1), TransposeRole::Key, &mut nodes, &mut cloned);
        self.absorb_operand(
            Input::new(matmul1.id, 1),
            TransposeRole::Value,
            &mut nodes,
            &mut cloned,
        );
        let output = self.absorb_output(matmul1, &mut nodes);

        self.sort_nodes(&mut nodes);
        let mut cloned_constants: Vec<NodeId> = cloned.iter().copied().collect();
        self.sort_nodes(&mut cloned_constants);
        let inputs = self.graph.region_inputs(&nodes, &cloned);

        if nodes.len() > self.config.max_token_count {
            return Err(Rejection::TooManyTokens {
                count: nodes.len(),
                max: self.config.max_token_count,
            });
        }
        let port_count = inputs.len() + 1;
        if port_count > self.config.max_port_count {
            return Err(Rejection::TooManyPorts {
                count: port_count,
                max: self.config.max_port_count,
            });
        }

        let is_dynamic = nodes
            .iter()
            .filter_map(|id| self.graph.node(*id))
            .flat_map(|n| n.outputs.iter())
            .chain(inputs.iter().filter_map(|src| self.graph.desc(*src)))
            .any(|desc| desc.is_dynamic());
        if is_dynamic && !self.config.tokenize_dynamic_mha {
            return Err(Rejection::DynamicShape);
        }

        let mixed_precision = nodes.iter().filter_map(|id| self.graph.node(*id)).any(|n| {
            n.op.is_quantization()
                || (n.is_matmul()
                    && (0..2).any(|port| {
                        self.graph
                            .input_desc(n.id, port)
                            .map(|d| d.element_type.is_quantized())
                            .unwrap_or(false)
                    }))
        });

        Ok(MhaMatch {
            matmul0: anchor,
            matmul1: matmul1.id,
            nodes,
            cloned_constants,
            inputs,
            output,
            mixed_precision,
            is_dynamic,
        })
    }

    fn check_ranks(&self, matmul: &Node) -> Result<(), Rejection> {
        for port in 0..2 {
            let rank = self
                .graph
                .input_desc(matmul.id, port)
                .map(|d| d.rank())
                .unwrap_or(0);
            if !(MIN_MATMUL_RANK..=MAX_MATMUL_RANK).contains(&rank) {
                return Err(Rejection::UnsupportedRank {
                    node: matmul.id,
                    rank,
                });
            }
        }
        Ok(())
    }

    /// The only reader of the single output of `node`
    fn single_consumer(&self, node: &Node) -> Result<(Input, &'a Node), Rejection> {
        if node.outputs.len() != 1 {
            return Err(Rejection::Branching(node.id));
        }
        match self.graph.consumers(node.output(0)) {
            [input] => self
                .graph
                .node(input.node)
                .map(|consumer| (*input, consumer))
                .ok_or(Rejection::Branching(node.id)),
            _ => Err(Rejection::Branching(node.id)),
        }
    }

    fn is_identity_reshape(node: &Node, graph: &Graph) -> bool {
        let (Some(input), Some(output)) = (graph.input_desc(node.id, 0), node.output_desc()) else {
            return false;
        };
        input.shape.is_static() && input.shape == output.shape
    }

    /// Walk from MatMul0 to MatMul1, returning MatMul1
    fn walk_chain(
        &self,
        matmul0: &'a Node,
        nodes: &mut Vec<NodeId>,
        cloned: &mut FxHashSet<NodeId>,
    ) -> Result<&'a Node, Rejection> {
        let mut current = matmul0;
        let mut has_softmax = false;

        loop {
            let (input, next) = self.single_consumer(current)?;
            match &next.op {
                Op::MatMul {
                    transpose_a: false,
                    ..
                } if input.port == 0 => {
                    if !has_softmax {
                        return Err(Rejection::MissingSoftmax);
                    }
                    return Ok(next);
                }
                Op::Softmax { axis } => {
                    let rank = next.output_desc().map(|d| d.rank()).unwrap_or(0);
                    match normalize_axis(*axis, rank) {
                        Ok(axis) if axis + 1 == rank => has_softmax = true,
                        _ => return Err(Rejection::SoftmaxAxis(next.id)),
                    }
                }
                Op::Reshape { .. } if Self::is_identity_reshape(next, self.graph) => {}
                op if op.is_elementwise() => {}
                op => {
                    return Err(Rejection::UnsupportedOp {
                        node: next.id,
                        op: op.type_name(),
                    })
                }
            }

            for source in &next.inputs {
                if source.node == current.id {
                    continue;
                }
                if let Some(side) = self.graph.node(source.node) {
                    if side.is_scalar_constant() {
                        cloned.insert(side.id);
                    }
                }
            }
            nodes.push(next.id);
            current = next;
        }
    }

    /// Scalar constant operand of a binary node: `(data port, constant)`
    fn scalar_operand(&self, node: &Node) -> Option<(usize, NodeId)> {
        let is_scalar = |port: usize| {
            self.graph
                .input_producer(node.id, port)
                .filter(|p| p.is_scalar_constant())
                .map(|p| p.id)
        };
        is_scalar(1)
            .map(|c| (0, c))
            .or_else(|| is_scalar(0).map(|c| (1, c)))
    }

    /// Extend the region upward from a MatMul operand
    fn absorb_operand(
        &self,
        operand: Input,
        role: TransposeRole,
        nodes: &mut Vec<NodeId>,
        cloned: &mut FxHashSet<NodeId>,
    ) {
        let transposed_b = operand.port == 1
            && matches!(
                self.graph.node(operand.node).map(|n| &n.op),
                Some(Op::MatMul {
                    transpose_b: true,
                    ..
                })
            );
        let mut port = operand;
        let mut has_transpose = false;

        loop {
            let Some(source) = self.graph.node(port.node).and_then(|n| n.input(port.port)) else {
                break;
            };
            if !self.graph.is_single_use(source) {
                break;
            }
            let Some(producer) = self.graph.node(source.node) else {
                break;
            };

            let data_port = match &producer.op {
                Op::Transpose { order } if !has_transpose => {
                    let effective = if transposed_b {
                        compose_orders(order, &last_two_swap(order.len()))
                    } else {
                        order.clone()
                    };
                    if !is_supported_transpose(&effective, role, self.config) {
                        break;
                    }
                    has_transpose = true;
                    0
                }
                Op::Convert { .. } | Op::Quantize { .. } | Op::Dequantize { .. } => 0,
                op if is_binary_op(op) => match self.scalar_operand(producer) {
                    Some((data_port, constant)) => {
                        cloned.insert(constant);
                        data_port
                    }
                    None => break,
                },
                _ => break,
            };

            nodes.push(producer.id);
            port = Input::new(producer.id, data_port);
        }
    }

    /// Extend the region below MatMul1, returning the region exit
    fn absorb_output(&self, matmul1: &Node, nodes: &mut Vec<NodeId>) -> Output {
        let mut exit = matmul1;
        let mut has_transpose = false;

        while let Ok((_, next)) = self.single_consumer(exit) {
            match &next.op {
                Op::Transpose { order }
                    if !has_transpose
                        && is_supported_transpose(order, TransposeRole::Output, self.config) =>
                {
                    has_transpose = true;
                }
                Op::Convert { .. } | Op::Quantize { .. } | Op::Dequantize { .. } => {}
                _ => break,
            }
            nodes.push(next.id);
            exit = next;
        }
        exit.output(0)
    }

    /// Sort by enumeration index, then creation order
    fn sort_nodes(&self, ids: &mut [NodeId]) {
        ids.sort_by_key(|id| {
            (
                self.graph.node(*id).and_then(|n| n.order()).unwrap_or(usize::MAX),
                self.graph.creation_index(*id).unwrap_or(usize::MAX),
            )
        });
    }
}
