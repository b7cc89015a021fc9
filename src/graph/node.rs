//! Node, edge and operation definitions
//!
//! Nodes are addressed through stable [`NodeId`] handles. An edge is identified
//! by its producer side ([`Output`]); every consumer stores the [`Output`] it
//! reads in its `inputs` list, and the graph keeps the reverse relation in its
//! consumer map.

use std::fmt;

use crate::tensor::{ElementType, TensorDesc};

use super::subgraph::Subgraph;

/// Stable handle of a node inside one [`Graph`](super::Graph)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Zero-based index of the handle
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Producer side of an edge: output `port` of `node`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Output {
    /// Producing node
    pub node: NodeId,
    /// Output port index
    pub port: usize,
}

impl Output {
    /// Create an output reference
    pub fn new(node: NodeId, port: usize) -> Self {
        Self { node, port }
    }
}

/// Consumer side of an edge: input `port` of `node`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Input {
    /// Consuming node
    pub node: NodeId,
    /// Input port index
    pub port: usize,
}

impl Input {
    /// Create an input reference
    pub fn new(node: NodeId, port: usize) -> Self {
        Self { node, port }
    }
}

/// Values of a constant node, stored row-major as f32
#[derive(Debug, Clone, PartialEq)]
pub struct ConstantData {
    /// Flattened values
    pub values: Vec<f32>,
}

impl ConstantData {
    /// Create constant data
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// Single value constant
    pub fn scalar(value: f32) -> Self {
        Self {
            values: vec![value],
        }
    }
}

/// Operation performed by a node
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Graph input
    Parameter,
    /// Constant tensor
    Constant(ConstantData),
    /// Graph output sink
    Result,
    /// Batched matrix multiplication
    MatMul {
        /// Treat the first operand as transposed in its last two axes
        transpose_a: bool,
        /// Treat the second operand as transposed in its last two axes
        transpose_b: bool,
    },
    /// Axis permutation
    Transpose {
        /// Output axis `i` reads input axis `order[i]`
        order: Vec<usize>,
    },
    /// Reshape to a target pattern
    Reshape {
        /// Target dims; `-1` is inferred, `0` copies the input dim when `special_zero`
        pattern: Vec<i64>,
        /// Interpret `0` as "copy the input dimension"
        special_zero: bool,
    },
    /// Elementwise addition
    Add,
    /// Elementwise subtraction
    Subtract,
    /// Elementwise multiplication
    Multiply,
    /// Elementwise division
    Divide,
    /// Elementwise maximum
    Maximum,
    /// Elementwise minimum
    Minimum,
    /// Rectified linear unit
    Relu,
    /// Exponent
    Exp,
    /// Negation
    Negative,
    /// Softmax along one axis
    Softmax {
        /// Reduction axis (negative counts from the end)
        axis: i64,
    },
    /// `cond ? then : else`, broadcast over all three inputs
    Select,
    /// Element type conversion
    Convert {
        /// Target type
        to: ElementType,
    },
    /// Affine quantization to an 8-bit type
    Quantize {
        /// Scale
        scale: f32,
        /// Zero point
        zero_point: f32,
        /// Target type
        to: ElementType,
    },
    /// Affine dequantization to f32
    Dequantize {
        /// Scale
        scale: f32,
        /// Zero point
        zero_point: f32,
    },
    /// Fused snippet subgraph
    Subgraph(Box<Subgraph>),
}

impl Op {
    /// Plain MatMul without transposed operands
    pub fn matmul() -> Self {
        Op::MatMul {
            transpose_a: false,
            transpose_b: false,
        }
    }

    /// Operation type name
    pub fn type_name(&self) -> &'static str {
        match self {
            Op::Parameter => "Parameter",
            Op::Constant(_) => "Constant",
            Op::Result => "Result",
            Op::MatMul { .. } => "MatMul",
            Op::Transpose { .. } => "Transpose",
            Op::Reshape { .. } => "Reshape",
            Op::Add => "Add",
            Op::Subtract => "Subtract",
            Op::Multiply => "Multiply",
            Op::Divide => "Divide",
            Op::Maximum => "Maximum",
            Op::Minimum => "Minimum",
            Op::Relu => "Relu",
            Op::Exp => "Exp",
            Op::Negative => "Negative",
            Op::Softmax { .. } => "Softmax",
            Op::Select => "Select",
            Op::Convert { .. } => "Convert",
            Op::Quantize { .. } => "Quantize",
            Op::Dequantize { .. } => "Dequantize",
            Op::Subgraph(_) => "Subgraph",
        }
    }

    /// Number of inputs the operation takes
    pub fn arity(&self) -> usize {
        match self {
            Op::Parameter | Op::Constant(_) => 0,
            Op::Result
            | Op::Transpose { .. }
            | Op::Reshape { .. }
            | Op::Relu
            | Op::Exp
            | Op::Negative
            | Op::Softmax { .. }
            | Op::Convert { .. }
            | Op::Quantize { .. }
            | Op::Dequantize { .. } => 1,
            Op::MatMul { .. }
            | Op::Add
            | Op::Subtract
            | Op::Multiply
            | Op::Divide
            | Op::Maximum
            | Op::Minimum => 2,
            Op::Select => 3,
            Op::Subgraph(subgraph) => subgraph.input_count(),
        }
    }

    /// Fused subgraph payload, if this is a snippet node
    pub fn as_subgraph(&self) -> Option<&Subgraph> {
        match self {
            Op::Subgraph(subgraph) => Some(subgraph),
            _ => None,
        }
    }

    /// Mutable fused subgraph payload
    pub fn as_subgraph_mut(&mut self) -> Option<&mut Subgraph> {
        match self {
            Op::Subgraph(subgraph) => Some(subgraph),
            _ => None,
        }
    }
}

/// Runtime annotations attached to a node by passes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RtInfo {
    /// Index assigned by the node enumerator
    pub topological_order: Option<usize>,
}

/// A node in the dataflow graph
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    /// Stable handle
    pub id: NodeId,
    /// Human-readable name
    pub name: String,
    /// The operation this node performs
    pub op: Op,
    /// Producer of each input port (ordered)
    pub inputs: Vec<Output>,
    /// Descriptor of each output port
    pub outputs: Vec<TensorDesc>,
    /// Pass annotations
    pub rt_info: RtInfo,
}

impl Node {
    /// Output reference for `port`
    pub fn output(&self, port: usize) -> Output {
        Output::new(self.id, port)
    }

    /// Descriptor of the first output
    pub fn output_desc(&self) -> Option<&TensorDesc> {
        self.outputs.first()
    }

    /// Producer of input `port`
    pub fn input(&self, port: usize) -> Option<Output> {
        self.inputs.get(port).copied()
    }

    /// Topological index, if the node has been enumerated
    pub fn order(&self) -> Option<usize> {
        self.rt_info.topological_order
    }

    /// Check if this node is a graph input
    pub fn is_parameter(&self) -> bool {
        matches!(self.op, Op::Parameter)
    }

    /// Check if this node is a constant
    pub fn is_constant(&self) -> bool {
        matches!(self.op, Op::Constant(_))
    }

    /// Check if this node is a graph output sink
    pub fn is_result(&self) -> bool {
        matches!(self.op, Op::Result)
    }

    /// Check if this node is a MatMul
    pub fn is_matmul(&self) -> bool {
        matches!(self.op, Op::MatMul { .. })
    }

    /// Check if this node is a constant holding a single element
    pub fn is_scalar_constant(&self) -> bool {
        self.is_constant()
            && self
                .output_desc()
                .map(|d| d.shape.is_scalar_like())
                .unwrap_or(false)
    }
}
