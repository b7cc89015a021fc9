//! Fluent graph builder
//!
//! Assembles graphs one op at a time, naming nodes automatically.

use crate::error::TokenizeResult;
use crate::graph::{Graph, NodeId, Op, Output};
use crate::tensor::{ElementType, PartialShape, TensorDesc};

use super::cleanup::{cleanup_graph, CleanupStats};

/// Builder for constructing graphs
///
/// Every op method infers the output descriptor from its inputs and returns
/// the produced [`Output`].
#[derive(Debug, Default)]
pub struct GraphBuilder {
    /// Graph under construction
    graph: Graph,
    /// Counter used for generated names
    counter: usize,
    /// Whether to run cleanup on build
    cleanup: bool,
}

impl GraphBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue building on an existing graph
    pub fn from_graph(graph: Graph) -> Self {
        let counter = graph.node_count();
        Self {
            graph,
            counter,
            cleanup: false,
        }
    }

    /// Enable or disable cleanup
    pub fn cleanup(mut self, enable: bool) -> Self {
        self.cleanup = enable;
        self
    }

    /// Graph built so far
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    fn next_name(&mut self, op_type: &str) -> String {
        let name = format!("{}_{}", op_type.to_lowercase(), self.counter);
        self.counter += 1;
        name
    }

    // ========================================================================
    // Sources and sinks
    // ========================================================================

    /// Add a graph input; negative dims are dynamic
    pub fn parameter(&mut self, element_type: ElementType, dims: &[i64]) -> Output {
        self.parameter_desc(TensorDesc::new(element_type, PartialShape::from_i64(dims)))
    }

    /// Add an f32 graph input; negative dims are dynamic
    pub fn input(&mut self, dims: &[i64]) -> Output {
        self.parameter(ElementType::F32, dims)
    }

    /// Add a graph input with a full descriptor
    pub fn parameter_desc(&mut self, desc: TensorDesc) -> Output {
        let name = self.next_name("Parameter");
        Output::new(self.graph.add_parameter(desc, name), 0)
    }

    /// Add an f32 constant
    pub fn constant(&mut self, dims: &[usize], values: Vec<f32>) -> TokenizeResult<Output> {
        let name = self.next_name("Constant");
        let desc = TensorDesc::f32(PartialShape::from_static(dims));
        Ok(Output::new(self.graph.add_constant(desc, values, name)?, 0))
    }

    /// Add an f32 constant of the given shape filled with `value`
    pub fn filled(&mut self, dims: &[usize], value: f32) -> TokenizeResult<Output> {
        let count = dims.iter().product();
        self.constant(dims, vec![value; count])
    }

    /// Add a rank-0 f32 constant
    pub fn scalar(&mut self, value: f32) -> TokenizeResult<Output> {
        self.constant(&[], vec![value])
    }

    /// Mark `source` as a graph output
    pub fn result(&mut self, source: Output) -> TokenizeResult<NodeId> {
        let name = self.next_name("Result");
        self.graph.add_result(source, name)
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Add any op, inferring its output
    pub fn op(&mut self, op: Op, inputs: &[Output]) -> TokenizeResult<Output> {
        let name = self.next_name(op.type_name());
        Ok(Output::new(self.graph.add_node(op, inputs.to_vec(), name)?, 0))
    }

    /// Plain MatMul
    pub fn matmul(&mut self, a: Output, b: Output) -> TokenizeResult<Output> {
        self.op(Op::matmul(), &[a, b])
    }

    /// MatMul with transpose flags
    pub fn matmul_t(
        &mut self,
        a: Output,
        b: Output,
        transpose_a: bool,
        transpose_b: bool,
    ) -> TokenizeResult<Output> {
        self.op(
            Op::MatMul {
                transpose_a,
                transpose_b,
            },
            &[a, b],
        )
    }

    /// Transpose by `order`
    pub fn transpose(&mut self, x: Output, order: &[usize]) -> TokenizeResult<Output> {
        self.op(
            Op::Transpose {
                order: order.to_vec(),
            },
            &[x],
        )
    }

    /// Reshape to `pattern` (no special zero)
    pub fn reshape(&mut self, x: Output, pattern: &[i64]) -> TokenizeResult<Output> {
        self.op(
            Op::Reshape {
                pattern: pattern.to_vec(),
                special_zero: false,
            },
            &[x],
        )
    }

    /// Elementwise addition
    pub fn add(&mut self, a: Output, b: Output) -> TokenizeResult<Output> {
        self.op(Op::Add, &[a, b])
    }

    /// Elementwise multiplication
    pub fn multiply(&mut self, a: Output, b: Output) -> TokenizeResult<Output> {
        self.op(Op::Multiply, &[a, b])
    }

    /// Elementwise maximum
    pub fn maximum(&mut self, a: Output, b: Output) -> TokenizeResult<Output> {
        self.op(Op::Maximum, &[a, b])
    }

    /// Conditional selection
    pub fn select(&mut self, cond: Output, then: Output, otherwise: Output) -> TokenizeResult<Output> {
        self.op(Op::Select, &[cond, then, otherwise])
    }

    /// Softmax along `axis`
    pub fn softmax(&mut self, x: Output, axis: i64) -> TokenizeResult<Output> {
        self.op(Op::Softmax { axis }, &[x])
    }

    /// Rectified linear unit
    pub fn relu(&mut self, x: Output) -> TokenizeResult<Output> {
        self.op(Op::Relu, &[x])
    }

    /// Element type conversion
    pub fn convert(&mut self, x: Output, to: ElementType) -> TokenizeResult<Output> {
        self.op(Op::Convert { to }, &[x])
    }

    /// Affine quantization
    pub fn quantize(
        &mut self,
        x: Output,
        scale: f32,
        zero_point: f32,
        to: ElementType,
    ) -> TokenizeResult<Output> {
        self.op(
            Op::Quantize {
                scale,
                zero_point,
                to,
            },
            &[x],
        )
    }

    /// Affine dequantization
    pub fn dequantize(&mut self, x: Output, scale: f32, zero_point: f32) -> TokenizeResult<Output> {
        self.op(Op::Dequantize { scale, zero_point }, &[x])
    }

    // ========================================================================
    // Finalization
    // ========================================================================

    /// Validate and return the graph
    pub fn build(self) -> TokenizeResult<Graph> {
        Ok(self.build_with_stats()?.0)
    }

    /// Validate and return the graph together with cleanup statistics
    pub fn build_with_stats(mut self) -> TokenizeResult<(Graph, CleanupStats)> {
        let stats = if self.cleanup {
            cleanup_graph(&mut self.graph)?
        } else {
            CleanupStats::default()
        };
        self.graph.validate()?;
        Ok((self.graph, stats))
    }
}
