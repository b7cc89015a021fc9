//! M dimension splitting
//!
//! When the batch of a fused attention body does not give the target
//! concurrency enough independent work, the M dimension (rows of the first
//! MatMul) is split into `batch_m x kernel_m`. The extra `batch_m` axis becomes
//! a batch axis for both MatMuls; `kernel_m` is what one kernel invocation
//! processes.
//!
//! The rewrite works on a copy of the body:
//!
//! ```text
//!   Q [.., M, K]  ->  Q [.., batch_m, kernel_m, K]
//!   K [.., K, N]  ->  K [.., 1, K, N]
//!   mask [.., M, N] -> mask [.., batch_m, kernel_m, N]
//!   out [.., M, D] -> out [.., batch_m, kernel_m, D]
//! ```
//!
//! Transposes on the way are given the extra axis, and the fused node's inputs
//! and outputs are reshaped outside so the surrounding graph is unchanged.

use log::{debug, info};
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;

use crate::config::TokenizationConfig;
use crate::error::{TokenizeError, TokenizeResult};
use crate::graph::{Graph, Input, Node, NodeId, Op, Output, SplitM};
use crate::tensor::{is_prime, normalize_axis, numel, Dim, PartialShape, TensorDesc};
use crate::traits::OpCapabilities;
use crate::transform::{insert_after, insert_before};

use super::common::{passthrough_port, pending_subgraphs, subgraph_mut, GraphTransformer, TransformResult};

/// Smallest kernel M the divisor search accepts
pub const MIN_KERNEL_M: usize = 32;

/// Smallest kernel M for the `M / C` ideal split
pub const MIN_IDEAL_KERNEL_M: usize = 64;

// ============================================================================
// Split heuristic
// ============================================================================

/// Exact splits: `C / B` blocks that fill the concurrency, or `C` blocks that
/// leave a large kernel
fn ideal_split(batch: usize, m: usize, concurrency: usize) -> Option<(usize, usize)> {
    let lower = concurrency / batch;
    if lower >= 2 && lower * batch == concurrency && m % lower == 0 {
        return Some((lower, m / lower));
    }
    if m % concurrency == 0 && m / concurrency >= MIN_IDEAL_KERNEL_M {
        return Some((concurrency, m / concurrency));
    }
    None
}

/// Smallest kernel M of at least [`MIN_KERNEL_M`] rows
fn kernel_split(batch: usize, m: usize, concurrency: usize) -> Option<(usize, usize)> {
    let mut best = None;
    let mut divisor = 2;
    while divisor * divisor <= m {
        if m % divisor == 0 {
            if divisor >= MIN_KERNEL_M {
                return Some((m / divisor, divisor));
            }
            if m / divisor >= MIN_KERNEL_M {
                best = Some((divisor, m / divisor));
            }
        }
        divisor += 1;
    }
    best.filter(|&(batch_m, _)| batch_m * batch >= concurrency)
}

/// Largest divisor below `2C / B` when the batch alone is too small
fn fallback_split(batch: usize, m: usize, concurrency: usize) -> Option<(usize, usize)> {
    if batch >= concurrency {
        return None;
    }
    let upper = (2 * concurrency).div_ceil(batch);
    let divisor = (2..upper).rev().find(|d| m % d == 0)?;
    (divisor * batch >= concurrency).then_some((divisor, m / divisor))
}

/// Choose how to split M for a body with `batch` independent matrices
///
/// Returns `None` when the batch already saturates the concurrency, M cannot
/// be divided, or no candidate keeps `batch_m` within the concurrency.
pub fn compute_split(batch: usize, m: usize, concurrency: usize) -> Option<SplitM> {
    if concurrency < 2 || m < 2 || batch == 0 || is_prime(m) || batch % concurrency == 0 {
        return None;
    }
    let fits = |&(batch_m, _): &(usize, usize)| batch_m <= concurrency;
    let (batch_m, kernel_m) = ideal_split(batch, m, concurrency)
        .filter(fits)
        .or_else(|| kernel_split(batch, m, concurrency).filter(fits))
        .or_else(|| fallback_split(batch, m, concurrency).filter(fits))?;
    Some(SplitM {
        batch_m,
        kernel_m,
        concurrency,
    })
}

// ============================================================================
// Body rewrite
// ============================================================================

/// Reason a body cannot take the split
#[derive(Error, Debug)]
enum SplitAbort {
    #[error("{0}")]
    Unsupported(String),
    #[error(transparent)]
    Graph(#[from] TokenizeError),
}

type SplitOutcome<T> = Result<T, SplitAbort>;

fn unsupported<T>(reason: impl Into<String>) -> SplitOutcome<T> {
    Err(SplitAbort::Unsupported(reason.into()))
}

/// Change a value must take on one axis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AxisEdit {
    /// Split the M axis (or a broadcast 1) into two
    Split(usize),
    /// Insert a unit axis
    Unit(usize),
}

/// `order` with input axis `axis` replaced by `axis, axis + 1`
fn split_order(order: &[usize], axis: usize) -> Vec<usize> {
    let mut result = Vec::with_capacity(order.len() + 1);
    for &p in order {
        if p == axis {
            result.extend([axis, axis + 1]);
        } else if p > axis {
            result.push(p + 1);
        } else {
            result.push(p);
        }
    }
    result
}

/// `order` with a unit axis appearing at output position `position`
///
/// The unit is read from input axis `order[position]`, inserted just before
/// the axis that used to be there.
fn unit_order(order: &[usize], position: usize) -> Vec<usize> {
    let unit = order[position];
    let shift = |p: usize| if p >= unit { p + 1 } else { p };
    order[..position]
        .iter()
        .map(|&p| shift(p))
        .chain([unit])
        .chain(order[position..].iter().map(|&p| shift(p)))
        .collect()
}

fn row_axis(rank: usize) -> SplitOutcome<usize> {
    match rank.checked_sub(2) {
        Some(axis) => Ok(axis),
        None => unsupported(format!("rank {} has no matrix axes", rank)),
    }
}

/// A body rewritten for a split, with the ports whose shapes changed
struct SplitBody {
    body: Graph,
    inputs: Vec<(usize, PartialShape)>,
    outputs: Vec<usize>,
}

/// Propagates the split through a body copy
struct BodySplitter {
    body: Graph,
    split: SplitM,
    /// New shapes of parameters and constants
    sources: FxHashMap<NodeId, PartialShape>,
    /// Non-source nodes whose op was rewritten while walking backward
    edited: FxHashSet<NodeId>,
    /// Inputs that already read the split layout
    adjusted: FxHashSet<Input>,
    visited: FxHashSet<NodeId>,
    results: Vec<NodeId>,
}

impl BodySplitter {
    fn new(body: Graph, split: SplitM) -> Self {
        Self {
            body,
            split,
            sources: FxHashMap::default(),
            edited: FxHashSet::default(),
            adjusted: FxHashSet::default(),
            visited: FxHashSet::default(),
            results: Vec::new(),
        }
    }

    fn rank_of(&self, value: Output) -> SplitOutcome<usize> {
        self.body
            .desc(value)
            .map(TensorDesc::rank)
            .ok_or(SplitAbort::Graph(TokenizeError::UnknownNode(value.node)))
    }

    fn input_of(node: &Node, port: usize) -> SplitOutcome<Output> {
        node.input(port).ok_or_else(|| {
            SplitAbort::Graph(TokenizeError::InvalidNode(format!(
                "{} has no input {}",
                node.name, port
            )))
        })
    }

    fn run(mut self) -> SplitOutcome<SplitBody> {
        let matmuls: Vec<NodeId> = self
            .body
            .topological_order()?
            .into_iter()
            .filter(|id| self.body.node(*id).map(Node::is_matmul).unwrap_or(false))
            .collect();
        let [matmul0, _] = matmuls[..] else {
            return unsupported(format!("body has {} MatMuls", matmuls.len()));
        };

        let first = self.body.get(matmul0)?.clone();
        if matches!(first.op, Op::MatMul { transpose_a: true, .. }) {
            return unsupported("first MatMul reads a transposed Q");
        }
        let (query, key) = (Self::input_of(&first, 0)?, Self::input_of(&first, 1)?);
        let query_axis = row_axis(self.rank_of(query)?)?;
        let key_axis = row_axis(self.rank_of(key)?)?;
        let out_axis = row_axis(self.rank_of(first.output(0))?)?;

        self.visited.insert(matmul0);
        self.require(query, Input::new(matmul0, 0), AxisEdit::Split(query_axis))?;
        self.require(key, Input::new(matmul0, 1), AxisEdit::Unit(key_axis))?;
        self.forward(first.output(0), out_axis)?;

        if self.results.is_empty() {
            return unsupported("no result depends on M");
        }
        self.check_closed()?;

        for (&id, shape) in &self.sources {
            let output = Output::new(id, 0);
            let desc = self
                .body
                .desc(output)
                .ok_or(TokenizeError::UnknownNode(id))?
                .with_shape(shape.clone());
            self.body.set_output_desc(output, desc)?;
        }
        self.body
            .infer_shapes()
            .map_err(|err| SplitAbort::Unsupported(err.to_string()))?;

        let inputs = self
            .body
            .parameters()
            .iter()
            .enumerate()
            .filter_map(|(port, id)| self.sources.get(id).map(|shape| (port, shape.clone())))
            .collect();
        let outputs = self
            .body
            .results()
            .iter()
            .enumerate()
            .filter(|(_, id)| self.results.contains(id))
            .map(|(port, _)| port)
            .collect();
        Ok(SplitBody {
            body: self.body,
            inputs,
            outputs,
        })
    }

    /// New shape of a parameter or constant under `edit`
    fn source_shape(&self, node: &Node, edit: AxisEdit) -> SplitOutcome<PartialShape> {
        let Some(desc) = node.output_desc() else {
            return unsupported(format!("{} has no output", node.name));
        };
        let shape = &desc.shape;
        match edit {
            AxisEdit::Split(axis) if axis < shape.rank() => match shape.dim(axis) {
                Dim::Static(d) if d == self.split.m() => {
                    Ok(shape.with_split(axis, self.split.batch_m, self.split.kernel_m))
                }
                Dim::Static(1) => Ok(shape.with_split(axis, 1, 1)),
                dim => unsupported(format!("{} has {} at the M axis", node.name, dim)),
            },
            AxisEdit::Unit(axis) if axis <= shape.rank() => {
                Ok(shape.with_inserted(axis, Dim::Static(1)))
            }
            _ => unsupported(format!("{:?} is out of range for {}", edit, shape)),
        }
    }

    /// Make `edge`, read by `reader`, arrive with `edit` applied
    fn require(&mut self, edge: Output, reader: Input, edit: AxisEdit) -> SplitOutcome<()> {
        self.adjusted.insert(reader);
        let node = self.body.get(edge.node)?.clone();

        match &node.op {
            Op::Parameter | Op::Constant(_) => {
                let shape = self.source_shape(&node, edit)?;
                match self.sources.get(&node.id) {
                    Some(existing) if *existing != shape => {
                        unsupported(format!("{} needs {} and {}", node.name, existing, shape))
                    }
                    _ => {
                        self.sources.insert(node.id, shape);
                        Ok(())
                    }
                }
            }
            Op::Transpose { order } => {
                if !self.edited.insert(node.id) {
                    return unsupported(format!("{} is reached twice", node.name));
                }
                let (new_order, input_edit) = match edit {
                    AxisEdit::Split(axis) if axis < order.len() => {
                        (split_order(order, order[axis]), AxisEdit::Split(order[axis]))
                    }
                    AxisEdit::Unit(axis) if axis < order.len() => {
                        (unit_order(order, axis), AxisEdit::Unit(order[axis]))
                    }
                    _ => return unsupported(format!("{:?} is out of range for {}", edit, node.name)),
                };
                if let Op::Transpose { order } = &mut self.body.get_mut(node.id)?.op {
                    *order = new_order;
                }
                self.require(Self::input_of(&node, 0)?, Input::new(node.id, 0), input_edit)
            }
            _ => {
                let Some(port) = passthrough_port(&self.body, &node) else {
                    return unsupported(format!("cannot split through {} ({})", node.name, node.op.type_name()));
                };
                let data = Self::input_of(&node, port)?;
                if self.rank_of(data)? != self.rank_of(edge)? {
                    return unsupported(format!("{} broadcasts its data operand", node.name));
                }
                if !self.edited.insert(node.id) {
                    return unsupported(format!("{} is reached twice", node.name));
                }
                self.require(data, Input::new(node.id, port), edit)
            }
        }
    }

    /// Follow the split M axis from `value` to the body results
    fn forward(&mut self, value: Output, axis: usize) -> SplitOutcome<()> {
        let value_rank = self.rank_of(value)?;
        let readers = self.body.consumers(value).to_vec();

        for reader in readers {
            self.adjusted.insert(reader);
            if !self.visited.insert(reader.node) {
                continue;
            }
            let node = self.body.get(reader.node)?.clone();

            match &node.op {
                Op::Result => self.results.push(node.id),
                Op::MatMul { transpose_a, .. } => {
                    if reader.port != 0 || *transpose_a || axis + 2 != value_rank {
                        return unsupported(format!("M does not reach {} as its rows", node.name));
                    }
                    let other = Self::input_of(&node, 1)?;
                    let other_axis = row_axis(self.rank_of(other)?)?;
                    self.require(other, Input::new(node.id, 1), AxisEdit::Unit(other_axis))?;
                    let out_axis = row_axis(self.rank_of(node.output(0))?)?;
                    self.forward(node.output(0), out_axis)?;
                }
                Op::Transpose { order } => {
                    let Some(out_axis) = order.iter().position(|&p| p == axis) else {
                        return unsupported(format!("{} does not permute axis {}", node.name, axis));
                    };
                    let new_order = split_order(order, axis);
                    if let Op::Transpose { order } = &mut self.body.get_mut(node.id)?.op {
                        *order = new_order;
                    }
                    self.forward(node.output(0), out_axis)?;
                }
                Op::Softmax { axis: reduced } => {
                    let reduced = normalize_axis(*reduced, value_rank)
                        .map_err(|err| SplitAbort::Unsupported(err.to_string()))?;
                    if reduced == axis {
                        return unsupported(format!("{} reduces over M", node.name));
                    }
                    let shifted = if reduced > axis { reduced + 1 } else { reduced };
                    if let Op::Softmax { axis } = &mut self.body.get_mut(node.id)?.op {
                        *axis = shifted as i64;
                    }
                    self.forward(node.output(0), axis)?;
                }
                op if op.is_elementwise() => {
                    let out_rank = self.rank_of(node.output(0))?;
                    let out_axis = axis + out_rank.saturating_sub(value_rank);
                    for (port, &side) in node.inputs.iter().enumerate() {
                        if port == reader.port || side == value {
                            continue;
                        }
                        let offset = out_rank.saturating_sub(self.rank_of(side)?);
                        let scalar_like = self
                            .body
                            .desc(side)
                            .map(|d| d.shape.is_scalar_like())
                            .unwrap_or(false);
                        if out_axis < offset || scalar_like {
                            continue;
                        }
                        self.require(side, Input::new(node.id, port), AxisEdit::Split(out_axis - offset))?;
                    }
                    self.forward(node.output(0), out_axis)?;
                }
                op => {
                    return unsupported(format!("cannot split through {} ({})", node.name, op.type_name()));
                }
            }
        }
        Ok(())
    }

    /// Every reader of a rewritten value must have been adjusted as well
    fn check_closed(&self) -> SplitOutcome<()> {
        for &id in self.edited.iter().chain(self.sources.keys()) {
            if let Some(reader) = self
                .body
                .all_consumers(id)
                .into_iter()
                .find(|input| !self.adjusted.contains(input))
            {
                return unsupported(format!("{} is also read by {}", id, reader.node));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Pass
// ============================================================================

/// Split the M dimension of fused bodies across the target concurrency
#[derive(Debug, Default)]
pub struct SplitDimensionM;

impl SplitDimensionM {
    /// Create the pass
    pub fn new() -> Self {
        Self
    }

    /// Batch and M extents of the first body MatMul, if static
    fn batch_and_m(graph: &Graph, id: NodeId) -> TokenizeResult<Option<(usize, usize)>> {
        let node = graph.get(id)?;
        let Some(subgraph) = node.op.as_subgraph() else {
            return Ok(None);
        };
        let ports_static = node.outputs.iter().all(|d| !d.is_dynamic())
            && node
                .inputs
                .iter()
                .all(|src| graph.desc(*src).map(|d| !d.is_dynamic()).unwrap_or(false));
        if !ports_static {
            debug!("{} has dynamic ports, M stays whole", node.name);
            return Ok(None);
        }

        let Some(&matmul0) = subgraph.matmuls()?.first() else {
            return Ok(None);
        };
        let dims = subgraph
            .body
            .get(matmul0)?
            .output_desc()
            .and_then(|d| d.shape.to_static());
        Ok(dims.filter(|d| d.len() >= 2).map(|dims| {
            let (batch, matrix) = dims.split_at(dims.len() - 2);
            (numel(batch), matrix[0])
        }))
    }

    /// Split fused node `id` if its shapes allow it
    ///
    /// Returns the applied split. A body the rewrite cannot handle is left
    /// untouched.
    pub fn apply_to(
        graph: &mut Graph,
        id: NodeId,
        config: &TokenizationConfig,
    ) -> TokenizeResult<Option<SplitM>> {
        if !config.split_m_dimension || config.concurrency <= 1 {
            return Ok(None);
        }
        let Some((batch, m)) = Self::batch_and_m(graph, id)? else {
            return Ok(None);
        };
        let name = graph.get(id)?.name.clone();
        let Some(split) = compute_split(batch, m, config.concurrency) else {
            debug!(
                "No M split for {} (batch {}, M {}, concurrency {})",
                name, batch, m, config.concurrency
            );
            return Ok(None);
        };

        let body = subgraph_mut(graph, id)?.body.clone();
        let rewrite = match BodySplitter::new(body, split).run() {
            Ok(rewrite) => rewrite,
            Err(SplitAbort::Unsupported(reason)) => {
                debug!("{} keeps M whole: {}", name, reason);
                return Ok(None);
            }
            Err(SplitAbort::Graph(err)) => return Err(err),
        };

        let subgraph = subgraph_mut(graph, id)?;
        subgraph.body = rewrite.body;
        subgraph.split = Some(split);
        let output_descs = subgraph.output_descs()?;

        for (port, shape) in &rewrite.inputs {
            insert_before(
                graph,
                Input::new(id, *port),
                Op::Reshape {
                    pattern: shape.to_i64(),
                    special_zero: false,
                },
                format!("{}/in{}/split_m", name, port),
            )?;
        }
        for port in rewrite.outputs {
            let output = Output::new(id, port);
            let original = graph
                .desc(output)
                .map(|d| d.shape.to_i64())
                .ok_or(TokenizeError::UnknownNode(id))?;
            graph.set_output_desc(output, output_descs[port].clone())?;
            insert_after(
                graph,
                output,
                Op::Reshape {
                    pattern: original,
                    special_zero: false,
                },
                format!("{}/out{}/split_m", name, port),
            )?;
        }

        info!("Split {} (batch {}): {}", name, batch, split);
        Ok(Some(split))
    }
}

impl GraphTransformer for SplitDimensionM {
    fn name(&self) -> &'static str {
        "SplitDimensionM"
    }

    fn transform(&self, graph: &mut Graph, config: &TokenizationConfig) -> TokenizeResult<TransformResult> {
        let mut result = TransformResult::new();
        for id in pending_subgraphs(graph) {
            if Self::apply_to(graph, id, config)?.is_some() {
                result.patterns_matched += 1;
                result.record(&graph.get(id)?.name);
            }
        }
        Ok(result)
    }

    fn is_applicable(&self, _graph: &Graph, config: &TokenizationConfig) -> bool {
        config.split_m_dimension && config.concurrency > 1
    }
}
