//! Reshape extraction around the attention chain
//!
//! Rewrites
//!
//! ```text
//!   MatMul0 -> Reshape(X→Y) -> Add(side) [-> Softmax] ... -> Reshape(Y→X) -> ...
//! ```
//!
//! into
//!
//! ```text
//!   MatMul0 -> Add(Reshape(side)) [-> Softmax] ... -> ...
//! ```
//!
//! so the chain operates on MatMul0's own shape and the matcher sees a
//! contiguous region. Dimensions of X and Y are grouped into blocks with equal
//! products; every side input must either be broadcast over a whole block or
//! cover it completely, in which case it is reshaped to X's block dims.

use std::ops::Range;

use log::{debug, info};

use crate::config::TokenizationConfig;
use crate::error::TokenizeResult;
use crate::graph::{Graph, Input, Node, NodeId, Op, Output};
use crate::tensor::normalize_axis;
use crate::traits::OpCapabilities;
use crate::transform::{eliminate_node, insert_before};

use super::common::{GraphTransformer, TransformResult};

/// Matching blocks of two static shapes with the same element count
///
/// Each entry pairs an axis range of `x` with an axis range of `y` whose
/// products are equal. Returns `None` if the shapes are incompatible.
pub fn group_dims(x: &[usize], y: &[usize]) -> Option<Vec<(Range<usize>, Range<usize>)>> {
    if x.iter().chain(y).any(|&d| d == 0) || x.iter().product::<usize>() != y.iter().product::<usize>() {
        return None;
    }

    let mut groups = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < x.len() || j < y.len() {
        let (start_x, start_y) = (i, j);
        let mut px = x.get(i).copied().unwrap_or(1);
        let mut py = y.get(j).copied().unwrap_or(1);
        i = (i + 1).min(x.len());
        j = (j + 1).min(y.len());
        while px != py {
            if px < py {
                px *= *x.get(i)?;
                i += 1;
            } else {
                py *= *y.get(j)?;
                j += 1;
            }
        }
        groups.push((start_x..i, start_y..j));
    }
    Some(groups)
}

/// Target dims for a side input of shape `side` (aligned to Y's rank)
fn side_target(
    side: &[usize],
    x: &[usize],
    y: &[usize],
    groups: &[(Range<usize>, Range<usize>)],
) -> Option<Vec<i64>> {
    let mut target = Vec::with_capacity(x.len());
    for (xr, yr) in groups {
        let block = &side[yr.clone()];
        if block.iter().all(|&d| d == 1) {
            target.extend(xr.clone().map(|_| 1i64));
        } else if block == &y[yr.clone()] {
            target.extend(x[xr.clone()].iter().map(|&d| d as i64));
        } else {
            return None;
        }
    }
    Some(target)
}

/// Planned rewrite of one reshape pair
#[derive(Debug)]
struct Extraction {
    /// Reshape X→Y
    first: NodeId,
    /// Reshape Y→X
    second: NodeId,
    /// Side inputs to reshape, with their new dims
    sides: Vec<(Input, Vec<i64>)>,
    /// Softmax nodes whose axis must be re-expressed in X's rank
    softmaxes: Vec<NodeId>,
}

/// Move Reshapes out of the chain between the attention MatMuls
#[derive(Debug, Default)]
pub struct ExtractReshapesFromMha;

impl ExtractReshapesFromMha {
    /// Create the pass
    pub fn new() -> Self {
        Self
    }

    fn static_dims(graph: &Graph, output: Output) -> Option<Vec<usize>> {
        graph.desc(output).and_then(|d| d.shape.to_static())
    }

    /// Plan the extraction of the Reshape pair starting at `first`
    fn plan(graph: &Graph, first: &Node) -> Option<Extraction> {
        let source = first.input(0)?;
        if !graph.producer(source).map(|p| p.is_matmul()).unwrap_or(false)
            || !graph.is_single_use(source)
        {
            return None;
        }
        let x = Self::static_dims(graph, source)?;
        let y = Self::static_dims(graph, first.output(0))?;
        if x == y {
            return None;
        }
        let groups = group_dims(&x, &y)?;

        let mut sides = Vec::new();
        let mut softmaxes = Vec::new();
        let mut current = first;
        let mut chain_len = 0;

        loop {
            let [input] = graph.consumers(current.output(0)) else {
                return None;
            };
            let next = graph.node(input.node)?;
            match &next.op {
                Op::Reshape { .. } => {
                    if chain_len == 0 || Self::static_dims(graph, next.output(0))? != x {
                        return None;
                    }
                    return Some(Extraction {
                        first: first.id,
                        second: next.id,
                        sides,
                        softmaxes,
                    });
                }
                Op::Softmax { axis } => {
                    let axis = normalize_axis(*axis, y.len()).ok()?;
                    let (xr, yr) = groups.last()?;
                    if axis + 1 != y.len() || xr.len() != 1 || yr.len() != 1 {
                        return None;
                    }
                    softmaxes.push(next.id);
                }
                op if op.is_layout_invariant() => {
                    if Self::static_dims(graph, next.output(0))? != y {
                        return None;
                    }
                    for (port, side) in next.inputs.iter().enumerate() {
                        if *side == current.output(0) {
                            continue;
                        }
                        let desc = graph.desc(*side)?;
                        if desc.shape.is_scalar_like() && desc.rank() <= x.len() {
                            continue;
                        }
                        if desc.rank() > y.len() {
                            return None;
                        }
                        let aligned = desc.shape.aligned_to(y.len()).to_static()?;
                        let target = side_target(&aligned, &x, &y, &groups)?;
                        sides.push((Input::new(next.id, port), target));
                    }
                }
                _ => return None,
            }
            chain_len += 1;
            current = next;
        }
    }

    fn apply(graph: &mut Graph, plan: Extraction) -> TokenizeResult<()> {
        for (input, target) in &plan.sides {
            let name = format!("{}/reshape{}", graph.get(input.node)?.name, input.port);
            insert_before(
                graph,
                *input,
                Op::Reshape {
                    pattern: target.clone(),
                    special_zero: false,
                },
                name,
            )?;
        }
        for id in &plan.softmaxes {
            if let Op::Softmax { axis } = &mut graph.get_mut(*id)?.op {
                *axis = -1;
            }
        }
        eliminate_node(graph, plan.first, 0)?;
        eliminate_node(graph, plan.second, 0)?;
        graph.infer_shapes()
    }
}

impl GraphTransformer for ExtractReshapesFromMha {
    fn name(&self) -> &'static str {
        "ExtractReshapesFromMha"
    }

    fn transform(&self, graph: &mut Graph, _config: &TokenizationConfig) -> TokenizeResult<TransformResult> {
        let mut result = TransformResult::new();

        let reshapes: Vec<NodeId> = graph
            .nodes()
            .filter(|n| matches!(n.op, Op::Reshape { .. }))
            .map(|n| n.id)
            .collect();

        for id in reshapes {
            let Some(first) = graph.node(id) else {
                continue;
            };
            let Some(plan) = Self::plan(graph, first) else {
                continue;
            };
            result.patterns_matched += 1;
            let name = first.name.clone();
            debug!(
                "Extracting reshape pair {} .. {} ({} side inputs)",
                name,
                plan.second,
                plan.sides.len()
            );
            Self::apply(graph, plan)?;
            info!("Extracted reshapes around {}", name);
            result.record(&name);
        }

        Ok(result)
    }

    fn is_applicable(&self, graph: &Graph, config: &TokenizationConfig) -> bool {
        config.enable_reshape_extraction && graph.count_ops("Reshape") >= 2
    }
}
