//! Reference evaluation
//!
//! A straightforward interpreter over [`ndarray`] that runs any [`Graph`],
//! fused bodies included, on f32 data. Passes are checked against it: a
//! rewrite is correct when the graph computes the same results before and
//! after.
//!
//! All element types are carried as f32. Integral conversions truncate and
//! saturate, booleans are `0.0` / `1.0`.
//!
//! # Example
//!
//! ```ignore
//! use mha_tokenizer::eval::{evaluate, sample_tensor};
//!
//! let inputs = vec![sample_tensor(&[12, 128, 64], 1)];
//! let outputs = evaluate(&graph, &inputs)?;
//! ```

use ndarray::{Array, Array3, ArrayD, ArrayViewD, Axis, IxDyn, Zip};
use rustc_hash::FxHashMap;

use crate::error::{TokenizeError, TokenizeResult};
use crate::graph::{infer_reshape_shape, Graph, Node, Op, Output};
use crate::tensor::{broadcast_shape, normalize_axis, ElementType, PartialShape};

/// Dense f32 tensor
pub type Tensor = ArrayD<f32>;

fn fail<T>(msg: impl Into<String>) -> TokenizeResult<T> {
    Err(TokenizeError::EvaluationFailed(msg.into()))
}

/// Evaluate `graph`, feeding `inputs` to its parameters in order
///
/// Returns one tensor per graph result, in result order.
pub fn evaluate(graph: &Graph, inputs: &[Tensor]) -> TokenizeResult<Vec<Tensor>> {
    if inputs.len() != graph.parameters().len() {
        return fail(format!(
            "graph has {} parameters, got {} inputs",
            graph.parameters().len(),
            inputs.len()
        ));
    }

    let mut values: FxHashMap<Output, Tensor> = FxHashMap::default();
    for (&param, input) in graph.parameters().iter().zip(inputs) {
        let node = graph.get(param)?;
        if let Some(desc) = node.output_desc() {
            check_shape(&node.name, input, &desc.shape)?;
        }
        values.insert(Output::new(param, 0), input.clone());
    }

    for id in graph.topological_order()? {
        let node = graph.get(id)?;
        if node.is_parameter() {
            continue;
        }
        let args = node
            .inputs
            .iter()
            .map(|src| {
                values
                    .get(src)
                    .ok_or(TokenizeError::UnknownNode(src.node))
            })
            .collect::<TokenizeResult<Vec<_>>>()?;
        let outputs = eval_node(node, &args)?;
        for (port, value) in outputs.into_iter().enumerate() {
            values.insert(Output::new(id, port), value);
        }
    }

    graph
        .results()
        .iter()
        .map(|id| {
            values
                .remove(&Output::new(*id, 0))
                .ok_or(TokenizeError::UnknownNode(*id))
        })
        .collect()
}

fn check_shape(name: &str, value: &Tensor, expected: &PartialShape) -> TokenizeResult<()> {
    let matches = value.ndim() == expected.rank()
        && value
            .shape()
            .iter()
            .zip(expected.dims())
            .all(|(&actual, dim)| dim.get().map(|d| d == actual).unwrap_or(true));
    if matches {
        Ok(())
    } else {
        fail(format!("{} expects {}, got {:?}", name, expected, value.shape()))
    }
}

fn eval_node(node: &Node, args: &[&Tensor]) -> TokenizeResult<Vec<Tensor>> {
    let value = match &node.op {
        Op::Parameter => return fail(format!("{} has no value", node.name)),
        Op::Constant(data) => {
            let Some(dims) = node.output_desc().and_then(|d| d.shape.to_static()) else {
                return fail(format!("{} has no static shape", node.name));
            };
            Array::from_shape_vec(IxDyn(&dims), data.values.clone())
                .map_err(|e| TokenizeError::EvaluationFailed(e.to_string()))?
        }
        Op::Result => args[0].clone(),
        Op::MatMul {
            transpose_a,
            transpose_b,
        } => matmul(args[0], args[1], *transpose_a, *transpose_b)?,
        Op::Transpose { order } => {
            if order.len() != args[0].ndim() {
                return fail(format!("{} permutes rank {}", node.name, args[0].ndim()));
            }
            args[0]
                .view()
                .permuted_axes(IxDyn(order))
                .as_standard_layout()
                .into_owned()
        }
        Op::Reshape {
            pattern,
            special_zero,
        } => {
            let input = PartialShape::from_static(args[0].shape());
            let Some(dims) = infer_reshape_shape(&input, pattern, *special_zero)?.to_static() else {
                return fail(format!("{} has an unresolved target", node.name));
            };
            reshape(args[0], &dims)?
        }
        Op::Add => zip_with(args[0], args[1], |a, b| a + b)?,
        Op::Subtract => zip_with(args[0], args[1], |a, b| a - b)?,
        Op::Multiply => zip_with(args[0], args[1], |a, b| a * b)?,
        Op::Divide => zip_with(args[0], args[1], |a, b| a / b)?,
        Op::Maximum => zip_with(args[0], args[1], f32::max)?,
        Op::Minimum => zip_with(args[0], args[1], f32::min)?,
        Op::Relu => args[0].mapv(|x| x.max(0.0)),
        Op::Exp => args[0].mapv(f32::exp),
        Op::Negative => args[0].mapv(|x| -x),
        Op::Softmax { axis } => softmax(args[0], *axis)?,
        Op::Select => select(args[0], args[1], args[2])?,
        Op::Convert { to } => args[0].mapv(|x| convert(x, *to)),
        Op::Quantize {
            scale,
            zero_point,
            to,
        } => args[0].mapv(|x| saturate((x / scale + zero_point).round(), *to)),
        Op::Dequantize { scale, zero_point } => args[0].mapv(|x| (x - zero_point) * scale),
        Op::Subgraph(subgraph) => {
            let inputs: Vec<Tensor> = args.iter().map(|a| (*a).clone()).collect();
            return evaluate(&subgraph.body, &inputs);
        }
    };
    Ok(vec![value])
}

fn saturate(value: f32, to: ElementType) -> f32 {
    match to.integral_range() {
        Some((lo, hi)) => value.clamp(lo, hi),
        None => value,
    }
}

fn convert(value: f32, to: ElementType) -> f32 {
    match to {
        ElementType::Boolean => {
            if value != 0.0 {
                1.0
            } else {
                0.0
            }
        }
        t if t.is_integral() => saturate(value.trunc(), t),
        _ => value,
    }
}

fn reshape(value: &Tensor, dims: &[usize]) -> TokenizeResult<Tensor> {
    value
        .as_standard_layout()
        .into_owned()
        .into_shape(IxDyn(dims))
        .map_err(|e| TokenizeError::EvaluationFailed(e.to_string()))
}

fn broadcast_to<'a>(value: &'a Tensor, dims: &[usize]) -> TokenizeResult<ArrayViewD<'a, f32>> {
    value.broadcast(IxDyn(dims)).ok_or_else(|| {
        TokenizeError::EvaluationFailed(format!("cannot broadcast {:?} to {:?}", value.shape(), dims))
    })
}

/// Common broadcast shape of several tensors
fn broadcast_dims(values: &[&Tensor]) -> TokenizeResult<Vec<usize>> {
    let mut shape = PartialShape::scalar();
    for value in values {
        shape = broadcast_shape(&shape, &PartialShape::from_static(value.shape()))?;
    }
    match shape.to_static() {
        Some(dims) => Ok(dims),
        None => fail("broadcast of concrete tensors is not static"),
    }
}

fn zip_with(a: &Tensor, b: &Tensor, f: impl Fn(f32, f32) -> f32) -> TokenizeResult<Tensor> {
    let dims = broadcast_dims(&[a, b])?;
    let (a, b) = (broadcast_to(a, &dims)?, broadcast_to(b, &dims)?);
    Ok(Zip::from(&a).and(&b).map_collect(|&x, &y| f(x, y)))
}

fn select(cond: &Tensor, then: &Tensor, otherwise: &Tensor) -> TokenizeResult<Tensor> {
    let dims = broadcast_dims(&[cond, then, otherwise])?;
    let cond = broadcast_to(cond, &dims)?;
    let then = broadcast_to(then, &dims)?;
    let otherwise = broadcast_to(otherwise, &dims)?;
    Ok(Zip::from(&cond)
        .and(&then)
        .and(&otherwise)
        .map_collect(|&c, &t, &e| if c != 0.0 { t } else { e }))
}

fn softmax(value: &Tensor, axis: i64) -> TokenizeResult<Tensor> {
    let axis = normalize_axis(axis, value.ndim())?;
    let mut out = value.clone();
    for mut lane in out.lanes_mut(Axis(axis)) {
        let max = lane.fold(f32::NEG_INFINITY, |m, &x| m.max(x));
        lane.mapv_inplace(|x| (x - max).exp());
        let sum = lane.sum();
        lane.mapv_inplace(|x| x / sum);
    }
    Ok(out)
}

/// Swap the last two axes
fn transposed(value: &Tensor) -> Tensor {
    let mut view = value.view();
    let rank = view.ndim();
    view.swap_axes(rank - 2, rank - 1);
    view.as_standard_layout().into_owned()
}

fn matmul(a: &Tensor, b: &Tensor, transpose_a: bool, transpose_b: bool) -> TokenizeResult<Tensor> {
    if a.ndim() < 2 || b.ndim() < 2 {
        return fail(format!("MatMul of {:?} and {:?}", a.shape(), b.shape()));
    }
    let a = if transpose_a { transposed(a) } else { a.clone() };
    let b = if transpose_b { transposed(b) } else { b.clone() };
    let (ra, rb) = (a.ndim(), b.ndim());
    let (m, k) = (a.shape()[ra - 2], a.shape()[ra - 1]);
    let (kb, n) = (b.shape()[rb - 2], b.shape()[rb - 1]);
    if k != kb {
        return fail(format!("MatMul of {:?} and {:?}", a.shape(), b.shape()));
    }

    let batch = broadcast_shape(
        &PartialShape::from_static(&a.shape()[..ra - 2]),
        &PartialShape::from_static(&b.shape()[..rb - 2]),
    )?
    .to_static()
    .unwrap_or_default();
    let count: usize = batch.iter().product();
    let with_matrix = |rows: usize, cols: usize| -> Vec<usize> {
        batch.iter().copied().chain([rows, cols]).collect()
    };

    let lhs = broadcast_to(&a, &with_matrix(m, k))?
        .to_owned()
        .into_shape((count, m, k))
        .map_err(|e| TokenizeError::EvaluationFailed(e.to_string()))?;
    let rhs = broadcast_to(&b, &with_matrix(k, n))?
        .to_owned()
        .into_shape((count, k, n))
        .map_err(|e| TokenizeError::EvaluationFailed(e.to_string()))?;

    let mut out = Array3::<f32>::zeros((count, m, n));
    for i in 0..count {
        out.index_axis_mut(Axis(0), i)
            .assign(&lhs.index_axis(Axis(0), i).dot(&rhs.index_axis(Axis(0), i)));
    }
    reshape(&out.into_dyn(), &with_matrix(m, n))
}

/// Deterministic test data in `[-1, 1)` for the given shape
pub fn sample_tensor(dims: &[usize], seed: u64) -> Tensor {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    let count: usize = dims.iter().product();
    let values = (0..count)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            ((state >> 40) as f32 / (1u64 << 24) as f32) * 2.0 - 1.0
        })
        .collect();
    Array::from_shape_vec(IxDyn(dims), values).unwrap_or_else(|_| ArrayD::zeros(IxDyn(dims)))
}

/// Deterministic inputs for every parameter of `graph`
///
/// Boolean parameters get `0.0` / `1.0` values.
pub fn sample_inputs(graph: &Graph, seed: u64) -> TokenizeResult<Vec<Tensor>> {
    graph
        .parameters()
        .iter()
        .enumerate()
        .map(|(i, id)| {
            let Some(desc) = graph.get(*id)?.output_desc() else {
                return fail(format!("parameter {} has no descriptor", id));
            };
            let Some(dims) = desc.shape.to_static() else {
                return fail(format!("parameter {} has dynamic shape {}", id, desc.shape));
            };
            let values = sample_tensor(&dims, seed + i as u64);
            Ok(match desc.element_type {
                ElementType::Boolean => values.mapv(|x| if x > 0.0 { 1.0 } else { 0.0 }),
                _ => values,
            })
        })
        .collect()
}

/// Check that two tensor lists agree in shape and, elementwise, within `tolerance`
pub fn all_close(a: &[Tensor], b: &[Tensor], tolerance: f32) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|(x, y)| {
            x.shape() == y.shape()
                && x.iter()
                    .zip(y.iter())
                    .all(|(p, q)| (p - q).abs() <= tolerance * (1.0 + q.abs()))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::GraphBuilder;
    use ndarray::arr2;

    #[test]
    fn test_matmul_with_transposed_operand() {
        let mut b = GraphBuilder::new();
        let x = b.input(&[2, 3]);
        let y = b.input(&[4, 3]);
        let mm = b.matmul_t(x, y, false, true).unwrap();
        b.result(mm).unwrap();
        let graph = b.build().unwrap();

        let x = arr2(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]).into_dyn();
        let y = arr2(&[[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0], [1.0, 1.0, 1.0]]).into_dyn();
        let out = evaluate(&graph, &[x, y]).unwrap();

        let expected: Tensor = arr2(&[[1.0, 2.0, 3.0, 6.0], [4.0, 5.0, 6.0, 15.0]]).into_dyn();
        assert_eq!(out[0], expected);
    }

    #[test]
    fn test_batched_matmul_broadcasts() {
        let a = sample_tensor(&[2, 3, 4, 5], 1);
        let b = sample_tensor(&[3, 5, 6], 2);
        let out = matmul(&a, &b, false, false).unwrap();
        assert_eq!(out.shape(), &[2, 3, 4, 6]);

        let a00 = a.index_axis(Axis(0), 1).index_axis(Axis(0), 2).to_owned();
        let b0 = b.index_axis(Axis(0), 2).to_owned();
        let a2 = a00.into_dimensionality::<ndarray::Ix2>().unwrap();
        let b2 = b0.into_dimensionality::<ndarray::Ix2>().unwrap();
        let direct = a2.dot(&b2).into_dyn();
        let picked = out.index_axis(Axis(0), 1).index_axis(Axis(0), 2).to_owned();
        assert!(all_close(&[picked], &[direct], 1e-6));
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let x = sample_tensor(&[3, 7], 5);
        let y = softmax(&x, -1).unwrap();
        for row in y.lanes(Axis(1)) {
            assert!((row.sum() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_broadcasting_select() {
        let cond = arr2(&[[1.0], [0.0]]).into_dyn();
        let then = arr2(&[[1.0, 2.0, 3.0]]).into_dyn();
        let otherwise = ArrayD::from_elem(IxDyn(&[]), -1.0);
        let out = select(&cond, &then, &otherwise).unwrap();
        let expected: Tensor = arr2(&[[1.0, 2.0, 3.0], [-1.0, -1.0, -1.0]]).into_dyn();
        assert_eq!(out, expected);
    }

    #[test]
    fn test_quantization_saturates() {
        assert_eq!(convert(300.7, ElementType::U8), 255.0);
        assert_eq!(convert(-3.7, ElementType::I8), -3.0);
        assert_eq!(convert(0.25, ElementType::Boolean), 1.0);
        assert_eq!(saturate(-200.0, ElementType::I8), -128.0);
    }

    #[test]
    fn test_evaluate_transpose_reshape() {
        let mut b = GraphBuilder::new();
        let x = b.input(&[2, 3]);
        let t = b.transpose(x, &[1, 0]).unwrap();
        let r = b.reshape(t, &[-1]).unwrap();
        b.result(r).unwrap();
        let graph = b.build().unwrap();

        let x = arr2(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]).into_dyn();
        let out = evaluate(&graph, &[x]).unwrap();
        let expected: [f32; 6] = [1.0, 4.0, 2.0, 5.0, 3.0, 6.0];
        assert_eq!(out[0].as_slice().unwrap(), &expected);
    }

    #[test]
    fn test_wrong_input_count() {
        let mut b = GraphBuilder::new();
        let x = b.input(&[2]);
        b.result(x).unwrap();
        let graph = b.build().unwrap();

        assert!(matches!(
            evaluate(&graph, &[]),
            Err(TokenizeError::EvaluationFailed(_))
        ));
        let wrong = sample_tensor(&[3], 0);
        assert!(evaluate(&graph, &[wrong]).is_err());
    }
}
