//! Shape and type inference
//!
//! Output descriptors for every op kind, computed from input descriptors.
//! Dynamic dimensions propagate; static mismatches are reported as
//! [`TokenizeError::ShapeInferenceFailed`]. A wrong input count is a
//! malformed node and reported as [`TokenizeError::InvalidNode`].

use log::trace;

use crate::error::{TokenizeError, TokenizeResult};
use crate::tensor::{broadcast_shape, normalize_axis, Dim, ElementType, PartialShape, TensorDesc};

use super::context::Graph;
use super::node::{Op, Output};

fn fail<T>(msg: String) -> TokenizeResult<T> {
    Err(TokenizeError::ShapeInferenceFailed(msg))
}

fn single<'a>(op: &Op, inputs: &'a [TensorDesc]) -> TokenizeResult<&'a TensorDesc> {
    inputs.first().ok_or_else(|| {
        TokenizeError::ShapeInferenceFailed(format!("{} has no input", op.type_name()))
    })
}

/// Output shape of a (possibly transposed) batched MatMul
pub fn infer_matmul_shape(
    a: &PartialShape,
    b: &PartialShape,
    transpose_a: bool,
    transpose_b: bool,
) -> TokenizeResult<PartialShape> {
    if a.rank() < 2 || b.rank() < 2 {
        return fail(format!("MatMul operands {} and {} must be at least 2-D", a, b));
    }
    let (ra, rb) = (a.rank(), b.rank());
    let (m, ka) = if transpose_a {
        (a.dim(ra - 1), a.dim(ra - 2))
    } else {
        (a.dim(ra - 2), a.dim(ra - 1))
    };
    let (kb, n) = if transpose_b {
        (b.dim(rb - 1), b.dim(rb - 2))
    } else {
        (b.dim(rb - 2), b.dim(rb - 1))
    };
    if ka.merge(kb).is_none() {
        return fail(format!(
            "MatMul reduction dims differ: {} (transpose_a={}) vs {} (transpose_b={})",
            a, transpose_a, b, transpose_b
        ));
    }

    let batch_a = PartialShape::new(a.dims()[..ra - 2].iter().copied());
    let batch_b = PartialShape::new(b.dims()[..rb - 2].iter().copied());
    let batch = broadcast_shape(&batch_a, &batch_b)?;
    Ok(PartialShape::new(
        batch.dims().iter().copied().chain([m, n]),
    ))
}

/// Output shape of a Reshape with `-1` inference and special zero
pub fn infer_reshape_shape(
    input: &PartialShape,
    pattern: &[i64],
    special_zero: bool,
) -> TokenizeResult<PartialShape> {
    let mut dims = Vec::with_capacity(pattern.len());
    let mut inferred_axis = None;

    for (i, &p) in pattern.iter().enumerate() {
        match p {
            -1 => {
                if inferred_axis.replace(i).is_some() {
                    return fail(format!("Reshape pattern {:?} has more than one -1", pattern));
                }
                dims.push(Dim::Dynamic);
            }
            0 if special_zero => {
                if i >= input.rank() {
                    return fail(format!(
                        "Reshape pattern {:?} copies axis {} of rank {} input",
                        pattern,
                        i,
                        input.rank()
                    ));
                }
                dims.push(input.dim(i));
            }
            p if p < 0 => {
                return fail(format!("Reshape pattern {:?} has invalid value {}", pattern, p));
            }
            p => dims.push(Dim::Static(p as usize)),
        }
    }

    let known: Option<usize> = dims
        .iter()
        .enumerate()
        .filter(|(i, _)| Some(*i) != inferred_axis)
        .map(|(_, d)| d.get())
        .product();

    match (inferred_axis, input.numel(), known) {
        (Some(axis), Some(total), Some(known)) => {
            if known == 0 || total % known != 0 {
                return fail(format!(
                    "Cannot reshape {} into {:?}",
                    input, pattern
                ));
            }
            dims[axis] = Dim::Static(total / known);
        }
        (None, Some(total), Some(known)) if total != known => {
            return fail(format!(
                "Reshape changes element count: {} into {:?}",
                input, pattern
            ));
        }
        _ => {}
    }

    Ok(PartialShape::new(dims))
}

/// Infer output descriptors of `op` from its input descriptors
///
/// Parameters and constants carry their own descriptors and cannot be inferred.
/// Subgraphs are inferred through [`Graph::infer_shapes`].
pub fn infer_op(op: &Op, inputs: &[TensorDesc]) -> TokenizeResult<Vec<TensorDesc>> {
    if inputs.len() != op.arity() {
        return Err(TokenizeError::InvalidNode(format!(
            "{} expects {} inputs, got {}",
            op.type_name(),
            op.arity(),
            inputs.len()
        )));
    }

    let desc = match op {
        Op::Parameter | Op::Constant(_) => {
            return fail(format!("{} carries its own descriptor", op.type_name()));
        }
        Op::Subgraph(subgraph) => return subgraph.infer_outputs(inputs),
        Op::Result => single(op, inputs)?.clone(),
        Op::MatMul {
            transpose_a,
            transpose_b,
        } => {
            let (a, b) = (&inputs[0], &inputs[1]);
            let shape = infer_matmul_shape(&a.shape, &b.shape, *transpose_a, *transpose_b)?;
            let element_type = if a.element_type.is_float() {
                a.element_type
            } else {
                ElementType::I32
            };
            TensorDesc::new(element_type, shape)
        }
        Op::Transpose { order } => {
            let input = single(op, inputs)?;
            input.with_shape(input.shape.permuted(order)?)
        }
        Op::Reshape {
            pattern,
            special_zero,
        } => {
            let input = single(op, inputs)?;
            input.with_shape(infer_reshape_shape(&input.shape, pattern, *special_zero)?)
        }
        Op::Add | Op::Subtract | Op::Multiply | Op::Divide | Op::Maximum | Op::Minimum => {
            let shape = broadcast_shape(&inputs[0].shape, &inputs[1].shape)?;
            inputs[0].with_shape(shape)
        }
        Op::Select => {
            let shape = broadcast_shape(&inputs[0].shape, &inputs[1].shape)?;
            let shape = broadcast_shape(&shape, &inputs[2].shape)?;
            inputs[1].with_shape(shape)
        }
        Op::Softmax { axis } => {
            let input = single(op, inputs)?;
            normalize_axis(*axis, input.rank())?;
            input.clone()
        }
        Op::Relu | Op::Exp | Op::Negative => single(op, inputs)?.clone(),
        Op::Convert { to } => {
            let input = single(op, inputs)?;
            TensorDesc::new(*to, input.shape.clone())
        }
        Op::Quantize { to, .. } => {
            if !to.is_quantized() {
                return fail(format!("Quantize target {} is not an 8-bit type", to));
            }
            TensorDesc::new(*to, single(op, inputs)?.shape.clone())
        }
        Op::Dequantize { .. } => TensorDesc::new(ElementType::F32, single(op, inputs)?.shape.clone()),
    };

    Ok(vec![desc])
}

impl Graph {
    /// Re-run shape inference over the whole graph in topological order
    ///
    /// Parameter and constant descriptors are taken as given; fused bodies are
    /// re-inferred from the descriptors of their inputs.
    pub fn infer_shapes(&mut self) -> TokenizeResult<()> {
        let order = self.topological_order()?;

        for id in order {
            let node = self.get(id)?;
            if node.is_parameter() || node.is_constant() {
                continue;
            }
            let input_descs = node
                .inputs
                .iter()
                .map(|src| {
                    self.desc(*src)
                        .cloned()
                        .ok_or(TokenizeError::UnknownNode(src.node))
                })
                .collect::<TokenizeResult<Vec<_>>>()?;

            let node = self.get_mut(id)?;
            let outputs = match &mut node.op {
                Op::Subgraph(subgraph) => subgraph.reinfer(&input_descs)?,
                op => infer_op(op, &input_descs)?,
            };
            trace!("Inferred {} ({}): {:?}", node.name, node.op.type_name(), outputs);
            node.outputs = outputs;
        }

        Ok(())
    }

    /// Infer the descriptor `op` would produce when fed from `inputs`
    pub fn infer_from(&self, op: &Op, inputs: &[Output]) -> TokenizeResult<Vec<TensorDesc>> {
        let descs = inputs
            .iter()
            .map(|src| {
                self.desc(*src)
                    .cloned()
                    .ok_or(TokenizeError::UnknownNode(src.node))
            })
            .collect::<TokenizeResult<Vec<_>>>()?;
        infer_op(op, &descs)
    }
}
