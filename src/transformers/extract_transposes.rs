//! Transpose extraction from fused bodies
//!
//! A body Transpose the kernel cannot execute at its operand position is moved
//! across the fused node boundary: input-side transposes are hoisted up to
//! their parameter and re-created in front of the fused input port, output
//! transposes are re-created after the fused output port.

use log::debug;

use crate::config::TokenizationConfig;
use crate::error::TokenizeResult;
use crate::graph::{Graph, Input, NodeId, Op, Output};
use crate::pattern::{is_supported_transpose, last_two_swap, TransposeRole};
use crate::tensor::compose_orders;
use crate::transform::{eliminate_node, insert_after, insert_before};

use super::common::{
    operand_role, passthrough_port, pending_subgraphs, subgraph_mut, GraphTransformer,
    TransformResult,
};

/// A transpose moved out of a body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractedTranspose {
    /// Re-create in front of input port `port`
    Input {
        /// Fused input port
        port: usize,
        /// Permutation
        order: Vec<usize>,
    },
    /// Re-create after output port `port`
    Output {
        /// Fused output port
        port: usize,
        /// Permutation
        order: Vec<usize>,
    },
}

/// Move unsupported transposes out of fused bodies
#[derive(Debug, Default)]
pub struct ExtractUnsupportedTransposes;

impl ExtractUnsupportedTransposes {
    /// Create the pass
    pub fn new() -> Self {
        Self
    }

    /// Swap `transpose` with its single-use elementwise producer
    ///
    /// Returns false if the producer cannot be crossed.
    fn hoist(body: &mut Graph, transpose: NodeId) -> TokenizeResult<bool> {
        let Some(source) = body.get(transpose)?.input(0) else {
            return Ok(false);
        };
        let producer = body.get(source.node)?;
        let Some(port) = passthrough_port(body, producer) else {
            return Ok(false);
        };
        let same_rank = match (body.input_desc(producer.id, port), producer.output_desc()) {
            (Some(input), Some(output)) => input.rank() == output.rank(),
            _ => false,
        };
        if !same_rank || !body.is_single_use(source) {
            return Ok(false);
        }
        let Some(data) = producer.input(port) else {
            return Ok(false);
        };

        let transposed = Output::new(transpose, 0);
        body.replace_all_uses(transposed, source)?;
        body.replace_input(Input::new(transpose, 0), data)?;
        body.replace_input(Input::new(source.node, port), transposed)?;
        body.infer_shapes()?;
        Ok(true)
    }

    /// Move one input-side transpose to the body boundary
    fn extract_input(body: &mut Graph, transpose: NodeId) -> TokenizeResult<Option<usize>> {
        loop {
            let Some(source) = body.get(transpose)?.input(0) else {
                return Ok(None);
            };
            if body.get(source.node)?.is_parameter() {
                if !body.is_single_use(source) {
                    return Ok(None);
                }
                let Some(port) = body.parameters().iter().position(|p| *p == source.node) else {
                    return Ok(None);
                };
                let Some(desc) = body.get(transpose)?.output_desc().cloned() else {
                    return Ok(None);
                };
                body.set_output_desc(source, desc)?;
                eliminate_node(body, transpose, 0)?;
                return Ok(Some(port));
            }
            if !Self::hoist(body, transpose)? {
                return Ok(None);
            }
        }
    }

    /// Move one output transpose to the body boundary
    fn extract_output(body: &mut Graph, transpose: NodeId) -> TokenizeResult<Option<usize>> {
        let [reader] = body.consumers(Output::new(transpose, 0)) else {
            return Ok(None);
        };
        let Some(port) = body.results().iter().position(|r| *r == reader.node) else {
            return Ok(None);
        };
        eliminate_node(body, transpose, 0)?;
        Ok(Some(port))
    }

    /// Extract every unsupported transpose of `body`
    pub fn extract_from_body(
        body: &mut Graph,
        config: &TokenizationConfig,
    ) -> TokenizeResult<Vec<ExtractedTranspose>> {
        let matmuls: Vec<NodeId> = body
            .topological_order()?
            .into_iter()
            .filter(|id| body.node(*id).map(|n| n.is_matmul()).unwrap_or(false))
            .collect();
        let transposes: Vec<NodeId> = body
            .nodes()
            .filter(|n| matches!(n.op, Op::Transpose { .. }))
            .map(|n| n.id)
            .collect();

        let mut extracted = Vec::new();
        for id in transposes {
            let Some(Op::Transpose { order }) = body.node(id).map(|n| n.op.clone()) else {
                continue;
            };
            let Some((role, transposed_b)) = operand_role(body, &matmuls, Output::new(id, 0)) else {
                continue;
            };
            let effective = if transposed_b {
                compose_orders(&order, &last_two_swap(order.len()))
            } else {
                order.clone()
            };
            if is_supported_transpose(&effective, role, config) {
                continue;
            }

            let entry = if role == TransposeRole::Output {
                Self::extract_output(body, id)?.map(|port| ExtractedTranspose::Output { port, order })
            } else {
                Self::extract_input(body, id)?.map(|port| ExtractedTranspose::Input { port, order })
            };
            match entry {
                Some(entry) => extracted.push(entry),
                None => debug!("Transpose {} ({:?}) cannot leave the body", id, role),
            }
        }

        if !extracted.is_empty() {
            body.infer_shapes()?;
        }
        Ok(extracted)
    }

    /// Extract unsupported transposes of fused node `id` into `graph`
    pub fn extract(graph: &mut Graph, id: NodeId, config: &TokenizationConfig) -> TokenizeResult<usize> {
        let subgraph = subgraph_mut(graph, id)?;
        let extracted = Self::extract_from_body(&mut subgraph.body, config)?;
        if extracted.is_empty() {
            return Ok(0);
        }
        let output_descs = subgraph.output_descs()?;
        let name = graph.get(id)?.name.clone();

        for entry in &extracted {
            match entry {
                ExtractedTranspose::Input { port, order } => {
                    insert_before(
                        graph,
                        Input::new(id, *port),
                        Op::Transpose {
                            order: order.clone(),
                        },
                        format!("{}/in{}/transpose", name, port),
                    )?;
                }
                ExtractedTranspose::Output { port, order } => {
                    let output = Output::new(id, *port);
                    graph.set_output_desc(output, output_descs[*port].clone())?;
                    insert_after(
                        graph,
                        output,
                        Op::Transpose {
                            order: order.clone(),
                        },
                        format!("{}/out{}/transpose", name, port),
                    )?;
                }
            }
            debug!("Moved {:?} out of {}", entry, name);
        }
        Ok(extracted.len())
    }
}

impl GraphTransformer for ExtractUnsupportedTransposes {
    fn name(&self) -> &'static str {
        "ExtractUnsupportedTransposes"
    }

    fn transform(&self, graph: &mut Graph, config: &TokenizationConfig) -> TokenizeResult<TransformResult> {
        let mut result = TransformResult::new();
        for id in pending_subgraphs(graph) {
            let count = Self::extract(graph, id, config)?;
            if count > 0 {
                result.patterns_matched += count;
                result.record(&graph.get(id)?.name);
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::GraphBuilder;
    use crate::tensor::PartialShape;
    use crate::transformers::TokenizeMhaSnippets;

    fn tokenize(graph: &mut Graph, config: &TokenizationConfig) -> NodeId {
        TokenizeMhaSnippets::new().transform(graph, config).unwrap();
        graph.find_nodes_by_op("Subgraph")[0].id
    }

    #[test]
    fn test_extract_rank2_key_transpose() {
        let mut b = GraphBuilder::new();
        let q = b.input(&[12, 64]);
        let k = b.input(&[12, 64]);
        let v = b.input(&[12, 64]);
        let qk = b.matmul_t(q, k, false, true).unwrap();
        let sm = b.softmax(qk, -1).unwrap();
        let out = b.matmul(sm, v).unwrap();
        b.result(out).unwrap();
        let mut graph = b.build().unwrap();

        let config = TokenizationConfig::default();
        let fused = tokenize(&mut graph, &config);
        let count = ExtractUnsupportedTransposes::extract(&mut graph, fused, &config).unwrap();
        graph.validate().unwrap();

        assert_eq!(count, 1);
        let body = &graph.node(fused).unwrap().op.as_subgraph().unwrap().body;
        assert_eq!(body.count_ops("Transpose"), 0);

        let outer = graph.input_producer(fused, 1).unwrap();
        assert_eq!(outer.op, Op::Transpose { order: vec![1, 0] });
        assert_eq!(outer.inputs[0], k);
        assert_eq!(
            graph.input_desc(fused, 1).unwrap().shape,
            PartialShape::from_static(&[64, 12])
        );
    }

    #[test]
    fn test_hoist_past_scalar_multiply() {
        let mut b = GraphBuilder::new();
        let q = b.input(&[12, 64]);
        let k = b.input(&[12, 64]);
        let v = b.input(&[12, 64]);
        let scale = b.scalar(0.125).unwrap();
        let ks = b.multiply(k, scale).unwrap();
        let qk = b.matmul_t(q, ks, false, true).unwrap();
        let sm = b.softmax(qk, -1).unwrap();
        let out = b.matmul(sm, v).unwrap();
        b.result(out).unwrap();
        let mut graph = b.build().unwrap();

        let config = TokenizationConfig::default();
        let fused = tokenize(&mut graph, &config);
        let count = ExtractUnsupportedTransposes::extract(&mut graph, fused, &config).unwrap();
        graph.validate().unwrap();

        assert_eq!(count, 1);
        let subgraph = graph.node(fused).unwrap().op.as_subgraph().unwrap();
        assert_eq!(subgraph.body.count_ops("Transpose"), 0);
        assert_eq!(subgraph.body.count_ops("Multiply"), 1);
        assert_eq!(
            subgraph.output_descs().unwrap()[0].shape,
            PartialShape::from_static(&[12, 64])
        );
    }

    #[test]
    fn test_supported_transposes_stay() {
        let mut b = GraphBuilder::new();
        let q = b.input(&[1, 128, 12, 64]);
        let k = b.input(&[1, 128, 12, 64]);
        let v = b.input(&[1, 128, 12, 64]);
        let qt = b.transpose(q, &[0, 2, 1, 3]).unwrap();
        let kt = b.transpose(k, &[0, 2, 3, 1]).unwrap();
        let vt = b.transpose(v, &[0, 2, 1, 3]).unwrap();
        let qk = b.matmul(qt, kt).unwrap();
        let sm = b.softmax(qk, -1).unwrap();
        let out = b.matmul(sm, vt).unwrap();
        b.result(out).unwrap();
        let mut graph = b.build().unwrap();

        let config = TokenizationConfig::default();
        let fused = tokenize(&mut graph, &config);
        let count = ExtractUnsupportedTransposes::extract(&mut graph, fused, &config).unwrap();
        assert_eq!(count, 0);
        assert_eq!(graph.count_ops("Transpose"), 0);
    }

    #[test]
    fn test_extract_output_transpose_at_disabled_rank() {
        let mut b = GraphBuilder::new();
        let q = b.input(&[1, 12, 128, 64]);
        let k = b.input(&[1, 12, 64, 128]);
        let v = b.input(&[1, 12, 128, 64]);
        let qk = b.matmul(q, k).unwrap();
        let sm = b.softmax(qk, -1).unwrap();
        let mm = b.matmul(sm, v).unwrap();
        let out = b.transpose(mm, &[0, 2, 1, 3]).unwrap();
        b.result(out).unwrap();
        let mut graph = b.build().unwrap();

        // Absorbed while rank 4 is allowed, then extracted once it is not
        let config = TokenizationConfig::default();
        let fused = tokenize(&mut graph, &config);
        let restricted = config.with_transpose_ranks([3]);
        let count = ExtractUnsupportedTransposes::extract(&mut graph, fused, &restricted).unwrap();
        graph.validate().unwrap();

        assert_eq!(count, 1);
        assert_eq!(
            graph.node(fused).unwrap().outputs[0].shape,
            PartialShape::from_static(&[1, 12, 128, 64])
        );
        let after = graph.consumer_nodes(Output::new(fused, 0))[0];
        assert_eq!(after.op, Op::Transpose { order: vec![0, 2, 1, 3] });
        assert_eq!(
            after.output_desc().unwrap().shape,
            PartialShape::from_static(&[1, 128, 12, 64])
        );
    }
}
