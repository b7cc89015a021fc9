//! Graph mutation operations
//!
//! Methods for modifying the graph structure: adding, removing, and rewiring nodes.
//! Every method keeps the consumer map in sync with the node inputs.

use crate::error::{TokenizeError, TokenizeResult};
use crate::tensor::TensorDesc;

use super::context::Graph;
use super::infer::infer_op;
use super::node::{ConstantData, Input, Node, NodeId, Op, Output, RtInfo};

impl Graph {
    // ========================================================================
    // Node insertion
    // ========================================================================

    fn alloc_id(&mut self) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        id
    }

    fn check_source(&self, consumer: Input, source: Output) -> TokenizeResult<()> {
        let valid = self
            .node(source.node)
            .map(|n| source.port < n.outputs.len())
            .unwrap_or(false);
        if valid {
            Ok(())
        } else {
            Err(TokenizeError::DanglingEdge {
                node: consumer.node,
                port: consumer.port,
                producer: source,
            })
        }
    }

    fn check_sources(&self, inputs: &[Output]) -> TokenizeResult<()> {
        let pending = NodeId(self.next_id);
        for (port, source) in inputs.iter().enumerate() {
            self.check_source(Input::new(pending, port), *source)?;
        }
        Ok(())
    }

    /// Insert a node with known output descriptors
    ///
    /// Updates the consumer map for every input.
    pub fn add_node_with_outputs(
        &mut self,
        op: Op,
        inputs: Vec<Output>,
        outputs: Vec<TensorDesc>,
        name: impl Into<String>,
    ) -> TokenizeResult<NodeId> {
        if inputs.len() != op.arity() {
            return Err(TokenizeError::InvalidNode(format!(
                "{} expects {} inputs, got {}",
                op.type_name(),
                op.arity(),
                inputs.len()
            )));
        }
        self.check_sources(&inputs)?;

        let id = self.alloc_id();
        for (port, source) in inputs.iter().enumerate() {
            self.consumer_map
                .entry(*source)
                .or_default()
                .push(Input::new(id, port));
        }

        match op {
            Op::Parameter => self.parameters.push(id),
            Op::Result => self.results.push(id),
            _ => {}
        }

        self.nodes.insert(
            id,
            Node {
                id,
                name: name.into(),
                op,
                inputs,
                outputs,
                rt_info: RtInfo::default(),
            },
        );
        Ok(id)
    }

    /// Insert a node, inferring its output descriptors from its inputs
    pub fn add_node(
        &mut self,
        op: Op,
        inputs: Vec<Output>,
        name: impl Into<String>,
    ) -> TokenizeResult<NodeId> {
        self.check_sources(&inputs)?;
        let input_descs = inputs
            .iter()
            .map(|src| {
                self.desc(*src)
                    .cloned()
                    .ok_or(TokenizeError::UnknownNode(src.node))
            })
            .collect::<TokenizeResult<Vec<_>>>()?;
        let outputs = infer_op(&op, &input_descs)?;
        self.add_node_with_outputs(op, inputs, outputs, name)
    }

    /// Add a graph input
    pub fn add_parameter(&mut self, desc: TensorDesc, name: impl Into<String>) -> NodeId {
        let id = self.alloc_id();
        self.parameters.push(id);
        self.nodes.insert(
            id,
            Node {
                id,
                name: name.into(),
                op: Op::Parameter,
                inputs: Vec::new(),
                outputs: vec![desc],
                rt_info: RtInfo::default(),
            },
        );
        id
    }

    /// Add a constant
    ///
    /// Fails if the value count does not match a static shape.
    pub fn add_constant(
        &mut self,
        desc: TensorDesc,
        values: Vec<f32>,
        name: impl Into<String>,
    ) -> TokenizeResult<NodeId> {
        match desc.shape.numel() {
            Some(n) if n == values.len() => {}
            Some(n) => {
                return Err(TokenizeError::InvalidNode(format!(
                    "Constant of shape {} needs {} values, got {}",
                    desc.shape,
                    n,
                    values.len()
                )))
            }
            None => {
                return Err(TokenizeError::InvalidNode(format!(
                    "Constant shape {} must be static",
                    desc.shape
                )))
            }
        }
        self.add_node_with_outputs(
            Op::Constant(ConstantData::new(values)),
            Vec::new(),
            vec![desc],
            name,
        )
    }

    /// Add a graph output reading `source`
    pub fn add_result(&mut self, source: Output, name: impl Into<String>) -> TokenizeResult<NodeId> {
        self.add_node(Op::Result, vec![source], name)
    }

    // ========================================================================
    // Rewiring
    // ========================================================================

    /// Make `input` read from `source`
    pub fn replace_input(&mut self, input: Input, source: Output) -> TokenizeResult<()> {
        self.check_source(input, source)?;
        let node = self.get_mut(input.node)?;
        let old = *node.inputs.get(input.port).ok_or_else(|| {
            TokenizeError::InvalidNode(format!(
                "Node {} has no input port {}",
                input.node, input.port
            ))
        })?;
        node.inputs[input.port] = source;

        if let Some(consumers) = self.consumer_map.get_mut(&old) {
            consumers.retain(|c| *c != input);
            if consumers.is_empty() {
                self.consumer_map.remove(&old);
            }
        }
        self.consumer_map.entry(source).or_default().push(input);
        Ok(())
    }

    /// Redirect every reader of `old` to `new`
    ///
    /// Inputs of `new.node` itself are left untouched, so a node inserted
    /// after `old` keeps reading it. Returns the number of rewired inputs.
    pub fn replace_all_uses(&mut self, old: Output, new: Output) -> TokenizeResult<usize> {
        let targets: Vec<Input> = self
            .consumers(old)
            .iter()
            .copied()
            .filter(|input| input.node != new.node)
            .collect();
        for input in &targets {
            self.replace_input(*input, new)?;
        }
        Ok(targets.len())
    }

    /// Overwrite the descriptor of an output
    pub fn set_output_desc(&mut self, output: Output, desc: TensorDesc) -> TokenizeResult<()> {
        let node = self.get_mut(output.node)?;
        let slot = node.outputs.get_mut(output.port).ok_or_else(|| {
            TokenizeError::InvalidNode(format!(
                "Node {} has no output port {}",
                output.node, output.port
            ))
        })?;
        *slot = desc;
        Ok(())
    }

    // ========================================================================
    // Removal
    // ========================================================================

    /// Remove a node from the graph
    ///
    /// Fails if any output is still read, since that would leave a dangling edge.
    pub fn remove_node(&mut self, id: NodeId) -> TokenizeResult<Node> {
        let ports = self.get(id)?.outputs.len();
        for port in 0..ports {
            if let Some(reader) = self.consumers(Output::new(id, port)).first() {
                return Err(TokenizeError::InvalidNode(format!(
                    "Cannot remove {}: output {} is still read by {}",
                    id, port, reader.node
                )));
            }
        }

        let node = self
            .nodes
            .shift_remove(&id)
            .ok_or(TokenizeError::UnknownNode(id))?;

        for (port, source) in node.inputs.iter().enumerate() {
            let input = Input::new(id, port);
            if let Some(consumers) = self.consumer_map.get_mut(source) {
                consumers.retain(|c| *c != input);
                if consumers.is_empty() {
                    self.consumer_map.remove(source);
                }
            }
        }
        for port in 0..ports {
            self.consumer_map.remove(&Output::new(id, port));
        }

        self.parameters.retain(|p| *p != id);
        self.results.retain(|r| *r != id);
        Ok(node)
    }

    /// Remove nodes whose outputs are never read, repeating until stable
    ///
    /// Parameters and results are kept. Returns the number of removed nodes.
    pub fn remove_dead_nodes(&mut self) -> TokenizeResult<usize> {
        let mut removed = 0;
        loop {
            let dead: Vec<NodeId> = self
                .nodes()
                .filter(|n| !n.is_parameter() && !n.is_result())
                .filter(|n| {
                    (0..n.outputs.len()).all(|port| self.is_unused(Output::new(n.id, port)))
                })
                .map(|n| n.id)
                .collect();
            if dead.is_empty() {
                return Ok(removed);
            }
            for id in dead {
                self.remove_node(id)?;
                removed += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{ElementType, PartialShape};

    fn desc(dims: &[usize]) -> TensorDesc {
        TensorDesc::f32(PartialShape::from_static(dims))
    }

    #[test]
    fn test_add_node_infers_outputs() {
        let mut graph = Graph::new();
        let a = graph.add_parameter(desc(&[2, 3]), "a");
        let b = graph.add_parameter(desc(&[3, 5]), "b");
        let mm = graph
            .add_node(Op::matmul(), vec![Output::new(a, 0), Output::new(b, 0)], "mm")
            .unwrap();

        assert_eq!(graph.node(mm).unwrap().outputs, vec![desc(&[2, 5])]);
        assert_eq!(graph.consumers(Output::new(a, 0)), &[Input::new(mm, 0)]);
    }

    #[test]
    fn test_add_node_rejects_wrong_arity() {
        let mut graph = Graph::new();
        let a = graph.add_parameter(desc(&[2]), "a");
        let err = graph
            .add_node(Op::Add, vec![Output::new(a, 0)], "add")
            .unwrap_err();
        assert!(matches!(err, TokenizeError::InvalidNode(_)));
    }

    #[test]
    fn test_add_node_rejects_missing_producer() {
        let mut graph = Graph::new();
        let err = graph
            .add_node(Op::Relu, vec![Output::new(NodeId(42), 0)], "relu")
            .unwrap_err();
        assert!(err.is_invariant_violation());
    }

    #[test]
    fn test_add_constant_checks_size() {
        let mut graph = Graph::new();
        assert!(graph
            .add_constant(desc(&[2, 2]), vec![1.0; 4], "c")
            .is_ok());
        assert!(graph.add_constant(desc(&[2, 2]), vec![1.0; 3], "c").is_err());
        let dynamic = TensorDesc::new(ElementType::F32, PartialShape::from_i64(&[-1]));
        assert!(graph.add_constant(dynamic, vec![1.0], "c").is_err());
    }

    #[test]
    fn test_replace_all_uses_skips_new_node() {
        let mut graph = Graph::new();
        let a = graph.add_parameter(desc(&[4]), "a");
        let r = graph.add_node(Op::Relu, vec![Output::new(a, 0)], "r").unwrap();
        let out = graph.add_result(Output::new(r, 0), "out").unwrap();

        let e = graph.add_node(Op::Exp, vec![Output::new(r, 0)], "e").unwrap();
        let rewired = graph
            .replace_all_uses(Output::new(r, 0), Output::new(e, 0))
            .unwrap();

        assert_eq!(rewired, 1);
        assert_eq!(graph.node(out).unwrap().inputs[0], Output::new(e, 0));
        assert_eq!(graph.node(e).unwrap().inputs[0], Output::new(r, 0));
        assert_eq!(graph.consumers(Output::new(r, 0)), &[Input::new(e, 0)]);
    }

    #[test]
    fn test_remove_node_refuses_dangling() {
        let mut graph = Graph::new();
        let a = graph.add_parameter(desc(&[4]), "a");
        let r = graph.add_node(Op::Relu, vec![Output::new(a, 0)], "r").unwrap();
        let out = graph.add_result(Output::new(r, 0), "out").unwrap();

        assert!(graph.remove_node(r).is_err());
        graph.remove_node(out).unwrap();
        graph.remove_node(r).unwrap();
        assert!(graph.is_unused(Output::new(a, 0)));
        assert!(graph.results().is_empty());
    }

    #[test]
    fn test_remove_dead_nodes() {
        let mut graph = Graph::new();
        let a = graph.add_parameter(desc(&[4]), "a");
        let r = graph.add_node(Op::Relu, vec![Output::new(a, 0)], "r").unwrap();
        graph.add_node(Op::Exp, vec![Output::new(r, 0)], "e").unwrap();

        assert_eq!(graph.remove_dead_nodes().unwrap(), 2);
        assert_eq!(graph.node_count(), 1);
    }
}
