//! Shared MHA fixture graphs

#![allow(dead_code)]

use mha_tokenizer::builder::GraphBuilder;
use mha_tokenizer::config::TokenizationConfig;
use mha_tokenizer::eval::{all_close, evaluate, sample_inputs};
use mha_tokenizer::graph::Graph;
use mha_tokenizer::tensor::ElementType;
use mha_tokenizer::transformers::TokenizationPipeline;

/// Q, K, mask and V shapes of the transposed 4-D attention block
pub const MHA_4D_SHAPES: [[i64; 4]; 4] = [
    [1, 128, 12, 64],
    [1, 128, 12, 64],
    [1, 12, 128, 128],
    [1, 128, 12, 64],
];

/// `softmax(q @ k) @ v` without any layout ops
pub fn mha_plain(q: &[i64], k: &[i64], v: &[i64]) -> Graph {
    let mut b = GraphBuilder::new();
    let q = b.input(q);
    let k = b.input(k);
    let v = b.input(v);
    let qk = b.matmul(q, k).unwrap();
    let sm = b.softmax(qk, -1).unwrap();
    let out = b.matmul(sm, v).unwrap();
    b.result(out).unwrap();
    b.build().unwrap()
}

/// 2-D attention whose key is stored untransposed
pub fn mha_2d() -> Graph {
    let mut b = GraphBuilder::new();
    let q = b.input(&[32, 16]);
    let k = b.input(&[32, 16]);
    let v = b.input(&[32, 16]);
    let kt = b.transpose(k, &[1, 0]).unwrap();
    let qk = b.matmul(q, kt).unwrap();
    let sm = b.softmax(qk, -1).unwrap();
    let out = b.matmul(sm, v).unwrap();
    b.result(out).unwrap();
    b.build().unwrap()
}

/// 3-D attention with a scaled query and an additive mask
pub fn mha_3d_masked() -> Graph {
    let mut b = GraphBuilder::new();
    let q = b.input(&[12, 128, 64]);
    let k = b.input(&[12, 64, 128]);
    let mask = b.input(&[1, 128, 128]);
    let v = b.input(&[12, 128, 64]);
    let scale = b.scalar(0.125).unwrap();
    let scaled = b.multiply(q, scale).unwrap();
    let qk = b.matmul(scaled, k).unwrap();
    let masked = b.add(qk, mask).unwrap();
    let sm = b.softmax(masked, -1).unwrap();
    let out = b.matmul(sm, v).unwrap();
    b.result(out).unwrap();
    b.build().unwrap()
}

/// 4-D attention with head-swap transposes on every operand and the output
pub fn mha_4d_transposed(q: &[i64], k: &[i64], mask: &[i64], v: &[i64]) -> Graph {
    let mut b = GraphBuilder::new();
    let q = b.input(q);
    let k = b.input(k);
    let mask = b.input(mask);
    let v = b.input(v);
    let qt = b.transpose(q, &[0, 2, 1, 3]).unwrap();
    let kt = b.transpose(k, &[0, 2, 3, 1]).unwrap();
    let vt = b.transpose(v, &[0, 2, 1, 3]).unwrap();
    let qk = b.matmul(qt, kt).unwrap();
    let masked = b.add(qk, mask).unwrap();
    let sm = b.softmax(masked, -1).unwrap();
    let mm = b.matmul(sm, vt).unwrap();
    let out = b.transpose(mm, &[0, 2, 1, 3]).unwrap();
    b.result(out).unwrap();
    b.build().unwrap()
}

/// The transposed 4-D block at its reference shapes
pub fn mha_4d() -> Graph {
    let [q, k, mask, v] = MHA_4D_SHAPES;
    mha_4d_transposed(&q, &k, &mask, &v)
}

/// 3-D attention with head-swap transposes, the layout SplitM reshapes
pub fn mha_3d_transposed() -> Graph {
    let mut b = GraphBuilder::new();
    let q = b.input(&[128, 12, 64]);
    let k = b.input(&[128, 12, 64]);
    let mask = b.input(&[12, 128, 128]);
    let v = b.input(&[128, 12, 64]);
    let qt = b.transpose(q, &[1, 0, 2]).unwrap();
    let kt = b.transpose(k, &[1, 2, 0]).unwrap();
    let vt = b.transpose(v, &[1, 0, 2]).unwrap();
    let qk = b.matmul(qt, kt).unwrap();
    let masked = b.add(qk, mask).unwrap();
    let sm = b.softmax(masked, -1).unwrap();
    let mm = b.matmul(sm, vt).unwrap();
    let out = b.transpose(mm, &[1, 0, 2]).unwrap();
    b.result(out).unwrap();
    b.build().unwrap()
}

/// 5-D attention
pub fn mha_5d() -> Graph {
    mha_plain(&[1, 2, 3, 32, 16], &[1, 2, 3, 16, 32], &[1, 2, 3, 32, 16])
}

/// Int8 attention: quantized QK product dequantized before Softmax
pub fn mha_int8() -> Graph {
    let mut b = GraphBuilder::new();
    let q = b.parameter(ElementType::I8, &[4, 32, 16]);
    let k = b.parameter(ElementType::I8, &[4, 16, 32]);
    let v = b.input(&[4, 32, 16]);
    let qk = b.matmul(q, k).unwrap();
    let deq = b.dequantize(qk, 0.02, 0.0).unwrap();
    let sm = b.softmax(deq, -1).unwrap();
    let out = b.matmul(sm, v).unwrap();
    let quantized = b.quantize(out, 0.05, 0.0, ElementType::I8).unwrap();
    b.result(quantized).unwrap();
    b.build().unwrap()
}

/// Attention masked by Select with a scalar or a full-tensor fill value
pub fn mha_select(scalar_fill: bool) -> Graph {
    let mut b = GraphBuilder::new();
    let q = b.input(&[2, 4, 16, 8]);
    let k = b.input(&[2, 4, 8, 16]);
    let cond = b.parameter(ElementType::Boolean, &[1, 1, 16, 16]);
    let v = b.input(&[2, 4, 16, 8]);
    let fill = if scalar_fill {
        b.scalar(-10000.0).unwrap()
    } else {
        b.filled(&[1, 1, 16, 16], -10000.0).unwrap()
    };
    let qk = b.matmul(q, k).unwrap();
    let selected = b.select(cond, qk, fill).unwrap();
    let sm = b.softmax(selected, -1).unwrap();
    let out = b.matmul(sm, v).unwrap();
    b.result(out).unwrap();
    b.build().unwrap()
}

/// Attention scores reshaped to a 2-D grid for two sparse bias adds
pub fn mha_reshape_extraction() -> Graph {
    let mut b = GraphBuilder::new();
    let q = b.input(&[4, 9, 8]);
    let k = b.input(&[4, 8, 9]);
    let bias0 = b.input(&[4, 3, 3, 1, 1]);
    let bias1 = b.input(&[1, 1, 1, 3, 3]);
    let v = b.input(&[4, 9, 8]);
    let qk = b.matmul(q, k).unwrap();
    let grid = b.reshape(qk, &[4, 3, 3, 3, 3]).unwrap();
    let a0 = b.add(grid, bias0).unwrap();
    let a1 = b.add(a0, bias1).unwrap();
    let flat = b.reshape(a1, &[4, 9, 9]).unwrap();
    let sm = b.softmax(flat, -1).unwrap();
    let out = b.matmul(sm, v).unwrap();
    b.result(out).unwrap();
    b.build().unwrap()
}

/// Attention scores lifted to rank 5 for a per-batch mask
pub fn mha_rank_change() -> Graph {
    let mut b = GraphBuilder::new();
    let q = b.input(&[4, 2, 6, 8]);
    let k = b.input(&[4, 2, 8, 6]);
    let mask = b.input(&[1, 4, 1, 6, 6]);
    let v = b.input(&[4, 2, 6, 8]);
    let qk = b.matmul(q, k).unwrap();
    let lifted = b.reshape(qk, &[1, 4, 2, 6, 6]).unwrap();
    let masked = b.add(lifted, mask).unwrap();
    let sm = b.softmax(masked, 4).unwrap();
    let lowered = b.reshape(sm, &[4, 2, 6, 6]).unwrap();
    let out = b.matmul(lowered, v).unwrap();
    b.result(out).unwrap();
    b.build().unwrap()
}

/// Run the full pipeline on a copy of `graph`
pub fn tokenized(graph: &Graph, config: TokenizationConfig) -> Graph {
    let mut graph = graph.clone();
    TokenizationPipeline::new(config).run(&mut graph).unwrap();
    graph.validate().unwrap();
    graph
}

/// Check that two graphs compute the same results on the same sample data
pub fn assert_equivalent(before: &Graph, after: &Graph) {
    let inputs = sample_inputs(before, 7).unwrap();
    let expected = evaluate(before, &inputs).unwrap();
    let actual = evaluate(after, &inputs).unwrap();
    assert!(
        all_close(&expected, &actual, 1e-4),
        "rewritten graph computes different results"
    );
}
