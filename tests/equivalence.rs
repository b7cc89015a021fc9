//! Tokenized graphs compute what the original graphs compute

mod common;

use common::*;
use mha_tokenizer::config::TokenizationConfig;
use mha_tokenizer::eval::{evaluate, sample_inputs};
use mha_tokenizer::transformers::{
    CommonOptimizations, ExtractReshapesFromMha, GraphTransformer, TokenizeMhaSnippets,
};

#[test]
fn test_tokenization_preserves_results() {
    for original in [
        mha_2d(),
        mha_3d_masked(),
        mha_4d(),
        mha_5d(),
        mha_int8(),
        mha_select(true),
        mha_select(false),
    ] {
        let graph = tokenized(&original, TokenizationConfig::default());
        assert_eq!(graph.count_ops("Subgraph"), 1);
        assert_equivalent(&original, &graph);
    }
}

#[test]
fn test_reshape_extraction_preserves_results() {
    for original in [mha_reshape_extraction(), mha_rank_change()] {
        let mut extracted = original.clone();
        ExtractReshapesFromMha::new()
            .transform(&mut extracted, &TokenizationConfig::default())
            .unwrap();
        extracted.validate().unwrap();
        assert_equivalent(&original, &extracted);

        let graph = tokenized(&original, TokenizationConfig::default());
        assert_equivalent(&original, &graph);
    }
}

#[test]
fn test_split_m_preserves_results() {
    let config = TokenizationConfig::default().with_concurrency(24);

    let original = mha_3d_transposed();
    let graph = tokenized(&original, config.clone());
    assert!(graph.find_nodes_by_op("Subgraph")[0]
        .op
        .as_subgraph()
        .unwrap()
        .split
        .is_some());
    assert_equivalent(&original, &graph);

    let original = mha_4d();
    let graph = tokenized(&original, config);
    assert_equivalent(&original, &graph);
}

#[test]
fn test_split_m_fallback_preserves_results() {
    // Batch 12 with M 30 has no ideal split for 32 units
    let original = mha_plain(&[12, 30, 8], &[12, 8, 30], &[12, 30, 8]);
    let config = TokenizationConfig::default().with_concurrency(32);
    let graph = tokenized(&original, config);
    let split = graph.find_nodes_by_op("Subgraph")[0]
        .op
        .as_subgraph()
        .unwrap()
        .split;
    if let Some(split) = split {
        assert!(split.batch_m <= 32);
        assert_eq!(split.m(), 30);
    }
    assert_equivalent(&original, &graph);
}

#[test]
fn test_transpose_extraction_preserves_results() {
    let original = mha_4d_transposed(&[1, 32, 4, 16], &[1, 32, 4, 16], &[1, 4, 32, 32], &[1, 32, 4, 16]);

    // Fuse with rank 4 layouts allowed, then finalize for a rank 3 only target
    let mut graph = original.clone();
    TokenizeMhaSnippets::new()
        .transform(&mut graph, &TokenizationConfig::default())
        .unwrap();
    let config = TokenizationConfig::default().with_transpose_ranks([3]);
    CommonOptimizations::new().transform(&mut graph, &config).unwrap();
    graph.validate().unwrap();

    let body = &graph.find_nodes_by_op("Subgraph")[0]
        .op
        .as_subgraph()
        .unwrap()
        .body;
    assert_eq!(body.count_ops("Transpose"), 0);
    assert_equivalent(&original, &graph);
}

#[test]
fn test_unfused_graph_is_untouched() {
    // A Softmax over the wrong axis is never tokenized
    let mut b = mha_tokenizer::builder::GraphBuilder::new();
    let q = b.input(&[2, 8, 4]);
    let k = b.input(&[2, 4, 8]);
    let v = b.input(&[2, 8, 4]);
    let qk = b.matmul(q, k).unwrap();
    let sm = b.softmax(qk, 1).unwrap();
    let out = b.matmul(sm, v).unwrap();
    b.result(out).unwrap();
    let original = b.build().unwrap();

    let graph = tokenized(&original, TokenizationConfig::default());
    assert_eq!(graph.count_ops("Subgraph"), 0);
    assert_eq!(graph.node_count(), original.node_count());

    let inputs = sample_inputs(&original, 3).unwrap();
    assert_eq!(
        evaluate(&original, &inputs).unwrap(),
        evaluate(&graph, &inputs).unwrap()
    );
}
