//! Benchmark for tokenization passes
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};

use mha_tokenizer::builder::GraphBuilder;
use mha_tokenizer::config::TokenizationConfig;
use mha_tokenizer::graph::Graph;
use mha_tokenizer::pattern::MhaMatcher;
use mha_tokenizer::transformers::{compute_split, EnumerateNodes, TokenizationPipeline};

/// `layers` stacked 4-D attention blocks, each feeding the next block's query
fn stacked_mha(layers: usize) -> Graph {
    let mut b = GraphBuilder::new();
    let mut x = b.input(&[1, 128, 12, 64]);
    for _ in 0..layers {
        let k = b.input(&[1, 128, 12, 64]);
        let mask = b.input(&[1, 1, 1, 128]);
        let v = b.input(&[1, 128, 12, 64]);
        let qt = b.transpose(x, &[0, 2, 1, 3]).unwrap();
        let kt = b.transpose(k, &[0, 2, 3, 1]).unwrap();
        let vt = b.transpose(v, &[0, 2, 1, 3]).unwrap();
        let qk = b.matmul(qt, kt).unwrap();
        let masked = b.add(qk, mask).unwrap();
        let sm = b.softmax(masked, -1).unwrap();
        let mm = b.matmul(sm, vt).unwrap();
        x = b.transpose(mm, &[0, 2, 1, 3]).unwrap();
    }
    b.result(x).unwrap();
    b.build().unwrap()
}

fn matcher_benchmark(c: &mut Criterion) {
    let mut graph = stacked_mha(12);
    EnumerateNodes::enumerate(&mut graph).unwrap();
    let config = TokenizationConfig::default();
    let anchors: Vec<_> = graph
        .find_nodes_by_op("MatMul")
        .iter()
        .map(|n| n.id)
        .collect();

    c.bench_function("match_12_layers", |b| {
        b.iter(|| {
            let matcher = MhaMatcher::new(&graph, &config);
            anchors
                .iter()
                .filter(|id| matcher.find_match(**id).is_some())
                .count()
        })
    });
}

fn pipeline_benchmark(c: &mut Criterion) {
    let graph = stacked_mha(12);

    for (name, config) in [
        ("pipeline_12_layers", TokenizationConfig::default()),
        (
            "pipeline_12_layers_split",
            TokenizationConfig::default().with_concurrency(24),
        ),
    ] {
        let pipeline = TokenizationPipeline::new(config);
        c.bench_function(name, |b| {
            b.iter_batched(
                || graph.clone(),
                |mut graph| {
                    pipeline.run(&mut graph).unwrap();
                    graph
                },
                BatchSize::SmallInput,
            )
        });
    }
}

fn split_benchmark(c: &mut Criterion) {
    c.bench_function("compute_split", |b| {
        b.iter(|| {
            (1..64)
                .filter_map(|batch| compute_split(black_box(batch), black_box(9216), black_box(60)))
                .count()
        })
    });
}

criterion_group!(benches, matcher_benchmark, pipeline_benchmark, split_benchmark);
criterion_main!(benches);
