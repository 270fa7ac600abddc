//! Benchmarks for level computation and stream fan-out.

use agentflow::graph::{compute_levels, Edge, ExecutionGraph, Node, SlotDecl};
use agentflow::streaming::{from_chunks, tee_n};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use futures::StreamExt;
use serde_json::json;

fn deep_graph(depth: usize) -> ExecutionGraph {
    let nodes = (0..depth)
        .map(|i| Node::new(format!("n{i}"), "echo").with_input(SlotDecl::optional("in")))
        .collect();
    let edges = (1..depth)
        .map(|i| Edge::new(format!("n{}", i - 1), "output", format!("n{i}"), "in"))
        .collect();
    ExecutionGraph::new(nodes, edges)
}

fn wide_graph(width: usize) -> ExecutionGraph {
    let mut nodes = vec![Node::new("root", "echo")];
    nodes.extend((0..width).map(|i| Node::new(format!("w{i}"), "echo").with_input(SlotDecl::required("in"))));
    let edges = (0..width)
        .map(|i| Edge::new("root", "output", format!("w{i}"), "in"))
        .collect();
    ExecutionGraph::new(nodes, edges)
}

fn levels_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("compute_levels");
    for size in [10usize, 100, 1000] {
        let deep = deep_graph(size);
        group.bench_with_input(BenchmarkId::new("deep", size), &deep, |b, graph| {
            b.iter(|| black_box(compute_levels(graph)));
        });
        let wide = wide_graph(size);
        group.bench_with_input(BenchmarkId::new("wide", size), &wide, |b, graph| {
            b.iter(|| black_box(compute_levels(graph)));
        });
    }
    group.finish();
}

fn tee_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let chunks: Vec<_> = (0..1000).map(|i| json!({"seq": i, "text": "token"})).collect();

    let mut group = c.benchmark_group("tee_n");
    for consumers in [2usize, 4, 8] {
        group.bench_with_input(BenchmarkId::from_parameter(consumers), &consumers, |b, &n| {
            b.iter(|| {
                runtime.block_on(async {
                    let branches = tee_n(from_chunks(chunks.clone()), n, 64);
                    let drained = futures::future::join_all(
                        branches.into_iter().map(|branch| branch.count()),
                    )
                    .await;
                    black_box(drained)
                })
            });
        });
    }
    group.finish();
}

criterion_group!(benches, levels_benchmark, tee_benchmark);
criterion_main!(benches);
