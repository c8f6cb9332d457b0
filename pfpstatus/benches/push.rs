//! Microbenchmarks for the `Recorder::push()` hot path.
//!
//! Run with: `cargo bench -p pfpstatus -- push`

#![allow(missing_docs)]

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use pfpstatus::{NamespacedName, Recorder, RecorderConfig, Status};

/// Builds a status with a realistic pod list.
fn status(node: &str, seq: u64, pods: usize) -> Status {
    let pods = (0..pods)
        .map(|i| NamespacedName::new("workload", format!("pod-{i}")))
        .collect();
    Status::new(node)
        .with_expected(format!("pfp0v001{seq:016x}"))
        .with_computed(format!("pfp0v001{seq:016x}"))
        .with_pods(pods)
}

fn bench_push_single_node(c: &mut Criterion) {
    let mut recorder = Recorder::new(RecorderConfig::default().with_node_capacity(10)).unwrap();
    let mut seq = 0u64;

    c.bench_function("push/single_node", |b| {
        b.iter(|| {
            seq += 1;
            recorder.push(black_box(status("node-0", seq, 8))).unwrap();
        });
    });
}

fn bench_push_many_nodes(c: &mut Criterion) {
    let mut group = c.benchmark_group("push/node_count");

    for count in [1usize, 10, 100, 1000] {
        let config = RecorderConfig::default()
            .with_max_nodes(count)
            .with_node_capacity(10);
        let mut recorder = Recorder::new(config).unwrap();
        let nodes: Vec<String> = (0..count).map(|i| format!("node-{i}")).collect();
        let mut seq = 0u64;

        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            b.iter(|| {
                seq += 1;
                for node in &nodes {
                    recorder.push(black_box(status(node, seq, 8))).unwrap();
                }
            });
        });
    }
    group.finish();
}

fn bench_push_size_bounded(c: &mut Criterion) {
    let config = RecorderConfig::default()
        .with_node_capacity(1000)
        .with_max_size_per_node(16 * 1024);
    let mut recorder = Recorder::new(config).unwrap();
    let mut seq = 0u64;

    c.bench_function("push/size_bounded", |b| {
        b.iter(|| {
            seq += 1;
            recorder.push(black_box(status("node-0", seq, 32))).unwrap();
        });
    });
}

fn bench_push_coalesced(c: &mut Criterion) {
    let config = RecorderConfig::default()
        .with_node_capacity(10)
        .with_coalescing(true);
    let mut recorder = Recorder::new(config).unwrap();

    c.bench_function("push/coalesced", |b| {
        b.iter(|| {
            recorder.push(black_box(status("node-0", 7, 8))).unwrap();
        });
    });
}

criterion_group!(
    benches,
    bench_push_single_node,
    bench_push_many_nodes,
    bench_push_size_bounded,
    bench_push_coalesced
);
criterion_main!(benches);
