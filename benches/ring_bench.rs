//! Benchmarks the ring's two hot paths: building placement for a cluster and
//! looking up a key's owner once it's built.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use loopcache::ring::Ring;
use loopcache::Node;

fn nodes(n: usize) -> Vec<Node> {
    (0..n)
        .map(|i| Node::new(format!("node-{i}"), 11211 + i as i32, 64 * 1024 * 1024))
        .collect()
}

fn bench_placement(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_placement");
    for &n in &[8usize, 32, 128] {
        group.bench_function(format!("{n}_nodes"), |b| {
            b.iter_batched(
                || nodes(n),
                |nodes| black_box(Ring::from_nodes(nodes).unwrap()),
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

fn bench_lookup(c: &mut Criterion) {
    let ring = Ring::from_nodes(nodes(64)).unwrap();
    let keys: Vec<String> = (0..10_000).map(|i| format!("bench-key-{i}")).collect();

    c.bench_function("owner_for_key_64_nodes", |b| {
        b.iter(|| {
            for key in &keys {
                black_box(ring.owner_for_key(key));
            }
        });
    });
}

criterion_group!(benches, bench_placement, bench_lookup);
criterion_main!(benches);
