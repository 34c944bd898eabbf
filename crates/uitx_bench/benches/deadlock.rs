//! Cross-lock check benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use uitx_bench::{random_snapshot, ring_snapshot};
use uitx_core::lock::deadlock::find_victims;

/// Benchmark victim selection on a single ring.
fn bench_ring(c: &mut Criterion) {
    let mut group = c.benchmark_group("cross_lock_ring");

    for size in [2usize, 16, 128].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let snapshot = ring_snapshot(size);
            b.iter(|| black_box(find_victims(black_box(&snapshot))));
        });
    }
    group.finish();
}

/// Benchmark victim selection on random wait-for graphs.
fn bench_random(c: &mut Criterion) {
    let mut group = c.benchmark_group("cross_lock_random");

    for size in [16usize, 128].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let snapshot = random_snapshot(size);
            b.iter(|| black_box(find_victims(black_box(&snapshot))));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_ring, bench_random);
criterion_main!(benches);
