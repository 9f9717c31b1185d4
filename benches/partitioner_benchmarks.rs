//! Partition selection cost per algorithm

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use kafka_alerts::partitioner::{fnv1a_32, murmur2, murmur3_32};
use kafka_alerts::{PartitionAlgorithm, Partitioning};
use std::hint::black_box;

fn alert_ids() -> Vec<Vec<u8>> {
    (0..1000)
        .map(|i| format!("cpu_usage:host=server-{:04},region=us-west", i).into_bytes())
        .collect()
}

fn benchmark_hashes(c: &mut Criterion) {
    let key = b"cpu_usage:host=server-0042,region=us-west";
    let mut group = c.benchmark_group("hash");
    group.bench_function("murmur2", |b| b.iter(|| murmur2(black_box(key))));
    group.bench_function("murmur3", |b| b.iter(|| murmur3_32(black_box(key))));
    group.bench_function("fnv1a", |b| b.iter(|| fnv1a_32(black_box(key))));
    group.bench_function("crc32", |b| b.iter(|| crc32fast::hash(black_box(key))));
    group.finish();
}

fn benchmark_partitioners(c: &mut Criterion) {
    let keys = alert_ids();
    let mut group = c.benchmark_group("partition");

    let strategies = [
        Partitioning::RoundRobin,
        Partitioning::ByKey(PartitionAlgorithm::Crc32),
        Partitioning::ByKey(PartitionAlgorithm::Murmur2),
        Partitioning::ByKey(PartitionAlgorithm::Murmur3),
        Partitioning::ByKey(PartitionAlgorithm::Fnv1a),
    ];
    for strategy in strategies {
        let name = match strategy {
            Partitioning::RoundRobin => "round-robin".to_string(),
            Partitioning::ByKey(algorithm) => algorithm.to_string(),
        };
        let mut partitioner = strategy.new_partitioner();
        group.bench_with_input(BenchmarkId::from_parameter(name), &keys, |b, keys| {
            b.iter(|| {
                for key in keys {
                    black_box(partitioner.partition(Some(key.as_slice()), 12).ok());
                }
            })
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_hashes, benchmark_partitioners);
criterion_main!(benches);
