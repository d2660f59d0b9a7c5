use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use mnemo_memory::{FlatIndex, NumericId, SimilarityIndex};

const DIM: usize = 384;

/// Deterministic pseudo-random unit vector.
fn unit_vector(seed: u64) -> Vec<f32> {
    let mut state = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
    let mut v: Vec<f32> = (0..DIM)
        .map(|_| {
            state = state
                .wrapping_mul(6_364_136_223_846_793_005)
                .wrapping_add(1_442_695_040_888_963_407);
            #[allow(clippy::cast_precision_loss)]
            let x = (state >> 40) as f32 / (1u64 << 24) as f32;
            x - 0.5
        })
        .collect();
    mnemo_memory::index::normalize(&mut v).unwrap();
    v
}

fn populated(n: u64) -> FlatIndex {
    let index = FlatIndex::new();
    let entries = (1..=n)
        .map(|i| (NumericId(i.cast_signed()), unit_vector(i)))
        .collect();
    index.replace_all(entries).unwrap();
    index
}

fn flat_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("flat_search");
    let query = unit_vector(u64::MAX);

    for size in [1_000u64, 10_000, 50_000] {
        let index = populated(size);
        group.throughput(Throughput::Elements(size));
        group.bench_with_input(BenchmarkId::new("k10", size), &index, |b, index| {
            b.iter(|| index.search(black_box(&query), 10).unwrap());
        });
    }

    group.finish();
}

fn flat_add(c: &mut Criterion) {
    let vectors: Vec<Vec<f32>> = (0..1_000).map(unit_vector).collect();

    c.bench_function("flat_add_1000", |b| {
        b.iter(|| {
            let index = FlatIndex::new();
            for (i, v) in vectors.iter().enumerate() {
                index
                    .add(NumericId(i64::try_from(i).unwrap()), v.clone())
                    .unwrap();
            }
            black_box(index.len())
        });
    });
}

criterion_group!(benches, flat_search, flat_add);
criterion_main!(benches);
