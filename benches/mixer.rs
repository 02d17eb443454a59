//! Benchmarks for the mixing and normalization hot path.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use voice_pipeline::audio::{hard_limit, mix_chunks, Limiter};

const CHUNK: usize = 960;

fn speaker_chunk(seed: usize) -> Vec<i16> {
    (0..CHUNK)
        .map(|i| (((i * 131 + seed * 977) % 40_000) as i32 - 20_000) as i16)
        .collect()
}

fn bench_mix(c: &mut Criterion) {
    let mut group = c.benchmark_group("mix_chunks");
    for speakers in [1usize, 4, 16] {
        let chunks: Vec<Vec<i16>> = (0..speakers).map(speaker_chunk).collect();
        group.bench_with_input(BenchmarkId::from_parameter(speakers), &chunks, |b, chunks| {
            b.iter(|| mix_chunks(black_box(chunks).iter().map(Vec::as_slice)))
        });
    }
    group.finish();
}

fn bench_normalize(c: &mut Criterion) {
    let chunks: Vec<Vec<i16>> = (0..4).map(speaker_chunk).collect();
    let mix = mix_chunks(chunks.iter().map(Vec::as_slice)).unwrap_or_default();

    c.bench_function("soft_normalize_4_speakers", |b| {
        let mut limiter = Limiter::new();
        b.iter(|| limiter.normalize(black_box(&mix)))
    });

    c.bench_function("hard_limit_4_speakers", |b| {
        b.iter(|| hard_limit(black_box(&mix)))
    });
}

criterion_group!(benches, bench_mix, bench_normalize);
criterion_main!(benches);
