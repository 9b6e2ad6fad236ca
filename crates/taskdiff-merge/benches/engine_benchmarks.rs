//! Benchmarks for task-vector computation and application.
//!
//! Run with: cargo bench -p taskdiff-merge

use candle_core::{Device, Tensor};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use taskdiff_merge::{ParameterMapping, TaskVector};

/// Deterministic test tensor.
fn generate_test_data(size: usize, phase: f32) -> Tensor {
    let data: Vec<f32> = (0..size)
        .map(|i| (i as f32 * 1.234567 + phase).sin() * 10.0)
        .collect();
    Tensor::from_vec(data, size, &Device::Cpu).unwrap()
}

fn generate_mapping(num_tensors: usize, size: usize, phase: f32) -> ParameterMapping {
    (0..num_tensors)
        .map(|i| {
            (
                format!("model.layers.{}.mlp.up_proj.weight", i),
                generate_test_data(size, phase + i as f32),
            )
        })
        .collect()
}

/// Benchmark diff computation across tensor sizes.
fn bench_between(c: &mut Criterion) {
    let mut group = c.benchmark_group("task_vector_between");

    for size in [1024, 16384, 262144, 1048576].iter() {
        let source = generate_mapping(4, *size, 0.0);
        let base = generate_mapping(4, *size, 0.5);

        group.throughput(Throughput::Elements((*size * 4) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| TaskVector::between(black_box(&source), black_box(&base)).unwrap());
        });
    }

    group.finish();
}

/// Benchmark applying a scaled task vector.
fn bench_apply(c: &mut Criterion) {
    let mut group = c.benchmark_group("task_vector_apply");

    for num_tensors in [8, 32, 128].iter() {
        let size = 65536;
        let source = generate_mapping(*num_tensors, size, 0.0);
        let base = generate_mapping(*num_tensors, size, 0.5);
        let target = generate_mapping(*num_tensors, size, 1.0);
        let task_vector = TaskVector::between(&source, &base).unwrap();

        group.throughput(Throughput::Elements((*num_tensors * size) as u64));
        group.bench_with_input(
            BenchmarkId::new("alpha_0.5", num_tensors),
            num_tensors,
            |b, _| {
                b.iter(|| {
                    task_vector
                        .apply(black_box(target.clone()), 0.5, &mut ())
                        .unwrap()
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_between, bench_apply);
criterion_main!(benches);
