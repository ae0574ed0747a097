//! Benchmarks for recipe evaluation, cache lookups and whole merges.
//!
//! Run with: cargo bench -p kitbash-merge

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use kitbash_merge::graph::{evaluate, EvalContext};
use kitbash_merge::{
    CheckpointId, Device, Dtype, MemoryStore, MergeRequest, Merger, MergerConfig, Node, Op,
    PriorMergeStore, ResultCache, Target, Tensor, TensorStore, WeightSet,
};

/// Deterministic test data.
fn generate_test_data(size: usize, phase: f32) -> Tensor {
    let data: Vec<f32> = (0..size)
        .map(|i| (i as f32 * 1.234567 + phase).sin() * 10.0)
        .collect();
    Tensor::from_vec(&[size], data, Dtype::F32).unwrap()
}

fn store(keys: usize, size: usize) -> MemoryStore {
    let mut store = MemoryStore::new();
    for i in 0..keys {
        let key = format!("model.layers.{i}.weight");
        store.insert("a", key.clone(), generate_test_data(size, 0.0));
        store.insert("b", key.clone(), generate_test_data(size, 1.0));
        store.insert("c", key, generate_test_data(size, 2.0));
    }
    store
}

/// Add-difference recipe evaluated with and without a warm cache.
fn bench_evaluate(c: &mut Criterion) {
    let mut group = c.benchmark_group("evaluate_add_difference");
    let (a, b, cc) = (CheckpointId::new("a"), CheckpointId::new("b"), CheckpointId::new("c"));

    for size in [1024, 16384, 262144].iter() {
        let store = store(1, *size);
        let opened = store.open(&[a.clone(), b.clone(), cc.clone()]).unwrap();
        let key = "model.layers.0.weight";
        let diff = Node::cached(key, Op::Sub, vec![Node::load(key, &b), Node::load(key, &cc)]);
        let scaled = Node::new(key, Op::Multiply { alpha: 0.5 }, vec![diff]);
        let root = Node::new(key, Op::Add, vec![Node::load(key, &a), scaled]);

        group.throughput(Throughput::Elements(*size as u64));

        group.bench_with_input(BenchmarkId::new("uncached", size), size, |bench, _| {
            let ctx = EvalContext {
                checkpoints: opened.as_ref(),
                cache: None,
                device: Device::Cpu,
                dtype: Dtype::F32,
            };
            bench.iter(|| evaluate(black_box(&root), &ctx).unwrap());
        });

        let cache = ResultCache::new(1 << 30).with_target(Device::Cpu, Dtype::F32);
        group.bench_with_input(BenchmarkId::new("cached", size), size, |bench, _| {
            let ctx = EvalContext {
                checkpoints: opened.as_ref(),
                cache: Some(&cache),
                device: Device::Cpu,
                dtype: Dtype::F32,
            };
            bench.iter(|| evaluate(black_box(&root), &ctx).unwrap());
        });
    }

    group.finish();
}

/// Smoothing is the most expensive single operator.
fn bench_smooth(c: &mut Criterion) {
    let mut group = c.benchmark_group("smooth");
    for side in [32, 128].iter() {
        let n = side * side;
        let data: Vec<f32> = (0..n).map(|i| (i as f32 * 0.37).sin()).collect();
        let tensor = Tensor::from_vec(&[*side, *side], data, Dtype::F32).unwrap();
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(side), side, |bench, _| {
            bench.iter(|| Op::Smooth.apply("w", std::slice::from_ref(black_box(&tensor))).unwrap());
        });
    }
    group.finish();
}

/// Full merge, cold and with the previous result available for reuse.
fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge");
    let store = store(64, 4096);
    let request = MergeRequest::new("Add Difference", ["a", "b", "c"]).with_target(Target::new(
        "*",
        WeightSet {
            alpha: Some(0.5),
            ..Default::default()
        },
    ));
    let config = MergerConfig {
        threads: 4,
        ..Default::default()
    };

    group.bench_function("cold", |bench| {
        bench.iter(|| {
            let merger = Merger::new(config.clone());
            merger.merge(black_box(&request), &store, None).unwrap()
        });
    });

    let merger = Merger::new(config.clone());
    let mut prior = PriorMergeStore::new();
    prior.record(&merger.merge(&request, &store, None).unwrap());
    group.bench_function("reuse", |bench| {
        bench.iter(|| merger.merge(black_box(&request), &store, prior.get()).unwrap());
    });

    group.finish();
}

criterion_group!(benches, bench_evaluate, bench_smooth, bench_merge);
criterion_main!(benches);
