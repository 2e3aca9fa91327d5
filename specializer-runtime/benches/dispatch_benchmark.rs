//! Benchmarks for dispatch overhead and the learning hot paths

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use specializer_core::{callable, seeded_rng, Callable, Profile, TypeSignature, Value};
use specializer_ml::{
    select_plan_from_predictions, DenseNetwork, FeatureExtractor, PredictorConfig, SpeedupModel,
    FEATURE_DIM,
};
use specializer_runtime::{FunctionConfig, IdentityBuilder, OrchestratorConfig, SpecializationCore};
use std::sync::Arc;

fn add() -> Callable {
    callable(|args: &[Value]| {
        let x = args[0].as_int().unwrap_or(0);
        let y = args[1].as_int().unwrap_or(0);
        Ok(Value::Int(x + y))
    })
}

fn benchmark_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch");
    let args = [Value::Int(1), Value::Int(2)];

    let raw = add();
    group.bench_function("original", |b| b.iter(|| raw(black_box(&args))));

    for &sample_rate in &[0.1, 1.0] {
        let config = OrchestratorConfig {
            defaults: FunctionConfig {
                sample_rate,
                specialize_threshold: 100,
                ..FunctionConfig::default()
            },
            ..OrchestratorConfig::default()
        };
        let core = SpecializationCore::builder(config)
            .variant_builder(Arc::new(IdentityBuilder))
            .build()
            .unwrap();
        let wrapped = core.wrap("add", add()).unwrap();
        // Warm up past the threshold so calls hit the variant
        for _ in 0..2_000 {
            wrapped.call(&args).unwrap();
        }

        group.bench_with_input(
            BenchmarkId::new("wrapped", sample_rate),
            &wrapped,
            |b, wrapped| b.iter(|| wrapped.call(black_box(&args))),
        );
    }
    group.finish();
}

fn benchmark_signature(c: &mut Criterion) {
    let mut group = c.benchmark_group("signature");
    for size in [1usize, 4, 16].iter() {
        let args: Vec<Value> = (0..*size)
            .map(|i| match i % 4 {
                0 => Value::Int(i as i64),
                1 => Value::Float(i as f64 + 0.5),
                2 => Value::String(format!("arg{}", i)),
                _ => Value::array((0..8).map(Value::Int)),
            })
            .collect();
        group.bench_with_input(BenchmarkId::new("build", size), &args, |b, args| {
            b.iter(|| TypeSignature::build(black_box(args)))
        });
    }
    group.finish();
}

fn benchmark_network(c: &mut Criterion) {
    let mut group = c.benchmark_group("network");
    let config = PredictorConfig::default();
    let mut rng = seeded_rng(42);
    let mut network = DenseNetwork::new(config.network_config(1e-3), &mut rng).unwrap();
    let features = FeatureExtractor::new().extract_profile(&Profile::new("bench"));
    assert_eq!(features.len(), FEATURE_DIM);
    let target = [1.2; 7];

    group.bench_function("forward", |b| {
        b.iter(|| network.forward(black_box(&features)).unwrap())
    });
    group.bench_function("train_one", |b| {
        b.iter(|| {
            network
                .train_one(black_box(&features), black_box(&target), &mut rng)
                .unwrap()
        })
    });
    group.finish();
}

fn benchmark_plan_selection(c: &mut Criterion) {
    let predictions = [1.05, 2.30, 1.00, 1.80, 1.00, 1.40, 1.20];
    c.bench_function("select_plan", |b| {
        b.iter(|| select_plan_from_predictions(black_box(&predictions), 10, 0.05))
    });
}

criterion_group!(
    benches,
    benchmark_dispatch,
    benchmark_signature,
    benchmark_network,
    benchmark_plan_selection
);
criterion_main!(benches);
