//! End-to-end dispatch tests for the specialization core

use anyhow::anyhow;
use approx::assert_relative_eq;
use parking_lot::Mutex;
use specializer_core::{
    callable, seeded_rng, Callable, CollectingReporter, CoreError, ManualClock, OptimizationPlan,
    ReportLevel, Result, Value,
};
use specializer_ml::{
    AdaptiveLearner, DenseNetwork, LearnerConfig, NetworkSnapshot, OptimizationPredictor,
    PredictorConfig, SpeedupModel,
};
use specializer_runtime::{
    BuildJob, BuildResult, FunctionConfig, IdentityBuilder, OrchestratorConfig, Phase,
    SpecializationCore, VariantBuilder, WrapOptions,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

struct Harness {
    core: SpecializationCore,
    clock: Arc<ManualClock>,
    reporter: Arc<CollectingReporter>,
}

fn every_call(threshold: u64) -> FunctionConfig {
    FunctionConfig {
        sample_rate: 1.0,
        specialize_threshold: threshold,
        ..FunctionConfig::default()
    }
}

fn harness(defaults: FunctionConfig, builder: Arc<dyn VariantBuilder>) -> Harness {
    let clock = Arc::new(ManualClock::new(0.0));
    let reporter = Arc::new(CollectingReporter::new());
    let config = OrchestratorConfig {
        defaults,
        ..OrchestratorConfig::default()
    };
    let core = SpecializationCore::builder(config)
        .clock(clock.clone())
        .reporter(reporter.clone())
        .variant_builder(builder)
        .build()
        .unwrap();
    Harness {
        core,
        clock,
        reporter,
    }
}

/// `x + y` that takes `cost_ms` of manual-clock time
fn timed_add(clock: Arc<ManualClock>, cost_ms: f64) -> Callable {
    callable(move |args: &[Value]| {
        clock.advance(cost_ms);
        let x = args[0].as_int().ok_or_else(|| anyhow!("x must be an integer"))?;
        let y = args[1].as_int().ok_or_else(|| anyhow!("y must be an integer"))?;
        Ok(Value::Int(x + y))
    })
}

fn counting_builder(
    calls: Arc<AtomicUsize>,
    result: impl Fn() -> BuildResult + Send + Sync + 'static,
) -> Arc<dyn VariantBuilder> {
    Arc::new(move |_: &Callable, _: &OptimizationPlan, _: &str| -> BuildResult {
        calls.fetch_add(1, Ordering::SeqCst);
        result()
    })
}

#[test]
fn test_dispatch_with_identity_builder() {
    let h = harness(every_call(100), Arc::new(IdentityBuilder));
    let add = h.core.wrap("add", timed_add(h.clock.clone(), 1.0)).unwrap();
    let args = [Value::Int(1), Value::Int(2)];

    for _ in 0..99 {
        assert_eq!(add.call(&args).unwrap().as_int(), Some(3));
    }
    assert_eq!(h.core.profile("add").unwrap().total_calls, 99);
    let stats = h.core.get_statistics();
    assert!(stats.per_function["add"].variants.is_empty());
    assert_eq!(h.core.phase("add"), Some(Phase::Observed));

    assert_eq!(add.call(&args).unwrap().as_int(), Some(3));
    let stats = h.core.get_statistics();
    let function = &stats.per_function["add"];
    assert_eq!(function.phase, Phase::Serving);
    assert!(!function.variants.is_empty());
    assert!(function.variants.iter().all(|v| v.signature == "int32,int32"));
    assert!(function.variants.iter().all(|v| !v.optimizations.is_empty()));
    assert!(function.variants.iter().all(|v| v.use_count == 0));

    assert_eq!(add.call(&args).unwrap().as_int(), Some(3));
    let stats = h.core.get_statistics();
    let served: u64 = stats.per_function["add"].variants.iter().map(|v| v.use_count).sum();
    assert_eq!(served, 1);
}

#[test]
fn test_user_errors_propagate_and_are_recorded() {
    let h = harness(every_call(100), Arc::new(IdentityBuilder));
    let add = h.core.wrap("add", timed_add(h.clock.clone(), 1.0)).unwrap();

    let err = add
        .call(&[Value::String("one".into()), Value::Int(2)])
        .unwrap_err();
    assert_eq!(err.to_string(), "x must be an integer");

    let profile = h.core.profile("add").unwrap();
    assert_eq!(profile.total_calls, 1);
    assert_eq!(profile.failures(), 1);
    assert_eq!(profile.signatures["string,int32"].failures, 1);
}

#[test]
fn test_empty_argument_tuple() {
    let h = harness(every_call(100), Arc::new(IdentityBuilder));
    let answer = h
        .core
        .wrap("answer", callable(|_: &[Value]| Ok(Value::Int(42))))
        .unwrap();

    assert_eq!(answer.call(&[]).unwrap().as_int(), Some(42));
    let profile = h.core.profile("answer").unwrap();
    assert!(profile.signatures.contains_key(""));
}

#[test]
fn test_builder_failures_suppress_until_reset() {
    let calls = Arc::new(AtomicUsize::new(0));
    let builder = counting_builder(calls.clone(), || Err(anyhow!("no code generator")));
    let h = harness(every_call(10), builder);
    let add = h.core.wrap("add", timed_add(h.clock.clone(), 1.0)).unwrap();
    let args = [Value::Int(1), Value::Int(2)];

    for _ in 0..10 {
        assert_eq!(add.call(&args).unwrap().as_int(), Some(3));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.core.phase("add"), Some(Phase::Observed));

    // Back-off: the next attempt waits for another threshold of calls
    for _ in 0..10 {
        add.call(&args).unwrap();
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    for _ in 0..40 {
        assert_eq!(add.call(&args).unwrap().as_int(), Some(3));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let stats = h.core.get_statistics();
    assert!(stats.per_function["add"].suppressed);
    assert_eq!(stats.per_function["add"].consecutive_failures, 2);
    // Two failures plus the suppression notice
    assert_eq!(h.reporter.count(ReportLevel::Warn), 3);

    h.core.reset(Some("add"), false);
    add.call(&args).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[test]
fn test_declining_builder_backs_off() {
    let calls = Arc::new(AtomicUsize::new(0));
    let builder = counting_builder(calls.clone(), || Ok(None));
    let h = harness(every_call(10), builder);
    let add = h.core.wrap("add", timed_add(h.clock.clone(), 1.0)).unwrap();
    let args = [Value::Int(1), Value::Int(2)];

    for _ in 0..19 {
        add.call(&args).unwrap();
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    add.call(&args).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let stats = h.core.get_statistics();
    assert!(!stats.per_function["add"].suppressed);
    assert!(stats.per_function["add"].variants.is_empty());
    let declines = h
        .reporter
        .entries()
        .into_iter()
        .filter(|e| e.level == ReportLevel::Info && e.message.starts_with("Builder declined"))
        .count();
    assert_eq!(declines, 2);
}

/// Builder whose jobs finish when the test sends on their channel
#[derive(Default)]
struct ChannelBuilder {
    senders: Mutex<Vec<oneshot::Sender<BuildResult>>>,
}

impl VariantBuilder for ChannelBuilder {
    fn build(&self, _original: &Callable, _plan: &OptimizationPlan, _signature: &str) -> BuildJob {
        let (tx, job) = BuildJob::channel();
        self.senders.lock().push(tx);
        job
    }
}

#[test]
fn test_pending_build_becomes_visible_on_next_call() {
    let builder = Arc::new(ChannelBuilder::default());
    let h = harness(every_call(10), builder.clone());
    let add = h.core.wrap("add", timed_add(h.clock.clone(), 1.0)).unwrap();
    let args = [Value::Int(1), Value::Int(2)];

    for _ in 0..11 {
        assert_eq!(add.call(&args).unwrap().as_int(), Some(3));
    }
    assert_eq!(h.core.phase("add"), Some(Phase::Specializing));
    assert_eq!(h.core.get_statistics().per_function["add"].pending_builds, 1);

    let tx = builder.senders.lock().pop().unwrap();
    assert!(tx.send(Ok(Some(add.original().clone()))).is_ok());

    add.call(&args).unwrap();
    let stats = h.core.get_statistics();
    assert_eq!(stats.per_function["add"].phase, Phase::Serving);
    assert_eq!(stats.per_function["add"].variants[0].use_count, 1);
}

#[test]
fn test_abandoned_build_stays_specializing() {
    let builder = Arc::new(ChannelBuilder::default());
    let h = harness(every_call(10), builder.clone());
    let add = h.core.wrap("add", timed_add(h.clock.clone(), 1.0)).unwrap();
    let args = [Value::Int(1), Value::Int(2)];

    for _ in 0..10 {
        add.call(&args).unwrap();
    }
    builder.senders.lock().clear();

    for _ in 0..50 {
        assert_eq!(add.call(&args).unwrap().as_int(), Some(3));
    }
    assert_eq!(h.core.phase("add"), Some(Phase::Specializing));
    assert!(builder.senders.lock().is_empty());

    h.core.reset(Some("add"), false);
    add.call(&args).unwrap();
    assert_eq!(builder.senders.lock().len(), 1);
}

#[test]
fn test_invalid_config_creates_no_state() {
    let h = harness(every_call(10), Arc::new(IdentityBuilder));
    let options = WrapOptions {
        config: Some(FunctionConfig {
            sample_rate: 0.0,
            ..FunctionConfig::default()
        }),
        builder: None,
    };

    let result = h
        .core
        .wrap_with("add", timed_add(h.clock.clone(), 1.0), options);
    assert!(matches!(result, Err(CoreError::InvalidConfig { .. })));
    assert!(h.core.get_statistics().per_function.is_empty());
    assert!(h.core.phase("add").is_none());
}

#[test]
fn test_auto_prune_returns_to_observed() {
    let config = FunctionConfig {
        prune_interval_calls: 5,
        prune_min_use_count: 1000,
        prune_max_age_ms: 10.0,
        ..every_call(10)
    };
    let h = harness(config, Arc::new(IdentityBuilder));
    let add = h.core.wrap("add", timed_add(h.clock.clone(), 1.0)).unwrap();
    let args = [Value::Int(1), Value::Int(2)];

    for _ in 0..20 {
        add.call(&args).unwrap();
    }
    assert_eq!(h.core.phase("add"), Some(Phase::Serving));

    // The variant created at t=10 is older than 10ms by the prune at call 25
    for _ in 0..10 {
        add.call(&args).unwrap();
    }
    let stats = h.core.get_statistics();
    assert_eq!(stats.per_function["add"].phase, Phase::Observed);
    assert!(stats.per_function["add"].variants.is_empty());

    for _ in 0..5 {
        add.call(&args).unwrap();
    }
    let stats = h.core.get_statistics();
    let function = &stats.per_function["add"];
    assert_eq!(function.phase, Phase::Serving);
    assert_eq!(function.specializations, 2);
    assert_eq!(function.variants[0].id, "add#1");
}

#[test]
fn test_measured_speedup_trains_learner() {
    let clock = Arc::new(ManualClock::new(0.0));
    let fast_clock = clock.clone();
    let builder: Arc<dyn VariantBuilder> =
        Arc::new(move |_: &Callable, _: &OptimizationPlan, _: &str| -> BuildResult {
            Ok(Some(timed_add(fast_clock.clone(), 1.0)))
        });
    let config = OrchestratorConfig {
        defaults: FunctionConfig {
            observation_interval: 5,
            ..every_call(10)
        },
        ..OrchestratorConfig::default()
    };
    let core = SpecializationCore::builder(config)
        .clock(clock.clone())
        .variant_builder(builder)
        .build()
        .unwrap();
    let add = core.wrap("add", timed_add(clock.clone(), 2.0)).unwrap();
    let args = [Value::Int(1), Value::Int(2)];

    for _ in 0..20 {
        assert_eq!(add.call(&args).unwrap().as_int(), Some(3));
    }

    let stats = core.get_statistics();
    assert_eq!(stats.predictor.iterations, 2);
    assert_eq!(stats.replay.size, 2);
    assert_relative_eq!(
        stats.per_function["add"].last_speedup.unwrap(),
        2.0,
        epsilon = 1e-9
    );
}

#[test]
fn test_explicit_observation() {
    let h = harness(every_call(10), Arc::new(IdentityBuilder));
    h.core.wrap("add", timed_add(h.clock.clone(), 1.0)).unwrap();

    let outcome = h.core.observe("add", "int32,int32", 1.5).unwrap();
    assert!(matches!(
        outcome,
        specializer_ml::ObservationOutcome::Trained { .. }
    ));
    let outcome = h
        .core
        .observe_per_optimization("add", "int32,int32", 1.5, [Some(1.2), None, None, None, None, None, None])
        .unwrap();
    assert!(matches!(
        outcome,
        specializer_ml::ObservationOutcome::Trained { .. }
    ));
    assert_eq!(h.core.get_statistics().predictor.iterations, 2);
}

#[test]
fn test_ml_selector_tries_untried_variant_first() {
    let config = FunctionConfig {
        use_ml_selector: true,
        ..every_call(1000)
    };
    let h = harness(config, Arc::new(IdentityBuilder));
    let add = h.core.wrap("add", timed_add(h.clock.clone(), 1.0)).unwrap();

    let slow = h
        .core
        .register_variant("add", "int32,int32", timed_add(h.clock.clone(), 3.0), None)
        .unwrap();
    let plan = OptimizationPlan {
        predicted_speedup: 2.0,
        ..OptimizationPlan::empty()
    };
    let fast = h
        .core
        .register_variant("add", "int32,int32", timed_add(h.clock.clone(), 1.0), Some(plan))
        .unwrap();

    let args = [Value::Int(1), Value::Int(2)];
    add.call(&args).unwrap();
    add.call(&args).unwrap();
    let stats = h.core.get_statistics();
    let uses = |id: &str| {
        stats.per_function["add"]
            .variants
            .iter()
            .find(|v| v.id == id)
            .map(|v| v.use_count)
    };
    // Highest expected speedup first, then the other untried one
    assert_eq!(uses(&fast), Some(1));
    assert_eq!(uses(&slow), Some(1));

    for _ in 0..5 {
        add.call(&args).unwrap();
    }
    let stats = h.core.get_statistics();
    let fast_uses = stats.per_function["add"]
        .variants
        .iter()
        .find(|v| v.id == fast)
        .map(|v| v.use_count);
    assert_eq!(fast_uses, Some(6));
}

#[test]
fn test_statistics_serialize_camel_case() {
    let h = harness(every_call(10), Arc::new(IdentityBuilder));
    let add = h.core.wrap("add", timed_add(h.clock.clone(), 1.0)).unwrap();
    add.call(&[Value::Int(1), Value::Int(2)]).unwrap();

    let json = serde_json::to_value(h.core.get_statistics()).unwrap();
    assert!(json["perFunction"]["add"]["totalCalls"].is_u64());
    assert!(json["predictor"]["currentLr"].is_f64());
    assert!(json["predictor"]["improvementTrend"].is_number());
    assert_eq!(json["replay"]["max"], 1000);
    assert_eq!(json["replay"]["size"], 0);
}

/// Network whose training always blows up
struct ExplodingModel {
    inner: DenseNetwork,
}

impl SpeedupModel for ExplodingModel {
    fn input_dim(&self) -> usize {
        self.inner.input_dim()
    }

    fn output_dim(&self) -> usize {
        self.inner.output_dim()
    }

    fn forward(&self, input: &[f64]) -> Result<Vec<f64>> {
        self.inner.forward(input)
    }

    fn train_one(&mut self, _input: &[f64], _target: &[f64], _rng: &mut dyn rand::RngCore) -> Result<f64> {
        Err(CoreError::numerical_instability("loss is not finite"))
    }

    fn learning_rate(&self) -> f64 {
        self.inner.learning_rate()
    }

    fn set_learning_rate(&mut self, learning_rate: f64) {
        self.inner.set_learning_rate(learning_rate)
    }

    fn snapshot(&self) -> NetworkSnapshot {
        self.inner.snapshot()
    }

    fn restore(&mut self, snapshot: &NetworkSnapshot) -> Result<()> {
        self.inner.restore(snapshot)
    }

    fn reinitialize(&mut self, rng: &mut dyn rand::RngCore) {
        self.inner.reinitialize(rng)
    }
}

#[test]
fn test_degraded_learner_keeps_dispatching() {
    let predictor_config = PredictorConfig::default();
    let mut rng = seeded_rng(3);
    let model = ExplodingModel {
        inner: DenseNetwork::new(predictor_config.network_config(1e-3), &mut rng).unwrap(),
    };
    let predictor = OptimizationPredictor::with_model(Box::new(model), predictor_config).unwrap();
    let learner =
        AdaptiveLearner::with_predictor(LearnerConfig::default(), predictor, Box::new(rng)).unwrap();

    let clock = Arc::new(ManualClock::new(0.0));
    let reporter = Arc::new(CollectingReporter::new());
    let config = OrchestratorConfig {
        defaults: FunctionConfig {
            observation_interval: 1,
            ..every_call(10)
        },
        ..OrchestratorConfig::default()
    };
    let core = SpecializationCore::builder(config)
        .clock(clock.clone())
        .reporter(reporter.clone())
        .variant_builder(Arc::new(IdentityBuilder))
        .learner(learner)
        .build()
        .unwrap();
    let add = core.wrap("add", timed_add(clock.clone(), 1.0)).unwrap();
    let args = [Value::Int(1), Value::Int(2)];

    for _ in 0..30 {
        assert_eq!(add.call(&args).unwrap().as_int(), Some(3));
    }
    let stats = core.get_statistics();
    assert!(stats.predictor.degraded);
    assert_eq!(stats.predictor.iterations, 0);
    assert_eq!(stats.per_function["add"].phase, Phase::Serving);
    assert!(reporter
        .entries()
        .iter()
        .any(|e| e.level == ReportLevel::Warn && e.message == "learner degraded"));

    // Plans still come from the last good weights
    assert!(core.predict_plan("add").is_ok());

    core.reset(None, false);
    assert!(!core.get_statistics().predictor.degraded);
}
