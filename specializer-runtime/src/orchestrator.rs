//! The specialization core
//!
//! [`SpecializationCore`] wraps host callables, profiles their calls, asks
//! the learner for an optimization plan once a function gets hot, hands the
//! plan to a [`VariantBuilder`] and then dispatches calls to the best
//! registered variant. Measured speedups of served variants flow back into
//! the learner.
//!
//! All mutable state sits behind one mutex. The lock is released while the
//! wrapped callable or a builder runs, so user code may re-enter the core.

use crate::builder::{BuildResult, JobStatus, VariantBuilder};
use crate::config::{FunctionConfig, OrchestratorConfig};
use crate::profiler::RuntimeProfiler;
use crate::registry::{VariantRegistry, VariantSpec};
use crate::snapshot::{self, CoreSnapshot, SNAPSHOT_VERSION};
use crate::state::{BuildTarget, FunctionState, PendingBuild, Phase};
use crate::stats::{
    CoreStatistics, FunctionStatistics, PredictorStatistics, ReplayStatistics, VariantStatistics,
};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use specializer_core::reporter::report_context;
use specializer_core::{
    callable, seeded_rng, BoxedRng, Callable, Clock, ContextMetadata, CoreError, MemoryProbe,
    MonotonicClock, NoMemoryProbe, OptimizationPlan, Profile, ReportLevel, Reporter, Result,
    StaticMetadata, TracingReporter, TypeSignature, Value, VariantSelector, NUM_OPTIMIZATIONS,
};
use specializer_ml::{AdaptiveLearner, FeatureSource, ObservationOutcome, RuntimeContext};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Consecutive builder failures after which a function stops specializing
const MAX_CONSECUTIVE_FAILURES: u32 = 2;

/// Per-wrap overrides
#[derive(Default, Clone)]
pub struct WrapOptions {
    /// Replaces the core's default function config
    pub config: Option<FunctionConfig>,
    /// Replaces the core's default builder
    pub builder: Option<Arc<dyn VariantBuilder>>,
}

/// Builder for a [`SpecializationCore`]
pub struct CoreBuilder {
    config: OrchestratorConfig,
    clock: Arc<dyn Clock>,
    memory: Arc<dyn MemoryProbe>,
    reporter: Arc<dyn Reporter>,
    variant_builder: Option<Arc<dyn VariantBuilder>>,
    learner: Option<AdaptiveLearner>,
}

impl CoreBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn memory_probe(mut self, memory: Arc<dyn MemoryProbe>) -> Self {
        self.memory = memory;
        self
    }

    pub fn reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Default builder for wrapped functions
    pub fn variant_builder(mut self, builder: Arc<dyn VariantBuilder>) -> Self {
        self.variant_builder = Some(builder);
        self
    }

    /// Use a prepared learner instead of one built from the config
    pub fn learner(mut self, learner: AdaptiveLearner) -> Self {
        self.learner = Some(learner);
        self
    }

    pub fn build(self) -> Result<SpecializationCore> {
        self.config.validate()?;
        let learner = match self.learner {
            Some(learner) => learner,
            None => AdaptiveLearner::new(self.config.learner.clone(), self.config.predictor.clone())?,
        };
        let rng: BoxedRng = Box::new(seeded_rng(self.config.predictor.seed.wrapping_add(1)));
        let profiler = RuntimeProfiler::new(
            self.config.defaults.sample_rate,
            self.clock.clone(),
            self.memory,
            rng,
        );

        info!(
            sample_rate = self.config.defaults.sample_rate,
            threshold = self.config.defaults.specialize_threshold,
            budget = self.config.defaults.budget,
            "specialization core ready"
        );
        Ok(SpecializationCore {
            inner: Arc::new(Mutex::new(CoreInner {
                config: self.config,
                default_builder: self.variant_builder,
                profiler,
                registry: VariantRegistry::new(),
                learner,
                functions: FxHashMap::default(),
            })),
            clock: self.clock,
            reporter: self.reporter,
        })
    }
}

/// Shared handle to the profiler, registry and learner
#[derive(Clone)]
pub struct SpecializationCore {
    inner: Arc<Mutex<CoreInner>>,
    clock: Arc<dyn Clock>,
    reporter: Arc<dyn Reporter>,
}

impl fmt::Debug for SpecializationCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("SpecializationCore")
            .field("functions", &inner.functions.len())
            .field("variants", &inner.registry.len())
            .field("learner", &inner.learner)
            .finish_non_exhaustive()
    }
}

/// A wrapped function; calls go through the core's dispatch
#[derive(Clone)]
pub struct Wrapped {
    core: SpecializationCore,
    func_id: Arc<str>,
    original: Callable,
}

impl fmt::Debug for Wrapped {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wrapped")
            .field("func_id", &self.func_id)
            .finish_non_exhaustive()
    }
}

impl Wrapped {
    /// Call the function. Errors from the host callable come back unchanged.
    pub fn call(&self, args: &[Value]) -> anyhow::Result<Value> {
        self.core.dispatch(&self.func_id, &self.original, args)
    }

    pub fn func_id(&self) -> &str {
        &self.func_id
    }

    pub fn original(&self) -> &Callable {
        &self.original
    }

    /// The wrapper as a plain [`Callable`]
    pub fn into_callable(self) -> Callable {
        callable(move |args: &[Value]| self.call(args))
    }
}

/// Builds started at the end of a call, run with the lock released
struct BuildRequest {
    builder: Arc<dyn VariantBuilder>,
    original: Callable,
    builds: Vec<(String, OptimizationPlan)>,
}

struct CallRecord<'a> {
    func_id: &'a str,
    signature: &'a str,
    variant_id: Option<&'a str>,
    elapsed_ms: f64,
    success: bool,
}

struct CoreInner {
    config: OrchestratorConfig,
    default_builder: Option<Arc<dyn VariantBuilder>>,
    profiler: RuntimeProfiler,
    registry: VariantRegistry,
    learner: AdaptiveLearner,
    functions: FxHashMap<String, FunctionState>,
}

impl SpecializationCore {
    /// Core with the monotonic clock, no memory probe and `tracing` reports
    pub fn new(config: OrchestratorConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: OrchestratorConfig) -> CoreBuilder {
        CoreBuilder {
            config,
            clock: Arc::new(MonotonicClock::new()),
            memory: Arc::new(NoMemoryProbe),
            reporter: Arc::new(TracingReporter),
            variant_builder: None,
            learner: None,
        }
    }

    /// Wrap `original` under `func_id` with the default config and builder
    pub fn wrap(&self, func_id: impl Into<String>, original: Callable) -> Result<Wrapped> {
        self.wrap_with(func_id, original, WrapOptions::default())
    }

    /// Wrap with per-function overrides. Wrapping an id again replaces its
    /// callable, config and builder but keeps its profile and variants.
    pub fn wrap_with(
        &self,
        func_id: impl Into<String>,
        original: Callable,
        options: WrapOptions,
    ) -> Result<Wrapped> {
        let func_id = func_id.into();
        let needs_rehydrate = {
            let mut inner = self.inner.lock();
            let config = options
                .config
                .unwrap_or_else(|| inner.config.defaults.clone());
            config.validate()?;
            let builder = options.builder.or_else(|| inner.default_builder.clone());

            inner.profiler.set_sample_rate(&func_id, config.sample_rate);
            let state = inner
                .functions
                .entry(func_id.clone())
                .or_insert_with(|| FunctionState::new(config.clone()));
            state.config = config;
            state.original = Some(original.clone());
            state.builder = builder;
            debug!(func_id = %func_id, "wrapped function");
            !inner.registry.missing_callables(&func_id).is_empty()
        };
        if needs_rehydrate {
            self.rehydrate(&func_id)?;
        }

        Ok(Wrapped {
            core: self.clone(),
            func_id: Arc::from(func_id),
            original,
        })
    }

    fn dispatch(&self, func_id: &str, original: &Callable, args: &[Value]) -> anyhow::Result<Value> {
        let signature = TypeSignature::build(args);
        let (token, selected) = {
            let mut inner = self.inner.lock();
            inner.poll_builds(func_id, self.clock.now_ms(), self.reporter.as_ref());
            let token = inner.profiler.start_call_with_signature(func_id, &signature);
            (token, inner.select_variant(func_id, &signature))
        };

        let target = selected.as_ref().map_or(original, |(_, c)| c);
        let started = self.clock.now_ms();
        let result = target(args);
        let elapsed_ms = (self.clock.now_ms() - started).max(0.0);

        let request = {
            let mut inner = self.inner.lock();
            inner.profiler.end_call(token, result.is_ok());
            inner.finish_call(
                CallRecord {
                    func_id,
                    signature: &signature,
                    variant_id: selected.as_ref().map(|(id, _)| id.as_str()),
                    elapsed_ms,
                    success: result.is_ok(),
                },
                self.clock.now_ms(),
                self.reporter.as_ref(),
            )
        };
        if let Some(request) = request {
            self.run_builds(func_id, request);
        }
        result
    }

    fn run_builds(&self, func_id: &str, request: BuildRequest) {
        let jobs: Vec<PendingBuild> = request
            .builds
            .into_iter()
            .map(|(signature, plan)| {
                let job = request.builder.build(&request.original, &plan, &signature);
                PendingBuild {
                    target: BuildTarget::NewVariant { signature, plan },
                    job,
                }
            })
            .collect();

        let mut inner = self.inner.lock();
        if let Some(state) = inner.functions.get_mut(func_id) {
            state.pending.extend(jobs);
        }
        inner.poll_builds(func_id, self.clock.now_ms(), self.reporter.as_ref());
    }

    /// Feed a measured speedup of the variant currently serving `signature`
    pub fn observe(&self, func_id: &str, signature: &str, measured_speedup: f64) -> Result<ObservationOutcome> {
        self.observe_inner(func_id, signature, measured_speedup, None)
    }

    /// [`observe`](Self::observe) with host-measured per-optimization
    /// speedups that replace the attributed ones
    pub fn observe_per_optimization(
        &self,
        func_id: &str,
        signature: &str,
        measured_speedup: f64,
        overrides: [Option<f64>; NUM_OPTIMIZATIONS],
    ) -> Result<ObservationOutcome> {
        self.observe_inner(func_id, signature, measured_speedup, Some(&overrides))
    }

    fn observe_inner(
        &self,
        func_id: &str,
        signature: &str,
        measured_speedup: f64,
        overrides: Option<&[Option<f64>; NUM_OPTIMIZATIONS]>,
    ) -> Result<ObservationOutcome> {
        let mut inner = self.inner.lock();
        if !inner.functions.contains_key(func_id) {
            return Err(CoreError::UnknownFunction(func_id.to_string()));
        }
        let plan = inner
            .registry
            .variants(func_id)
            .iter()
            .rev()
            .find(|v| !v.is_generic() && TypeSignature::matches(&v.signature, signature))
            .map(|v| v.plan.clone())
            .unwrap_or_else(OptimizationPlan::empty);
        Ok(inner.learn(
            func_id,
            &plan,
            measured_speedup,
            overrides,
            self.clock.now_ms(),
            self.reporter.as_ref(),
        ))
    }

    /// Encode the learner, registry, profiles and per-function state
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        let inner = self.inner.lock();
        let snapshot = CoreSnapshot {
            version: SNAPSHOT_VERSION,
            learner: inner.learner.snapshot(),
            registry: inner.registry.snapshot(),
            profiler: inner.profiler.snapshot(),
            functions: inner
                .functions
                .iter()
                .map(|(id, state)| (id.clone(), state.snapshot()))
                .collect(),
        };
        snapshot::encode(&snapshot)
    }

    /// Replace all state with a snapshot. On error nothing changes.
    ///
    /// Restored variants have no callable; functions that are already
    /// wrapped are rehydrated through their builder right away.
    pub fn restore(&self, bytes: &[u8]) -> Result<()> {
        let snapshot = snapshot::decode(bytes)?;
        let registry = VariantRegistry::from_snapshot(snapshot.registry);
        let wrapped: Vec<String> = {
            let mut inner = self.inner.lock();
            inner.learner.restore(&snapshot.learner)?;
            inner.registry = registry;
            inner.profiler.restore(snapshot.profiler);

            let mut saved = snapshot.functions;
            for (func_id, state) in inner.functions.iter_mut() {
                match saved.remove(func_id) {
                    Some(function) => state.apply_snapshot(function),
                    None => {
                        state.reset_specialization();
                        state.baselines.clear();
                    }
                }
            }
            for (func_id, function) in saved {
                let mut state = FunctionState::new(function.config.clone());
                state.apply_snapshot(function);
                inner.functions.insert(func_id, state);
            }
            info!(
                functions = inner.functions.len(),
                variants = inner.registry.len(),
                "restored snapshot"
            );
            inner
                .functions
                .iter()
                .filter(|(_, s)| s.original.is_some())
                .map(|(id, _)| id.clone())
                .collect()
        };

        for func_id in wrapped {
            self.rehydrate(&func_id)?;
        }
        Ok(())
    }

    /// Rebuild callables for restored variants of a wrapped function.
    ///
    /// Generic variants get the original callable; the rest go through the
    /// function's builder. Returns how many variants became live right away.
    pub fn rehydrate(&self, func_id: &str) -> Result<usize> {
        let (builder, original, targets) = {
            let inner = self.inner.lock();
            let state = inner
                .functions
                .get(func_id)
                .ok_or_else(|| CoreError::UnknownFunction(func_id.to_string()))?;
            let Some(original) = state.original.clone() else {
                return Ok(0);
            };
            let targets: Vec<(String, String, OptimizationPlan)> = inner
                .registry
                .missing_callables(func_id)
                .into_iter()
                .map(|v| (v.id.clone(), v.signature.clone(), v.plan.clone()))
                .collect();
            (state.builder.clone(), original, targets)
        };

        let mut immediate: Vec<(String, BuildResult)> = Vec::new();
        let mut jobs = Vec::new();
        for (variant_id, signature, plan) in targets {
            if TypeSignature::is_generic(&signature) {
                immediate.push((variant_id, Ok(Some(original.clone()))));
                continue;
            }
            let Some(builder) = &builder else {
                continue;
            };
            let mut job = builder.build(&original, &plan, &signature);
            match job.poll() {
                JobStatus::Done(result) => immediate.push((variant_id, result)),
                JobStatus::Running => jobs.push(PendingBuild {
                    target: BuildTarget::Rehydrate { variant_id },
                    job,
                }),
                JobStatus::Abandoned => {}
            }
        }

        let mut inner = self.inner.lock();
        let now = self.clock.now_ms();
        let mut live = 0;
        for (variant_id, result) in immediate {
            if inner.apply_build(func_id, BuildTarget::Rehydrate { variant_id }, result, now, self.reporter.as_ref()) {
                live += 1;
            }
        }
        if let Some(state) = inner.functions.get_mut(func_id) {
            state.pending.extend(jobs);
        }
        Ok(live)
    }

    /// Register a host-built variant; `plan` defaults to an empty plan
    pub fn register_variant(
        &self,
        func_id: &str,
        signature: &str,
        variant: Callable,
        plan: Option<OptimizationPlan>,
    ) -> Result<String> {
        let mut inner = self.inner.lock();
        if !inner.functions.contains_key(func_id) {
            return Err(CoreError::UnknownFunction(func_id.to_string()));
        }
        let spec = VariantSpec::from_plan(signature, variant, plan.unwrap_or_else(OptimizationPlan::empty));
        let id = inner.registry.register(func_id, spec, self.clock.now_ms());
        let serving = inner.registry.non_generic_count(func_id) > 0;
        if let Some(state) = inner.functions.get_mut(func_id) {
            if serving && state.phase == Phase::Observed {
                state.phase = Phase::Serving;
            }
        }
        Ok(id)
    }

    /// Prune every function with its own thresholds; returns the number of
    /// removed variants
    pub fn prune_all(&self) -> usize {
        let mut inner = self.inner.lock();
        let now = self.clock.now_ms();
        let mut ids: Vec<String> = inner.functions.keys().cloned().collect();
        ids.sort();
        ids.iter().map(|id| inner.prune_function(id, now)).sum()
    }

    /// Drop variants and failure history of one function, or of all
    /// functions plus the learner's degraded state when `func_id` is `None`
    pub fn reset(&self, func_id: Option<&str>, clear_profile: bool) {
        let mut inner = self.inner.lock();
        let ids: Vec<String> = match func_id {
            Some(id) => vec![id.to_string()],
            None => inner.functions.keys().cloned().collect(),
        };
        for id in &ids {
            inner.reset_function(id, clear_profile);
        }
        if func_id.is_none() && inner.learner.is_degraded() {
            inner.learner.reset();
        }
        info!(functions = ids.len(), clear_profile, "reset specialization state");
    }

    /// Roll the learner back to its last good weights and leave the
    /// degraded state
    pub fn reset_learner(&self) {
        self.inner.lock().learner.reset();
    }

    pub fn set_static_metadata(&self, func_id: &str, metadata: StaticMetadata) {
        self.inner.lock().state_entry(func_id).static_info = Some(metadata);
    }

    pub fn set_context_metadata(&self, func_id: &str, metadata: ContextMetadata) {
        self.inner.lock().state_entry(func_id).context = Some(metadata);
    }

    pub fn phase(&self, func_id: &str) -> Option<Phase> {
        self.inner.lock().functions.get(func_id).map(|s| s.phase)
    }

    pub fn profile(&self, func_id: &str) -> Option<Profile> {
        self.inner.lock().profiler.profile(func_id).cloned()
    }

    /// Functions in the top `fraction` by profiled calls
    pub fn hot_functions(&self, fraction: f64) -> Vec<String> {
        self.inner.lock().profiler.hot_functions(fraction)
    }

    /// Hot signatures of one function, most frequent first
    pub fn hot_path(&self, func_id: &str) -> Vec<String> {
        self.inner.lock().profiler.hot_path(func_id)
    }

    /// Predicted plan for a function's current profile
    pub fn predict_plan(&self, func_id: &str) -> Result<OptimizationPlan> {
        let inner = self.inner.lock();
        let state = inner
            .functions
            .get(func_id)
            .ok_or_else(|| CoreError::UnknownFunction(func_id.to_string()))?;
        let runtime = inner.runtime_context(func_id, self.clock.now_ms());
        let source = inner.feature_source(func_id, &runtime);
        inner
            .learner
            .predictor()
            .select_plan(&source, state.config.budget, state.config.min_benefit)
    }

    pub fn get_statistics(&self) -> CoreStatistics {
        let inner = self.inner.lock();
        let per_function = inner
            .functions
            .iter()
            .map(|(id, state)| (id.clone(), inner.function_statistics(id, state)))
            .collect::<BTreeMap<_, _>>();
        let learner = inner.learner.stats();
        CoreStatistics {
            per_function,
            predictor: PredictorStatistics {
                iterations: learner.iterations,
                current_lr: learner.current_lr,
                recent_mae: learner.recent_mae,
                improvement_trend: learner.improvement_trend,
                degraded: learner.degraded,
                batch_retrains: learner.batch_retrains,
            },
            replay: ReplayStatistics {
                size: learner.replay.size,
                max: learner.replay.capacity,
                mean_speedups: learner.replay.mean_speedups,
            },
        }
    }
}

impl CoreInner {
    fn state_entry(&mut self, func_id: &str) -> &mut FunctionState {
        let defaults = &self.config.defaults;
        self.functions
            .entry(func_id.to_string())
            .or_insert_with(|| FunctionState::new(defaults.clone()))
    }

    fn select_variant(&self, func_id: &str, signature: &str) -> Option<(String, Callable)> {
        let use_ml = self
            .functions
            .get(func_id)
            .map_or(false, |s| s.config.use_ml_selector);
        let selector: Option<&dyn VariantSelector> = if use_ml {
            Some(self.learner.predictor())
        } else {
            None
        };
        self.registry
            .select_best(func_id, signature, selector)
            .and_then(|v| v.callable.clone().map(|c| (v.id.clone(), c)))
    }

    /// Bookkeeping after the wrapped call returned; may start a
    /// specialization round
    fn finish_call(&mut self, call: CallRecord<'_>, now: f64, reporter: &dyn Reporter) -> Option<BuildRequest> {
        let state = self.functions.get_mut(call.func_id)?;
        state.wrapped_calls += 1;
        match call.variant_id {
            Some(id) => {
                self.registry.record_execution(id, call.elapsed_ms, call.success);
            }
            None if call.success => {
                state
                    .baselines
                    .entry(call.signature.to_string())
                    .or_default()
                    .record(call.elapsed_ms);
            }
            None => {}
        }

        let prune_interval = state.config.prune_interval_calls;
        if prune_interval > 0 && state.wrapped_calls % prune_interval == 0 {
            self.prune_function(call.func_id, now);
        }

        if let (Some(id), true) = (call.variant_id, call.success) {
            self.maybe_observe(call.func_id, id, call.signature, now, reporter);
        }

        self.maybe_specialize(call.func_id, now, reporter)
    }

    /// Every `observation_interval` successful calls of a variant, compare
    /// its mean time with the original's for the same signature
    fn maybe_observe(&mut self, func_id: &str, variant_id: &str, signature: &str, now: f64, reporter: &dyn Reporter) {
        let Some(state) = self.functions.get_mut(func_id) else {
            return;
        };
        let interval = state.config.observation_interval;
        let counter = state
            .observation_counters
            .entry(variant_id.to_string())
            .or_insert(0);
        *counter += 1;
        if *counter % interval != 0 {
            return;
        }
        let Some(baseline) = state.baselines.get(signature).and_then(|b| b.mean()) else {
            return;
        };
        let Some(variant) = self.registry.variant(variant_id) else {
            return;
        };
        if variant.mean_time <= 0.0 {
            return;
        }
        let speedup = baseline / variant.mean_time;
        let plan = variant.plan.clone();
        self.learn(func_id, &plan, speedup, None, now, reporter);
    }

    fn learn(
        &mut self,
        func_id: &str,
        plan: &OptimizationPlan,
        measured_speedup: f64,
        overrides: Option<&[Option<f64>; NUM_OPTIMIZATIONS]>,
        now: f64,
        reporter: &dyn Reporter,
    ) -> ObservationOutcome {
        let runtime = self.runtime_context(func_id, now);
        let outcome = {
            let source = FeatureSource {
                profile: self.profiler.profile(func_id),
                static_info: self.functions.get(func_id).and_then(|s| s.static_info.as_ref()),
                context: self.functions.get(func_id).and_then(|s| s.context.as_ref()),
                runtime: Some(&runtime),
            };
            self.learner
                .on_observation(&source, plan, measured_speedup, overrides)
        };

        if let Some(state) = self.functions.get_mut(func_id) {
            state.last_speedup = Some(measured_speedup);
        }
        match &outcome {
            ObservationOutcome::Degraded(reason) => {
                let context = report_context([("func_id", func_id), ("reason", reason.as_str())]);
                reporter.log(ReportLevel::Warn, "learner degraded", Some(&context));
            }
            ObservationOutcome::Trained { loss, retrained } => {
                debug!(func_id, measured_speedup, loss, retrained, "observation");
            }
            ObservationOutcome::Skipped => {}
        }
        outcome
    }

    fn feature_source<'a>(&'a self, func_id: &str, runtime: &'a RuntimeContext) -> FeatureSource<'a> {
        let state = self.functions.get(func_id);
        FeatureSource {
            profile: self.profiler.profile(func_id),
            static_info: state.and_then(|s| s.static_info.as_ref()),
            context: state.and_then(|s| s.context.as_ref()),
            runtime: Some(runtime),
        }
    }

    fn runtime_context(&self, func_id: &str, now: f64) -> RuntimeContext {
        runtime_context(
            func_id,
            now,
            &self.profiler,
            &self.registry,
            self.functions.get(func_id),
        )
    }

    fn maybe_specialize(&mut self, func_id: &str, now: f64, reporter: &dyn Reporter) -> Option<BuildRequest> {
        let state = self.functions.get(func_id)?;
        if state.phase != Phase::Observed || state.suppressed {
            return None;
        }
        let threshold = state.config.specialize_threshold;
        let total_calls = self.profiler.profile(func_id).map_or(0, |p| p.total_calls);
        if total_calls < threshold || total_calls < state.rearm_at {
            return None;
        }
        if self.registry.non_generic_count(func_id) > 0 {
            return None;
        }
        let report = self.profiler.analyze_for_specialization(func_id, threshold)?;

        let runtime = self.runtime_context(func_id, now);
        let source = self.feature_source(func_id, &runtime);
        let plan = match self.learner.predictor().select_plan(
            &source,
            state.config.budget,
            state.config.min_benefit,
        ) {
            Ok(plan) => plan,
            Err(e) => {
                let context = report_context([("func_id", func_id.to_string()), ("error", e.to_string())]);
                reporter.log(ReportLevel::Warn, "plan prediction failed", Some(&context));
                OptimizationPlan::empty()
            }
        };
        let builds: Vec<(String, OptimizationPlan)> = if plan.is_empty() {
            Vec::new()
        } else {
            report
                .top_signatures()
                .map(|signature| (signature.to_string(), plan.clone()))
                .collect()
        };
        let builder = state.builder.clone();
        let original = state.original.clone();

        let state = self.functions.get_mut(func_id)?;
        state.phase = Phase::Specializing;
        state.specializations += 1;
        info!(
            func_id,
            total_calls,
            signatures = builds.len(),
            optimizations = plan.len(),
            predicted_speedup = plan.predicted_speedup,
            "specializing"
        );

        match (builder, original) {
            (Some(builder), Some(original)) if !builds.is_empty() => Some(BuildRequest {
                builder,
                original,
                builds,
            }),
            (None, _) if !builds.is_empty() => {
                for (signature, _) in &builds {
                    let error = CoreError::BuilderDeclined {
                        func_id: func_id.to_string(),
                        signature: signature.clone(),
                    };
                    let context = report_context([("func_id", func_id), ("signature", signature.as_str())]);
                    reporter.log(ReportLevel::Info, &error.to_string(), Some(&context));
                }
                self.settle_phase(func_id);
                None
            }
            _ => {
                self.settle_phase(func_id);
                None
            }
        }
    }

    /// Collect finished build jobs of one function
    fn poll_builds(&mut self, func_id: &str, now: f64, reporter: &dyn Reporter) {
        let Some(state) = self.functions.get_mut(func_id) else {
            return;
        };
        if state.pending.is_empty() {
            return;
        }

        let mut finished = Vec::new();
        let mut running = Vec::new();
        for mut pending in std::mem::take(&mut state.pending) {
            match pending.job.poll() {
                JobStatus::Done(result) => finished.push((pending.target, result)),
                JobStatus::Running => running.push(pending),
                JobStatus::Abandoned => {
                    if matches!(pending.target, BuildTarget::NewVariant { .. }) {
                        state.abandoned = true;
                    }
                    debug!(func_id, "build job abandoned");
                }
            }
        }
        state.pending = running;

        for (target, result) in finished {
            self.apply_build(func_id, target, result, now, reporter);
        }
        self.settle_phase(func_id);
    }

    /// Apply one build result; returns true when a callable was installed
    fn apply_build(
        &mut self,
        func_id: &str,
        target: BuildTarget,
        result: BuildResult,
        now: f64,
        reporter: &dyn Reporter,
    ) -> bool {
        let Some(state) = self.functions.get_mut(func_id) else {
            return false;
        };
        match (target, result) {
            (BuildTarget::NewVariant { signature, plan }, Ok(Some(variant))) => {
                state.consecutive_failures = 0;
                let id = self
                    .registry
                    .register(func_id, VariantSpec::from_plan(signature, variant, plan), now);
                let context = report_context([("func_id", func_id), ("variant_id", id.as_str())]);
                reporter.log(ReportLevel::Debug, "variant registered", Some(&context));
                true
            }
            (BuildTarget::NewVariant { signature, .. }, Ok(None)) => {
                let error = CoreError::BuilderDeclined {
                    func_id: func_id.to_string(),
                    signature: signature.clone(),
                };
                let context = report_context([("func_id", func_id), ("signature", signature.as_str())]);
                reporter.log(ReportLevel::Info, &error.to_string(), Some(&context));
                false
            }
            (BuildTarget::NewVariant { signature, .. }, Err(e)) => {
                state.consecutive_failures += 1;
                let error = CoreError::BuilderFailed {
                    func_id: func_id.to_string(),
                    signature: signature.clone(),
                    message: format!("{:#}", e),
                };
                let context = report_context([("func_id", func_id), ("signature", signature.as_str())]);
                reporter.log(ReportLevel::Warn, &error.to_string(), Some(&context));
                if state.consecutive_failures >= MAX_CONSECUTIVE_FAILURES && !state.suppressed {
                    state.suppressed = true;
                    let context = report_context([
                        ("func_id", func_id.to_string()),
                        ("failures", state.consecutive_failures.to_string()),
                    ]);
                    reporter.log(
                        ReportLevel::Warn,
                        "specialization suppressed until reset",
                        Some(&context),
                    );
                }
                false
            }
            (BuildTarget::Rehydrate { variant_id }, Ok(Some(variant))) => {
                self.registry.set_callable(&variant_id, variant)
            }
            (BuildTarget::Rehydrate { variant_id }, Ok(None)) => {
                let context = report_context([("func_id", func_id), ("variant_id", variant_id.as_str())]);
                reporter.log(ReportLevel::Info, "builder declined rehydration", Some(&context));
                false
            }
            (BuildTarget::Rehydrate { variant_id }, Err(e)) => {
                let context = report_context([
                    ("func_id", func_id.to_string()),
                    ("variant_id", variant_id),
                    ("error", format!("{:#}", e)),
                ]);
                reporter.log(ReportLevel::Warn, "rehydration failed", Some(&context));
                false
            }
        }
    }

    /// Leave `Specializing` once every variant build has an answer. An
    /// abandoned build keeps the function there until reset.
    fn settle_phase(&mut self, func_id: &str) {
        let total_calls = self.profiler.profile(func_id).map_or(0, |p| p.total_calls);
        let has_variants = self.registry.non_generic_count(func_id) > 0;
        let Some(state) = self.functions.get_mut(func_id) else {
            return;
        };
        if state.phase != Phase::Specializing || state.has_pending_variants() || state.abandoned {
            return;
        }
        if has_variants {
            state.phase = Phase::Serving;
            info!(func_id, "serving specialized variants");
        } else {
            state.phase = Phase::Observed;
            state.rearm_at = total_calls + state.config.specialize_threshold;
            debug!(func_id, rearm_at = state.rearm_at, "no variant registered, backing off");
        }
    }

    fn prune_function(&mut self, func_id: &str, now: f64) -> usize {
        let Some(state) = self.functions.get(func_id) else {
            return 0;
        };
        let removed = self.registry.prune_function(
            func_id,
            state.config.prune_min_use_count,
            state.config.prune_max_age_ms,
            now,
        );
        let total_calls = self.profiler.profile(func_id).map_or(0, |p| p.total_calls);
        let has_variants = self.registry.non_generic_count(func_id) > 0;
        if let Some(state) = self.functions.get_mut(func_id) {
            for id in &removed {
                state.observation_counters.remove(id);
            }
            if state.phase == Phase::Serving && !has_variants {
                state.phase = Phase::Observed;
                state.rearm_at = total_calls + state.config.specialize_threshold;
                info!(func_id, "all variants pruned");
            }
        }
        removed.len()
    }

    fn reset_function(&mut self, func_id: &str, clear_profile: bool) {
        self.registry.remove_function(func_id);
        let Some(state) = self.functions.get_mut(func_id) else {
            return;
        };
        state.reset_specialization();
        if clear_profile {
            state.baselines.clear();
            state.wrapped_calls = 0;
            let rate = state.config.sample_rate;
            self.profiler.remove(func_id);
            self.profiler.set_sample_rate(func_id, rate);
        }
    }

    fn function_statistics(&self, func_id: &str, state: &FunctionState) -> FunctionStatistics {
        let profile = self.profiler.profile(func_id);
        FunctionStatistics {
            phase: state.phase,
            total_calls: profile.map_or(0, |p| p.total_calls),
            wrapped_calls: state.wrapped_calls,
            signatures: profile.map_or(0, |p| p.signatures.len()),
            hot_signatures: profile.map(Profile::hot_signatures).unwrap_or_default(),
            mean_time: profile.map_or(0.0, Profile::mean_time),
            variants: self
                .registry
                .variants(func_id)
                .iter()
                .map(|v| VariantStatistics {
                    id: v.id.clone(),
                    signature: v.signature.clone(),
                    optimizations: v.plan.optimizations.clone(),
                    expected_speedup: v.expected_speedup,
                    use_count: v.use_count,
                    mean_time: v.mean_time,
                    guard_failure_rate: v.guard_failure_rate,
                    live: v.is_live(),
                })
                .collect(),
            specializations: state.specializations,
            consecutive_failures: state.consecutive_failures,
            suppressed: state.suppressed,
            pending_builds: state.pending.len(),
            last_speedup: state.last_speedup,
        }
    }
}

/// Facts about a function that come from outside its profile
fn runtime_context(
    func_id: &str,
    now: f64,
    profiler: &RuntimeProfiler,
    registry: &VariantRegistry,
    state: Option<&FunctionState>,
) -> RuntimeContext {
    let variants = registry.variants(func_id);
    let uses: u64 = variants.iter().map(|v| v.use_count).sum();
    let deopts: u64 = variants.iter().map(|v| v.deopt_count).sum();
    let arg_count = profiler
        .profile(func_id)
        .and_then(|p| p.hot_signatures().into_iter().next())
        .map_or(0, |s| if s.is_empty() { 0 } else { s.split(',').count() });

    RuntimeContext {
        now_ms: now,
        is_hot: profiler.is_hot(func_id),
        time_share: profiler.time_share(func_id),
        variant_count: variants.len(),
        deopt_rate: if uses > 0 { deopts as f64 / uses as f64 } else { 0.0 },
        previously_optimized: !variants.is_empty() || state.map_or(false, |s| s.specializations > 0),
        last_speedup: state.and_then(|s| s.last_speedup),
        applied_optimization_count: variants.iter().map(|v| v.plan.len()).max().unwrap_or(0),
        arg_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::IdentityBuilder;
    use specializer_core::ManualClock;

    fn core_with_clock(defaults: FunctionConfig) -> (SpecializationCore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0.0));
        let config = OrchestratorConfig {
            defaults,
            ..OrchestratorConfig::default()
        };
        let core = SpecializationCore::builder(config)
            .clock(clock.clone())
            .variant_builder(Arc::new(IdentityBuilder))
            .build()
            .unwrap();
        (core, clock)
    }

    #[test]
    fn test_runtime_context_counts_args() {
        let (core, _clock) = core_with_clock(FunctionConfig {
            sample_rate: 1.0,
            ..FunctionConfig::default()
        });
        let f = core
            .wrap("add", callable(|args: &[Value]| Ok(args[0].clone())))
            .unwrap();
        f.call(&[Value::Int(1), Value::Int(2)]).unwrap();

        let inner = core.inner.lock();
        let ctx = inner.runtime_context("add", 0.0);
        assert_eq!(ctx.arg_count, 2);
        assert_eq!(ctx.variant_count, 0);
        assert!(!ctx.previously_optimized);
    }

    #[test]
    fn test_register_variant_moves_to_serving() {
        let (core, _clock) = core_with_clock(FunctionConfig::default());
        let f = core
            .wrap("id", callable(|args: &[Value]| Ok(args[0].clone())))
            .unwrap();
        assert!(matches!(
            core.register_variant("missing", "int32", f.original().clone(), None),
            Err(CoreError::UnknownFunction(_))
        ));

        let id = core
            .register_variant("id", "int32", f.original().clone(), None)
            .unwrap();
        assert_eq!(id, "id#0");
        assert_eq!(core.phase("id"), Some(Phase::Serving));
    }

    #[test]
    fn test_hot_path_orders_by_frequency() {
        let (core, _clock) = core_with_clock(FunctionConfig {
            sample_rate: 1.0,
            ..FunctionConfig::default()
        });
        let f = core
            .wrap("first", callable(|args: &[Value]| Ok(args[0].clone())))
            .unwrap();
        for _ in 0..3 {
            f.call(&[Value::Float(0.5)]).unwrap();
        }
        for _ in 0..9 {
            f.call(&[Value::Int(1)]).unwrap();
        }
        assert_eq!(core.hot_path("first"), vec!["int32", "float64"]);
        assert!(core.hot_path("unknown").is_empty());
    }

    #[test]
    fn test_metadata_reaches_features() {
        let (core, _clock) = core_with_clock(FunctionConfig::default());
        let features = |core: &SpecializationCore| {
            let inner = core.inner.lock();
            let runtime = inner.runtime_context("loop", 0.0);
            let source = inner.feature_source("loop", &runtime);
            inner.learner.predictor().extractor().extract(&source)
        };
        let bare = features(&core);

        core.set_static_metadata(
            "loop",
            StaticMetadata {
                loop_count: 3.0,
                is_recursive: true,
                ..StaticMetadata::default()
            },
        );
        core.set_context_metadata(
            "loop",
            ContextMetadata {
                on_hot_path: true,
                ..ContextMetadata::default()
            },
        );
        let described = features(&core);
        assert_ne!(bare, described);
        assert_eq!(core.phase("loop"), Some(Phase::Observed));
    }

    #[test]
    fn test_observe_unknown_function() {
        let (core, _clock) = core_with_clock(FunctionConfig::default());
        assert!(matches!(
            core.observe("nope", "int32", 1.5),
            Err(CoreError::UnknownFunction(_))
        ));
    }
}
