//! Online learning loop around the predictor
//!
//! Every observation becomes one SGD step plus a replay entry; every
//! `batch_retrain_interval` observations the network is retrained on a
//! random batch from the replay buffer. A numerical failure parks the
//! learner in a degraded state until the host resets it.

use crate::features::{FeatureExtractor, FeatureSource, FeatureVector};
use crate::predictor::{clamp_speedup, OptimizationPredictor, PredictorConfig, PredictorSnapshot};
use crate::replay::{ExperienceReplayBuffer, ReplaySnapshot, ReplayStats, Sample};
use serde::{Deserialize, Serialize};
use specializer_core::{seeded_rng, BoxedRng, CoreError, OptimizationPlan, Result, NUM_OPTIMIZATIONS};
use std::collections::VecDeque;
use tracing::{debug, info, warn};

/// Step-wise exponential learning-rate decay
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningRateSchedule {
    pub initial: f64,
    pub minimum: f64,
    pub decay_factor: f64,
    pub decay_interval: u64,
}

impl Default for LearningRateSchedule {
    fn default() -> Self {
        Self {
            initial: 1e-3,
            minimum: 1e-4,
            decay_factor: 0.95,
            decay_interval: 100,
        }
    }
}

impl LearningRateSchedule {
    /// `max(minimum, initial * decay_factor^floor(iteration / decay_interval))`
    pub fn rate_at(&self, iteration: u64) -> f64 {
        let steps = (iteration / self.decay_interval.max(1)) as f64;
        (self.initial * self.decay_factor.powf(steps)).max(self.minimum)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.initial.is_finite() && self.initial > 0.0) {
            return Err(CoreError::invalid_config("learning_rate_schedule.initial", "must be positive"));
        }
        if !(self.minimum.is_finite() && self.minimum > 0.0 && self.minimum <= self.initial) {
            return Err(CoreError::invalid_config(
                "learning_rate_schedule.minimum",
                "must be positive and at most initial",
            ));
        }
        if !(self.decay_factor > 0.0 && self.decay_factor <= 1.0) {
            return Err(CoreError::invalid_config(
                "learning_rate_schedule.decay_factor",
                "must be in (0, 1]",
            ));
        }
        if self.decay_interval == 0 {
            return Err(CoreError::invalid_config(
                "learning_rate_schedule.decay_interval",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Learner settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearnerConfig {
    pub replay_capacity: usize,
    /// Observations between batch retrains
    pub batch_retrain_interval: u64,
    /// Minimum replay size before a batch retrain runs
    pub retrain_threshold: usize,
    pub batch_size: usize,
    pub batch_epochs: usize,
    pub learning_rate_schedule: LearningRateSchedule,
    /// Observations kept by the accuracy tracker
    pub accuracy_window: usize,
}

impl Default for LearnerConfig {
    fn default() -> Self {
        Self {
            replay_capacity: 1000,
            batch_retrain_interval: 50,
            retrain_threshold: 50,
            batch_size: 32,
            batch_epochs: 10,
            learning_rate_schedule: LearningRateSchedule::default(),
            accuracy_window: 100,
        }
    }
}

impl LearnerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.replay_capacity == 0 {
            return Err(CoreError::invalid_config("replay_capacity", "must be at least 1"));
        }
        if self.batch_retrain_interval == 0 {
            return Err(CoreError::invalid_config("batch_retrain_interval", "must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(CoreError::invalid_config("batch_size", "must be at least 1"));
        }
        if self.batch_epochs == 0 {
            return Err(CoreError::invalid_config("batch_epochs", "must be at least 1"));
        }
        if self.accuracy_window < 2 {
            return Err(CoreError::invalid_config("accuracy_window", "must be at least 2"));
        }
        self.learning_rate_schedule.validate()
    }
}

/// Split one measured speedup across the plan's optimizations.
///
/// Slots in a non-empty plan get `measured^(1/|plan|)`; every other slot is
/// 1.0. Host-supplied per-kind measurements replace the default. Every slot
/// ends up in `[1.0, max]`.
pub fn attribute_speedup(
    plan: &OptimizationPlan,
    measured: f64,
    overrides: Option<&[Option<f64>; NUM_OPTIMIZATIONS]>,
    max: f64,
) -> [f64; NUM_OPTIMIZATIONS] {
    let mut target = [1.0; NUM_OPTIMIZATIONS];
    // +inf saturates through the clamp below
    if !plan.is_empty() && !measured.is_nan() && measured > 0.0 {
        let share = measured.powf(1.0 / plan.len() as f64);
        for kind in &plan.optimizations {
            target[kind.index()] = share;
        }
    }
    if let Some(overrides) = overrides {
        for (slot, value) in target.iter_mut().zip(overrides.iter()) {
            if let Some(v) = value {
                *slot = *v;
            }
        }
    }
    for slot in &mut target {
        *slot = clamp_speedup(*slot, max);
    }
    target
}

/// Windowed mean absolute error between predictions and observed targets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccuracyTracker {
    window: usize,
    errors: VecDeque<f64>,
}

impl AccuracyTracker {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(2),
            errors: VecDeque::with_capacity(window.max(2)),
        }
    }

    /// Record one observation; returns its mean absolute error
    pub fn record(&mut self, predicted: &[f64], observed: &[f64]) -> f64 {
        let n = predicted.len().min(observed.len()).max(1) as f64;
        let mae = predicted
            .iter()
            .zip(observed.iter())
            .map(|(p, o)| (p - o).abs())
            .sum::<f64>()
            / n;
        if self.errors.len() == self.window {
            self.errors.pop_front();
        }
        self.errors.push_back(mae);
        mae
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Mean error over the window
    pub fn recent_mae(&self) -> f64 {
        if self.errors.is_empty() {
            return 0.0;
        }
        self.errors.iter().sum::<f64>() / self.errors.len() as f64
    }

    /// Percentage by which the second half of the window improves on the first
    pub fn improvement_trend(&self) -> f64 {
        if self.errors.len() < 2 {
            return 0.0;
        }
        let mid = self.errors.len() / 2;
        let first = self.errors.iter().take(mid).sum::<f64>() / mid as f64;
        let second =
            self.errors.iter().skip(mid).sum::<f64>() / (self.errors.len() - mid) as f64;
        if first <= 0.0 {
            0.0
        } else {
            (first - second) / first * 100.0
        }
    }

    pub fn clear(&mut self) {
        self.errors.clear();
    }
}

/// Result of feeding one observation to the learner
#[derive(Debug, Clone, PartialEq)]
pub enum ObservationOutcome {
    /// One online step ran
    Trained {
        loss: f64,
        /// A batch retrain also ran
        retrained: bool,
    },
    /// The learner is degraded; nothing changed
    Skipped,
    /// This observation failed numerically and degraded the learner
    Degraded(String),
}

/// Snapshot of the whole learning state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnerSnapshot {
    pub predictor: PredictorSnapshot,
    pub replay: ReplaySnapshot,
    pub iterations: u64,
    pub learning_rate: f64,
    pub accuracy: AccuracyTracker,
    pub batch_retrains: u64,
}

/// Learner statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnerStats {
    pub iterations: u64,
    pub current_lr: f64,
    pub recent_mae: f64,
    pub improvement_trend: f64,
    pub degraded: bool,
    pub batch_retrains: u64,
    pub replay: ReplayStats,
}

/// Drives the predictor from observations
pub struct AdaptiveLearner {
    predictor: OptimizationPredictor,
    replay: ExperienceReplayBuffer,
    extractor: FeatureExtractor,
    rng: BoxedRng,
    config: LearnerConfig,
    iterations: u64,
    current_lr: f64,
    accuracy: AccuracyTracker,
    degraded: bool,
    batch_retrains: u64,
    /// Last known good predictor state
    checkpoint: Option<PredictorSnapshot>,
}

impl std::fmt::Debug for AdaptiveLearner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveLearner")
            .field("iterations", &self.iterations)
            .field("current_lr", &self.current_lr)
            .field("degraded", &self.degraded)
            .field("replay", &self.replay.len())
            .finish_non_exhaustive()
    }
}

impl AdaptiveLearner {
    /// Learner over a fresh [`DenseNetwork`](crate::DenseNetwork) seeded from
    /// `predictor_config.seed`
    pub fn new(config: LearnerConfig, predictor_config: PredictorConfig) -> Result<Self> {
        config.validate()?;
        let mut rng: BoxedRng = Box::new(seeded_rng(predictor_config.seed));
        let predictor = OptimizationPredictor::new(
            predictor_config,
            config.learning_rate_schedule.initial,
            rng.as_mut(),
        )?;
        Self::with_predictor(config, predictor, rng)
    }

    /// Learner over an existing predictor and random source
    pub fn with_predictor(
        config: LearnerConfig,
        mut predictor: OptimizationPredictor,
        rng: BoxedRng,
    ) -> Result<Self> {
        config.validate()?;
        let replay = ExperienceReplayBuffer::new(config.replay_capacity)?;
        let current_lr = config.learning_rate_schedule.initial;
        predictor.set_learning_rate(current_lr);
        let checkpoint = Some(predictor.snapshot());
        Ok(Self {
            predictor,
            replay,
            extractor: FeatureExtractor::new(),
            rng,
            accuracy: AccuracyTracker::new(config.accuracy_window),
            config,
            iterations: 0,
            current_lr,
            degraded: false,
            batch_retrains: 0,
            checkpoint,
        })
    }

    pub fn predictor(&self) -> &OptimizationPredictor {
        &self.predictor
    }

    pub fn replay(&self) -> &ExperienceReplayBuffer {
        &self.replay
    }

    pub fn config(&self) -> &LearnerConfig {
        &self.config
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    pub fn current_lr(&self) -> f64 {
        self.current_lr
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn accuracy(&self) -> &AccuracyTracker {
        &self.accuracy
    }

    /// Learn from one measured speedup of `plan` applied to the function
    /// described by `source`
    pub fn on_observation(
        &mut self,
        source: &FeatureSource<'_>,
        plan: &OptimizationPlan,
        measured_speedup: f64,
        overrides: Option<&[Option<f64>; NUM_OPTIMIZATIONS]>,
    ) -> ObservationOutcome {
        if self.degraded {
            return ObservationOutcome::Skipped;
        }
        let features = self.extractor.extract(source);
        self.observe_features(features, plan, measured_speedup, overrides)
    }

    /// Same as [`on_observation`](Self::on_observation) for an already
    /// extracted feature vector
    pub fn observe_features(
        &mut self,
        features: FeatureVector,
        plan: &OptimizationPlan,
        measured_speedup: f64,
        overrides: Option<&[Option<f64>; NUM_OPTIMIZATIONS]>,
    ) -> ObservationOutcome {
        if self.degraded {
            return ObservationOutcome::Skipped;
        }

        let max = self.predictor.config().max_speedup_clamp;
        let target = attribute_speedup(plan, measured_speedup, overrides, max);

        let predicted = match self.predictor.predict_speedups(&features) {
            Ok(p) => p,
            Err(e) => return self.degrade(e),
        };

        let sample = Sample {
            features,
            observed_speedups: target,
        };
        self.replay.add(sample.clone());

        let loss = match self.predictor.update(&sample, self.rng.as_mut()) {
            Ok(loss) => loss,
            Err(e) => return self.degrade(e),
        };

        self.iterations += 1;
        self.current_lr = self.config.learning_rate_schedule.rate_at(self.iterations);
        self.predictor.set_learning_rate(self.current_lr);
        self.accuracy.record(&predicted, &target);

        let mut retrained = false;
        if self.iterations % self.config.batch_retrain_interval == 0
            && self.replay.len() >= self.config.retrain_threshold
        {
            let batch = self.replay.sample(self.config.batch_size, self.rng.as_mut());
            match self
                .predictor
                .train_batch(&batch, self.config.batch_epochs, self.rng.as_mut())
            {
                Ok(history) => {
                    self.batch_retrains += 1;
                    self.checkpoint = Some(self.predictor.snapshot());
                    retrained = true;
                    debug!(
                        iteration = self.iterations,
                        batch = batch.len(),
                        final_loss = history.last().copied().unwrap_or(0.0),
                        "batch retrain"
                    );
                }
                Err(e) => return self.degrade(e),
            }
        }

        ObservationOutcome::Trained { loss, retrained }
    }

    fn degrade(&mut self, error: CoreError) -> ObservationOutcome {
        warn!(iteration = self.iterations, error = %error, "learner degraded");
        self.degraded = true;
        ObservationOutcome::Degraded(error.to_string())
    }

    /// Leave the degraded state, restoring the last good weights (or fresh
    /// ones when none can be restored)
    pub fn reset(&mut self) {
        let restored = match &self.checkpoint {
            Some(checkpoint) => self.predictor.restore(checkpoint).is_ok(),
            None => false,
        };
        if !restored {
            self.predictor.reinitialize(self.rng.as_mut());
            self.checkpoint = Some(self.predictor.snapshot());
        }
        self.predictor.set_learning_rate(self.current_lr);
        self.degraded = false;
        info!(restored, "learner reset");
    }

    pub fn snapshot(&self) -> LearnerSnapshot {
        LearnerSnapshot {
            predictor: self.predictor.snapshot(),
            replay: self.replay.snapshot(),
            iterations: self.iterations,
            learning_rate: self.current_lr,
            accuracy: self.accuracy.clone(),
            batch_retrains: self.batch_retrains,
        }
    }

    /// Replace the learning state; on error nothing changes
    pub fn restore(&mut self, snapshot: &LearnerSnapshot) -> Result<()> {
        let replay = ExperienceReplayBuffer::from_snapshot(&snapshot.replay)?;
        self.predictor.restore(&snapshot.predictor)?;
        self.predictor.set_learning_rate(snapshot.learning_rate);
        self.replay = replay;
        self.iterations = snapshot.iterations;
        self.current_lr = snapshot.learning_rate;
        self.accuracy = snapshot.accuracy.clone();
        self.batch_retrains = snapshot.batch_retrains;
        self.degraded = false;
        self.checkpoint = Some(snapshot.predictor.clone());
        Ok(())
    }

    pub fn stats(&self) -> LearnerStats {
        LearnerStats {
            iterations: self.iterations,
            current_lr: self.current_lr,
            recent_mae: self.accuracy.recent_mae(),
            improvement_trend: self.accuracy.improvement_trend(),
            degraded: self.degraded,
            batch_retrains: self.batch_retrains,
            replay: self.replay.stats(),
        }
    }
}
