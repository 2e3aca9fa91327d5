//! Per-optimization speedup prediction and cost-constrained plan selection

use crate::features::{FeatureExtractor, FeatureSource, FEATURE_DIM};
use crate::network::{DenseNetwork, NetworkConfig, NetworkSnapshot, SpeedupModel};
use crate::replay::Sample;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use specializer_core::{
    CoreError, OptimizationKind, OptimizationPlan, Result, SelectorCandidate, VariantSelector,
    NUM_OPTIMIZATIONS, OPTIMIZATION_COSTS,
};
use tracing::debug;

/// Predictor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictorConfig {
    /// Upper clamp for every predicted speedup
    pub max_speedup_clamp: f64,
    pub hidden_layers: Vec<usize>,
    /// One drop probability per hidden layer
    pub dropout: Vec<f64>,
    /// Seed for weight initialization, dropout and replay sampling
    pub seed: u64,
    /// Speedups assumed before the network has seen any data
    pub prior_speedups: [f64; NUM_OPTIMIZATIONS],
    /// Training steps over which predictions shift from the prior to the
    /// network; 0 uses the network from the start
    pub prior_warmup_steps: u64,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            max_speedup_clamp: 8.0,
            hidden_layers: vec![128, 64, 32],
            dropout: vec![0.3, 0.2, 0.1],
            seed: 42,
            prior_speedups: [1.10, 1.25, 1.15, 1.20, 1.05, 1.10, 1.08],
            prior_warmup_steps: 100,
        }
    }
}

impl PredictorConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.max_speedup_clamp.is_finite() && self.max_speedup_clamp > 1.0) {
            return Err(CoreError::invalid_config("max_speedup_clamp", "must be greater than 1"));
        }
        if self.prior_speedups.iter().any(|p| !p.is_finite()) {
            return Err(CoreError::invalid_config("prior_speedups", "must be finite"));
        }
        self.network_config(1e-3).validate()
    }

    /// Network shape for these settings
    pub fn network_config(&self, learning_rate: f64) -> NetworkConfig {
        let mut layer_sizes = Vec::with_capacity(self.hidden_layers.len() + 2);
        layer_sizes.push(FEATURE_DIM);
        layer_sizes.extend_from_slice(&self.hidden_layers);
        layer_sizes.push(NUM_OPTIMIZATIONS);
        NetworkConfig {
            layer_sizes,
            dropout: self.dropout.clone(),
            learning_rate,
        }
    }
}

/// Greedy benefit-per-cost selection over a prediction vector.
///
/// Candidates are visited by `(prediction - 1) / cost` descending, ties by
/// output position. A candidate is accepted when its benefit is positive and
/// at least `min_benefit` and its cost fits the remaining budget.
pub fn select_plan_from_predictions(
    predictions: &[f64; NUM_OPTIMIZATIONS],
    budget: u32,
    min_benefit: f64,
) -> OptimizationPlan {
    let mut candidates: Vec<(usize, f64, f64)> = (0..NUM_OPTIMIZATIONS)
        .map(|k| {
            let benefit = predictions[k] - 1.0;
            (k, benefit, benefit / f64::from(OPTIMIZATION_COSTS[k]))
        })
        .collect();
    candidates.sort_by(|a, b| b.2.total_cmp(&a.2).then(a.0.cmp(&b.0)));

    let mut remaining = budget;
    let mut accepted = Vec::new();
    for (k, benefit, _) in candidates {
        let cost = OPTIMIZATION_COSTS[k];
        if benefit <= 0.0 || benefit < min_benefit || cost > remaining {
            continue;
        }
        remaining -= cost;
        if let Some(kind) = OptimizationKind::from_index(k) {
            accepted.push(kind);
        }
    }

    if accepted.is_empty() {
        OptimizationPlan::empty()
    } else {
        OptimizationPlan::from_predictions(accepted, predictions)
    }
}

/// Serialized predictor state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictorSnapshot {
    pub network: NetworkSnapshot,
    pub trained_steps: u64,
}

/// Wraps a [`SpeedupModel`] with feature extraction, clamping and plan selection
pub struct OptimizationPredictor {
    model: Box<dyn SpeedupModel>,
    extractor: FeatureExtractor,
    config: PredictorConfig,
    trained_steps: u64,
}

impl std::fmt::Debug for OptimizationPredictor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimizationPredictor")
            .field("config", &self.config)
            .field("trained_steps", &self.trained_steps)
            .finish_non_exhaustive()
    }
}

impl OptimizationPredictor {
    /// Predictor backed by a freshly initialized [`DenseNetwork`]
    pub fn new(config: PredictorConfig, learning_rate: f64, rng: &mut dyn RngCore) -> Result<Self> {
        config.validate()?;
        let network = DenseNetwork::new(config.network_config(learning_rate), rng)?;
        Self::with_model(Box::new(network), config)
    }

    /// Predictor backed by a host-supplied model
    pub fn with_model(model: Box<dyn SpeedupModel>, config: PredictorConfig) -> Result<Self> {
        config.validate()?;
        if model.input_dim() != FEATURE_DIM {
            return Err(CoreError::dimension_mismatch(FEATURE_DIM, model.input_dim()));
        }
        if model.output_dim() != NUM_OPTIMIZATIONS {
            return Err(CoreError::dimension_mismatch(NUM_OPTIMIZATIONS, model.output_dim()));
        }
        Ok(Self {
            model,
            extractor: FeatureExtractor::new(),
            config,
            trained_steps: 0,
        })
    }

    pub fn config(&self) -> &PredictorConfig {
        &self.config
    }

    pub fn extractor(&self) -> &FeatureExtractor {
        &self.extractor
    }

    pub fn model(&self) -> &dyn SpeedupModel {
        self.model.as_ref()
    }

    pub fn trained_steps(&self) -> u64 {
        self.trained_steps
    }

    fn prior_weight(&self) -> f64 {
        if self.config.prior_warmup_steps == 0 {
            0.0
        } else {
            1.0 - (self.trained_steps as f64 / self.config.prior_warmup_steps as f64).min(1.0)
        }
    }

    /// Clamped per-kind speedups for a feature vector
    pub fn predict_speedups(&self, features: &[f64]) -> Result<[f64; NUM_OPTIMIZATIONS]> {
        let raw = self.model.forward(features)?;
        if raw.len() != NUM_OPTIMIZATIONS {
            return Err(CoreError::dimension_mismatch(NUM_OPTIMIZATIONS, raw.len()));
        }

        let prior = self.prior_weight();
        let mut out = [1.0; NUM_OPTIMIZATIONS];
        for (k, slot) in out.iter_mut().enumerate() {
            let blended = prior * self.config.prior_speedups[k] + (1.0 - prior) * raw[k];
            *slot = clamp_speedup(blended, self.config.max_speedup_clamp);
        }
        Ok(out)
    }

    pub fn predict_for(&self, source: &FeatureSource<'_>) -> Result<[f64; NUM_OPTIMIZATIONS]> {
        self.predict_speedups(&self.extractor.extract(source))
    }

    /// Best plan under `budget` for the function described by `source`
    pub fn select_plan(
        &self,
        source: &FeatureSource<'_>,
        budget: u32,
        min_benefit: f64,
    ) -> Result<OptimizationPlan> {
        let predictions = self.predict_for(source)?;
        let plan = select_plan_from_predictions(&predictions, budget, min_benefit);
        debug!(
            optimizations = plan.len(),
            predicted_speedup = plan.predicted_speedup,
            cost = plan.total_cost,
            "selected optimization plan"
        );
        Ok(plan)
    }

    /// One online training step
    pub fn update(&mut self, sample: &Sample, rng: &mut dyn RngCore) -> Result<f64> {
        let loss = self
            .model
            .train_one(&sample.features, &sample.observed_speedups, rng)?;
        self.trained_steps += 1;
        Ok(loss)
    }

    pub fn train_batch(
        &mut self,
        samples: &[Sample],
        epochs: usize,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<f64>> {
        let history = self.model.train_batch(samples, epochs, rng)?;
        self.trained_steps += (samples.len() * epochs) as u64;
        Ok(history)
    }

    pub fn learning_rate(&self) -> f64 {
        self.model.learning_rate()
    }

    pub fn set_learning_rate(&mut self, learning_rate: f64) {
        self.model.set_learning_rate(learning_rate);
    }

    pub fn snapshot(&self) -> PredictorSnapshot {
        PredictorSnapshot {
            network: self.model.snapshot(),
            trained_steps: self.trained_steps,
        }
    }

    pub fn restore(&mut self, snapshot: &PredictorSnapshot) -> Result<()> {
        self.model.restore(&snapshot.network)?;
        self.trained_steps = snapshot.trained_steps;
        Ok(())
    }

    /// Fresh weights; predictions fall back to the prior
    pub fn reinitialize(&mut self, rng: &mut dyn RngCore) {
        self.model.reinitialize(rng);
        self.trained_steps = 0;
    }
}

/// Clamp into `[1.0, max]`; non-finite values count as no speedup
pub fn clamp_speedup(value: f64, max: f64) -> f64 {
    if value.is_nan() {
        1.0
    } else {
        value.clamp(1.0, max)
    }
}

impl VariantSelector for OptimizationPredictor {
    /// Untried candidates first, by expected speedup; otherwise the fastest
    /// observed mean time
    fn select(&self, candidates: &[SelectorCandidate]) -> Option<usize> {
        let untried = candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| c.use_count == 0)
            .fold(None, |best: Option<(usize, f64)>, (i, c)| match best {
                Some((_, s)) if s >= c.expected_speedup => best,
                _ => Some((i, c.expected_speedup)),
            });
        if let Some((i, _)) = untried {
            return Some(i);
        }

        candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| c.mean_time.is_finite())
            .fold(None, |best: Option<(usize, f64)>, (i, c)| match best {
                Some((_, t)) if t <= c.mean_time => best,
                _ => Some((i, c.mean_time)),
            })
            .map(|(i, _)| i)
    }
}
