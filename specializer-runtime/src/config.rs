//! Orchestrator configuration

use serde::{Deserialize, Serialize};
use specializer_core::{CoreError, Result};
use specializer_ml::{LearnerConfig, PredictorConfig};

/// Per-function settings, fixed at wrap time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FunctionConfig {
    /// Fraction of calls the profiler records, in `(0, 1]`
    pub sample_rate: f64,
    /// Profiled calls before specialization is attempted
    pub specialize_threshold: u64,
    /// Cost units available to one optimization plan
    pub budget: u32,
    /// Smallest predicted gain an optimization must offer
    pub min_benefit: f64,
    pub prune_min_use_count: u64,
    /// Minimum age before a cold variant is pruned; infinite disables
    /// pruning by age
    #[serde(with = "specializer_core::profiling::extended_f64")]
    pub prune_max_age_ms: f64,
    /// Wrapped calls between automatic prunes; 0 disables
    pub prune_interval_calls: u64,
    /// Successful variant calls between measured-speedup observations
    pub observation_interval: u64,
    /// Let the predictor choose between several matching variants
    pub use_ml_selector: bool,
}

impl Default for FunctionConfig {
    fn default() -> Self {
        Self {
            sample_rate: 0.1,
            specialize_threshold: 100,
            budget: 10,
            min_benefit: 0.05,
            prune_min_use_count: 10,
            prune_max_age_ms: 3_600_000.0,
            prune_interval_calls: 1000,
            observation_interval: 10,
            use_ml_selector: true,
        }
    }
}

impl FunctionConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.sample_rate > 0.0 && self.sample_rate <= 1.0) {
            return Err(CoreError::invalid_config("sample_rate", "must be in (0, 1]"));
        }
        if self.specialize_threshold == 0 {
            return Err(CoreError::invalid_config("specialize_threshold", "must be at least 1"));
        }
        if !(self.min_benefit.is_finite() && self.min_benefit >= 0.0) {
            return Err(CoreError::invalid_config("min_benefit", "must be non-negative"));
        }
        if self.prune_max_age_ms.is_nan() || self.prune_max_age_ms < 0.0 {
            return Err(CoreError::invalid_config("prune_max_age_ms", "must be non-negative"));
        }
        if self.observation_interval == 0 {
            return Err(CoreError::invalid_config("observation_interval", "must be at least 1"));
        }
        Ok(())
    }
}

/// Process-wide settings for a [`SpecializationCore`](crate::SpecializationCore)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub learner: LearnerConfig,
    pub predictor: PredictorConfig,
    /// Used by `wrap` when no per-function config is given
    pub defaults: FunctionConfig,
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        self.learner.validate()?;
        self.predictor.validate()?;
        self.defaults.validate()
    }

    /// Parse and validate a JSON document; missing fields take defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }
}
