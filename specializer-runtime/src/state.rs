//! Per-function orchestration state

use crate::builder::{BuildJob, VariantBuilder};
use crate::config::FunctionConfig;
use crate::snapshot::FunctionSnapshot;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use specializer_core::{Callable, ContextMetadata, OptimizationPlan, StaticMetadata};
use std::sync::Arc;

/// Where a function is in its specialization cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    /// Profiling, no specialized variants
    Observed,
    /// Builds requested and not all settled
    Specializing,
    /// Specialized variants are registered
    Serving,
}

/// Timing of calls served by the original callable
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BaselineStats {
    pub count: u64,
    pub total_time: f64,
}

impl BaselineStats {
    pub fn record(&mut self, elapsed_ms: f64) {
        self.count += 1;
        self.total_time += elapsed_ms;
    }

    pub fn mean(&self) -> Option<f64> {
        if self.count == 0 || self.total_time <= 0.0 {
            None
        } else {
            Some(self.total_time / self.count as f64)
        }
    }
}

/// What a build job produces a callable for
pub(crate) enum BuildTarget {
    NewVariant {
        signature: String,
        plan: OptimizationPlan,
    },
    Rehydrate {
        variant_id: String,
    },
}

pub(crate) struct PendingBuild {
    pub target: BuildTarget,
    pub job: BuildJob,
}

pub(crate) struct FunctionState {
    pub config: FunctionConfig,
    pub phase: Phase,
    pub original: Option<Callable>,
    pub builder: Option<Arc<dyn VariantBuilder>>,
    pub consecutive_failures: u32,
    /// Set after repeated builder failures; cleared by reset
    pub suppressed: bool,
    /// Profiled call count at which specialization may be tried again
    pub rearm_at: u64,
    pub wrapped_calls: u64,
    pub specializations: u64,
    pub pending: Vec<PendingBuild>,
    /// A variant build was dropped without a result
    pub abandoned: bool,
    pub baselines: FxHashMap<String, BaselineStats>,
    /// Successful calls per variant since its last observation
    pub observation_counters: FxHashMap<String, u64>,
    pub last_speedup: Option<f64>,
    pub static_info: Option<StaticMetadata>,
    pub context: Option<ContextMetadata>,
}

impl FunctionState {
    pub fn new(config: FunctionConfig) -> Self {
        Self {
            config,
            phase: Phase::Observed,
            original: None,
            builder: None,
            consecutive_failures: 0,
            suppressed: false,
            rearm_at: 0,
            wrapped_calls: 0,
            specializations: 0,
            pending: Vec::new(),
            abandoned: false,
            baselines: FxHashMap::default(),
            observation_counters: FxHashMap::default(),
            last_speedup: None,
            static_info: None,
            context: None,
        }
    }

    pub fn has_pending_variants(&self) -> bool {
        self.pending
            .iter()
            .any(|p| matches!(p.target, BuildTarget::NewVariant { .. }))
    }

    /// Back to `Observed` with no failure history
    pub fn reset_specialization(&mut self) {
        self.phase = Phase::Observed;
        self.consecutive_failures = 0;
        self.suppressed = false;
        self.rearm_at = 0;
        self.pending.clear();
        self.abandoned = false;
        self.observation_counters.clear();
        self.last_speedup = None;
    }

    pub fn snapshot(&self) -> FunctionSnapshot {
        FunctionSnapshot {
            config: self.config.clone(),
            phase: self.phase,
            consecutive_failures: self.consecutive_failures,
            suppressed: self.suppressed,
            rearm_at: self.rearm_at,
            wrapped_calls: self.wrapped_calls,
            specializations: self.specializations,
            baselines: self
                .baselines
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
            last_speedup: self.last_speedup,
            static_info: self.static_info.clone(),
            context: self.context.clone(),
        }
    }

    /// Load saved bookkeeping; the live callable and builder are kept
    pub fn apply_snapshot(&mut self, snapshot: FunctionSnapshot) {
        self.config = snapshot.config;
        // Build jobs do not survive a snapshot.
        self.phase = match snapshot.phase {
            Phase::Specializing => Phase::Observed,
            phase => phase,
        };
        self.consecutive_failures = snapshot.consecutive_failures;
        self.suppressed = snapshot.suppressed;
        self.rearm_at = snapshot.rearm_at;
        self.wrapped_calls = snapshot.wrapped_calls;
        self.specializations = snapshot.specializations;
        self.pending.clear();
        self.abandoned = false;
        self.baselines = snapshot.baselines.into_iter().collect();
        self.observation_counters.clear();
        self.last_speedup = snapshot.last_speedup;
        self.static_info = snapshot.static_info;
        self.context = snapshot.context;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_baseline_mean() {
        let mut stats = BaselineStats::default();
        assert_eq!(stats.mean(), None);
        stats.record(2.0);
        stats.record(4.0);
        assert_eq!(stats.mean(), Some(3.0));
    }

    #[test]
    fn test_snapshot_drops_in_flight_builds() {
        let mut state = FunctionState::new(FunctionConfig::default());
        state.phase = Phase::Specializing;
        state.suppressed = true;
        state.baselines.entry("int32".into()).or_default().record(5.0);

        let mut restored = FunctionState::new(FunctionConfig::default());
        restored.apply_snapshot(state.snapshot());
        assert_eq!(restored.phase, Phase::Observed);
        assert!(restored.suppressed);
        assert_eq!(restored.baselines["int32"].mean(), Some(5.0));
    }
}
