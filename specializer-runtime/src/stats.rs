//! Read-only statistics view

use crate::state::Phase;
use serde::Serialize;
use specializer_core::OptimizationKind;
use std::collections::BTreeMap;

/// Everything `get_statistics` reports
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreStatistics {
    pub per_function: BTreeMap<String, FunctionStatistics>,
    pub predictor: PredictorStatistics,
    pub replay: ReplayStatistics,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionStatistics {
    pub phase: Phase,
    /// Profiled calls
    pub total_calls: u64,
    /// Every call through the wrapper
    pub wrapped_calls: u64,
    pub signatures: usize,
    pub hot_signatures: Vec<String>,
    pub mean_time: f64,
    pub variants: Vec<VariantStatistics>,
    pub specializations: u64,
    pub consecutive_failures: u32,
    pub suppressed: bool,
    pub pending_builds: usize,
    pub last_speedup: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantStatistics {
    pub id: String,
    pub signature: String,
    pub optimizations: Vec<OptimizationKind>,
    pub expected_speedup: f64,
    pub use_count: u64,
    pub mean_time: f64,
    pub guard_failure_rate: f64,
    /// Has a callable and can be dispatched
    pub live: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictorStatistics {
    pub iterations: u64,
    pub current_lr: f64,
    pub recent_mae: f64,
    /// Percent drop of the recent error against the older half of the window
    pub improvement_trend: f64,
    pub degraded: bool,
    pub batch_retrains: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayStatistics {
    pub size: usize,
    pub max: usize,
    pub mean_speedups: Vec<(String, f64)>,
}
