//! Profiling data structures shared between the profiler and the learner
//!
//! This module defines the per-function profile records without any
//! collection logic, so the feature extractor and the runtime can both work
//! with them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Fraction of calls the hot signatures must cover
pub const HOT_SIGNATURE_COVERAGE: f64 = 0.8;

/// Serde support for floats that may be infinite or NaN
pub mod extended_f64 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Finite(f64),
        Special(String),
    }

    pub fn serialize<S>(value: &f64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let repr = if value.is_finite() {
            Repr::Finite(*value)
        } else if value.is_nan() {
            Repr::Special("nan".to_string())
        } else if *value > 0.0 {
            Repr::Special("inf".to_string())
        } else {
            Repr::Special("-inf".to_string())
        };
        repr.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<f64, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Repr::deserialize(deserializer)? {
            Repr::Finite(v) => Ok(v),
            Repr::Special(s) => match s.as_str() {
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                "nan" => Ok(f64::NAN),
                other => Err(serde::de::Error::custom(format!("invalid float: {}", other))),
            },
        }
    }
}

/// Timing statistics for one signature of one function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerSignatureStats {
    /// Number of profiled calls
    pub count: u64,
    /// Sum of call durations (ms)
    pub total_time: f64,
    /// `total_time / count`
    pub mean_time: f64,
    #[serde(with = "extended_f64")]
    pub min_time: f64,
    #[serde(with = "extended_f64")]
    pub max_time: f64,
    /// Sum of per-call memory deltas (bytes)
    pub memory_used_total: f64,
    /// Sum of squared durations, for the standard deviation
    pub total_time_sq: f64,
    /// Largest per-call memory delta
    pub peak_memory: f64,
    /// Calls that raised an error
    pub failures: u64,
}

impl Default for PerSignatureStats {
    fn default() -> Self {
        Self {
            count: 0,
            total_time: 0.0,
            mean_time: 0.0,
            min_time: f64::INFINITY,
            max_time: f64::NEG_INFINITY,
            memory_used_total: 0.0,
            total_time_sq: 0.0,
            peak_memory: 0.0,
            failures: 0,
        }
    }
}

impl PerSignatureStats {
    /// Fold in one observation
    pub fn record(&mut self, elapsed_ms: f64, memory_delta: f64, success: bool) {
        self.count += 1;
        self.total_time += elapsed_ms;
        self.total_time_sq += elapsed_ms * elapsed_ms;
        self.mean_time = self.total_time / self.count as f64;
        self.min_time = self.min_time.min(elapsed_ms);
        self.max_time = self.max_time.max(elapsed_ms);
        self.memory_used_total += memory_delta;
        self.peak_memory = self.peak_memory.max(memory_delta);
        if !success {
            self.failures += 1;
        }
    }

    /// Population standard deviation of call durations
    pub fn std_time(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let n = self.count as f64;
        let variance = self.total_time_sq / n - self.mean_time * self.mean_time;
        variance.max(0.0).sqrt()
    }
}

/// Aggregate dynamic statistics for one function, grouped by signature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub func_id: String,
    /// Sum of `count` over every signature
    pub total_calls: u64,
    pub signatures: BTreeMap<String, PerSignatureStats>,
    /// Clock reading of the first profiled call
    pub first_call_at: Option<f64>,
    /// Clock reading of the latest profiled call
    pub last_call_at: Option<f64>,
}

impl Profile {
    pub fn new(func_id: impl Into<String>) -> Self {
        Self {
            func_id: func_id.into(),
            total_calls: 0,
            signatures: BTreeMap::new(),
            first_call_at: None,
            last_call_at: None,
        }
    }

    /// Record a completed call
    pub fn record(
        &mut self,
        signature: &str,
        elapsed_ms: f64,
        memory_delta: f64,
        success: bool,
        now_ms: f64,
    ) {
        self.signatures
            .entry(signature.to_string())
            .or_default()
            .record(elapsed_ms, memory_delta, success);
        self.total_calls += 1;
        self.first_call_at.get_or_insert(now_ms);
        self.last_call_at = Some(now_ms);
    }

    /// Signatures covering the top share of calls, most frequent first.
    /// Derived from the counts on each call, so recording stays cheap.
    pub fn hot_signatures(&self) -> Vec<String> {
        self.signatures_by_coverage(HOT_SIGNATURE_COVERAGE)
    }

    /// Signatures sorted by call count (ties by name), cut once cumulative
    /// coverage reaches `coverage`
    pub fn signatures_by_coverage(&self, coverage: f64) -> Vec<String> {
        let mut sorted: Vec<(&String, &PerSignatureStats)> = self.signatures.iter().collect();
        sorted.sort_by(|a, b| b.1.count.cmp(&a.1.count).then_with(|| a.0.cmp(b.0)));

        let total = self.total_calls.max(1) as f64;
        let mut cumulative = 0.0;
        let mut hot = Vec::new();
        for (signature, stats) in sorted {
            if cumulative >= coverage {
                break;
            }
            cumulative += stats.count as f64 / total;
            hot.push(signature.clone());
        }
        hot
    }

    /// Total time across signatures
    pub fn total_time(&self) -> f64 {
        self.signatures.values().map(|s| s.total_time).sum()
    }

    /// Mean time across signatures
    pub fn mean_time(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.total_time() / self.total_calls as f64
        }
    }

    pub fn min_time(&self) -> f64 {
        let min = self
            .signatures
            .values()
            .map(|s| s.min_time)
            .fold(f64::INFINITY, f64::min);
        if min.is_finite() {
            min
        } else {
            0.0
        }
    }

    pub fn max_time(&self) -> f64 {
        let max = self
            .signatures
            .values()
            .map(|s| s.max_time)
            .fold(f64::NEG_INFINITY, f64::max);
        if max.is_finite() {
            max
        } else {
            0.0
        }
    }

    /// Pooled standard deviation of call durations
    pub fn std_time(&self) -> f64 {
        if self.total_calls == 0 {
            return 0.0;
        }
        let n = self.total_calls as f64;
        let sum_sq: f64 = self.signatures.values().map(|s| s.total_time_sq).sum();
        let mean = self.mean_time();
        (sum_sq / n - mean * mean).max(0.0).sqrt()
    }

    pub fn mean_memory(&self) -> f64 {
        if self.total_calls == 0 {
            return 0.0;
        }
        let total: f64 = self.signatures.values().map(|s| s.memory_used_total).sum();
        total / self.total_calls as f64
    }

    pub fn peak_memory(&self) -> f64 {
        self.signatures
            .values()
            .map(|s| s.peak_memory)
            .fold(0.0, f64::max)
    }

    pub fn failures(&self) -> u64 {
        self.signatures.values().map(|s| s.failures).sum()
    }

    /// Profiled calls per second between the first and latest call
    pub fn calls_per_second(&self) -> f64 {
        match (self.first_call_at, self.last_call_at) {
            (Some(first), Some(last)) if last > first => {
                self.total_calls as f64 / ((last - first) / 1000.0)
            }
            _ => 0.0,
        }
    }

    /// Share of calls taken by the most frequent signature
    pub fn dominant_signature_share(&self) -> f64 {
        if self.total_calls == 0 {
            return 0.0;
        }
        let max = self.signatures.values().map(|s| s.count).max().unwrap_or(0);
        max as f64 / self.total_calls as f64
    }

    /// Whether `total_calls` equals the per-signature sum
    pub fn is_consistent(&self) -> bool {
        self.total_calls == self.signatures.values().map(|s| s.count).sum::<u64>()
    }
}

/// Host-supplied static description of a function's source
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StaticMetadata {
    pub line_count: f64,
    pub char_count: f64,
    pub token_count: f64,
    pub cyclomatic_complexity: f64,
    pub max_nesting_depth: f64,
    pub loop_count: f64,
    pub conditional_count: f64,
    pub return_count: f64,
    pub is_recursive: bool,
    pub is_mutually_recursive: bool,
    pub mean_branching_factor: f64,
    pub expression_complexity: f64,
    pub parameter_count: f64,
    pub local_variable_count: f64,
    pub call_site_count: f64,
    pub arithmetic_op_count: f64,
    pub array_access_count: f64,
    pub property_access_count: f64,
    pub has_closures: bool,
    pub string_op_count: f64,
}

/// Host-supplied call-graph context of a function
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextMetadata {
    pub call_graph_depth: f64,
    /// Centrality in `[0, 1]`
    pub centrality: f64,
    pub caller_count: f64,
    pub callee_count: f64,
    pub on_hot_path: bool,
    pub hot_path_length: f64,
}
