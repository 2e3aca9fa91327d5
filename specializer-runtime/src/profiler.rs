//! Sampling call profiler
//!
//! Records per-function, per-signature timing for a random sample of calls
//! and ranks the signatures worth specializing. The profiler holds no locks
//! of its own; the owning core serializes access.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use specializer_core::rng::next_float;
use specializer_core::{BoxedRng, Clock, MemoryProbe, Profile, TypeSignature, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Share of calls the retained signatures must cover
pub const REPORT_COVERAGE: f64 = 0.8;

/// Share of functions, by call count, considered hot
pub const HOT_FUNCTION_FRACTION: f64 = 0.1;

/// Handle for one sampled call, returned by [`RuntimeProfiler::start_call`]
#[derive(Debug, Clone, PartialEq)]
pub struct CallToken {
    pub func_id: String,
    pub signature: String,
    start_ms: f64,
    start_mem: Option<u64>,
}

/// One signature worth specializing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureReport {
    pub signature: String,
    pub count: u64,
    /// Share of the function's calls with this signature
    pub coverage: f64,
    pub mean_time: f64,
    /// `coverage / mean_time`
    pub priority: f64,
}

/// Signatures of one function ranked by specialization priority
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecializationReport {
    pub func_id: String,
    pub total_calls: u64,
    pub signatures: Vec<SignatureReport>,
}

impl SpecializationReport {
    /// Signatures, highest priority first
    pub fn top_signatures(&self) -> impl Iterator<Item = &str> {
        self.signatures.iter().map(|s| s.signature.as_str())
    }
}

/// Serialized profiler state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfilerSnapshot {
    pub profiles: BTreeMap<String, Profile>,
    pub sample_rates: BTreeMap<String, f64>,
}

/// Sampling profiler keyed by function id
pub struct RuntimeProfiler {
    profiles: FxHashMap<String, Profile>,
    sample_rates: FxHashMap<String, f64>,
    default_sample_rate: f64,
    clock: Arc<dyn Clock>,
    memory: Arc<dyn MemoryProbe>,
    rng: BoxedRng,
}

impl RuntimeProfiler {
    pub fn new(
        default_sample_rate: f64,
        clock: Arc<dyn Clock>,
        memory: Arc<dyn MemoryProbe>,
        rng: BoxedRng,
    ) -> Self {
        Self {
            profiles: FxHashMap::default(),
            sample_rates: FxHashMap::default(),
            default_sample_rate,
            clock,
            memory,
            rng,
        }
    }

    /// Override the sample rate for one function
    pub fn set_sample_rate(&mut self, func_id: &str, rate: f64) {
        self.sample_rates.insert(func_id.to_string(), rate);
    }

    pub fn sample_rate(&self, func_id: &str) -> f64 {
        self.sample_rates
            .get(func_id)
            .copied()
            .unwrap_or(self.default_sample_rate)
    }

    /// Begin a call; `None` when the call is not sampled
    pub fn start_call(&mut self, func_id: &str, args: &[Value]) -> Option<CallToken> {
        if !self.should_sample(func_id) {
            return None;
        }
        Some(self.open_token(func_id, TypeSignature::build(args)))
    }

    /// [`start_call`](Self::start_call) for a signature the caller already built
    pub fn start_call_with_signature(&mut self, func_id: &str, signature: &str) -> Option<CallToken> {
        if !self.should_sample(func_id) {
            return None;
        }
        Some(self.open_token(func_id, signature.to_string()))
    }

    fn should_sample(&mut self, func_id: &str) -> bool {
        let rate = self.sample_rate(func_id);
        rate >= 1.0 || next_float(self.rng.as_mut()) < rate
    }

    fn open_token(&mut self, func_id: &str, signature: String) -> CallToken {
        self.profiles
            .entry(func_id.to_string())
            .or_insert_with(|| Profile::new(func_id));
        CallToken {
            func_id: func_id.to_string(),
            signature,
            start_ms: self.clock.now_ms(),
            start_mem: self.memory.current_bytes(),
        }
    }

    /// Finish a call started with [`start_call`](Self::start_call)
    pub fn end_call(&mut self, token: Option<CallToken>, success: bool) {
        let Some(token) = token else {
            return;
        };
        let now = self.clock.now_ms();
        let elapsed = (now - token.start_ms).max(0.0);
        let memory_delta = match (token.start_mem, self.memory.current_bytes()) {
            (Some(start), Some(end)) => end as f64 - start as f64,
            _ => 0.0,
        };

        self.profiles
            .entry(token.func_id.clone())
            .or_insert_with(|| Profile::new(token.func_id.as_str()))
            .record(&token.signature, elapsed, memory_delta, success, now);
    }

    pub fn profile(&self, func_id: &str) -> Option<&Profile> {
        self.profiles.get(func_id)
    }

    pub fn profiles(&self) -> impl Iterator<Item = &Profile> {
        self.profiles.values()
    }

    /// Rank the signatures of `func_id` once it has at least `min_calls`
    /// profiled calls
    pub fn analyze_for_specialization(
        &self,
        func_id: &str,
        min_calls: u64,
    ) -> Option<SpecializationReport> {
        let profile = self.profiles.get(func_id)?;
        if profile.total_calls < min_calls || profile.total_calls == 0 {
            return None;
        }

        let total = profile.total_calls as f64;
        let mut signatures: Vec<SignatureReport> = profile
            .signatures_by_coverage(REPORT_COVERAGE)
            .into_iter()
            .filter_map(|signature| {
                let stats = profile.signatures.get(&signature)?;
                let coverage = stats.count as f64 / total;
                let priority = if stats.mean_time > 0.0 {
                    coverage / stats.mean_time
                } else {
                    f64::INFINITY
                };
                Some(SignatureReport {
                    signature,
                    count: stats.count,
                    coverage,
                    mean_time: stats.mean_time,
                    priority,
                })
            })
            .collect();
        signatures.sort_by(|a, b| b.priority.total_cmp(&a.priority));

        Some(SpecializationReport {
            func_id: func_id.to_string(),
            total_calls: profile.total_calls,
            signatures,
        })
    }

    /// Functions in the top `fraction` by call count, busiest first
    pub fn hot_functions(&self, fraction: f64) -> Vec<String> {
        let mut ranked: Vec<&Profile> = self.profiles.values().filter(|p| p.total_calls > 0).collect();
        ranked.sort_by(|a, b| {
            b.total_calls
                .cmp(&a.total_calls)
                .then_with(|| a.func_id.cmp(&b.func_id))
        });
        let keep = ((ranked.len() as f64) * fraction.clamp(0.0, 1.0)).ceil() as usize;
        ranked
            .into_iter()
            .take(keep)
            .map(|p| p.func_id.clone())
            .collect()
    }

    /// In the top decile by call count
    pub fn is_hot(&self, func_id: &str) -> bool {
        self.hot_functions(HOT_FUNCTION_FRACTION)
            .iter()
            .any(|id| id == func_id)
    }

    /// Share of all profiled time spent in `func_id`
    pub fn time_share(&self, func_id: &str) -> f64 {
        let total: f64 = self.profiles.values().map(Profile::total_time).sum();
        if total <= 0.0 {
            return 0.0;
        }
        self.profiles
            .get(func_id)
            .map_or(0.0, |p| p.total_time() / total)
    }

    /// Hot signatures of `func_id`, most frequent first
    pub fn hot_path(&self, func_id: &str) -> Vec<String> {
        self.profiles
            .get(func_id)
            .map(Profile::hot_signatures)
            .unwrap_or_default()
    }

    /// Forget a function's profile and sample-rate override
    pub fn remove(&mut self, func_id: &str) {
        self.profiles.remove(func_id);
        self.sample_rates.remove(func_id);
    }

    pub fn clear(&mut self) {
        self.profiles.clear();
        self.sample_rates.clear();
    }

    pub fn snapshot(&self) -> ProfilerSnapshot {
        ProfilerSnapshot {
            profiles: self
                .profiles
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            sample_rates: self
                .sample_rates
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
        }
    }

    pub fn restore(&mut self, snapshot: ProfilerSnapshot) {
        self.profiles = snapshot.profiles.into_iter().collect();
        self.sample_rates = snapshot.sample_rates.into_iter().collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use specializer_core::{seeded_rng, ManualClock, ManualMemoryProbe, NoMemoryProbe};

    fn profiler(rate: f64, clock: Arc<ManualClock>) -> RuntimeProfiler {
        RuntimeProfiler::new(rate, clock, Arc::new(NoMemoryProbe), Box::new(seeded_rng(1)))
    }

    fn timed_call(p: &mut RuntimeProfiler, clock: &ManualClock, func: &str, args: &[Value], dt: f64) {
        let token = p.start_call(func, args);
        clock.advance(dt);
        p.end_call(token, true);
    }

    #[test]
    fn test_mean_time_invariant() {
        let clock = Arc::new(ManualClock::new(0.0));
        let mut p = profiler(1.0, clock.clone());
        let args = [Value::Int(1), Value::Int(2)];

        for (dt, mean, total) in [(10.0, 10.0, 10.0), (20.0, 15.0, 30.0), (30.0, 20.0, 60.0)] {
            timed_call(&mut p, &clock, "add", &args, dt);
            let stats = &p.profile("add").unwrap().signatures["int32,int32"];
            assert_eq!(stats.mean_time, mean);
            assert_eq!(stats.total_time, total);
            assert_eq!(stats.min_time, 10.0);
            assert_eq!(stats.max_time, dt);
        }
        assert_eq!(p.profile("add").unwrap().total_calls, 3);
    }

    #[test]
    fn test_unsampled_calls_are_ignored() {
        let clock = Arc::new(ManualClock::new(0.0));
        let mut p = profiler(1e-12, clock.clone());
        for _ in 0..1000 {
            timed_call(&mut p, &clock, "f", &[], 1.0);
        }
        assert!(p.profile("f").is_none());
        assert!(p.analyze_for_specialization("f", 1).is_none());
        p.end_call(None, true);
    }

    #[test]
    fn test_sample_rate_is_roughly_respected() {
        let clock = Arc::new(ManualClock::new(0.0));
        let mut p = profiler(0.1, clock.clone());
        for _ in 0..10_000 {
            timed_call(&mut p, &clock, "f", &[], 1.0);
        }
        let calls = p.profile("f").unwrap().total_calls;
        assert!((800..1200).contains(&calls), "sampled {}", calls);
    }

    #[test]
    fn test_memory_delta() {
        let clock = Arc::new(ManualClock::new(0.0));
        let memory = Arc::new(ManualMemoryProbe::default());
        let mut p = RuntimeProfiler::new(1.0, clock, memory.clone(), Box::new(seeded_rng(0)));

        memory.set(Some(1000));
        let token = p.start_call("f", &[]);
        memory.set(Some(1500));
        p.end_call(token, true);

        let token = p.start_call("f", &[]);
        memory.set(None);
        p.end_call(token, true);

        assert_eq!(p.profile("f").unwrap().signatures[""].memory_used_total, 500.0);
    }

    #[test]
    fn test_report_coverage_and_priority() {
        let clock = Arc::new(ManualClock::new(0.0));
        let mut p = profiler(1.0, clock.clone());
        let ints = [Value::Int(1)];
        let floats = [Value::Float(0.5)];
        let strings = [Value::from("s")];

        for _ in 0..60 {
            timed_call(&mut p, &clock, "f", &ints, 4.0);
        }
        for _ in 0..30 {
            timed_call(&mut p, &clock, "f", &floats, 1.0);
        }
        for _ in 0..10 {
            timed_call(&mut p, &clock, "f", &strings, 1.0);
        }

        assert!(p.analyze_for_specialization("f", 101).is_none());
        let report = p.analyze_for_specialization("f", 100).unwrap();
        let sigs: Vec<&str> = report.top_signatures().collect();
        // int32 covers 60%, float64 brings it to 90%; string is cut
        assert_eq!(sigs, vec!["float64", "int32"]);
        assert_eq!(report.signatures[0].priority, 0.3);
        assert_eq!(report.signatures[1].priority, 0.15);
    }

    #[test]
    fn test_hot_functions_and_time_share() {
        let clock = Arc::new(ManualClock::new(0.0));
        let mut p = profiler(1.0, clock.clone());
        for i in 0..10 {
            let id = format!("f{}", i);
            for _ in 0..=i {
                timed_call(&mut p, &clock, &id, &[], 1.0);
            }
        }
        assert_eq!(p.hot_functions(0.1), vec!["f9".to_string()]);
        assert!(p.is_hot("f9"));
        assert!(!p.is_hot("f8"));
        assert!((p.time_share("f9") - 10.0 / 55.0).abs() < 1e-12);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let clock = Arc::new(ManualClock::new(0.0));
        let mut p = profiler(1.0, clock.clone());
        p.set_sample_rate("g", 0.5);
        timed_call(&mut p, &clock, "f", &[Value::Bool(true)], 2.0);

        let mut q = profiler(1.0, clock);
        q.restore(p.snapshot());
        assert_eq!(q.profile("f"), p.profile("f"));
        assert_eq!(q.sample_rate("g"), 0.5);
    }
}
