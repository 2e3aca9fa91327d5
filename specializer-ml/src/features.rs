//! Feature extraction for function profiles
//!
//! Every slot has a fixed `(accessor, min, max, scale)` schedule so the same
//! profile always maps to the same vector, independent of what else has been
//! observed. Missing inputs read as zero.

use specializer_core::{ContextMetadata, Profile, StaticMetadata};

/// Length of every feature vector
pub const FEATURE_DIM: usize = 50;

/// A normalized feature vector; every slot lies in `[0, 1]`
pub type FeatureVector = Vec<f64>;

/// Feature group a slot belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureGroup {
    Static,
    Dynamic,
    Contextual,
}

/// Transform applied before min/max normalization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureScale {
    Linear,
    Log1p,
}

impl FeatureScale {
    fn apply(self, x: f64) -> f64 {
        match self {
            FeatureScale::Linear => x,
            FeatureScale::Log1p => x.ln_1p(),
        }
    }
}

/// Runtime facts about a function that live outside its profile
#[derive(Debug, Clone, Default)]
pub struct RuntimeContext {
    /// Current clock reading (ms)
    pub now_ms: f64,
    /// In the top decile of call counts
    pub is_hot: bool,
    /// Share of all profiled time spent in this function
    pub time_share: f64,
    pub variant_count: usize,
    /// Deopts over variant executions
    pub deopt_rate: f64,
    pub previously_optimized: bool,
    pub last_speedup: Option<f64>,
    pub applied_optimization_count: usize,
    pub arg_count: usize,
}

/// Everything the extractor reads for one function
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureSource<'a> {
    pub profile: Option<&'a Profile>,
    pub static_info: Option<&'a StaticMetadata>,
    pub context: Option<&'a ContextMetadata>,
    pub runtime: Option<&'a RuntimeContext>,
}

impl<'a> FeatureSource<'a> {
    pub fn from_profile(profile: &'a Profile) -> Self {
        Self {
            profile: Some(profile),
            ..Self::default()
        }
    }

    fn stat(&self, f: impl Fn(&StaticMetadata) -> f64) -> f64 {
        self.static_info.map(f).unwrap_or(0.0)
    }

    fn dynamic(&self, f: impl Fn(&Profile) -> f64) -> f64 {
        self.profile.map(f).unwrap_or(0.0)
    }

    fn ctx(&self, f: impl Fn(&ContextMetadata) -> f64) -> f64 {
        self.context.map(f).unwrap_or(0.0)
    }

    fn rt(&self, f: impl Fn(&RuntimeContext) -> f64) -> f64 {
        self.runtime.map(f).unwrap_or(0.0)
    }
}

fn flag(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

/// Normalization schedule for one slot
pub struct FeatureSpec {
    pub name: &'static str,
    pub group: FeatureGroup,
    pub min: f64,
    pub max: f64,
    pub scale: FeatureScale,
    accessor: fn(&FeatureSource<'_>) -> f64,
}

impl FeatureSpec {
    const fn new(
        name: &'static str,
        group: FeatureGroup,
        min: f64,
        max: f64,
        scale: FeatureScale,
        accessor: fn(&FeatureSource<'_>) -> f64,
    ) -> Self {
        Self {
            name,
            group,
            min,
            max,
            scale,
            accessor,
        }
    }

    /// Normalized value of this slot for `source`
    pub fn normalize(&self, source: &FeatureSource<'_>) -> f64 {
        let raw = (self.accessor)(source);
        if raw.is_nan() {
            return 0.0;
        }
        let lo = self.scale.apply(self.min);
        let hi = self.scale.apply(self.max);
        let value = (self.scale.apply(raw.max(self.min)) - lo) / (hi - lo);
        if value.is_nan() {
            0.0
        } else {
            value.clamp(0.0, 1.0)
        }
    }
}

use FeatureGroup::{Contextual, Dynamic, Static};
use FeatureScale::{Linear, Log1p};

/// The fixed schedule. Order is part of the model's input contract.
pub static FEATURE_SCHEDULE: [FeatureSpec; FEATURE_DIM] = [
    // Static
    FeatureSpec::new("line_count", Static, 0.0, 500.0, Log1p, |s| s.stat(|m| m.line_count)),
    FeatureSpec::new("char_count", Static, 0.0, 20_000.0, Log1p, |s| s.stat(|m| m.char_count)),
    FeatureSpec::new("token_count", Static, 0.0, 5_000.0, Log1p, |s| s.stat(|m| m.token_count)),
    FeatureSpec::new("cyclomatic_complexity", Static, 0.0, 50.0, Linear, |s| {
        s.stat(|m| m.cyclomatic_complexity)
    }),
    FeatureSpec::new("max_nesting_depth", Static, 0.0, 10.0, Linear, |s| {
        s.stat(|m| m.max_nesting_depth)
    }),
    FeatureSpec::new("loop_count", Static, 0.0, 20.0, Linear, |s| s.stat(|m| m.loop_count)),
    FeatureSpec::new("conditional_count", Static, 0.0, 50.0, Linear, |s| {
        s.stat(|m| m.conditional_count)
    }),
    FeatureSpec::new("return_count", Static, 0.0, 20.0, Linear, |s| s.stat(|m| m.return_count)),
    FeatureSpec::new("is_recursive", Static, 0.0, 1.0, Linear, |s| {
        s.stat(|m| flag(m.is_recursive))
    }),
    FeatureSpec::new("is_mutually_recursive", Static, 0.0, 1.0, Linear, |s| {
        s.stat(|m| flag(m.is_mutually_recursive))
    }),
    FeatureSpec::new("mean_branching_factor", Static, 0.0, 8.0, Linear, |s| {
        s.stat(|m| m.mean_branching_factor)
    }),
    FeatureSpec::new("expression_complexity", Static, 0.0, 100.0, Log1p, |s| {
        s.stat(|m| m.expression_complexity)
    }),
    FeatureSpec::new("parameter_count", Static, 0.0, 10.0, Linear, |s| {
        s.stat(|m| m.parameter_count)
    }),
    FeatureSpec::new("local_variable_count", Static, 0.0, 50.0, Linear, |s| {
        s.stat(|m| m.local_variable_count)
    }),
    FeatureSpec::new("call_site_count", Static, 0.0, 50.0, Linear, |s| {
        s.stat(|m| m.call_site_count)
    }),
    FeatureSpec::new("arithmetic_op_count", Static, 0.0, 200.0, Log1p, |s| {
        s.stat(|m| m.arithmetic_op_count)
    }),
    FeatureSpec::new("array_access_count", Static, 0.0, 100.0, Log1p, |s| {
        s.stat(|m| m.array_access_count)
    }),
    FeatureSpec::new("property_access_count", Static, 0.0, 100.0, Log1p, |s| {
        s.stat(|m| m.property_access_count)
    }),
    FeatureSpec::new("has_closures", Static, 0.0, 1.0, Linear, |s| {
        s.stat(|m| flag(m.has_closures))
    }),
    FeatureSpec::new("string_op_count", Static, 0.0, 50.0, Linear, |s| {
        s.stat(|m| m.string_op_count)
    }),
    // Dynamic
    FeatureSpec::new("call_count", Dynamic, 0.0, 1e7, Log1p, |s| {
        s.dynamic(|p| p.total_calls as f64)
    }),
    FeatureSpec::new("is_hot", Dynamic, 0.0, 1.0, Linear, |s| s.rt(|r| flag(r.is_hot))),
    FeatureSpec::new("calls_per_second", Dynamic, 0.0, 1e6, Log1p, |s| {
        s.dynamic(Profile::calls_per_second)
    }),
    FeatureSpec::new("mean_time_ms", Dynamic, 0.0, 1_000.0, Log1p, |s| {
        s.dynamic(Profile::mean_time)
    }),
    FeatureSpec::new("min_time_ms", Dynamic, 0.0, 1_000.0, Log1p, |s| {
        s.dynamic(Profile::min_time)
    }),
    FeatureSpec::new("max_time_ms", Dynamic, 0.0, 10_000.0, Log1p, |s| {
        s.dynamic(Profile::max_time)
    }),
    FeatureSpec::new("std_time_ms", Dynamic, 0.0, 1_000.0, Log1p, |s| {
        s.dynamic(Profile::std_time)
    }),
    FeatureSpec::new("total_time_ms", Dynamic, 0.0, 1e7, Log1p, |s| {
        s.dynamic(Profile::total_time)
    }),
    FeatureSpec::new("time_share", Dynamic, 0.0, 1.0, Linear, |s| s.rt(|r| r.time_share)),
    FeatureSpec::new("mean_memory_bytes", Dynamic, 0.0, 1e8, Log1p, |s| {
        s.dynamic(Profile::mean_memory)
    }),
    FeatureSpec::new("peak_memory_bytes", Dynamic, 0.0, 1e9, Log1p, |s| {
        s.dynamic(Profile::peak_memory)
    }),
    FeatureSpec::new("signature_count", Dynamic, 0.0, 32.0, Linear, |s| {
        s.dynamic(|p| p.signatures.len() as f64)
    }),
    FeatureSpec::new("dominant_signature_share", Dynamic, 0.0, 1.0, Linear, |s| {
        s.dynamic(Profile::dominant_signature_share)
    }),
    FeatureSpec::new("hot_signature_count", Dynamic, 0.0, 16.0, Linear, |s| {
        s.dynamic(|p| p.hot_signatures().len() as f64)
    }),
    FeatureSpec::new("is_polymorphic", Dynamic, 0.0, 1.0, Linear, |s| {
        s.dynamic(|p| flag(p.signatures.len() > 1))
    }),
    FeatureSpec::new("time_variation", Dynamic, 0.0, 4.0, Linear, |s| {
        s.dynamic(|p| {
            let mean = p.mean_time();
            if mean > 0.0 {
                p.std_time() / mean
            } else {
                0.0
            }
        })
    }),
    FeatureSpec::new("failure_rate", Dynamic, 0.0, 1.0, Linear, |s| {
        s.dynamic(|p| {
            if p.total_calls == 0 {
                0.0
            } else {
                p.failures() as f64 / p.total_calls as f64
            }
        })
    }),
    FeatureSpec::new("variant_count", Dynamic, 0.0, 16.0, Linear, |s| {
        s.rt(|r| r.variant_count as f64)
    }),
    FeatureSpec::new("deopt_rate", Dynamic, 0.0, 1.0, Linear, |s| s.rt(|r| r.deopt_rate)),
    FeatureSpec::new("profile_age_s", Dynamic, 0.0, 86_400.0, Log1p, |s| {
        let first = s.profile.and_then(|p| p.first_call_at);
        match (first, s.runtime) {
            (Some(first), Some(rt)) => (rt.now_ms - first) / 1000.0,
            _ => 0.0,
        }
    }),
    // Contextual
    FeatureSpec::new("call_graph_depth", Contextual, 0.0, 32.0, Linear, |s| {
        s.ctx(|c| c.call_graph_depth)
    }),
    FeatureSpec::new("centrality", Contextual, 0.0, 1.0, Linear, |s| s.ctx(|c| c.centrality)),
    FeatureSpec::new("caller_count", Contextual, 0.0, 100.0, Log1p, |s| {
        s.ctx(|c| c.caller_count)
    }),
    FeatureSpec::new("callee_count", Contextual, 0.0, 100.0, Log1p, |s| {
        s.ctx(|c| c.callee_count)
    }),
    FeatureSpec::new("on_hot_path", Contextual, 0.0, 1.0, Linear, |s| {
        s.ctx(|c| flag(c.on_hot_path))
    }),
    FeatureSpec::new("hot_path_length", Contextual, 0.0, 32.0, Linear, |s| {
        s.ctx(|c| c.hot_path_length)
    }),
    FeatureSpec::new("previously_optimized", Contextual, 0.0, 1.0, Linear, |s| {
        s.rt(|r| flag(r.previously_optimized))
    }),
    FeatureSpec::new("last_speedup", Contextual, 1.0, 8.0, Linear, |s| {
        s.rt(|r| r.last_speedup.unwrap_or(1.0))
    }),
    FeatureSpec::new("applied_optimization_count", Contextual, 0.0, 7.0, Linear, |s| {
        s.rt(|r| r.applied_optimization_count as f64)
    }),
    FeatureSpec::new("arg_count", Contextual, 0.0, 16.0, Linear, |s| {
        s.rt(|r| r.arg_count as f64)
    }),
];

/// Derives fixed-length normalized vectors from function profiles
#[derive(Debug, Default, Clone, Copy)]
pub struct FeatureExtractor;

impl FeatureExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Extract the feature vector for `source`. Never fails.
    pub fn extract(&self, source: &FeatureSource<'_>) -> FeatureVector {
        FEATURE_SCHEDULE
            .iter()
            .map(|spec| spec.normalize(source))
            .collect()
    }

    /// Shorthand for a profile with no other metadata
    pub fn extract_profile(&self, profile: &Profile) -> FeatureVector {
        self.extract(&FeatureSource::from_profile(profile))
    }

    pub fn feature_names(&self) -> Vec<&'static str> {
        FEATURE_SCHEDULE.iter().map(|spec| spec.name).collect()
    }

    /// Slot indices belonging to a group
    pub fn group_indices(&self, group: FeatureGroup) -> Vec<usize> {
        FEATURE_SCHEDULE
            .iter()
            .enumerate()
            .filter(|(_, spec)| spec.group == group)
            .map(|(i, _)| i)
            .collect()
    }
}
