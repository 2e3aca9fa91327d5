//! Pluggable variant selection

use serde::{Deserialize, Serialize};

/// What a selector sees about one dispatch candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectorCandidate {
    pub id: String,
    pub signature: String,
    pub expected_speedup: f64,
    pub use_count: u64,
    pub mean_time: f64,
}

/// Picks one of several variants that match an incoming signature.
///
/// Returns an index into `candidates`, or `None` to fall back to the
/// registry's own scoring.
pub trait VariantSelector {
    fn select(&self, candidates: &[SelectorCandidate]) -> Option<usize>;
}
