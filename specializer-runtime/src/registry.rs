//! Variant storage and selection
//!
//! Variants live in per-function lists in registration order. Ids have the
//! form `<func_id>#<n>` with `n` drawn from a per-function counter that
//! survives pruning, so an id is never handed out twice.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use specializer_core::{
    Callable, OptimizationPlan, SelectorCandidate, TypeSignature, VariantSelector,
};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

/// A specialized implementation of one function
#[derive(Clone, Serialize, Deserialize)]
pub struct Variant {
    pub id: String,
    pub func_id: String,
    pub signature: String,
    /// `None` until the host rehydrates a restored variant
    #[serde(skip)]
    pub callable: Option<Callable>,
    pub plan: OptimizationPlan,
    pub expected_speedup: f64,
    pub created_at: f64,
    pub use_count: u64,
    pub total_time: f64,
    pub mean_time: f64,
    pub deopt_count: u64,
    pub guard_failure_rate: f64,
}

impl fmt::Debug for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Variant")
            .field("id", &self.id)
            .field("signature", &self.signature)
            .field("callable", &self.callable.is_some())
            .field("plan", &self.plan)
            .field("use_count", &self.use_count)
            .field("mean_time", &self.mean_time)
            .field("guard_failure_rate", &self.guard_failure_rate)
            .finish()
    }
}

impl Variant {
    pub fn is_generic(&self) -> bool {
        TypeSignature::is_generic(&self.signature)
    }

    /// Dispatchable right now
    pub fn is_live(&self) -> bool {
        self.callable.is_some()
    }

    /// Registry ranking when no selector decides
    fn score(&self) -> f64 {
        if self.use_count == 0 {
            self.expected_speedup
        } else if self.mean_time > 0.0 {
            (1.0 / self.mean_time) * (1.0 - self.guard_failure_rate)
        } else {
            f64::MAX * (1.0 - self.guard_failure_rate)
        }
    }

    fn candidate(&self) -> SelectorCandidate {
        SelectorCandidate {
            id: self.id.clone(),
            signature: self.signature.clone(),
            expected_speedup: self.expected_speedup,
            use_count: self.use_count,
            mean_time: self.mean_time,
        }
    }
}

/// What the caller supplies when registering a variant
pub struct VariantSpec {
    pub signature: String,
    pub callable: Option<Callable>,
    pub plan: OptimizationPlan,
    pub expected_speedup: f64,
}

impl VariantSpec {
    /// Spec for a variant built from `plan`
    pub fn from_plan(signature: impl Into<String>, callable: Callable, plan: OptimizationPlan) -> Self {
        Self {
            signature: signature.into(),
            callable: Some(callable),
            expected_speedup: plan.predicted_speedup,
            plan,
        }
    }
}

/// Serialized registry metadata; callables are not included
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub functions: BTreeMap<String, Vec<Variant>>,
    pub next_index: BTreeMap<String, u64>,
}

/// Variants per function
#[derive(Debug, Default)]
pub struct VariantRegistry {
    variants: FxHashMap<String, Vec<Variant>>,
    next_index: FxHashMap<String, u64>,
}

impl VariantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a variant; returns its id
    pub fn register(&mut self, func_id: &str, spec: VariantSpec, now_ms: f64) -> String {
        let index = self.next_index.entry(func_id.to_string()).or_insert(0);
        let id = format!("{}#{}", func_id, index);
        *index += 1;

        debug!(func_id, variant_id = %id, signature = %spec.signature, "registered variant");
        self.variants
            .entry(func_id.to_string())
            .or_default()
            .push(Variant {
                id: id.clone(),
                func_id: func_id.to_string(),
                signature: spec.signature,
                callable: spec.callable,
                plan: spec.plan,
                expected_speedup: spec.expected_speedup,
                created_at: now_ms,
                use_count: 0,
                total_time: 0.0,
                mean_time: 0.0,
                deopt_count: 0,
                guard_failure_rate: 0.0,
            });
        id
    }

    /// Best live variant of `func_id` for `signature`.
    ///
    /// Non-generic variants matching the signature compete; with none, the
    /// first generic fallback is used. Several candidates go to `selector`
    /// first, then to the registry's own score.
    pub fn select_best(
        &self,
        func_id: &str,
        signature: &str,
        selector: Option<&dyn VariantSelector>,
    ) -> Option<&Variant> {
        let variants = self.variants.get(func_id)?;
        let candidates: Vec<&Variant> = variants
            .iter()
            .filter(|v| v.is_live() && !v.is_generic())
            .filter(|v| TypeSignature::matches(&v.signature, signature))
            .collect();

        match candidates.len() {
            0 => variants.iter().find(|v| v.is_live() && v.is_generic()),
            1 => Some(candidates[0]),
            _ => {
                if let Some(selector) = selector {
                    let records: Vec<SelectorCandidate> =
                        candidates.iter().map(|v| v.candidate()).collect();
                    if let Some(choice) = selector.select(&records) {
                        if let Some(variant) = candidates.get(choice) {
                            return Some(*variant);
                        }
                    }
                }
                best_by_score(&candidates)
            }
        }
    }

    /// Update usage stats; returns false for an unknown id
    pub fn record_execution(&mut self, variant_id: &str, elapsed_ms: f64, success: bool) -> bool {
        let Some(variant) = self.variant_mut(variant_id) else {
            return false;
        };
        variant.use_count += 1;
        variant.total_time += elapsed_ms;
        variant.mean_time = variant.total_time / variant.use_count as f64;
        if !success {
            variant.deopt_count += 1;
        }
        variant.guard_failure_rate = variant.deopt_count as f64 / variant.use_count as f64;
        true
    }

    /// Drop cold, old variants of one function; returns the removed ids.
    /// Generic fallbacks always stay.
    pub fn prune_function(
        &mut self,
        func_id: &str,
        min_use_count: u64,
        max_age_ms: f64,
        now_ms: f64,
    ) -> Vec<String> {
        let Some(variants) = self.variants.get_mut(func_id) else {
            return Vec::new();
        };
        let mut removed = Vec::new();
        variants.retain(|v| {
            let stale = !v.is_generic()
                && v.use_count < min_use_count
                && now_ms - v.created_at > max_age_ms;
            if stale {
                removed.push(v.id.clone());
            }
            !stale
        });
        if !removed.is_empty() {
            debug!(func_id, removed = removed.len(), "pruned variants");
        }
        removed
    }

    /// [`prune_function`](Self::prune_function) over every function
    pub fn prune(&mut self, min_use_count: u64, max_age_ms: f64, now_ms: f64) -> Vec<String> {
        let mut ids: Vec<String> = self.variants.keys().cloned().collect();
        ids.sort();
        ids.iter()
            .flat_map(|id| self.prune_function(id, min_use_count, max_age_ms, now_ms))
            .collect()
    }

    pub fn variants(&self, func_id: &str) -> &[Variant] {
        self.variants.get(func_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn variant(&self, variant_id: &str) -> Option<&Variant> {
        let (func_id, _) = variant_id.rsplit_once('#')?;
        self.variants.get(func_id)?.iter().find(|v| v.id == variant_id)
    }

    fn variant_mut(&mut self, variant_id: &str) -> Option<&mut Variant> {
        let (func_id, _) = variant_id.rsplit_once('#')?;
        self.variants
            .get_mut(func_id)?
            .iter_mut()
            .find(|v| v.id == variant_id)
    }

    /// Attach a rebuilt callable to a restored variant
    pub fn set_callable(&mut self, variant_id: &str, callable: Callable) -> bool {
        match self.variant_mut(variant_id) {
            Some(variant) => {
                variant.callable = Some(callable);
                true
            }
            None => false,
        }
    }

    /// Variants of `func_id` still waiting for a callable
    pub fn missing_callables(&self, func_id: &str) -> Vec<&Variant> {
        self.variants(func_id)
            .iter()
            .filter(|v| !v.is_live())
            .collect()
    }

    pub fn non_generic_count(&self, func_id: &str) -> usize {
        self.variants(func_id).iter().filter(|v| !v.is_generic()).count()
    }

    pub fn len(&self) -> usize {
        self.variants.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every variant of a function; ids are still not reused
    pub fn remove_function(&mut self, func_id: &str) -> usize {
        self.variants.remove(func_id).map_or(0, |v| v.len())
    }

    pub fn clear(&mut self) {
        self.variants.clear();
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            functions: self
                .variants
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            next_index: self
                .next_index
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
        }
    }

    /// Rebuild from a snapshot; every variant starts without a callable
    pub fn from_snapshot(snapshot: RegistrySnapshot) -> Self {
        let variants = snapshot
            .functions
            .into_iter()
            .map(|(func_id, mut list)| {
                for variant in &mut list {
                    variant.callable = None;
                }
                (func_id, list)
            })
            .collect();
        Self {
            variants,
            next_index: snapshot.next_index.into_iter().collect(),
        }
    }
}

/// Highest score; ties go to the earliest `created_at`, then registration order
fn best_by_score<'a>(candidates: &[&'a Variant]) -> Option<&'a Variant> {
    let mut best: Option<&'a Variant> = None;
    for &variant in candidates {
        best = match best {
            None => Some(variant),
            Some(current) => {
                let (a, b) = (variant.score(), current.score());
                if a > b || (a == b && variant.created_at < current.created_at) {
                    Some(variant)
                } else {
                    Some(current)
                }
            }
        };
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use specializer_core::{callable, OptimizationKind, Value, GENERIC, NUM_OPTIMIZATIONS};

    fn identity() -> Callable {
        callable(|args: &[Value]| Ok(args.first().cloned().unwrap_or(Value::Null)))
    }

    fn spec(signature: &str, expected: f64) -> VariantSpec {
        let plan = OptimizationPlan::from_predictions(
            vec![OptimizationKind::Inline],
            &[expected; NUM_OPTIMIZATIONS],
        );
        VariantSpec::from_plan(signature, identity(), plan)
    }

    #[test]
    fn test_ids_are_never_reused() {
        let mut registry = VariantRegistry::new();
        let a = registry.register("f", spec("int32", 1.5), 0.0);
        let b = registry.register("f", spec("float64", 1.5), 0.0);
        assert_eq!((a.as_str(), b.as_str()), ("f#0", "f#1"));

        registry.prune(1, 0.0, 10.0);
        assert!(registry.variants("f").is_empty());
        assert_eq!(registry.register("f", spec("int32", 1.5), 20.0), "f#2");
    }

    #[test]
    fn test_generic_fallback() {
        let mut registry = VariantRegistry::new();
        assert!(registry.select_best("f", "int32", None).is_none());

        let generic = registry.register("f", spec(GENERIC, 1.1), 0.0);
        let typed = registry.register("f", spec("int32", 1.5), 0.0);
        assert_eq!(registry.select_best("f", "int32", None).unwrap().id, typed);
        assert_eq!(registry.select_best("f", "string", None).unwrap().id, generic);
    }

    #[test]
    fn test_score_prefers_expected_then_measured() {
        let mut registry = VariantRegistry::new();
        let slow = registry.register("f", spec("int32", 2.0), 0.0);
        let fast = registry.register("f", spec("int32", 1.5), 1.0);
        assert_eq!(registry.select_best("f", "int32", None).unwrap().id, slow);

        registry.record_execution(&slow, 10.0, true);
        registry.record_execution(&fast, 2.0, true);
        assert_eq!(registry.select_best("f", "int32", None).unwrap().id, fast);

        // Guard failures make a fast variant lose
        registry.record_execution(&fast, 2.0, false);
        registry.record_execution(&fast, 2.0, false);
        registry.record_execution(&fast, 2.0, false);
        let v = registry.variant(&fast).unwrap();
        assert_eq!(v.deopt_count, 3);
        assert_eq!(v.guard_failure_rate, 0.75);
    }

    #[test]
    fn test_ties_go_to_earliest() {
        let mut registry = VariantRegistry::new();
        let first = registry.register("f", spec("int32", 1.5), 5.0);
        let _second = registry.register("f", spec("int32", 1.5), 6.0);
        assert_eq!(registry.select_best("f", "int32", None).unwrap().id, first);
    }

    #[test]
    fn test_selector_is_consulted() {
        struct Last;
        impl VariantSelector for Last {
            fn select(&self, candidates: &[SelectorCandidate]) -> Option<usize> {
                candidates.len().checked_sub(1)
            }
        }

        let mut registry = VariantRegistry::new();
        registry.register("f", spec("int32", 3.0), 0.0);
        let last = registry.register("f", spec("int32", 1.2), 0.0);
        assert_eq!(registry.select_best("f", "int32", Some(&Last)).unwrap().id, last);
    }

    #[test]
    fn test_prune_rules() {
        let mut registry = VariantRegistry::new();
        let generic = registry.register("f", spec(GENERIC, 1.1), 0.0);
        let used = registry.register("f", spec("int32", 1.5), 0.0);
        let young = registry.register("f", spec("float64", 1.5), 900.0);
        let cold = registry.register("f", spec("string", 1.5), 0.0);
        for _ in 0..10 {
            registry.record_execution(&used, 1.0, true);
        }

        let removed = registry.prune_function("f", 10, 500.0, 1000.0);
        assert_eq!(removed, vec![cold]);
        let ids: Vec<&str> = registry.variants("f").iter().map(|v| v.id.as_str()).collect();
        assert_eq!(ids, vec![generic.as_str(), used.as_str(), young.as_str()]);
    }

    #[test]
    fn test_restored_variants_are_skipped_until_rehydrated() {
        let mut registry = VariantRegistry::new();
        let id = registry.register("f", spec("int32", 1.5), 0.0);
        registry.record_execution(&id, 3.0, true);

        let mut restored = VariantRegistry::from_snapshot(registry.snapshot());
        assert_eq!(restored.variant(&id).unwrap().use_count, 1);
        assert!(restored.select_best("f", "int32", None).is_none());
        assert_eq!(restored.missing_callables("f").len(), 1);

        assert!(restored.set_callable(&id, identity()));
        assert_eq!(restored.select_best("f", "int32", None).unwrap().id, id);
        assert_eq!(restored.register("f", spec("int32", 1.0), 1.0), "f#1");
    }

    #[test]
    fn test_unknown_variant() {
        let mut registry = VariantRegistry::new();
        assert!(!registry.record_execution("nope", 1.0, true));
        assert!(!registry.record_execution("f#9", 1.0, true));
    }
}
