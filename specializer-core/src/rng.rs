//! Seeded randomness

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

/// Boxed random source the learner and network draw from
pub type BoxedRng = Box<dyn RngCore + Send>;

/// Deterministic generator for a seed
pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Uniform draw in `[0, 1)`
pub fn next_float(rng: &mut dyn RngCore) -> f64 {
    rng.gen::<f64>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_rng_is_reproducible() {
        let mut a = seeded_rng(7);
        let mut b = seeded_rng(7);
        for _ in 0..10 {
            assert_eq!(next_float(&mut a), next_float(&mut b));
        }
    }
}
