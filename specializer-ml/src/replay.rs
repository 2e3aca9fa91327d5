//! Experience replay for predictor training

use crate::features::FeatureVector;
use rand::seq::SliceRandom;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use specializer_core::{CoreError, OptimizationKind, Result, NUM_OPTIMIZATIONS};

/// One training example
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Normalized feature vector
    pub features: FeatureVector,
    /// Speedup attributed to each optimization kind, every slot `>= 1.0`
    pub observed_speedups: [f64; NUM_OPTIMIZATIONS],
}

/// Bounded circular store of samples
///
/// Appends until full, then overwrites the oldest slot.
#[derive(Debug, Clone)]
pub struct ExperienceReplayBuffer {
    samples: Vec<Sample>,
    capacity: usize,
    /// Slot the next insert overwrites once the buffer is full
    insert_index: usize,
}

impl ExperienceReplayBuffer {
    /// Create new replay buffer
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(CoreError::invalid_config("replay_capacity", "must be at least 1"));
        }
        Ok(Self {
            samples: Vec::with_capacity(capacity.min(4096)),
            capacity,
            insert_index: 0,
        })
    }

    pub fn add(&mut self, sample: Sample) {
        if self.samples.len() < self.capacity {
            self.samples.push(sample);
        } else {
            self.samples[self.insert_index] = sample;
            self.insert_index = (self.insert_index + 1) % self.capacity;
        }
    }

    /// Up to `n` distinct samples drawn uniformly without replacement
    pub fn sample(&self, n: usize, rng: &mut dyn RngCore) -> Vec<Sample> {
        self.samples
            .choose_multiple(rng, n.min(self.samples.len()))
            .cloned()
            .collect()
    }

    /// The last `n` inserts, oldest first
    pub fn recent(&self, n: usize) -> Vec<Sample> {
        let ordered = self.ordered();
        let skip = ordered.len().saturating_sub(n);
        ordered.into_iter().skip(skip).cloned().collect()
    }

    /// The `n` samples with the highest `projection`, best first.
    /// Ties keep insertion order.
    pub fn top<F>(&self, n: usize, projection: F) -> Vec<Sample>
    where
        F: Fn(&Sample) -> f64,
    {
        let mut scored: Vec<(f64, &Sample)> = self
            .ordered()
            .into_iter()
            .map(|s| (projection(s), s))
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored.into_iter().take(n).map(|(_, s)| s.clone()).collect()
    }

    /// Get buffer size
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.insert_index = 0;
    }

    /// Samples in insertion order
    fn ordered(&self) -> Vec<&Sample> {
        if self.samples.len() < self.capacity {
            self.samples.iter().collect()
        } else {
            self.samples[self.insert_index..]
                .iter()
                .chain(self.samples[..self.insert_index].iter())
                .collect()
        }
    }

    pub fn snapshot(&self) -> ReplaySnapshot {
        ReplaySnapshot {
            capacity: self.capacity,
            samples: self.ordered().into_iter().cloned().collect(),
        }
    }

    /// Rebuild a buffer; keeps the newest `capacity` samples
    pub fn from_snapshot(snapshot: &ReplaySnapshot) -> Result<Self> {
        let mut buffer = Self::new(snapshot.capacity)?;
        for sample in &snapshot.samples {
            buffer.add(sample.clone());
        }
        Ok(buffer)
    }

    /// Get statistics about the stored samples
    pub fn stats(&self) -> ReplayStats {
        let mut mean_speedups = [0.0; NUM_OPTIMIZATIONS];
        let mut max_speedup: f64 = 1.0;
        for sample in &self.samples {
            for (acc, v) in mean_speedups.iter_mut().zip(sample.observed_speedups.iter()) {
                *acc += v;
            }
            max_speedup = sample
                .observed_speedups
                .iter()
                .copied()
                .fold(max_speedup, f64::max);
        }
        let n = self.samples.len().max(1) as f64;
        for acc in &mut mean_speedups {
            *acc /= n;
        }

        ReplayStats {
            size: self.samples.len(),
            capacity: self.capacity,
            mean_speedups: OptimizationKind::ALL
                .iter()
                .map(|k| (k.tag().to_string(), mean_speedups[k.index()]))
                .collect(),
            max_speedup,
        }
    }
}

/// Serialized buffer contents, oldest first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplaySnapshot {
    pub capacity: usize,
    pub samples: Vec<Sample>,
}

/// Statistics about the replay buffer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayStats {
    pub size: usize,
    pub capacity: usize,
    /// Mean observed speedup per optimization tag
    pub mean_speedups: Vec<(String, f64)>,
    pub max_speedup: f64,
}
