//! Optimization kinds, their static cost table and optimization plans

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of optimization kinds; also the width of the predictor's output layer
pub const NUM_OPTIMIZATIONS: usize = 7;

/// Optimization tags, in the fixed order the network output layer uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OptimizationKind {
    Inline,
    LoopUnroll,
    SimdVectorize,
    ConstantFold,
    TailCall,
    Cse,
    StrengthReduce,
}

impl OptimizationKind {
    /// All kinds in output-layer order
    pub const ALL: [OptimizationKind; NUM_OPTIMIZATIONS] = [
        OptimizationKind::Inline,
        OptimizationKind::LoopUnroll,
        OptimizationKind::SimdVectorize,
        OptimizationKind::ConstantFold,
        OptimizationKind::TailCall,
        OptimizationKind::Cse,
        OptimizationKind::StrengthReduce,
    ];

    /// Position in the output layer
    pub fn index(self) -> usize {
        match self {
            OptimizationKind::Inline => 0,
            OptimizationKind::LoopUnroll => 1,
            OptimizationKind::SimdVectorize => 2,
            OptimizationKind::ConstantFold => 3,
            OptimizationKind::TailCall => 4,
            OptimizationKind::Cse => 5,
            OptimizationKind::StrengthReduce => 6,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Relative build/size cost from the static cost table
    pub fn cost(self) -> u32 {
        OPTIMIZATION_COSTS[self.index()]
    }

    /// Wire tag
    pub fn tag(self) -> &'static str {
        match self {
            OptimizationKind::Inline => "inline",
            OptimizationKind::LoopUnroll => "loopUnroll",
            OptimizationKind::SimdVectorize => "simdVectorize",
            OptimizationKind::ConstantFold => "constantFold",
            OptimizationKind::TailCall => "tailCall",
            OptimizationKind::Cse => "cse",
            OptimizationKind::StrengthReduce => "strengthReduce",
        }
    }
}

impl fmt::Display for OptimizationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Static cost table, indexed by [`OptimizationKind::index`]
pub const OPTIMIZATION_COSTS: [u32; NUM_OPTIMIZATIONS] = [2, 5, 8, 1, 3, 4, 2];

/// A selected set of optimizations with its predicted combined speedup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationPlan {
    /// Selected kinds, in acceptance order
    pub optimizations: Vec<OptimizationKind>,
    /// Product of the per-kind predicted speedups
    pub predicted_speedup: f64,
    /// Sum of the per-kind costs
    pub total_cost: u32,
}

impl Default for OptimizationPlan {
    fn default() -> Self {
        Self::empty()
    }
}

impl OptimizationPlan {
    /// A plan with no optimizations
    pub fn empty() -> Self {
        Self {
            optimizations: Vec::new(),
            predicted_speedup: 1.0,
            total_cost: 0,
        }
    }

    /// Build a plan from accepted kinds and the prediction vector they came from
    pub fn from_predictions(
        optimizations: Vec<OptimizationKind>,
        predictions: &[f64; NUM_OPTIMIZATIONS],
    ) -> Self {
        let predicted_speedup = combined_speedup(&optimizations, predictions);
        let total_cost = optimizations.iter().map(|k| k.cost()).sum();
        Self {
            optimizations,
            predicted_speedup,
            total_cost,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.optimizations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.optimizations.len()
    }

    pub fn contains(&self, kind: OptimizationKind) -> bool {
        self.optimizations.contains(&kind)
    }

    /// Bitmask over output-layer positions
    pub fn mask(&self) -> u32 {
        self.optimizations
            .iter()
            .fold(0, |mask, kind| mask | (1 << kind.index()))
    }
}

/// Multiplicative combination of per-kind speedups
pub fn combined_speedup(
    optimizations: &[OptimizationKind],
    predictions: &[f64; NUM_OPTIMIZATIONS],
) -> f64 {
    optimizations
        .iter()
        .map(|kind| predictions[kind.index()])
        .product()
}
