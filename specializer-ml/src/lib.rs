//! Learning side of the specialization runtime
//!
//! This crate turns function profiles into optimization decisions:
//!
//! - Fixed-schedule feature extraction
//! - A small dense regression network on `ndarray`
//! - Speedup prediction and cost-constrained plan selection
//! - Experience replay and the online learning loop

pub mod features;
pub mod learner;
pub mod matrix;
pub mod network;
pub mod predictor;
pub mod replay;

pub use features::{
    FeatureExtractor, FeatureGroup, FeatureScale, FeatureSource, FeatureVector, RuntimeContext,
    FEATURE_DIM,
};
pub use learner::{
    attribute_speedup, AccuracyTracker, AdaptiveLearner, LearnerConfig, LearnerSnapshot,
    LearnerStats, LearningRateSchedule, ObservationOutcome,
};
pub use network::{Activation, DenseLayer, DenseNetwork, NetworkConfig, NetworkSnapshot, SpeedupModel};
pub use predictor::{
    select_plan_from_predictions, OptimizationPredictor, PredictorConfig, PredictorSnapshot,
};
pub use replay::{ExperienceReplayBuffer, ReplaySnapshot, ReplayStats, Sample};
