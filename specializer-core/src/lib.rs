//! Core types for the adaptive specialization runtime
//!
//! This crate holds everything the profiler, the learner and the
//! orchestrator share:
//!
//! - Runtime values and the type-signature detector
//! - The closed set of optimization kinds and their cost table
//! - Profile records
//! - Injectable clock, memory probe, random source and reporter
//! - The error taxonomy

pub mod clock;
pub mod error;
pub mod optimization;
pub mod profiling;
pub mod reporter;
pub mod rng;
pub mod selection;
pub mod signature;
pub mod value;

pub use clock::{Clock, ManualClock, ManualMemoryProbe, MemoryProbe, MonotonicClock, NoMemoryProbe};
pub use error::{CoreError, Result};
pub use optimization::{
    combined_speedup, OptimizationKind, OptimizationPlan, NUM_OPTIMIZATIONS, OPTIMIZATION_COSTS,
};
pub use profiling::{ContextMetadata, PerSignatureStats, Profile, StaticMetadata};
pub use reporter::{CollectingReporter, ReportContext, ReportLevel, Reporter, TracingReporter};
pub use rng::{seeded_rng, BoxedRng};
pub use selection::{SelectorCandidate, VariantSelector};
pub use signature::{TypeSignature, GENERIC};
pub use value::{callable, Callable, TypedArray, Value};
