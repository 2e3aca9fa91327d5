//! Adaptive specialization runtime
//!
//! Wrap a host function, and the runtime profiles its calls by argument
//! signature. Once the function is hot, the runtime predicts which
//! optimizations pay off, asks a [`VariantBuilder`] for specialized variants
//! and routes later calls to the best one.
//!
//! ```no_run
//! use specializer_core::{callable, Value};
//! use specializer_runtime::{IdentityBuilder, OrchestratorConfig, SpecializationCore};
//! use std::sync::Arc;
//!
//! let core = SpecializationCore::builder(OrchestratorConfig::default())
//!     .variant_builder(Arc::new(IdentityBuilder))
//!     .build()?;
//! let square = core.wrap("square", callable(|args: &[Value]| {
//!     let x = args[0].as_float().unwrap_or(0.0);
//!     Ok(Value::Float(x * x))
//! }))?;
//! square.call(&[Value::Float(3.0)])?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod builder;
pub mod config;
pub mod orchestrator;
pub mod profiler;
pub mod registry;
pub mod snapshot;
pub mod state;
pub mod stats;

pub use builder::{BuildJob, BuildResult, IdentityBuilder, JobStatus, VariantBuilder};
pub use config::{FunctionConfig, OrchestratorConfig};
pub use orchestrator::{CoreBuilder, SpecializationCore, WrapOptions, Wrapped};
pub use profiler::{CallToken, RuntimeProfiler, SignatureReport, SpecializationReport};
pub use registry::{Variant, VariantRegistry, VariantSpec};
pub use snapshot::{CoreSnapshot, FunctionSnapshot, SNAPSHOT_VERSION};
pub use state::{BaselineStats, Phase};
pub use stats::{
    CoreStatistics, FunctionStatistics, PredictorStatistics, ReplayStatistics, VariantStatistics,
};
