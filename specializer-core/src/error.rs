//! Error types for the specialization core

use thiserror::Error;

/// Result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised by the specialization core.
///
/// User-call errors are not represented here: they travel through wrapped
/// callables as the original `anyhow::Error`.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Configuration value outside its documented range
    #[error("Invalid configuration for `{field}`: {reason}")]
    InvalidConfig { field: String, reason: String },

    /// Vector length does not match the layer it is fed to
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Non-finite value produced by the network
    #[error("Numerical instability: {0}")]
    NumericalInstability(String),

    /// Variant builder declined to build
    #[error("Builder declined variant for {func_id} ({signature})")]
    BuilderDeclined { func_id: String, signature: String },

    /// Variant builder raised an error
    #[error("Builder failed for {func_id} ({signature}): {message}")]
    BuilderFailed {
        func_id: String,
        signature: String,
        message: String,
    },

    /// Snapshot written by an incompatible version
    #[error("Snapshot version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    /// Malformed snapshot contents
    #[error("Snapshot error: {0}")]
    Snapshot(String),

    /// Operation names a function that was never wrapped
    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    /// JSON error
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    /// Create an invalid configuration error
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a dimension mismatch error
    pub fn dimension_mismatch(expected: usize, actual: usize) -> Self {
        Self::DimensionMismatch { expected, actual }
    }

    /// Create a numerical instability error
    pub fn numerical_instability(msg: impl Into<String>) -> Self {
        Self::NumericalInstability(msg.into())
    }

    /// Create a snapshot error
    pub fn snapshot(msg: impl Into<String>) -> Self {
        Self::Snapshot(msg.into())
    }

    /// Errors the learner recovers from by entering the degraded state
    pub fn is_numerical(&self) -> bool {
        matches!(
            self,
            CoreError::DimensionMismatch { .. } | CoreError::NumericalInstability(_)
        )
    }
}
