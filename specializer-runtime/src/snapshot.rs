//! Versioned JSON snapshots of the whole core
//!
//! Callables are never serialized; restored variants wait for rehydration.

use crate::config::FunctionConfig;
use crate::profiler::ProfilerSnapshot;
use crate::registry::RegistrySnapshot;
use crate::state::{BaselineStats, Phase};
use serde::{Deserialize, Serialize};
use specializer_core::{ContextMetadata, CoreError, Result, StaticMetadata};
use specializer_ml::LearnerSnapshot;
use std::collections::BTreeMap;

/// Format version written by this build
pub const SNAPSHOT_VERSION: u32 = 1;

/// Everything `restore` needs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreSnapshot {
    /// Kept first so it leads the encoded document
    pub version: u32,
    pub learner: LearnerSnapshot,
    pub registry: RegistrySnapshot,
    pub profiler: ProfilerSnapshot,
    pub functions: BTreeMap<String, FunctionSnapshot>,
}

/// Orchestration bookkeeping for one function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSnapshot {
    pub config: FunctionConfig,
    pub phase: Phase,
    pub consecutive_failures: u32,
    pub suppressed: bool,
    pub rearm_at: u64,
    pub wrapped_calls: u64,
    pub specializations: u64,
    pub baselines: BTreeMap<String, BaselineStats>,
    pub last_speedup: Option<f64>,
    pub static_info: Option<StaticMetadata>,
    pub context: Option<ContextMetadata>,
}

#[derive(Deserialize)]
struct VersionProbe {
    version: Option<u32>,
}

pub fn encode(snapshot: &CoreSnapshot) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(snapshot)?)
}

/// Decode snapshot bytes, checking the version before anything else
pub fn decode(bytes: &[u8]) -> Result<CoreSnapshot> {
    let probe: VersionProbe = serde_json::from_slice(bytes)?;
    match probe.version {
        None => Err(CoreError::snapshot("missing version")),
        Some(found) if found != SNAPSHOT_VERSION => Err(CoreError::VersionMismatch {
            expected: SNAPSHOT_VERSION,
            found,
        }),
        Some(_) => Ok(serde_json::from_slice(bytes)?),
    }
}
