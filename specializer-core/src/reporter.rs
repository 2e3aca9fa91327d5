//! Advisory diagnostics sink
//!
//! The core reports builder declines, builder failures and learner
//! degradation through a [`Reporter`]. The default implementation forwards
//! to `tracing`.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, error, info, warn};

/// Severity of a report
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ReportLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Structured key/value context attached to a report
pub type ReportContext = BTreeMap<String, String>;

/// Receiver for advisory diagnostics
pub trait Reporter: Send + Sync {
    fn log(&self, level: ReportLevel, message: &str, context: Option<&ReportContext>);
}

/// Reporter that emits `tracing` events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn log(&self, level: ReportLevel, message: &str, context: Option<&ReportContext>) {
        let context = context.map(|c| format!("{:?}", c)).unwrap_or_default();
        match level {
            ReportLevel::Debug => debug!(context = %context, "{}", message),
            ReportLevel::Info => info!(context = %context, "{}", message),
            ReportLevel::Warn => warn!(context = %context, "{}", message),
            ReportLevel::Error => error!(context = %context, "{}", message),
        }
    }
}

/// A single captured report
#[derive(Debug, Clone, PartialEq)]
pub struct ReportEntry {
    pub level: ReportLevel,
    pub message: String,
    pub context: ReportContext,
}

/// Reporter that keeps every entry in memory
#[derive(Debug, Default)]
pub struct CollectingReporter {
    entries: Mutex<Vec<ReportEntry>>,
}

impl CollectingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<ReportEntry> {
        self.entries.lock().clone()
    }

    /// Number of entries at a given level
    pub fn count(&self, level: ReportLevel) -> usize {
        self.entries.lock().iter().filter(|e| e.level == level).count()
    }
}

impl Reporter for CollectingReporter {
    fn log(&self, level: ReportLevel, message: &str, context: Option<&ReportContext>) {
        self.entries.lock().push(ReportEntry {
            level,
            message: message.to_string(),
            context: context.cloned().unwrap_or_default(),
        });
    }
}

/// Build a report context from key/value pairs
pub fn report_context<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> ReportContext
where
    K: Into<String>,
    V: ToString,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.to_string()))
        .collect()
}
