//! Injectable time and memory sources

use parking_lot::Mutex;
use web_time::Instant;

/// Monotonic millisecond clock
pub trait Clock: Send + Sync {
    /// Milliseconds since an arbitrary fixed origin
    fn now_ms(&self) -> f64;
}

/// Wall clock backed by [`Instant`]
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> f64 {
        self.origin.elapsed().as_secs_f64() * 1000.0
    }
}

/// Hand-driven clock for deterministic tests and replays
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<f64>,
}

impl ManualClock {
    pub fn new(start_ms: f64) -> Self {
        Self {
            now: Mutex::new(start_ms),
        }
    }

    /// Move time forward
    pub fn advance(&self, delta_ms: f64) {
        *self.now.lock() += delta_ms;
    }

    pub fn set(&self, now_ms: f64) {
        *self.now.lock() = now_ms;
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> f64 {
        *self.now.lock()
    }
}

/// Source of the current memory footprint
pub trait MemoryProbe: Send + Sync {
    /// Bytes in use, or `None` when the host cannot tell
    fn current_bytes(&self) -> Option<u64>;
}

/// Probe that never reports; memory deltas are recorded as zero
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMemoryProbe;

impl MemoryProbe for NoMemoryProbe {
    fn current_bytes(&self) -> Option<u64> {
        None
    }
}

/// Probe returning a host-settable value
#[derive(Debug, Default)]
pub struct ManualMemoryProbe {
    bytes: Mutex<Option<u64>>,
}

impl ManualMemoryProbe {
    pub fn set(&self, bytes: Option<u64>) {
        *self.bytes.lock() = bytes;
    }
}

impl MemoryProbe for ManualMemoryProbe {
    fn current_bytes(&self) -> Option<u64> {
        *self.bytes.lock()
    }
}
