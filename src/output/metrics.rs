//! Counter sink for output I/O accounting.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Bytes written per flush, summed per target
pub const IO_WRITE_BYTES: &str = "io-write-bytes";
/// Milliseconds spent per flush, summed per target
pub const IO_WRITE_MSEC: &str = "io-write-msec";

/// Receives counter increments from writers
pub trait MetricsSink: Send + Sync {
    fn increment(&self, counter: &str, delta: u64);
}

/// Discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment(&self, _counter: &str, _delta: u64) {}
}

/// Shared in-memory counters
#[derive(Debug, Clone, Default)]
pub struct Counters {
    values: Arc<Mutex<BTreeMap<String, u64>>>,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, counter: &str) -> u64 {
        self.values.lock().get(counter).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.values.lock().clone()
    }
}

impl MetricsSink for Counters {
    fn increment(&self, counter: &str, delta: u64) {
        let mut values = self.values.lock();
        let entry = values.entry(counter.to_string()).or_insert(0);
        *entry = entry.saturating_add(delta);
    }
}
