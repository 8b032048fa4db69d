//! Simulated Object Store with Fault Injection
//!
//! DST wrapper that injects faults into every storage call using buggify.
//! Faults fire before the wrapped operation takes effect, except for a
//! partial flush, which persists a prefix of the pending bytes and then
//! reports failure.

use super::object_store::{CreateOptions, ObjectMeta, ObjectStore, ObjectWriter, OpenMode, StoreError};
use crate::buggify::faults::object_store as faults;
use crate::io::Rng;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Configuration for simulated fault injection
#[derive(Debug, Clone)]
pub struct SimulatedStoreConfig {
    /// Probability of OPEN failure
    pub open_fail_prob: f64,
    /// Probability of a buffered write being refused
    pub write_fail_prob: f64,
    /// Probability of FLUSH failure with nothing persisted
    pub flush_fail_prob: f64,
    /// Probability of FLUSH persisting only a prefix
    pub partial_flush_prob: f64,
    /// Probability of CLOSE failure
    pub close_fail_prob: f64,
    /// Probability of READ/STAT failure
    pub read_fail_prob: f64,
    /// Probability of COPY failure
    pub copy_fail_prob: f64,
    /// Probability of DELETE failure
    pub delete_fail_prob: f64,
    /// Probability of LIST returning incomplete results
    pub list_incomplete_prob: f64,
}

impl Default for SimulatedStoreConfig {
    fn default() -> Self {
        SimulatedStoreConfig {
            open_fail_prob: 0.01,       // 1%
            write_fail_prob: 0.005,     // 0.5%
            flush_fail_prob: 0.01,      // 1%
            partial_flush_prob: 0.005,  // 0.5%
            close_fail_prob: 0.01,      // 1%
            read_fail_prob: 0.01,       // 1%
            copy_fail_prob: 0.01,       // 1%
            delete_fail_prob: 0.01,     // 1%
            list_incomplete_prob: 0.02, // 2%
        }
    }
}

impl SimulatedStoreConfig {
    /// High chaos configuration for stress testing
    pub fn high_chaos() -> Self {
        SimulatedStoreConfig {
            open_fail_prob: 0.05,
            write_fail_prob: 0.02,
            flush_fail_prob: 0.05,
            partial_flush_prob: 0.03,
            close_fail_prob: 0.05,
            read_fail_prob: 0.05,
            copy_fail_prob: 0.05,
            delete_fail_prob: 0.05,
            list_incomplete_prob: 0.05,
        }
    }

    /// No faults - for baseline testing
    pub fn no_faults() -> Self {
        SimulatedStoreConfig {
            open_fail_prob: 0.0,
            write_fail_prob: 0.0,
            flush_fail_prob: 0.0,
            partial_flush_prob: 0.0,
            close_fail_prob: 0.0,
            read_fail_prob: 0.0,
            copy_fail_prob: 0.0,
            delete_fail_prob: 0.0,
            list_incomplete_prob: 0.0,
        }
    }
}

/// Statistics for fault injection
#[derive(Debug, Clone, Default)]
pub struct SimulatedStoreStats {
    pub open_attempts: u64,
    pub open_failures: u64,
    pub write_failures: u64,
    pub flush_attempts: u64,
    pub flush_failures: u64,
    pub partial_flushes: u64,
    pub close_failures: u64,
    pub read_attempts: u64,
    pub read_failures: u64,
    pub copy_attempts: u64,
    pub copy_failures: u64,
    pub delete_attempts: u64,
    pub delete_failures: u64,
    pub list_attempts: u64,
    pub list_incomplete: u64,
}

struct SimulatedStoreInner<R: Rng> {
    rng: R,
    stats: SimulatedStoreStats,
}

type SharedState<R> = Arc<Mutex<SimulatedStoreInner<R>>>;

fn injected(what: &str, name: &str) -> StoreError {
    StoreError::Other(format!("simulated {} failure: {}", what, name))
}

/// Simulated object store that wraps another store and injects faults
pub struct SimulatedObjectStore<S: ObjectStore + Clone, R: Rng> {
    inner_store: S,
    config: SimulatedStoreConfig,
    state: SharedState<R>,
}

impl<S: ObjectStore + Clone, R: Rng> SimulatedObjectStore<S, R> {
    pub fn new(inner_store: S, rng: R, config: SimulatedStoreConfig) -> Self {
        SimulatedObjectStore {
            inner_store,
            config,
            state: Arc::new(Mutex::new(SimulatedStoreInner {
                rng,
                stats: SimulatedStoreStats::default(),
            })),
        }
    }

    /// The wrapped store, for fault-free inspection
    pub fn inner(&self) -> &S {
        &self.inner_store
    }

    pub fn config(&self) -> &SimulatedStoreConfig {
        &self.config
    }

    pub fn stats(&self) -> SimulatedStoreStats {
        self.state.lock().stats.clone()
    }

    pub fn reset_stats(&self) {
        self.state.lock().stats = SimulatedStoreStats::default();
    }
}

impl<S: ObjectStore + Clone, R: Rng> Clone for SimulatedObjectStore<S, R> {
    fn clone(&self) -> Self {
        SimulatedObjectStore {
            inner_store: self.inner_store.clone(),
            config: self.config.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

/// Writer wrapper; bytes stay here until a flush hands them to the inner
/// writer so a partial flush can persist an exact prefix.
pub struct SimulatedObjectWriter<W: ObjectWriter, R: Rng> {
    inner: W,
    pending: Vec<u8>,
    config: SimulatedStoreConfig,
    state: SharedState<R>,
}

impl<W: ObjectWriter, R: Rng> ObjectWriter for SimulatedObjectWriter<W, R> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn write(&mut self, data: &[u8]) -> Result<(), StoreError> {
        if self.inner.is_closed() {
            return Err(StoreError::Closed(self.inner.name().to_string()));
        }
        {
            let mut s = self.state.lock();
            if crate::buggify!(&mut s.rng, faults::WRITE_FAIL, self.config.write_fail_prob) {
                s.stats.write_failures += 1;
                return Err(injected("write", self.inner.name()));
            }
        }
        self.pending.extend_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        let partial_len = {
            let mut s = self.state.lock();
            s.stats.flush_attempts += 1;
            if crate::buggify!(&mut s.rng, faults::FLUSH_FAIL, self.config.flush_fail_prob) {
                s.stats.flush_failures += 1;
                return Err(injected("flush", self.inner.name()));
            }
            let partial = self.pending.len() > 1
                && crate::buggify!(
                    &mut s.rng,
                    faults::PARTIAL_FLUSH,
                    self.config.partial_flush_prob
                );
            if partial {
                s.stats.partial_flushes += 1;
                Some(s.rng.gen_range(1, self.pending.len() as u64) as usize)
            } else {
                None
            }
        };

        match partial_len {
            Some(len) => {
                self.inner.write(&self.pending[..len])?;
                self.inner.flush()?;
                self.pending.drain(..len);
                Err(injected("partial flush", self.inner.name()))
            }
            None => {
                self.inner.write(&self.pending)?;
                self.pending.clear();
                self.inner.flush()
            }
        }
    }

    fn close(&mut self) -> Result<(), StoreError> {
        if self.inner.is_closed() {
            return Ok(());
        }
        {
            let mut s = self.state.lock();
            if crate::buggify!(&mut s.rng, faults::CLOSE_FAIL, self.config.close_fail_prob) {
                s.stats.close_failures += 1;
                return Err(injected("close", self.inner.name()));
            }
        }
        self.inner.write(&self.pending)?;
        self.pending.clear();
        self.inner.close()
    }

    fn tell(&self) -> u64 {
        self.inner.tell() + self.pending.len() as u64
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

impl<S: ObjectStore + Clone, R: Rng> ObjectStore for SimulatedObjectStore<S, R> {
    type Writer = SimulatedObjectWriter<S::Writer, R>;

    fn open(
        &self,
        name: &str,
        mode: OpenMode,
        options: &CreateOptions,
    ) -> Result<Self::Writer, StoreError> {
        {
            let mut s = self.state.lock();
            s.stats.open_attempts += 1;
            if crate::buggify!(&mut s.rng, faults::OPEN_FAIL, self.config.open_fail_prob) {
                s.stats.open_failures += 1;
                return Err(injected("open", name));
            }
        }
        let inner = self.inner_store.open(name, mode, options)?;
        Ok(SimulatedObjectWriter {
            inner,
            pending: Vec::new(),
            config: self.config.clone(),
            state: Arc::clone(&self.state),
        })
    }

    fn read(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        {
            let mut s = self.state.lock();
            s.stats.read_attempts += 1;
            if crate::buggify!(&mut s.rng, faults::READ_FAIL, self.config.read_fail_prob) {
                s.stats.read_failures += 1;
                return Err(injected("read", name));
            }
        }
        self.inner_store.read(name)
    }

    fn read_range(&self, name: &str, offset: u64, len: usize) -> Result<Vec<u8>, StoreError> {
        {
            let mut s = self.state.lock();
            s.stats.read_attempts += 1;
            if crate::buggify!(&mut s.rng, faults::READ_FAIL, self.config.read_fail_prob) {
                s.stats.read_failures += 1;
                return Err(injected("read_range", name));
            }
        }
        self.inner_store.read_range(name, offset, len)
    }

    fn stat(&self, name: &str) -> Result<ObjectMeta, StoreError> {
        {
            let mut s = self.state.lock();
            s.stats.read_attempts += 1;
            if crate::buggify!(&mut s.rng, faults::READ_FAIL, self.config.read_fail_prob) {
                s.stats.read_failures += 1;
                return Err(injected("stat", name));
            }
        }
        self.inner_store.stat(name)
    }

    fn copy(
        &self,
        src: &str,
        dst: &str,
        metadata: Option<BTreeMap<String, String>>,
    ) -> Result<(), StoreError> {
        {
            let mut s = self.state.lock();
            s.stats.copy_attempts += 1;
            if crate::buggify!(&mut s.rng, faults::COPY_FAIL, self.config.copy_fail_prob) {
                s.stats.copy_failures += 1;
                return Err(injected("copy", src));
            }
        }
        self.inner_store.copy(src, dst, metadata)
    }

    fn delete(&self, name: &str) -> Result<(), StoreError> {
        {
            let mut s = self.state.lock();
            s.stats.delete_attempts += 1;
            if crate::buggify!(&mut s.rng, faults::DELETE_FAIL, self.config.delete_fail_prob) {
                s.stats.delete_failures += 1;
                return Err(injected("delete", name));
            }
        }
        self.inner_store.delete(name)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut names = self.inner_store.list(prefix)?;
        let mut s = self.state.lock();
        s.stats.list_attempts += 1;
        if !names.is_empty()
            && crate::buggify!(
                &mut s.rng,
                faults::LIST_INCOMPLETE,
                self.config.list_incomplete_prob
            )
        {
            s.stats.list_incomplete += 1;
            let keep = s.rng.gen_range(0, names.len() as u64) as usize;
            names.truncate(keep);
        }
        Ok(names)
    }
}
