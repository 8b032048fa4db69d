//! Buffered Append Pool
//!
//! Accumulates small appends per target in memory and turns them into one
//! storage append per target once the buffered total crosses the flush
//! threshold. Byte and latency counters are reported for every target
//! written.

use super::error::{OutputError, Result};
use super::metrics::{MetricsSink, IO_WRITE_BYTES, IO_WRITE_MSEC};
use super::object_store::{CreateOptions, ObjectStore, ObjectWriter, OpenMode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::debug;

/// Default flush threshold (128 KiB)
pub const FLUSH_SIZE: usize = 128 * 1024;
/// Hard limit for one append and for one per-target storage write (1000 KiB)
pub const MAX_SIZE: usize = 1000 * 1024;

/// Pool thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub flush_size: usize,
    pub max_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            flush_size: FLUSH_SIZE,
            max_size: MAX_SIZE,
        }
    }
}

impl PoolConfig {
    /// Small thresholds so tests cross them with little data
    pub fn test() -> Self {
        PoolConfig {
            flush_size: 64,
            max_size: 256,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.flush_size == 0 {
            return Err(OutputError::Config("flush_size must be positive".into()));
        }
        if self.flush_size > self.max_size {
            return Err(OutputError::Config(format!(
                "flush_size {} exceeds max size {}",
                self.flush_size, self.max_size
            )));
        }
        Ok(())
    }
}

/// Destination of a pool flush
pub trait AppendSink {
    fn append(&mut self, target: &str, data: &[u8]) -> Result<()>;
}

/// Appends each flushed buffer to an unsealed object in the store
pub struct StoreAppender<'a, S: ObjectStore> {
    store: &'a S,
    options: &'a CreateOptions,
}

impl<'a, S: ObjectStore> StoreAppender<'a, S> {
    pub fn new(store: &'a S, options: &'a CreateOptions) -> Self {
        StoreAppender { store, options }
    }
}

impl<S: ObjectStore> AppendSink for StoreAppender<'_, S> {
    fn append(&mut self, target: &str, data: &[u8]) -> Result<()> {
        let mut writer = self.store.open(target, OpenMode::Append, self.options)?;
        writer.write(data)?;
        writer.flush()?;
        Ok(())
    }
}

/// Appends into an already-open writer; the target name is ignored
pub struct WriterSink<'a, W: ObjectWriter>(pub &'a mut W);

impl<W: ObjectWriter> AppendSink for WriterSink<'_, W> {
    fn append(&mut self, _target: &str, data: &[u8]) -> Result<()> {
        self.0.write(data)?;
        self.0.flush()?;
        Ok(())
    }
}

/// Per-target append buffers
#[derive(Debug, Default)]
pub struct AppendPool {
    config: PoolConfig,
    buffers: BTreeMap<String, Vec<u8>>,
    size: usize,
}

impl AppendPool {
    pub fn new(config: PoolConfig) -> Self {
        AppendPool {
            config,
            buffers: BTreeMap::new(),
            size: 0,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Total buffered bytes across all targets
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn append(
        &mut self,
        target: &str,
        data: &[u8],
        sink: &mut dyn AppendSink,
        metrics: &dyn MetricsSink,
    ) -> Result<()> {
        if data.len() > self.config.max_size {
            return Err(OutputError::SizeLimit {
                size: data.len(),
                limit: self.config.max_size,
            });
        }

        if self.size + data.len() > self.config.flush_size {
            self.flush(sink, metrics)?;
        }

        self.buffers
            .entry(target.to_string())
            .or_default()
            .extend_from_slice(data);
        self.size += data.len();

        if self.size > self.config.flush_size {
            self.flush(sink, metrics)?;
        }
        Ok(())
    }

    /// One append per target with buffered data. Targets written before a
    /// failure are dropped from the pool; the rest stay buffered.
    pub fn flush(&mut self, sink: &mut dyn AppendSink, metrics: &dyn MetricsSink) -> Result<()> {
        while let Some((target, data)) = self.buffers.pop_first() {
            if data.len() > self.config.max_size {
                let size = data.len();
                self.buffers.insert(target, data);
                return Err(OutputError::SizeLimit {
                    size,
                    limit: self.config.max_size,
                });
            }

            let start = Instant::now();
            if let Err(e) = sink.append(&target, &data) {
                self.buffers.insert(target, data);
                return Err(e);
            }
            let elapsed_ms = start.elapsed().as_millis() as u64;

            metrics.increment(IO_WRITE_BYTES, data.len() as u64);
            metrics.increment(IO_WRITE_MSEC, elapsed_ms);
            self.size -= data.len();
            debug!(target = %target, bytes = data.len(), elapsed_ms, "pool flushed");
        }

        debug_assert_eq!(self.size, 0, "Postcondition: empty pool has zero size");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::metrics::Counters;
    use crate::output::object_store::InMemoryObjectStore;

    /// Records every append it receives
    #[derive(Default)]
    struct RecordingSink {
        appends: Vec<(String, Vec<u8>)>,
        fail: bool,
    }

    impl AppendSink for RecordingSink {
        fn append(&mut self, target: &str, data: &[u8]) -> Result<()> {
            if self.fail {
                return Err(OutputError::Storage(
                    crate::output::object_store::StoreError::Other("down".into()),
                ));
            }
            self.appends.push((target.to_string(), data.to_vec()));
            Ok(())
        }
    }

    #[test]
    fn test_small_appends_are_buffered() {
        let mut pool = AppendPool::new(PoolConfig::test());
        let mut sink = RecordingSink::default();
        let metrics = Counters::new();

        pool.append("a", b"hello", &mut sink, &metrics).unwrap();
        pool.append("b", b"world", &mut sink, &metrics).unwrap();
        assert!(sink.appends.is_empty());
        assert_eq!(pool.size(), 10);

        pool.flush(&mut sink, &metrics).unwrap();
        assert_eq!(
            sink.appends,
            vec![("a".to_string(), b"hello".to_vec()), ("b".to_string(), b"world".to_vec())]
        );
        assert!(pool.is_empty());
        assert_eq!(metrics.get(IO_WRITE_BYTES), 10);
    }

    #[test]
    fn test_flush_before_append_crossing_threshold() {
        let mut pool = AppendPool::new(PoolConfig::test());
        let mut sink = RecordingSink::default();
        let metrics = Counters::new();

        pool.append("a", &[1u8; 40], &mut sink, &metrics).unwrap();
        pool.append("a", &[2u8; 40], &mut sink, &metrics).unwrap();

        // First 40 bytes went out before the second append was buffered
        assert_eq!(sink.appends.len(), 1);
        assert_eq!(sink.appends[0].1, vec![1u8; 40]);
        assert_eq!(pool.size(), 40);
    }

    #[test]
    fn test_flush_after_append_over_threshold() {
        let mut pool = AppendPool::new(PoolConfig::test());
        let mut sink = RecordingSink::default();
        let metrics = Counters::new();

        pool.append("a", &[7u8; 100], &mut sink, &metrics).unwrap();
        assert_eq!(sink.appends.len(), 1);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_exact_threshold_stays_buffered() {
        let mut pool = AppendPool::new(PoolConfig::test());
        let mut sink = RecordingSink::default();
        let metrics = Counters::new();

        pool.append("a", &[0u8; 64], &mut sink, &metrics).unwrap();
        assert!(sink.appends.is_empty());
        assert_eq!(pool.size(), 64);
    }

    #[test]
    fn test_oversized_append_rejected() {
        let mut pool = AppendPool::new(PoolConfig::test());
        let mut sink = RecordingSink::default();
        let metrics = Counters::new();

        pool.append("a", b"keep", &mut sink, &metrics).unwrap();
        let err = pool
            .append("a", &[0u8; 257], &mut sink, &metrics)
            .unwrap_err();
        assert!(matches!(err, OutputError::SizeLimit { size: 257, limit: 256 }));
        // Rejected before any flush
        assert!(sink.appends.is_empty());
        assert_eq!(pool.size(), 4);
    }

    #[test]
    fn test_failed_flush_keeps_data() {
        let mut pool = AppendPool::new(PoolConfig::test());
        let mut sink = RecordingSink::default();
        let metrics = Counters::new();
        pool.append("a", b"abc", &mut sink, &metrics).unwrap();

        sink.fail = true;
        assert!(pool.flush(&mut sink, &metrics).unwrap_err().is_retryable());
        assert_eq!(pool.size(), 3);

        sink.fail = false;
        pool.flush(&mut sink, &metrics).unwrap();
        assert_eq!(sink.appends, vec![("a".to_string(), b"abc".to_vec())]);
    }

    #[test]
    fn test_config_validation() {
        assert!(PoolConfig::default().validate().is_ok());
        assert!(PoolConfig { flush_size: 0, max_size: 10 }.validate().is_err());
        assert!(PoolConfig { flush_size: 11, max_size: 10 }.validate().is_err());
    }

    #[test]
    fn test_store_appender() {
        let store = InMemoryObjectStore::new();
        let options = CreateOptions::default();
        store.open("/b/shared", OpenMode::Create, &options).unwrap();

        let mut pool = AppendPool::new(PoolConfig::default());
        let metrics = Counters::new();
        let mut sink = StoreAppender::new(&store, &options);
        pool.append("/b/shared", b"one,", &mut sink, &metrics).unwrap();
        pool.append("/b/shared", b"two", &mut sink, &metrics).unwrap();
        pool.flush(&mut sink, &metrics).unwrap();

        assert_eq!(store.read("/b/shared").unwrap(), b"one,two");
    }
}
