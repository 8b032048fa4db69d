//! Shard Output Writers
//!
//! Persists the output of sharded batch jobs to an object store. A job is
//! split into shards, each shard runs as a sequence of slices, and every
//! slice may be retried from the writer checkpoint taken after the
//! previous one.
//!
//! ## Architecture
//!
//! ```text
//! slice ─ write* ─▶ OutputWriter ─▶ (AppendPool) ─▶ ObjectStore
//!                        │
//!                   to_state() ─▶ WriterState (JSON checkpoint)
//! ```
//!
//! ## Writers
//!
//! - **SimpleObjectWriter**: one object per shard, optionally pooled,
//!   shared across shards, or split into duplicate-free segments
//! - **ConsistentObjectWriter**: staging objects per slice, copied into the
//!   main object at the checkpointed offset so retries never duplicate
//! - **RecordObjectWriter**: leveldb-style framed records over either
//! - **KeyValueWriter**: bincode-encoded key/value pairs as records

pub mod error;
pub mod object_store;
pub mod simulated_store;
pub mod metrics;
pub mod pool;
pub mod records;
pub mod config;
pub mod model;
pub mod writer;
pub mod simple;
pub mod consistent;
pub mod record_writer;
pub mod dst;

pub use error::{OutputError, Result};
pub use object_store::{
    CreateOptions, ObjectMeta, ObjectStore, ObjectWriter, OpenMode, StoreError,
};
pub use object_store::{InMemoryObjectStore, LocalFsObjectStore};
pub use simulated_store::{SimulatedObjectStore, SimulatedStoreConfig, SimulatedStoreStats};
pub use metrics::{Counters, MetricsSink, NoopMetrics};
pub use pool::{AppendPool, AppendSink, PoolConfig};
pub use records::{decode_all, encode_all, RecordError, RecordsReader, RecordsWriter};
pub use config::{OptionRules, OutputSharding, WriterOptions, WriterSpec};
pub use model::{JobSpec, JobState, ResultStatus, ShardState, SliceContext};
pub use writer::{
    segment_names, successful_outputs, OutputWriter, ShardOutput, SupportsSliceRecovery,
    WriterState, STATE_VERSION,
};
pub use simple::{SimpleObjectWriter, SimpleState, VALID_LENGTH_KEY};
pub use consistent::{ConsistentObjectWriter, ConsistentState};
pub use record_writer::{
    decode_key_values, KeyValue, KeyValueWriter, RecordConsistentWriter, RecordObjectWriter,
    RecordSimpleWriter,
};
pub use dst::{
    OutputDSTConfig, OutputDSTHarness, OutputDSTResult,
    run_consistent_dst_batch, run_segment_dst_batch, summarize_output_dst_batch,
};
