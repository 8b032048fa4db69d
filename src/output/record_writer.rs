//! Record-Framed Object Writer
//!
//! Decorator that frames every written value with the records codec before
//! handing the bytes to an inner object-store writer. The block is padded at
//! each slice end so the next slice's append starts on a block boundary and
//! the output reads back record by record no matter how slices were split.

use super::config::{WriterOptions, WriterSpec, OUTPUT_SHARDING};
use super::consistent::ConsistentObjectWriter;
use super::error::{OutputError, Result};
use super::model::{JobSpec, JobState, ShardState, SliceContext};
use super::records::{RecordsReader, RecordsWriter, BLOCK_SIZE};
use super::simple::SimpleObjectWriter;
use super::writer::{wrong_kind, OutputWriter, SupportsSliceRecovery, WriterState};
use serde::{Deserialize, Serialize};

pub type RecordSimpleWriter<S> = RecordObjectWriter<SimpleObjectWriter<S>>;
pub type RecordConsistentWriter<S> = RecordObjectWriter<ConsistentObjectWriter<S>>;

pub struct RecordObjectWriter<W> {
    inner: W,
    encoder: RecordsWriter,
    scratch: Vec<u8>,
    finalized: bool,
}

impl<W> RecordObjectWriter<W> {
    pub fn inner(&self) -> &W {
        &self.inner
    }

    fn wrap(inner: W, encoder: RecordsWriter) -> Self {
        RecordObjectWriter {
            inner,
            encoder,
            scratch: Vec::new(),
            finalized: false,
        }
    }
}

impl<W: OutputWriter<Input = [u8]>> OutputWriter for RecordObjectWriter<W> {
    type Store = W::Store;
    type Input = [u8];

    fn validate(options: &WriterOptions) -> Result<WriterSpec> {
        if options.contains_key(OUTPUT_SHARDING) {
            return Err(OutputError::Config(format!(
                "{} is not supported by record writers",
                OUTPUT_SHARDING
            )));
        }
        W::validate(options)
    }

    fn init_job(store: &Self::Store, job: &mut JobState) -> Result<()> {
        W::init_job(store, job)
    }

    fn finalize_job(store: &Self::Store, job: &mut JobState) -> Result<()> {
        W::finalize_job(store, job)
    }

    fn create(
        store: Self::Store,
        job: &JobState,
        shard_number: u32,
        attempt: u32,
    ) -> Result<Self> {
        Self::validate(&job.spec.writer)?;
        let inner = W::create(store, job, shard_number, attempt)?;
        Ok(Self::wrap(inner, RecordsWriter::new()))
    }

    fn to_state(&self) -> Result<WriterState> {
        Ok(WriterState::Records {
            inner: Box::new(self.inner.to_state()?),
            block_offset: self.encoder.block_position(),
        })
    }

    fn from_state(store: Self::Store, state: WriterState) -> Result<Self> {
        let WriterState::Records {
            inner,
            block_offset,
        } = state
        else {
            return Err(wrong_kind("records", &state));
        };
        if block_offset >= BLOCK_SIZE {
            return Err(OutputError::State(format!(
                "block offset {} outside a {} byte block",
                block_offset, BLOCK_SIZE
            )));
        }
        let inner = W::from_state(store, *inner)?;
        Ok(Self::wrap(inner, RecordsWriter::with_position(block_offset)))
    }

    fn begin_slice(&mut self, ctx: &SliceContext<'_>) -> Result<()> {
        self.inner.begin_slice(ctx)
    }

    fn end_slice(&mut self, ctx: &SliceContext<'_>) -> Result<()> {
        // The inner object is sealed; padding has nowhere to go
        if self.finalized {
            return Ok(());
        }
        self.scratch.clear();
        self.encoder.pad_block(&mut self.scratch);
        if !self.scratch.is_empty() {
            self.inner.write(ctx, &self.scratch)?;
        }
        self.inner.end_slice(ctx)
    }

    fn write(&mut self, ctx: &SliceContext<'_>, record: &[u8]) -> Result<()> {
        self.scratch.clear();
        self.encoder.encode(record, &mut self.scratch);
        self.inner.write(ctx, &self.scratch)
    }

    fn finalize(&mut self, ctx: &SliceContext<'_>, shard: &mut ShardState) -> Result<()> {
        self.inner.finalize(ctx, shard)?;
        self.finalized = true;
        Ok(())
    }

    fn get_filenames(job: &JobState) -> Result<Vec<String>> {
        W::get_filenames(job)
    }

    fn supports_shard_retry(&self) -> bool {
        self.inner.supports_shard_retry()
    }
}

impl<W> SupportsSliceRecovery for RecordObjectWriter<W>
where
    W: SupportsSliceRecovery + OutputWriter<Input = [u8]>,
{
    fn supports_slice_recovery(&self) -> bool {
        self.inner.supports_slice_recovery()
    }

    /// The recovered inner writer starts a fresh object, so framing restarts
    /// at a block boundary.
    fn recover(&self, job: &JobSpec, shard_number: u32, attempt: u32) -> Result<Self> {
        let inner = self.inner.recover(job, shard_number, attempt)?;
        Ok(Self::wrap(inner, RecordsWriter::new()))
    }
}

// ============================================================================
// KeyValueWriter - bincode-encoded pairs, one per record
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl KeyValue {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        KeyValue {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Decode a record stream written by a `KeyValueWriter`
pub fn decode_key_values(data: &[u8]) -> Result<Vec<KeyValue>> {
    RecordsReader::new(data)
        .map(|record| -> Result<KeyValue> {
            let record = record.map_err(|e| OutputError::Encoding(e.to_string()))?;
            Ok(bincode::deserialize(&record)?)
        })
        .collect()
}

pub struct KeyValueWriter<W> {
    records: RecordObjectWriter<W>,
    scratch: Vec<u8>,
}

impl<W> KeyValueWriter<W> {
    pub fn records(&self) -> &RecordObjectWriter<W> {
        &self.records
    }

    fn wrap(records: RecordObjectWriter<W>) -> Self {
        KeyValueWriter {
            records,
            scratch: Vec::new(),
        }
    }
}

impl<W: OutputWriter<Input = [u8]>> OutputWriter for KeyValueWriter<W> {
    type Store = W::Store;
    type Input = KeyValue;

    fn validate(options: &WriterOptions) -> Result<WriterSpec> {
        RecordObjectWriter::<W>::validate(options)
    }

    fn init_job(store: &Self::Store, job: &mut JobState) -> Result<()> {
        RecordObjectWriter::<W>::init_job(store, job)
    }

    fn finalize_job(store: &Self::Store, job: &mut JobState) -> Result<()> {
        RecordObjectWriter::<W>::finalize_job(store, job)
    }

    fn create(
        store: Self::Store,
        job: &JobState,
        shard_number: u32,
        attempt: u32,
    ) -> Result<Self> {
        RecordObjectWriter::create(store, job, shard_number, attempt).map(Self::wrap)
    }

    fn to_state(&self) -> Result<WriterState> {
        self.records.to_state()
    }

    fn from_state(store: Self::Store, state: WriterState) -> Result<Self> {
        RecordObjectWriter::from_state(store, state).map(Self::wrap)
    }

    fn begin_slice(&mut self, ctx: &SliceContext<'_>) -> Result<()> {
        self.records.begin_slice(ctx)
    }

    fn end_slice(&mut self, ctx: &SliceContext<'_>) -> Result<()> {
        self.records.end_slice(ctx)
    }

    fn write(&mut self, ctx: &SliceContext<'_>, pair: &KeyValue) -> Result<()> {
        self.scratch.clear();
        bincode::serialize_into(&mut self.scratch, pair)?;
        self.records.write(ctx, &self.scratch)
    }

    fn finalize(&mut self, ctx: &SliceContext<'_>, shard: &mut ShardState) -> Result<()> {
        self.records.finalize(ctx, shard)
    }

    fn get_filenames(job: &JobState) -> Result<Vec<String>> {
        RecordObjectWriter::<W>::get_filenames(job)
    }

    fn supports_shard_retry(&self) -> bool {
        self.records.supports_shard_retry()
    }
}

impl<W> SupportsSliceRecovery for KeyValueWriter<W>
where
    W: SupportsSliceRecovery + OutputWriter<Input = [u8]>,
{
    fn supports_slice_recovery(&self) -> bool {
        self.records.supports_slice_recovery()
    }

    fn recover(&self, job: &JobSpec, shard_number: u32, attempt: u32) -> Result<Self> {
        self.records
            .recover(job, shard_number, attempt)
            .map(Self::wrap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::metrics::NoopMetrics;
    use crate::output::object_store::{InMemoryObjectStore, ObjectStore};
    use crate::output::records::decode_all;
    use crate::output::writer::segment_names;
    use serde_json::{json, Value};

    type Records = RecordSimpleWriter<InMemoryObjectStore>;

    const MAIN: &str = "/out/wc/42/output-0";

    fn job(writer: Value) -> JobState {
        let Value::Object(writer) = writer else {
            panic!("writer options must be an object")
        };
        JobState::new(JobSpec {
            name: "wc".into(),
            job_id: "42".into(),
            shard_count: 1,
            writer,
        })
    }

    fn ctx(job: &JobState) -> SliceContext<'_> {
        SliceContext::new(&job.spec, 0, 1, 0, &NoopMetrics)
    }

    #[test]
    fn test_validate_rejects_output_sharding() {
        let job = job(json!({"bucket_name": "out", "output_sharding": "input"}));
        let err = Records::validate(&job.spec.writer).unwrap_err();
        assert!(matches!(err, OutputError::Config(_)));
        assert!(SimpleObjectWriter::<InMemoryObjectStore>::validate(&job.spec.writer).is_ok());
    }

    #[test]
    fn test_records_over_consistent_writer() {
        let store = InMemoryObjectStore::new();
        let job = job(json!({"bucket_name": "out"}));
        let ctx = ctx(&job);

        let mut w = RecordConsistentWriter::<InMemoryObjectStore>::create(store.clone(), &job, 0, 1).unwrap();
        w.begin_slice(&ctx).unwrap();
        w.write(&ctx, b"alpha").unwrap();
        w.write(&ctx, b"").unwrap();
        w.end_slice(&ctx).unwrap();
        let state = w.to_state().unwrap();
        assert!(matches!(state, WriterState::Records { block_offset: 0, .. }));

        let json = state.to_json().unwrap();
        let mut w = RecordConsistentWriter::<InMemoryObjectStore>::from_state(
            store.clone(),
            WriterState::from_json(json).unwrap(),
        )
        .unwrap();
        w.begin_slice(&ctx).unwrap();
        w.write(&ctx, b"beta").unwrap();
        w.end_slice(&ctx).unwrap();
        w.begin_slice(&ctx).unwrap();
        w.finalize(&ctx, &mut ShardState::new(0)).unwrap();

        let data = store.read(MAIN).unwrap();
        assert_eq!(data.len(), 2 * BLOCK_SIZE);
        assert_eq!(
            decode_all(&data).unwrap(),
            vec![b"alpha".to_vec(), Vec::new(), b"beta".to_vec()]
        );
    }

    #[test]
    fn test_records_survive_segment_recovery() {
        let store = InMemoryObjectStore::new();
        let job = job(json!({"bucket_name": "out", "no_duplicate": true}));
        let ctx = ctx(&job);

        let mut w = Records::create(store.clone(), &job, 0, 1).unwrap();
        assert!(w.supports_slice_recovery());
        w.write(&ctx, b"one").unwrap();
        w.end_slice(&ctx).unwrap();
        let state = w.to_state().unwrap();

        w.write(&ctx, b"duplicate").unwrap();
        w.end_slice(&ctx).unwrap();
        drop(w);

        let restored = Records::from_state(store.clone(), state).unwrap();
        let mut w = restored.recover(&job.spec, 0, 1).unwrap();
        w.write(&ctx, b"two").unwrap();
        w.end_slice(&ctx).unwrap();
        let mut shard = ShardState::new(0);
        w.finalize(&ctx, &mut shard).unwrap();

        let mut records = Vec::new();
        for name in segment_names(&shard).unwrap() {
            records.extend(decode_all(&store.read(&name).unwrap()).unwrap());
        }
        assert_eq!(records, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn test_end_slice_after_finalize_writes_nothing() {
        let store = InMemoryObjectStore::new();
        let job = job(json!({"bucket_name": "out"}));
        let ctx = ctx(&job);

        let mut w = Records::create(store.clone(), &job, 0, 1).unwrap();
        w.write(&ctx, b"one").unwrap();
        w.finalize(&ctx, &mut ShardState::new(0)).unwrap();
        let sealed = store.read(MAIN).unwrap();
        assert!(sealed.len() < BLOCK_SIZE);

        w.end_slice(&ctx).unwrap();
        assert_eq!(store.read(MAIN).unwrap(), sealed);
        assert!(store.stat(MAIN).unwrap().sealed);
        assert_eq!(decode_all(&sealed).unwrap(), vec![b"one".to_vec()]);
    }

    #[test]
    fn test_bad_block_offset_rejected() {
        let store = InMemoryObjectStore::new();
        let job = job(json!({"bucket_name": "out"}));
        let w = Records::create(store.clone(), &job, 0, 1).unwrap();
        let WriterState::Records { inner, .. } = w.to_state().unwrap() else {
            panic!("record writer produced another state kind")
        };
        let bad = WriterState::Records {
            inner,
            block_offset: BLOCK_SIZE,
        };
        assert!(matches!(
            Records::from_state(store, bad),
            Err(OutputError::State(_))
        ));
    }

    #[test]
    fn test_key_value_writer() {
        let store = InMemoryObjectStore::new();
        let job = job(json!({"bucket_name": "out"}));
        let ctx = ctx(&job);

        let mut w = KeyValueWriter::<SimpleObjectWriter<InMemoryObjectStore>>::create(store.clone(), &job, 0, 1).unwrap();
        w.write(&ctx, &KeyValue::new("apple", "3")).unwrap();
        w.write(&ctx, &KeyValue::new("pear", "")).unwrap();
        w.end_slice(&ctx).unwrap();
        w.finalize(&ctx, &mut ShardState::new(0)).unwrap();

        let pairs = decode_key_values(&store.read(MAIN).unwrap()).unwrap();
        assert_eq!(pairs, vec![KeyValue::new("apple", "3"), KeyValue::new("pear", "")]);
    }
}
