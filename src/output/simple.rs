//! Simple Object-Store Writer
//!
//! One output object per shard, streamed directly or (when `buffered`)
//! through an `AppendPool`. Two variations:
//!
//! - Shared output (`output_sharding = "none"`): `init_job` creates one
//!   job-wide object, every shard appends to it through its pool, and
//!   `finalize_job` seals it.
//! - Duplicate avoidance (`no_duplicate = true`): output goes to numbered
//!   segments. Each checkpoint records the segment index and the length
//!   acknowledged so far; `recover` cuts a segment back to that length,
//!   stamps it into the segment metadata and moves on to the next index.
//!   Segments are left for a downstream step to merge.

use super::config::{OptionRules, OutputSharding, WriterOptions, WriterSpec};
use super::error::{OutputError, Result};
use super::metrics::{IO_WRITE_BYTES, IO_WRITE_MSEC};
use super::model::{JobSpec, JobState, ResultStatus, ShardState, SliceContext};
use super::object_store::{CreateOptions, ObjectStore, ObjectWriter, OpenMode, StoreError};
use super::pool::{AppendPool, AppendSink, StoreAppender, WriterSink};
use super::writer::{
    check_version, successful_outputs, wrong_kind, OutputWriter, ShardOutput,
    SupportsSliceRecovery, WriterState, STATE_VERSION,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Segment metadata key holding the acknowledged length
pub const VALID_LENGTH_KEY: &str = "mr-valid-length";

/// Side object used while cutting a sealed segment back
const TRIM_SUFFIX: &str = ".trim";

/// Job writer-state field naming the shared output object
const SHARED_FILENAME: &str = "filename";

/// Position inside the current duplicate-avoiding segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentCursor {
    pub index: u32,
    /// Bytes durable in the segment at the last checkpoint
    pub valid_length: u64,
}

/// Checkpoint of a `SimpleObjectWriter`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimpleState {
    pub version: u32,
    pub spec: WriterSpec,
    pub job_name: String,
    pub job_id: String,
    pub shard_number: u32,
    pub attempt: u32,
    /// Object this writer appends to
    pub target: String,
    pub closed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment: Option<SegmentCursor>,
}

pub struct SimpleObjectWriter<S: ObjectStore> {
    store: S,
    spec: WriterSpec,
    job_name: String,
    job_id: String,
    shard_number: u32,
    attempt: u32,
    target: String,
    /// Open upload; reopened lazily after a restore
    stream: Option<S::Writer>,
    pool: Option<AppendPool>,
    closed: bool,
    segment: Option<SegmentCursor>,
}

fn valid_length_metadata(length: u64) -> BTreeMap<String, String> {
    BTreeMap::from([(VALID_LENGTH_KEY.to_string(), length.to_string())])
}

fn shared_filename(job: &JobState) -> Option<String> {
    job.writer_state
        .as_ref()
        .and_then(|v| v.get(SHARED_FILENAME))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Reopen the upload for `target` if this writer has no handle yet
fn ensure_stream<'a, S: ObjectStore>(
    stream: &'a mut Option<S::Writer>,
    store: &S,
    target: &str,
    spec: &WriterSpec,
) -> Result<&'a mut S::Writer> {
    if stream.is_none() {
        *stream = Some(store.open(target, OpenMode::Append, &spec.create_options())?);
    }
    stream
        .as_mut()
        .ok_or_else(|| OutputError::Invariant(format!("no open stream for {}", target)))
}

impl<S: ObjectStore> SimpleObjectWriter<S> {
    pub fn spec(&self) -> &WriterSpec {
        &self.spec
    }

    /// Object currently written to (segment name in duplicate-avoiding mode)
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn segment(&self) -> Option<SegmentCursor> {
        self.segment
    }

    fn pooled(spec: &WriterSpec) -> bool {
        spec.buffered || spec.output_sharding == OutputSharding::Shared
    }

    fn new_pool(spec: &WriterSpec) -> Option<AppendPool> {
        Self::pooled(spec).then(|| AppendPool::new(spec.pool))
    }

    fn flush_pool(&mut self, ctx: &SliceContext<'_>) -> Result<()> {
        let Some(pool) = self.pool.as_mut() else {
            return Ok(());
        };
        if pool.is_empty() {
            return Ok(());
        }
        let options = self.spec.create_options();
        if self.spec.output_sharding == OutputSharding::Shared {
            pool.flush(&mut StoreAppender::new(&self.store, &options), ctx.metrics)
        } else {
            let stream = ensure_stream(&mut self.stream, &self.store, &self.target, &self.spec)?;
            pool.flush(&mut WriterSink(stream), ctx.metrics)
        }
    }

    /// Replace a sealed target with its first `valid` bytes. The prefix is
    /// sealed under a side name first and copied over the target, so the
    /// target never holds fewer than `valid` bytes.
    fn rewrite_sealed_prefix(&self, valid: u64, options: &CreateOptions) -> Result<()> {
        let mut data = self.store.read(&self.target)?;
        data.truncate(valid as usize);

        let trimmed = format!("{}{}", self.target, TRIM_SUFFIX);
        let mut writer = self.store.open(&trimmed, OpenMode::Create, options)?;
        writer.write(&data)?;
        writer.close()?;
        self.store
            .copy(&trimmed, &self.target, Some(valid_length_metadata(valid)))?;

        if let Err(e) = self.store.delete(&trimmed) {
            warn!(object = %trimmed, error = %e, "failed to delete trimmed segment copy");
        }
        Ok(())
    }

    /// Seal the target unless an earlier finalize already did
    fn seal_target(&mut self) -> Result<u64> {
        if let Some(stream) = self.stream.as_mut() {
            stream.close()?;
            return Ok(stream.tell());
        }
        let meta = self.store.stat(&self.target)?;
        if meta.sealed {
            debug!(target = %self.target, "target already sealed");
            return Ok(meta.size);
        }
        let stream = ensure_stream(&mut self.stream, &self.store, &self.target, &self.spec)?;
        stream.close()?;
        Ok(stream.tell())
    }
}

impl<S: ObjectStore + Clone> OutputWriter for SimpleObjectWriter<S> {
    type Store = S;
    type Input = [u8];

    fn validate(options: &WriterOptions) -> Result<WriterSpec> {
        WriterSpec::parse(options, OptionRules::SIMPLE)
    }

    fn init_job(store: &S, job: &mut JobState) -> Result<()> {
        let spec = Self::validate(&job.spec.writer)?;
        if spec.output_sharding != OutputSharding::Shared {
            return Ok(());
        }
        let name = spec.shared_name(&job.spec.name, &job.spec.job_id);
        store.open(&name, OpenMode::Create, &spec.create_options())?;
        job.writer_state = Some(serde_json::json!({ SHARED_FILENAME: name }));
        info!(job_id = %job.spec.job_id, object = %name, "created shared output");
        Ok(())
    }

    fn finalize_job(store: &S, job: &mut JobState) -> Result<()> {
        let Some(name) = shared_filename(job) else {
            return Ok(());
        };
        match store.open(&name, OpenMode::Append, &Default::default()) {
            Ok(mut stream) => stream.close()?,
            Err(StoreError::Closed(_)) => debug!(object = %name, "shared output already sealed"),
            Err(e) => return Err(e.into()),
        }
        info!(job_id = %job.spec.job_id, object = %name, "sealed shared output");
        Ok(())
    }

    fn create(store: S, job: &JobState, shard_number: u32, attempt: u32) -> Result<Self> {
        let spec = Self::validate(&job.spec.writer)?;
        let name = &job.spec.name;
        let id = &job.spec.job_id;

        let (target, stream, segment) = match spec.output_sharding {
            OutputSharding::Shared => {
                let target = shared_filename(job).ok_or_else(|| {
                    OutputError::Invariant("shared output requested before init_job".into())
                })?;
                (target, None, None)
            }
            OutputSharding::PerShard => {
                let (target, segment) = if spec.no_duplicate {
                    let cursor = SegmentCursor {
                        index: 0,
                        valid_length: 0,
                    };
                    (spec.segment_name(name, id, shard_number, attempt, 0)?, Some(cursor))
                } else {
                    (spec.output_name(name, id, shard_number)?, None)
                };
                let stream = store.open(&target, OpenMode::Create, &spec.create_options())?;
                (target, Some(stream), segment)
            }
        };

        debug!(shard = shard_number, attempt, target = %target, "created simple writer");
        Ok(SimpleObjectWriter {
            pool: Self::new_pool(&spec),
            store,
            spec,
            job_name: name.clone(),
            job_id: id.clone(),
            shard_number,
            attempt,
            target,
            stream,
            closed: false,
            segment,
        })
    }

    fn to_state(&self) -> Result<WriterState> {
        if self.pool.as_ref().is_some_and(|p| !p.is_empty()) {
            return Err(OutputError::Invariant(
                "checkpoint with unflushed pool data".into(),
            ));
        }
        Ok(WriterState::Simple(SimpleState {
            version: STATE_VERSION,
            spec: self.spec.clone(),
            job_name: self.job_name.clone(),
            job_id: self.job_id.clone(),
            shard_number: self.shard_number,
            attempt: self.attempt,
            target: self.target.clone(),
            closed: self.closed,
            segment: self.segment,
        }))
    }

    fn from_state(store: S, state: WriterState) -> Result<Self> {
        let WriterState::Simple(state) = state else {
            return Err(wrong_kind("simple", &state));
        };
        check_version(state.version)?;
        Ok(SimpleObjectWriter {
            pool: Self::new_pool(&state.spec),
            store,
            spec: state.spec,
            job_name: state.job_name,
            job_id: state.job_id,
            shard_number: state.shard_number,
            attempt: state.attempt,
            target: state.target,
            stream: None,
            closed: state.closed,
            segment: state.segment,
        })
    }

    fn end_slice(&mut self, ctx: &SliceContext<'_>) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.flush_pool(ctx)?;
        if let Some(stream) = self.stream.as_mut() {
            stream.flush()?;
            if let Some(segment) = self.segment.as_mut() {
                segment.valid_length = stream.tell();
            }
        }
        Ok(())
    }

    fn write(&mut self, ctx: &SliceContext<'_>, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(OutputError::Invariant(format!(
                "write to finalized output {}",
                self.target
            )));
        }

        if let Some(pool) = self.pool.as_mut() {
            let options = self.spec.create_options();
            let mut sink: Box<dyn AppendSink + '_> =
                if self.spec.output_sharding == OutputSharding::Shared {
                    Box::new(StoreAppender::new(&self.store, &options))
                } else {
                    Box::new(WriterSink(ensure_stream(
                        &mut self.stream,
                        &self.store,
                        &self.target,
                        &self.spec,
                    )?))
                };
            return pool.append(&self.target, data, sink.as_mut(), ctx.metrics);
        }

        let start = Instant::now();
        ensure_stream(&mut self.stream, &self.store, &self.target, &self.spec)?.write(data)?;
        ctx.metrics.increment(IO_WRITE_BYTES, data.len() as u64);
        ctx.metrics
            .increment(IO_WRITE_MSEC, start.elapsed().as_millis() as u64);
        Ok(())
    }

    fn finalize(&mut self, ctx: &SliceContext<'_>, shard: &mut ShardState) -> Result<()> {
        self.flush_pool(ctx)?;

        let output = if self.spec.output_sharding == OutputSharding::Shared {
            // Sealed by finalize_job
            ShardOutput::plain(self.target.clone())
        } else {
            let length = self.seal_target()?;
            match self.segment {
                Some(segment) => {
                    self.store
                        .copy(&self.target, &self.target, Some(valid_length_metadata(length)))?;
                    let prefix = match self.target.rsplit_once('-') {
                        Some((head, _)) => format!("{}-", head),
                        None => self.target.clone(),
                    };
                    ShardOutput {
                        filename: self.spec.output_name(
                            &self.job_name,
                            &self.job_id,
                            self.shard_number,
                        )?,
                        seg_prefix: Some(prefix),
                        last_seg_index: Some(segment.index),
                    }
                }
                None => ShardOutput::plain(self.target.clone()),
            }
        };

        self.closed = true;
        output.store(shard)?;
        info!(shard = self.shard_number, output = %output.filename, "finalized simple writer");
        Ok(())
    }

    fn get_filenames(job: &JobState) -> Result<Vec<String>> {
        match shared_filename(job) {
            Some(name) if job.result_status == Some(ResultStatus::Success) => Ok(vec![name]),
            Some(_) => Ok(Vec::new()),
            None => successful_outputs(job),
        }
    }

    fn supports_shard_retry(&self) -> bool {
        self.spec.output_sharding != OutputSharding::Shared
    }
}

impl<S: ObjectStore + Clone> SupportsSliceRecovery for SimpleObjectWriter<S> {
    fn supports_slice_recovery(&self) -> bool {
        self.spec.no_duplicate
    }

    fn recover(&self, job: &JobSpec, shard_number: u32, attempt: u32) -> Result<Self> {
        let Some(cursor) = self.segment else {
            return Err(OutputError::Invariant(
                "slice recovery needs no_duplicate output".into(),
            ));
        };
        let options = self.spec.create_options();

        let mut next_index = cursor.index;
        if cursor.valid_length != 0 {
            let valid = cursor.valid_length;
            let meta = self.store.stat(&self.target)?;
            if meta.size < valid {
                return Err(OutputError::Invariant(format!(
                    "segment {} holds {} bytes, checkpoint acknowledged {}",
                    self.target, meta.size, valid
                )));
            }
            if !meta.sealed {
                let mode = if meta.size > valid {
                    OpenMode::Resume { offset: valid }
                } else {
                    OpenMode::Append
                };
                self.store.open(&self.target, mode, &options)?.close()?;
            } else if meta.size > valid {
                warn!(segment = %self.target, size = meta.size, valid, "cutting unacknowledged tail from sealed segment");
                self.rewrite_sealed_prefix(valid, &options)?;
            }
            self.store
                .copy(&self.target, &self.target, Some(valid_length_metadata(valid)))?;
            next_index += 1;
        }

        let target = self
            .spec
            .segment_name(&job.name, &job.job_id, shard_number, attempt, next_index)?;
        let stream = self.store.open(&target, OpenMode::Create, &options)?;
        info!(shard = shard_number, from = %self.target, to = %target, "recovered segment writer");

        Ok(SimpleObjectWriter {
            store: self.store.clone(),
            spec: self.spec.clone(),
            job_name: job.name.clone(),
            job_id: job.job_id.clone(),
            shard_number,
            attempt,
            target,
            stream: Some(stream),
            pool: Self::new_pool(&self.spec),
            closed: false,
            segment: Some(SegmentCursor {
                index: next_index,
                valid_length: 0,
            }),
        })
    }
}
