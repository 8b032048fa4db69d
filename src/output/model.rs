//! Job and shard metadata as seen by output writers.
//!
//! The scheduler owns these records and persists them; writers only read the
//! identifiers and status and fill in their opaque `writer_state` blobs.

use super::config::WriterOptions;
use super::metrics::MetricsSink;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Static description of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub job_id: String,
    pub shard_count: u32,
    pub writer: WriterOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Failed,
    Aborted,
}

/// Per-shard metadata record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardState {
    pub shard_number: u32,
    pub attempt: u32,
    pub result_status: Option<ResultStatus>,
    /// Durable output locations, set by the writer at finalize
    pub writer_state: Option<Value>,
}

impl ShardState {
    pub fn new(shard_number: u32) -> Self {
        ShardState {
            shard_number,
            attempt: 1,
            result_status: None,
            writer_state: None,
        }
    }
}

/// Job-level metadata record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    pub spec: JobSpec,
    /// Job-scoped writer blob; only the shared-output mode uses it
    pub writer_state: Option<Value>,
    pub result_status: Option<ResultStatus>,
    pub shards: Vec<ShardState>,
}

impl JobState {
    /// Fresh job with one unstarted record per shard
    pub fn new(spec: JobSpec) -> Self {
        let shards = (0..spec.shard_count).map(ShardState::new).collect();
        JobState {
            spec,
            writer_state: None,
            result_status: None,
            shards,
        }
    }

    pub fn shard(&self, shard_number: u32) -> Option<&ShardState> {
        self.shards.iter().find(|s| s.shard_number == shard_number)
    }

    pub fn shard_mut(&mut self, shard_number: u32) -> Option<&mut ShardState> {
        self.shards.iter_mut().find(|s| s.shard_number == shard_number)
    }
}

/// Everything a writer may consult while a slice runs
pub struct SliceContext<'a> {
    pub job: &'a JobSpec,
    pub shard_number: u32,
    pub attempt: u32,
    pub slice_id: u64,
    pub metrics: &'a dyn MetricsSink,
}

impl<'a> SliceContext<'a> {
    pub fn new(
        job: &'a JobSpec,
        shard_number: u32,
        attempt: u32,
        slice_id: u64,
        metrics: &'a dyn MetricsSink,
    ) -> Self {
        SliceContext {
            job,
            shard_number,
            attempt,
            slice_id,
            metrics,
        }
    }
}

impl std::fmt::Debug for SliceContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SliceContext")
            .field("job_id", &self.job.job_id)
            .field("shard_number", &self.shard_number)
            .field("attempt", &self.attempt)
            .field("slice_id", &self.slice_id)
            .finish()
    }
}
