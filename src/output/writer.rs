//! Output Writer Contract
//!
//! Lifecycle every writer variant follows, driven by the scheduler:
//!
//! ```text
//! validate ─► [init_job] ─► create ─► { begin_slice ─► write* ─► end_slice ─► to_state }*
//!                                        ─► finalize ─► [finalize_job] ─► get_filenames
//! ```
//!
//! Between slices the writer only exists as its `WriterState` snapshot; the
//! next slice rebuilds it with `from_state`. Snapshots are tagged and
//! versioned so a checkpoint from an incompatible build is refused instead
//! of misread.

use super::config::{WriterOptions, WriterSpec};
use super::consistent::ConsistentState;
use super::error::{OutputError, Result};
use super::model::{JobSpec, JobState, ResultStatus, ShardState, SliceContext};
use super::object_store::ObjectStore;
use super::simple::SimpleState;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current snapshot format version
pub const STATE_VERSION: u32 = 1;

/// Serialized writer snapshot, one variant per writer kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WriterState {
    Simple(SimpleState),
    Consistent(ConsistentState),
    Records {
        inner: Box<WriterState>,
        /// Encoder position inside the current block
        block_offset: usize,
    },
}

impl WriterState {
    pub fn to_json(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_json(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WriterState::Simple(_) => "simple",
            WriterState::Consistent(_) => "consistent",
            WriterState::Records { .. } => "records",
        }
    }
}

/// Refuse snapshots written by another format version
pub fn check_version(found: u32) -> Result<()> {
    if found != STATE_VERSION {
        return Err(OutputError::State(format!(
            "writer state version {} is not supported (expected {})",
            found, STATE_VERSION
        )));
    }
    Ok(())
}

pub fn wrong_kind(expected: &str, state: &WriterState) -> OutputError {
    OutputError::State(format!(
        "expected {} writer state, got {}",
        expected,
        state.kind()
    ))
}

/// What a finalized shard leaves in `ShardState::writer_state`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardOutput {
    /// Logical output name
    pub filename: String,
    /// Segment name prefix, duplicate-avoiding mode only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seg_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seg_index: Option<u32>,
}

impl ShardOutput {
    pub fn plain(filename: String) -> Self {
        ShardOutput {
            filename,
            seg_prefix: None,
            last_seg_index: None,
        }
    }

    pub fn from_shard(shard: &ShardState) -> Result<Option<Self>> {
        shard
            .writer_state
            .clone()
            .map(serde_json::from_value)
            .transpose()
            .map_err(OutputError::from)
    }

    pub fn store(&self, shard: &mut ShardState) -> Result<()> {
        shard.writer_state = Some(serde_json::to_value(self)?);
        Ok(())
    }
}

/// Names of every segment a duplicate-avoiding shard produced, in order.
/// Empty for shards that wrote a single object.
pub fn segment_names(shard: &ShardState) -> Result<Vec<String>> {
    let Some(output) = ShardOutput::from_shard(shard)? else {
        return Ok(Vec::new());
    };
    match (output.seg_prefix, output.last_seg_index) {
        (Some(prefix), Some(last)) => Ok((0..=last).map(|i| format!("{}{}", prefix, i)).collect()),
        _ => Ok(Vec::new()),
    }
}

/// Outputs of successful shards in shard-number order
pub fn successful_outputs(job: &JobState) -> Result<Vec<String>> {
    let mut shards: Vec<&ShardState> = job
        .shards
        .iter()
        .filter(|s| s.result_status == Some(ResultStatus::Success))
        .collect();
    shards.sort_by_key(|s| s.shard_number);

    let mut filenames = Vec::with_capacity(shards.len());
    for shard in shards {
        if let Some(output) = ShardOutput::from_shard(shard)? {
            filenames.push(output.filename);
        }
    }
    Ok(filenames)
}

/// Polymorphic writer lifecycle
pub trait OutputWriter: Sized {
    type Store: ObjectStore;
    /// One logical unit passed to `write`
    type Input: ?Sized;

    /// Check options without side effects
    fn validate(options: &WriterOptions) -> Result<WriterSpec>;

    /// Job-wide setup; shared-output mode only
    fn init_job(_store: &Self::Store, _job: &mut JobState) -> Result<()> {
        Ok(())
    }

    /// Job-wide teardown; shared-output mode only
    fn finalize_job(_store: &Self::Store, _job: &mut JobState) -> Result<()> {
        Ok(())
    }

    /// Writer for one shard attempt
    fn create(store: Self::Store, job: &JobState, shard_number: u32, attempt: u32)
        -> Result<Self>;

    fn to_state(&self) -> Result<WriterState>;

    fn from_state(store: Self::Store, state: WriterState) -> Result<Self>;

    fn begin_slice(&mut self, _ctx: &SliceContext<'_>) -> Result<()> {
        Ok(())
    }

    fn end_slice(&mut self, _ctx: &SliceContext<'_>) -> Result<()> {
        Ok(())
    }

    fn write(&mut self, ctx: &SliceContext<'_>, data: &Self::Input) -> Result<()>;

    /// Called once the shard succeeded; records output locations in `shard`
    fn finalize(&mut self, ctx: &SliceContext<'_>, shard: &mut ShardState) -> Result<()>;

    fn get_filenames(job: &JobState) -> Result<Vec<String>> {
        successful_outputs(job)
    }

    /// Whether a failed shard can be rerun from scratch as a new attempt
    fn supports_shard_retry(&self) -> bool {
        false
    }
}

/// Writers that can rebuild themselves after a failed slice
pub trait SupportsSliceRecovery: OutputWriter {
    fn supports_slice_recovery(&self) -> bool;

    /// Writer to continue with after the slice that produced `self`'s
    /// checkpoint was retried. Safe to call repeatedly.
    fn recover(&self, job: &JobSpec, shard_number: u32, attempt: u32) -> Result<Self>;
}
