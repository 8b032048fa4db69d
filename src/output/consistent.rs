//! Consistent Object-Store Writer
//!
//! Keeps retried slices from leaving duplicate or torn bytes in the output.
//! Each slice writes into its own staging object; the next slice start
//! copies that sealed staging object into the main object. The main
//! object's length is checkpointed with every slice, so a copy that reruns
//! after a crash resumes at the checkpointed offset and overwrites whatever
//! the failed run left behind.
//!
//! ```text
//! slice N:    begin ── delete staging[N-2] ── copy staging[N-1] → main ── create staging[N]
//!             write* → staging[N]
//!             end ──── seal staging[N]
//! finalize:   seal main ── delete staging[N-1], staging[N] ── sweep prefix
//! ```

use super::config::{OptionRules, WriterOptions, WriterSpec};
use super::error::{OutputError, Result};
use super::metrics::{IO_WRITE_BYTES, IO_WRITE_MSEC};
use super::model::{JobState, ShardState, SliceContext};
use super::object_store::{CreateOptions, ObjectStore, ObjectWriter, OpenMode, StoreError};
use super::writer::{
    check_version, wrong_kind, OutputWriter, ShardOutput, WriterState, STATE_VERSION,
};
use crate::io::{ProductionRng, Rng};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Chunk size used when copying staging bytes into the main object
pub const REWRITE_BLOCK_SIZE: usize = 256 * 1024;

/// Checkpoint of a `ConsistentObjectWriter`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistentState {
    pub version: u32,
    pub spec: WriterSpec,
    pub job_id: String,
    pub shard_number: u32,
    pub main: String,
    /// Durable length of the main object covered by this checkpoint
    pub main_offset: u64,
    /// Staging object of the last completed slice, not yet copied
    pub staging: Option<String>,
    /// Staging object already copied, pending deletion
    pub previous_staging: Option<String>,
    pub main_closed: bool,
}

pub struct ConsistentObjectWriter<S: ObjectStore> {
    store: S,
    state: ConsistentState,
    /// Open upload for the current slice's staging object
    staging_writer: Option<S::Writer>,
    data_written_to_slice: bool,
    rng: Box<dyn Rng>,
}

impl<S: ObjectStore> ConsistentObjectWriter<S> {
    /// Replace the source of staging-name randomness
    pub fn with_rng(mut self, rng: impl Rng) -> Self {
        self.rng = Box::new(rng);
        self
    }

    pub fn main_name(&self) -> &str {
        &self.state.main
    }

    pub fn main_offset(&self) -> u64 {
        self.state.main_offset
    }

    pub fn staging_name(&self) -> Option<&str> {
        self.state.staging.as_deref()
    }

    fn staging_prefix(&self) -> Result<String> {
        self.state
            .spec
            .staging_prefix(&self.state.job_id, self.state.shard_number)
    }

    fn new_staging_name(&mut self) -> Result<String> {
        let suffix = ((self.rng.next_u64() as u128) << 64) | self.rng.next_u64() as u128;
        Ok(format!("{}{:032x}", self.staging_prefix()?, suffix))
    }

    fn remove_staging(&self, name: &str) -> std::result::Result<(), StoreError> {
        match self.store.delete(name) {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    /// Append a sealed staging object to main at the checkpointed offset
    fn copy_into_main(&mut self, staging: &str) -> Result<()> {
        if self.state.main_closed || self.store.stat(&self.state.main)?.sealed {
            debug!(main = %self.state.main, "main already sealed, skipping copy");
            self.state.main_closed = true;
            return Ok(());
        }

        let mut main = self.store.open(
            &self.state.main,
            OpenMode::Resume {
                offset: self.state.main_offset,
            },
            &self.state.spec.create_options(),
        )?;
        // One block in memory at a time; a retry resumes at main_offset
        let mut copied = 0u64;
        loop {
            let block = self.store.read_range(staging, copied, REWRITE_BLOCK_SIZE)?;
            if block.is_empty() {
                break;
            }
            main.write(&block)?;
            main.flush()?;
            copied += block.len() as u64;
            if block.len() < REWRITE_BLOCK_SIZE {
                break;
            }
        }

        debug_assert_eq!(main.tell(), self.state.main_offset + copied);
        self.state.main_offset = main.tell();
        debug!(main = %self.state.main, staging = %staging, bytes = copied, "copied staging into main");
        Ok(())
    }

    fn seal_main(&mut self) -> Result<()> {
        if self.state.main_closed || self.store.stat(&self.state.main)?.sealed {
            self.state.main_closed = true;
            return Ok(());
        }
        let mut main = self.store.open(
            &self.state.main,
            OpenMode::Resume {
                offset: self.state.main_offset,
            },
            &self.state.spec.create_options(),
        )?;
        main.close()?;
        self.state.main_closed = true;
        Ok(())
    }

    /// Delete every staging object left under this shard's prefix
    fn sweep_garbage(&self) -> Result<()> {
        let prefix = self.staging_prefix()?;
        for name in self.store.list(&prefix)? {
            self.remove_staging(&name)?;
        }
        Ok(())
    }
}

impl<S: ObjectStore> OutputWriter for ConsistentObjectWriter<S> {
    type Store = S;
    type Input = [u8];

    fn validate(options: &WriterOptions) -> Result<WriterSpec> {
        WriterSpec::parse(options, OptionRules::CONSISTENT)
    }

    fn create(store: S, job: &JobState, shard_number: u32, attempt: u32) -> Result<Self> {
        let spec = Self::validate(&job.spec.writer)?;
        let main = spec.output_name(&job.spec.name, &job.spec.job_id, shard_number)?;

        let mut writer = store.open(&main, OpenMode::Create, &spec.create_options())?;
        writer.flush()?;
        debug!(shard = shard_number, attempt, main = %main, "created consistent writer");

        Ok(ConsistentObjectWriter {
            store,
            state: ConsistentState {
                version: STATE_VERSION,
                spec,
                job_id: job.spec.job_id.clone(),
                shard_number,
                main,
                main_offset: 0,
                staging: None,
                previous_staging: None,
                main_closed: false,
            },
            staging_writer: None,
            data_written_to_slice: false,
            rng: Box::new(ProductionRng),
        })
    }

    fn to_state(&self) -> Result<WriterState> {
        if self.staging_writer.is_some() {
            return Err(OutputError::Invariant(
                "checkpoint requested inside an open slice".into(),
            ));
        }
        Ok(WriterState::Consistent(self.state.clone()))
    }

    fn from_state(store: S, state: WriterState) -> Result<Self> {
        let WriterState::Consistent(state) = state else {
            return Err(wrong_kind("consistent", &state));
        };
        check_version(state.version)?;
        Ok(ConsistentObjectWriter {
            store,
            state,
            staging_writer: None,
            data_written_to_slice: false,
            rng: Box::new(ProductionRng),
        })
    }

    fn begin_slice(&mut self, ctx: &SliceContext<'_>) -> Result<()> {
        if let Some(previous) = self.state.previous_staging.take() {
            if let Err(e) = self.remove_staging(&previous) {
                warn!(staging = %previous, error = %e, "failed to delete old staging object");
            }
        }

        if let Some(staging) = self.state.staging.clone() {
            self.copy_into_main(&staging)?;
        }
        self.state.previous_staging = self.state.staging.take();

        if self.state.main_closed {
            return Ok(());
        }

        let name = self.new_staging_name()?;
        let writer = self
            .store
            .open(&name, OpenMode::Create, &CreateOptions::default())?;
        debug!(slice = ctx.slice_id, staging = %name, "rotated staging object");
        self.state.staging = Some(name);
        self.staging_writer = Some(writer);
        Ok(())
    }

    fn end_slice(&mut self, _ctx: &SliceContext<'_>) -> Result<()> {
        if let Some(mut writer) = self.staging_writer.take() {
            writer.close()?;
        }
        self.data_written_to_slice = false;
        Ok(())
    }

    fn write(&mut self, ctx: &SliceContext<'_>, data: &[u8]) -> Result<()> {
        let start = Instant::now();
        let writer = self.staging_writer.as_mut().ok_or_else(|| {
            OutputError::Invariant("write outside a slice, begin_slice missing?".into())
        })?;
        writer.write(data)?;
        self.data_written_to_slice = true;
        ctx.metrics.increment(IO_WRITE_BYTES, data.len() as u64);
        ctx.metrics
            .increment(IO_WRITE_MSEC, start.elapsed().as_millis() as u64);
        Ok(())
    }

    fn finalize(&mut self, _ctx: &SliceContext<'_>, shard: &mut ShardState) -> Result<()> {
        if self.data_written_to_slice {
            return Err(OutputError::Invariant(
                "finalize called after data was written without end_slice".into(),
            ));
        }

        if let Some(mut writer) = self.staging_writer.take() {
            writer.close()?;
        }
        if let Some(staging) = self.state.staging.clone() {
            self.copy_into_main(&staging)?;
        }
        self.seal_main()?;

        if let Some(previous) = self.state.previous_staging.take() {
            self.remove_staging(&previous)?;
        }
        if let Some(staging) = self.state.staging.take() {
            self.remove_staging(&staging)?;
        }
        self.sweep_garbage()?;

        ShardOutput::plain(self.state.main.clone()).store(shard)?;
        info!(shard = self.state.shard_number, main = %self.state.main, bytes = self.state.main_offset, "finalized consistent writer");
        Ok(())
    }

    fn supports_shard_retry(&self) -> bool {
        true
    }
}
