//! Output Writer Deterministic Simulation Testing Harness
//!
//! Verifies the retry guarantees of the output writers under fault
//! injection and crashes:
//!
//! - **Consistent writer**: after any mix of crashed and faulted slice
//!   attempts, the sealed main object equals the concatenation of the data
//!   written by the attempts that reached a checkpoint, and no staging
//!   object survives finalize.
//! - **Segment recovery**: the duplicate-avoiding simple writer's segments,
//!   concatenated by index, equal the checkpointed data, and every segment
//!   carries its valid length.
//!
//! ## DST Methodology
//!
//! 1. Wrap an `InMemoryObjectStore` in a `SimulatedObjectStore`
//! 2. Drive slices from checkpoints; some attempts crash at a random step
//!    (the writer is dropped, losing unflushed bytes), others fail on
//!    injected storage faults
//! 3. Retry from the last checkpoint until the slice sticks, tracking the
//!    bytes of the sticking attempt as the shadow state
//! 4. Finalize (retrying on storage errors) and compare against the shadow

use super::config::WriterOptions;
use super::consistent::ConsistentObjectWriter;
use super::error::Result;
use super::metrics::NoopMetrics;
use super::model::{JobSpec, JobState, ShardState, SliceContext};
use super::object_store::{InMemoryObjectStore, ObjectStore};
use super::simple::{SimpleObjectWriter, VALID_LENGTH_KEY};
use super::simulated_store::{SimulatedObjectStore, SimulatedStoreConfig, SimulatedStoreStats};
use super::writer::{segment_names, OutputWriter, ShardOutput, SupportsSliceRecovery, WriterState};
use crate::io::simulation::SimulatedRng;
use crate::io::Rng;
use serde_json::{json, Value};

type SimStore = SimulatedObjectStore<InMemoryObjectStore, SimulatedRng>;

const BUCKET: &str = "out";
const JOB_NAME: &str = "dst";
const JOB_ID: &str = "7";
const SHARD: u32 = 0;
const ATTEMPT: u32 = 1;

/// Result of a single DST run
#[derive(Debug)]
pub struct OutputDSTResult {
    pub seed: u64,
    pub slices: usize,
    /// Slice attempts that crashed or hit a fault
    pub failed_attempts: usize,
    pub finalize_attempts: usize,
    /// Attempts that finalized and then lost their checkpoint
    pub finalize_crashes: usize,
    pub expected_bytes: usize,
    pub actual_bytes: usize,
    pub leftover_staging: usize,
    pub store_stats: SimulatedStoreStats,
    pub passed: bool,
    pub error_message: Option<String>,
}

/// Configuration for the output DST harness
#[derive(Debug, Clone)]
pub struct OutputDSTConfig {
    /// Slices per shard
    pub num_slices: usize,
    /// Planned crashes per slice are drawn from `0..=max_crashes_per_slice`
    pub max_crashes_per_slice: u64,
    /// Upper bound on writes per slice attempt
    pub max_writes_per_slice: u64,
    /// Upper bound on bytes per write
    pub max_write_size: u64,
    /// Give up after this many tries of a single step
    pub max_retries: usize,
    pub store_config: SimulatedStoreConfig,
}

impl Default for OutputDSTConfig {
    fn default() -> Self {
        OutputDSTConfig {
            num_slices: 8,
            max_crashes_per_slice: 2,
            max_writes_per_slice: 5,
            max_write_size: 2048,
            max_retries: 200,
            store_config: SimulatedStoreConfig::default(),
        }
    }
}

impl OutputDSTConfig {
    /// No faults, no crash: baseline correctness test
    pub fn baseline() -> Self {
        OutputDSTConfig {
            max_crashes_per_slice: 0,
            store_config: SimulatedStoreConfig::no_faults(),
            ..Default::default()
        }
    }

    /// Crashes without faults
    pub fn crash_only() -> Self {
        OutputDSTConfig {
            store_config: SimulatedStoreConfig::no_faults(),
            ..Default::default()
        }
    }

    /// Full chaos: faults plus crashes
    pub fn chaos() -> Self {
        OutputDSTConfig {
            store_config: SimulatedStoreConfig::high_chaos(),
            ..Default::default()
        }
    }
}

/// Shared bookkeeping of one run
struct RunState {
    expected: Vec<u8>,
    failed_attempts: usize,
    finalize_attempts: usize,
    finalize_crashes: usize,
}

/// Output DST Harness
pub struct OutputDSTHarness {
    seed: u64,
    rng: SimulatedRng,
    config: OutputDSTConfig,
}

impl OutputDSTHarness {
    pub fn new(seed: u64, config: OutputDSTConfig) -> Self {
        OutputDSTHarness {
            seed,
            rng: SimulatedRng::new(seed),
            config,
        }
    }

    fn job(extra: Value) -> JobState {
        let mut writer = WriterOptions::new();
        writer.insert("bucket_name".into(), json!(BUCKET));
        if let Value::Object(extra) = extra {
            writer.extend(extra);
        }
        JobState::new(JobSpec {
            name: JOB_NAME.into(),
            job_id: JOB_ID.into(),
            shard_count: 1,
            writer,
        })
    }

    /// Random writes for one slice attempt
    fn payload(&mut self) -> Vec<Vec<u8>> {
        let writes = self.rng.gen_range(1, self.config.max_writes_per_slice + 1);
        (0..writes)
            .map(|_| {
                let mut buf = vec![0u8; self.rng.gen_range(0, self.config.max_write_size + 1) as usize];
                self.rng.fill_bytes(&mut buf);
                buf
            })
            .collect()
    }

    /// Retry a storage step until it succeeds. Non-retryable errors and
    /// exhausted retries end the run.
    fn retry<T>(&self, what: &str, mut step: impl FnMut() -> Result<T>) -> std::result::Result<T, String> {
        let mut last = None;
        for _ in 0..self.config.max_retries {
            match step() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => last = Some(e),
                Err(e) => return Err(format!("{} failed: {}", what, e)),
            }
        }
        Err(format!(
            "{} still failing after {} retries: {}",
            what,
            self.config.max_retries,
            last.map(|e| e.to_string()).unwrap_or_default()
        ))
    }

    /// Run one slice attempt. `crash_at` stops the attempt after that many
    /// steps (begin, each write, end) and drops the writer.
    fn run_attempt<W>(
        writer: &mut W,
        ctx: &SliceContext<'_>,
        writes: &[Vec<u8>],
        crash_at: Option<usize>,
    ) -> Result<Option<WriterState>>
    where
        W: OutputWriter<Input = [u8]>,
    {
        writer.begin_slice(ctx)?;
        if crash_at == Some(0) {
            return Ok(None);
        }
        for (i, data) in writes.iter().enumerate() {
            writer.write(ctx, data)?;
            if crash_at == Some(i + 1) {
                return Ok(None);
            }
        }
        writer.end_slice(ctx)?;
        if crash_at.is_some() {
            return Ok(None);
        }
        writer.to_state().map(Some)
    }

    fn crash_point(&mut self, planned: &mut u64, writes: usize) -> Option<usize> {
        if *planned == 0 {
            return None;
        }
        *planned -= 1;
        Some(self.rng.gen_range(0, writes as u64 + 2) as usize)
    }

    fn result(
        &self,
        store: &SimStore,
        run: &RunState,
        actual_bytes: usize,
        leftover_staging: usize,
        error: Option<String>,
    ) -> OutputDSTResult {
        OutputDSTResult {
            seed: self.seed,
            slices: self.config.num_slices,
            failed_attempts: run.failed_attempts,
            finalize_attempts: run.finalize_attempts,
            finalize_crashes: run.finalize_crashes,
            expected_bytes: run.expected.len(),
            actual_bytes,
            leftover_staging,
            store_stats: store.stats(),
            passed: error.is_none(),
            error_message: error,
        }
    }

    /// Consistent writer under retried slices
    pub fn run_consistent(&mut self) -> OutputDSTResult {
        let store = SimulatedObjectStore::new(
            InMemoryObjectStore::new(),
            self.rng.fork(),
            self.config.store_config.clone(),
        );
        let job = Self::job(Value::Null);
        let mut run = RunState {
            expected: Vec::new(),
            failed_attempts: 0,
            finalize_attempts: 0,
            finalize_crashes: 0,
        };

        match self.drive_consistent(&store, &job, &mut run) {
            Ok((main, leftover)) => {
                let actual = store.inner().read(&main).unwrap_or_default();
                let sealed = store.inner().stat(&main).map(|m| m.sealed).unwrap_or(false);
                let error = if actual != run.expected {
                    Some(format!(
                        "INVARIANT VIOLATION: main holds {} bytes, expected {} (first difference at {:?})",
                        actual.len(),
                        run.expected.len(),
                        actual.iter().zip(&run.expected).position(|(a, b)| a != b)
                    ))
                } else if !sealed {
                    Some("INVARIANT VIOLATION: main object not sealed after finalize".into())
                } else if self.config.store_config.list_incomplete_prob == 0.0 && leftover > 0 {
                    Some(format!(
                        "INVARIANT VIOLATION: {} staging objects left after finalize",
                        leftover
                    ))
                } else {
                    None
                };
                self.result(&store, &run, actual.len(), leftover, error)
            }
            Err(e) => self.result(&store, &run, 0, 0, Some(e)),
        }
    }

    fn drive_consistent(
        &mut self,
        store: &SimStore,
        job: &JobState,
        run: &mut RunState,
    ) -> std::result::Result<(String, usize), String> {
        type Writer = ConsistentObjectWriter<SimStore>;

        let ctx = SliceContext::new(&job.spec, SHARD, ATTEMPT, 0, &NoopMetrics);
        let writer = self.retry("create", || Writer::create(store.clone(), job, SHARD, ATTEMPT))?;
        let main = writer.main_name().to_string();
        let mut checkpoint = writer.to_state().map_err(|e| e.to_string())?;

        for slice in 0..self.config.num_slices {
            let mut planned = self.rng.gen_range(0, self.config.max_crashes_per_slice + 1);
            let mut tries = 0;
            loop {
                tries += 1;
                if tries > self.config.max_retries {
                    return Err(format!("slice {} never completed", slice));
                }
                let writes = self.payload();
                let crash_at = self.crash_point(&mut planned, writes.len());
                let ctx = SliceContext { slice_id: slice as u64, ..ctx };

                let attempt = Writer::from_state(store.clone(), checkpoint.clone()).and_then(|w| {
                    let mut w = w.with_rng(self.rng.fork());
                    Self::run_attempt(&mut w, &ctx, &writes, crash_at)
                });
                match attempt {
                    Ok(Some(state)) => {
                        checkpoint = state;
                        run.expected.extend(writes.concat());
                        break;
                    }
                    Ok(None) => run.failed_attempts += 1,
                    Err(e) if e.is_retryable() => run.failed_attempts += 1,
                    Err(e) => return Err(format!("slice {} failed: {}", slice, e)),
                }
            }
        }

        let mut shard = ShardState::new(SHARD);
        let mut finalize_attempts = 0;
        let finalize_rng = self.rng.fork();
        self.retry("finalize", || {
            finalize_attempts += 1;
            let mut w = Writer::from_state(store.clone(), checkpoint.clone())?
                .with_rng(finalize_rng.clone());
            w.begin_slice(&ctx)?;
            w.finalize(&ctx, &mut shard)
        })?;
        run.finalize_attempts = finalize_attempts;

        let recorded = ShardOutput::from_shard(&shard)
            .map_err(|e| e.to_string())?
            .map(|o| o.filename);
        if recorded.as_deref() != Some(main.as_str()) {
            return Err(format!(
                "INVARIANT VIOLATION: shard recorded {:?}, main is {}",
                recorded, main
            ));
        }

        let spec = Writer::validate(&job.spec.writer).map_err(|e| e.to_string())?;
        let prefix = spec.staging_prefix(JOB_ID, SHARD).map_err(|e| e.to_string())?;
        let leftover = store.inner().list(&prefix).map_err(|e| e.to_string())?.len();
        Ok((main, leftover))
    }

    /// Duplicate-avoiding simple writer under slice recovery
    pub fn run_segments(&mut self) -> OutputDSTResult {
        let store = SimulatedObjectStore::new(
            InMemoryObjectStore::new(),
            self.rng.fork(),
            self.config.store_config.clone(),
        );
        let job = Self::job(json!({"no_duplicate": true}));
        let mut run = RunState {
            expected: Vec::new(),
            failed_attempts: 0,
            finalize_attempts: 0,
            finalize_crashes: 0,
        };

        match self.drive_segments(&store, &job, &mut run) {
            Ok(shard) => {
                let error = match Self::check_segments(store.inner(), &shard, &run.expected) {
                    Ok(()) => None,
                    Err(e) => Some(e),
                };
                let actual = segment_names(&shard)
                    .map(|names| {
                        names
                            .iter()
                            .map(|n| store.inner().stat(n).map(|m| m.size as usize).unwrap_or(0))
                            .sum()
                    })
                    .unwrap_or(0);
                self.result(&store, &run, actual, 0, error)
            }
            Err(e) => self.result(&store, &run, 0, 0, Some(e)),
        }
    }

    fn drive_segments(
        &mut self,
        store: &SimStore,
        job: &JobState,
        run: &mut RunState,
    ) -> std::result::Result<ShardState, String> {
        type Writer = SimpleObjectWriter<SimStore>;

        let ctx = SliceContext::new(&job.spec, SHARD, ATTEMPT, 0, &NoopMetrics);
        let writer = self.retry("create", || Writer::create(store.clone(), job, SHARD, ATTEMPT))?;
        let mut checkpoint = writer.to_state().map_err(|e| e.to_string())?;
        drop(writer);

        for slice in 0..self.config.num_slices {
            let mut planned = self.rng.gen_range(0, self.config.max_crashes_per_slice + 1);
            let mut needs_recovery = false;
            // The last slice may finalize and then lose its checkpoint
            let mut finalize_crash = slice + 1 == self.config.num_slices
                && self.config.max_crashes_per_slice > 0
                && self.rng.gen_bool(0.5);
            let mut tries = 0;
            loop {
                tries += 1;
                if tries > self.config.max_retries {
                    return Err(format!("slice {} never completed", slice));
                }
                let writes = self.payload();
                let crash_at = self.crash_point(&mut planned, writes.len());
                let ctx = SliceContext { slice_id: slice as u64, ..ctx };
                let crash_after_finalize = finalize_crash && crash_at.is_none();

                let attempt = Writer::from_state(store.clone(), checkpoint.clone())
                    .and_then(|w| {
                        if needs_recovery {
                            w.recover(&job.spec, SHARD, ATTEMPT)
                        } else {
                            Ok(w)
                        }
                    })
                    .and_then(|mut w| {
                        let state = Self::run_attempt(&mut w, &ctx, &writes, crash_at)?;
                        if crash_after_finalize && state.is_some() {
                            w.finalize(&ctx, &mut ShardState::new(SHARD))?;
                            return Ok(None);
                        }
                        Ok(state)
                    });
                if crash_after_finalize && matches!(attempt, Ok(None)) {
                    finalize_crash = false;
                    run.finalize_crashes += 1;
                }
                match attempt {
                    Ok(Some(state)) => {
                        checkpoint = state;
                        run.expected.extend(writes.concat());
                        break;
                    }
                    Ok(None) => {}
                    Err(e) if e.is_retryable() => {}
                    Err(e) => return Err(format!("slice {} failed: {}", slice, e)),
                }
                run.failed_attempts += 1;
                needs_recovery = true;
            }
        }

        let mut shard = ShardState::new(SHARD);
        let mut finalize_attempts = 0;
        self.retry("finalize", || {
            finalize_attempts += 1;
            let mut w = Writer::from_state(store.clone(), checkpoint.clone())?;
            w.begin_slice(&ctx)?;
            w.finalize(&ctx, &mut shard)
        })?;
        run.finalize_attempts = finalize_attempts;
        Ok(shard)
    }

    fn check_segments(
        store: &InMemoryObjectStore,
        shard: &ShardState,
        expected: &[u8],
    ) -> std::result::Result<(), String> {
        let names = segment_names(shard).map_err(|e| e.to_string())?;
        if names.is_empty() {
            return Err("INVARIANT VIOLATION: finalize recorded no segments".into());
        }

        let mut joined = Vec::new();
        for name in &names {
            let meta = store.stat(name).map_err(|e| format!("{}: {}", name, e))?;
            let stamped = meta.metadata.get(VALID_LENGTH_KEY).cloned();
            if !meta.sealed || stamped != Some(meta.size.to_string()) {
                return Err(format!(
                    "INVARIANT VIOLATION: segment {} sealed={} size={} valid-length={:?}",
                    name, meta.sealed, meta.size, stamped
                ));
            }
            joined.extend(store.read(name).map_err(|e| e.to_string())?);
        }

        if joined != expected {
            return Err(format!(
                "INVARIANT VIOLATION: {} segments hold {} bytes, expected {}",
                names.len(),
                joined.len(),
                expected.len()
            ));
        }
        Ok(())
    }
}

/// Run a batch of consistent-writer DST runs across multiple seeds
pub fn run_consistent_dst_batch(
    seeds: std::ops::Range<u64>,
    config: OutputDSTConfig,
) -> Vec<OutputDSTResult> {
    seeds
        .map(|seed| OutputDSTHarness::new(seed, config.clone()).run_consistent())
        .collect()
}

/// Run a batch of segment-recovery DST runs across multiple seeds
pub fn run_segment_dst_batch(
    seeds: std::ops::Range<u64>,
    config: OutputDSTConfig,
) -> Vec<OutputDSTResult> {
    seeds
        .map(|seed| OutputDSTHarness::new(seed, config.clone()).run_segments())
        .collect()
}

pub fn summarize_output_dst_batch(name: &str, results: &[OutputDSTResult]) -> String {
    let total = results.len();
    let passed = results.iter().filter(|r| r.passed).count();
    let failed = total - passed;

    let failed_attempts: usize = results.iter().map(|r| r.failed_attempts).sum();
    let finalize_attempts: usize = results.iter().map(|r| r.finalize_attempts).sum();
    let finalize_crashes: usize = results.iter().map(|r| r.finalize_crashes).sum();
    let expected: usize = results.iter().map(|r| r.expected_bytes).sum();
    let leftover: usize = results.iter().map(|r| r.leftover_staging).sum();

    let mut summary = format!(
        "{} DST Batch: {}/{} passed ({} failed)\n\
         Failed slice attempts: {}, Finalize attempts: {}, Crashes after finalize: {}, Bytes checked: {}, Leftover staging: {}",
        name, passed, total, failed, failed_attempts, finalize_attempts, finalize_crashes, expected, leftover
    );

    if failed > 0 {
        summary.push_str("\n\nFailed seeds:");
        for r in results.iter().filter(|r| !r.passed) {
            summary.push_str(&format!(
                "\n  Seed {}: {}",
                r.seed,
                r.error_message.as_deref().unwrap_or("unknown error")
            ));
        }
    }

    summary
}
