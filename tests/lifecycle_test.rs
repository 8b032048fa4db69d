//! End-to-end writer lifecycles against real stores
//!
//! Drives jobs through create, slices, checkpoints and finalize the way a
//! scheduler would, on the local filesystem store and the in-memory store.

use serde_json::{json, Value};
use shard_output::output::metrics::{Counters, IO_WRITE_BYTES};
use shard_output::output::{
    decode_all, decode_key_values, ConsistentObjectWriter, InMemoryObjectStore, JobSpec,
    JobState, KeyValue, KeyValueWriter, LocalFsObjectStore, NoopMetrics, ObjectStore,
    OutputError, OutputWriter, RecordConsistentWriter, ResultStatus, SimpleObjectWriter,
    SliceContext, WriterSpec, WriterState,
};
use tempfile::TempDir;

type LocalConsistent = ConsistentObjectWriter<LocalFsObjectStore>;
type MemorySimple = SimpleObjectWriter<InMemoryObjectStore>;

fn job(name: &str, shard_count: u32, writer: Value) -> JobState {
    let Value::Object(writer) = writer else {
        panic!("writer options must be an object")
    };
    JobState::new(JobSpec {
        name: name.into(),
        job_id: "9".into(),
        shard_count,
        writer,
    })
}

/// Run every slice through fresh writers restored from the previous
/// checkpoint, then finalize and mark the shard successful.
fn run_shard<W: OutputWriter>(
    store: &W::Store,
    job: &mut JobState,
    shard: u32,
    slices: &[Vec<&W::Input>],
) where
    W::Store: Clone,
{
    let spec = job.spec.clone();
    let mut state = W::create(store.clone(), job, shard, 1).unwrap().to_state().unwrap();

    for (i, slice) in slices.iter().enumerate() {
        let ctx = SliceContext::new(&spec, shard, 1, i as u64, &NoopMetrics);
        let mut w = W::from_state(store.clone(), WriterState::from_json(state.to_json().unwrap()).unwrap()).unwrap();
        w.begin_slice(&ctx).unwrap();
        for item in slice {
            w.write(&ctx, *item).unwrap();
        }
        w.end_slice(&ctx).unwrap();
        state = w.to_state().unwrap();
    }

    let ctx = SliceContext::new(&spec, shard, 1, slices.len() as u64, &NoopMetrics);
    let mut w = W::from_state(store.clone(), state).unwrap();
    w.begin_slice(&ctx).unwrap();
    let shard_state = job.shard_mut(shard).unwrap();
    w.finalize(&ctx, shard_state).unwrap();
    shard_state.result_status = Some(ResultStatus::Success);
}

#[test]
fn test_simple_writer_on_local_fs() {
    let dir = TempDir::new().unwrap();
    let store = LocalFsObjectStore::new(dir.path().to_path_buf()).unwrap();
    let mut job = job("wc", 2, json!({"bucket_name": "out", "content_type": "text/plain"}));

    run_shard::<SimpleObjectWriter<LocalFsObjectStore>>(&store, &mut job, 0, &[vec![b"a1 ".as_slice(), b"a2 ".as_slice()], vec![b"a3".as_slice()]]);
    run_shard::<SimpleObjectWriter<LocalFsObjectStore>>(&store, &mut job, 1, &[vec![b"b1".as_slice()]]);

    let files = SimpleObjectWriter::<LocalFsObjectStore>::get_filenames(&job).unwrap();
    assert_eq!(files, vec!["/out/wc/9/output-0", "/out/wc/9/output-1"]);
    assert_eq!(store.read(&files[0]).unwrap(), b"a1 a2 a3");
    assert_eq!(store.read(&files[1]).unwrap(), b"b1");

    let meta = store.stat(&files[0]).unwrap();
    assert!(meta.sealed);
    assert_eq!(meta.content_type.as_deref(), Some("text/plain"));
}

#[test]
fn test_consistent_writer_on_local_fs() {
    let dir = TempDir::new().unwrap();
    let store = LocalFsObjectStore::new(dir.path().to_path_buf()).unwrap();
    let mut job = job("wc", 1, json!({"bucket_name": "out", "tmp_bucket_name": "scratch"}));

    run_shard::<ConsistentObjectWriter<LocalFsObjectStore>>(
        &store,
        &mut job,
        0,
        &[
            vec![b"one ".as_slice()],
            vec![b"two ".as_slice(), b"three".as_slice()],
            vec![],
        ],
    );

    let files = ConsistentObjectWriter::<LocalFsObjectStore>::get_filenames(&job).unwrap();
    assert_eq!(files, vec!["/out/wc/9/output-0"]);
    assert_eq!(store.read(&files[0]).unwrap(), b"one two three");
    assert!(store.list("/scratch/").unwrap().is_empty());
}

#[test]
fn test_consistent_retry_after_crash_on_local_fs() {
    let dir = TempDir::new().unwrap();
    let store = LocalFsObjectStore::new(dir.path().to_path_buf()).unwrap();
    let job = job("wc", 1, json!({"bucket_name": "out"}));
    let ctx = SliceContext::new(&job.spec, 0, 1, 0, &NoopMetrics);

    let mut w = LocalConsistent::create(store.clone(), &job, 0, 1).unwrap();
    w.begin_slice(&ctx).unwrap();
    w.write(&ctx, b"first").unwrap();
    w.end_slice(&ctx).unwrap();
    let checkpoint = w.to_state().unwrap();

    // Second slice copies "first" into main, then dies mid-slice
    let mut crashed = LocalConsistent::from_state(store.clone(), checkpoint.clone()).unwrap();
    crashed.begin_slice(&ctx).unwrap();
    crashed.write(&ctx, b"lost").unwrap();
    drop(crashed);

    let mut retry = LocalConsistent::from_state(store.clone(), checkpoint).unwrap();
    retry.begin_slice(&ctx).unwrap();
    retry.write(&ctx, b"+second").unwrap();
    retry.end_slice(&ctx).unwrap();
    let checkpoint = retry.to_state().unwrap();

    let mut fin = LocalConsistent::from_state(store.clone(), checkpoint).unwrap();
    let mut shard = job.shards[0].clone();
    fin.begin_slice(&ctx).unwrap();
    fin.finalize(&ctx, &mut shard).unwrap();

    assert_eq!(store.read("/out/wc/9/output-0").unwrap(), b"first+second");
}

#[test]
fn test_key_values_over_consistent_records() {
    let store = InMemoryObjectStore::new();
    let mut job = job("kv", 1, json!({"bucket_name": "out"}));
    let pairs = [
        KeyValue::new("alpha", vec![1u8; 10]),
        KeyValue::new("beta", vec![2u8; 40_000]),
        KeyValue::new("", Vec::new()),
    ];

    run_shard::<KeyValueWriter<ConsistentObjectWriter<InMemoryObjectStore>>>(
        &store,
        &mut job,
        0,
        &[vec![&pairs[0], &pairs[1]], vec![&pairs[2]]],
    );

    let files = KeyValueWriter::<ConsistentObjectWriter<InMemoryObjectStore>>::get_filenames(&job).unwrap();
    let data = store.read(&files[0]).unwrap();
    assert_eq!(decode_key_values(&data).unwrap(), pairs.to_vec());
}

#[test]
fn test_records_across_slices() {
    let store = InMemoryObjectStore::new();
    let mut job = job("rec", 1, json!({"bucket_name": "out"}));
    let big = vec![7u8; 70_000];

    run_shard::<RecordConsistentWriter<InMemoryObjectStore>>(
        &store,
        &mut job,
        0,
        &[
            vec![b"r1".as_slice(), big.as_slice()],
            vec![b"".as_slice()],
            vec![b"r3".as_slice()],
        ],
    );

    let data = store.read("/out/rec/9/output-0").unwrap();
    let records = decode_all(&data).unwrap();
    assert_eq!(records, vec![b"r1".to_vec(), big, Vec::new(), b"r3".to_vec()]);
}

#[test]
fn test_shared_output_across_shards() {
    let store = InMemoryObjectStore::new();
    let mut job = job(
        "shared",
        2,
        json!({"bucket_name": "out", "output_sharding": "none", "flush_size": 4}),
    );
    MemorySimple::init_job(&store, &mut job).unwrap();

    let counters = Counters::new();
    let spec = job.spec.clone();
    let mut shards = Vec::new();
    for shard in 0..2u32 {
        let ctx = SliceContext::new(&spec, shard, 1, 0, &counters);
        let mut w = MemorySimple::create(store.clone(), &job, shard, 1).unwrap();
        w.write(&ctx, if shard == 0 { b"zero|".as_slice() } else { b"one|".as_slice() }).unwrap();
        w.end_slice(&ctx).unwrap();
        let mut state = job.shards[shard as usize].clone();
        w.finalize(&ctx, &mut state).unwrap();
        shards.push(state);
    }
    job.shards = shards;

    MemorySimple::finalize_job(&store, &mut job).unwrap();
    // Sealing twice is harmless
    MemorySimple::finalize_job(&store, &mut job).unwrap();

    assert!(MemorySimple::get_filenames(&job).unwrap().is_empty());
    job.result_status = Some(ResultStatus::Success);
    let files = MemorySimple::get_filenames(&job).unwrap();
    assert_eq!(files, vec!["/out/shared-9-output"]);

    let meta = store.stat(&files[0]).unwrap();
    assert!(meta.sealed);
    assert_eq!(store.read(&files[0]).unwrap(), b"zero|one|");
    assert_eq!(counters.get(IO_WRITE_BYTES), 9);
}

#[test]
fn test_options_from_toml() {
    let options = WriterSpec::options_from_toml(
        r#"
        bucket_name = "out"
        naming_format = "$name/$num"
        buffered = true
        "#,
    )
    .unwrap();
    let job = JobState::new(JobSpec {
        name: "toml".into(),
        job_id: "1".into(),
        shard_count: 1,
        writer: options,
    });

    let spec = MemorySimple::validate(&job.spec.writer).unwrap();
    assert!(spec.buffered);
    assert_eq!(spec.output_name("toml", "1", 3).unwrap(), "/out/toml/3");
}

#[test]
fn test_config_errors_are_not_retryable() {
    let job = job("bad", 1, json!({"bucket_name": "out", "mystery": 1}));
    let err = ConsistentObjectWriter::<InMemoryObjectStore>::create(InMemoryObjectStore::new(), &job, 0, 1).err().unwrap();
    assert!(matches!(err, OutputError::Config(_)));
    assert!(!err.is_retryable());
}
