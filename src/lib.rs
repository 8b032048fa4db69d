pub mod io;
pub mod buggify;
pub mod output;

pub use output::{
    ConsistentObjectWriter, InMemoryObjectStore, JobSpec, JobState, KeyValueWriter,
    LocalFsObjectStore, ObjectStore, OutputError, OutputWriter, RecordConsistentWriter,
    RecordSimpleWriter, SimpleObjectWriter, SliceContext, WriterState,
};
