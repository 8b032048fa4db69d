//! Output writer error taxonomy.

use super::object_store::StoreError;

/// Errors surfaced by output writers to the scheduler
#[derive(Debug)]
pub enum OutputError {
    /// Bad writer options; never retried
    Config(String),
    /// A single write or a per-target flush exceeded the hard limit
    SizeLimit { size: usize, limit: usize },
    /// Object store failure; the slice may be retried
    Storage(StoreError),
    /// Broken lifecycle contract; fails the job
    Invariant(String),
    /// Checkpoint could not be decoded or has the wrong version
    State(String),
    /// Value could not be framed into a record
    Encoding(String),
}

impl OutputError {
    /// Only storage failures are worth retrying at the slice level.
    pub fn is_retryable(&self) -> bool {
        matches!(self, OutputError::Storage(_))
    }
}

impl std::fmt::Display for OutputError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputError::Config(msg) => write!(f, "Invalid writer configuration: {}", msg),
            OutputError::SizeLimit { size, limit } => {
                write!(f, "Write of {} bytes exceeds limit of {} bytes", size, limit)
            }
            OutputError::Storage(e) => write!(f, "Storage error: {}", e),
            OutputError::Invariant(msg) => write!(f, "Invariant violation: {}", msg),
            OutputError::State(msg) => write!(f, "Invalid writer state: {}", msg),
            OutputError::Encoding(msg) => write!(f, "Encoding error: {}", msg),
        }
    }
}

impl std::error::Error for OutputError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            OutputError::Storage(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for OutputError {
    fn from(e: StoreError) -> Self {
        OutputError::Storage(e)
    }
}

impl From<serde_json::Error> for OutputError {
    fn from(e: serde_json::Error) -> Self {
        OutputError::State(e.to_string())
    }
}

impl From<bincode::Error> for OutputError {
    fn from(e: bincode::Error) -> Self {
        OutputError::Encoding(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OutputError>;
