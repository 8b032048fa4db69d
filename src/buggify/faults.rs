//! Fault identifiers.

/// Object store faults injected by `SimulatedObjectStore`
pub mod object_store {
    pub const OPEN_FAIL: &str = "object_store.open_fail";
    pub const WRITE_FAIL: &str = "object_store.write_fail";
    pub const FLUSH_FAIL: &str = "object_store.flush_fail";
    /// Flush persists a prefix of the pending bytes, then errors
    pub const PARTIAL_FLUSH: &str = "object_store.partial_flush";
    pub const CLOSE_FAIL: &str = "object_store.close_fail";
    pub const READ_FAIL: &str = "object_store.read_fail";
    pub const COPY_FAIL: &str = "object_store.copy_fail";
    pub const DELETE_FAIL: &str = "object_store.delete_fail";
    /// List returns a truncated result without reporting an error
    pub const LIST_INCOMPLETE: &str = "object_store.list_incomplete";
}

pub const ALL_FAULTS: &[&str] = &[
    object_store::OPEN_FAIL,
    object_store::WRITE_FAIL,
    object_store::FLUSH_FAIL,
    object_store::PARTIAL_FLUSH,
    object_store::CLOSE_FAIL,
    object_store::READ_FAIL,
    object_store::COPY_FAIL,
    object_store::DELETE_FAIL,
    object_store::LIST_INCOMPLETE,
];
