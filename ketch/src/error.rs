use ketch_types::{ObjectId, ParseError};
use thiserror::Error;

/// Errors surfaced by the replication core.
///
/// Conflicts detected while queueing a proposal are NOT errors: the proposal
/// is aborted and the queue call returns `Ok`. Only failures the caller must
/// react to (bad configuration, a shut-down leader, storage trouble) come
/// back through this type.
#[derive(Debug, Error)]
pub enum KetchError {
    /// The monotonic clock could not prove the proposed timestamp has passed
    /// within the configured bound.
    #[error("time is not certain enough to proceed")]
    TimeUncertain,

    #[error("leader is shut down")]
    Shutdown,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("object store: {0}")]
    Store(#[from] StoreError),

    #[error("object format: {0}")]
    Format(#[from] ParseError),
}

/// Errors from the local object store and reference database.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object {} not found", .0.short())]
    NotFound(ObjectId),

    #[error("corrupt object: {0}")]
    Corrupt(String),
}

impl From<ParseError> for StoreError {
    fn from(err: ParseError) -> Self {
        StoreError::Corrupt(err.to_string())
    }
}
