//! Error types for the coordinator

use thiserror::Error;
use tokio::task::JoinError;

/// Main error type for coordinator operations
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Transient stream source error: {0}")]
    TransientSource(String),

    /// A source failure that retrying will not fix
    #[error("Stream source error: {0}")]
    Source(String),

    #[error("Lease conflict on shard {shard_id}")]
    LeaseConflict { shard_id: String },

    #[error("Processing failed for shard {shard_id}: {message}")]
    ProcessingFailed { shard_id: String, message: String },

    #[error("Durable store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Maximum retry attempts reached: {0}")]
    MaxRetriesExceeded(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Shutdown requested")]
    Shutdown,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CoordinatorError {
    /// Whether the error is an expected outcome of optimistic concurrency
    pub fn is_conflict(&self) -> bool {
        matches!(self, CoordinatorError::LeaseConflict { .. })
    }
}

/// Result type for coordinator operations
pub type Result<T> = std::result::Result<T, CoordinatorError>;

/// Error returned by lease table and checkpoint store operations
#[derive(Debug, Error)]
pub enum StoreError {
    /// The conditional write lost against a concurrent writer
    #[error("Conditional write failed for shard {shard_id}")]
    Conflict { shard_id: String },

    #[error("Store unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),
}

impl StoreError {
    pub fn conflict(shard_id: impl Into<String>) -> Self {
        StoreError::Conflict {
            shard_id: shard_id.into(),
        }
    }

    pub fn unavailable(err: impl Into<anyhow::Error>) -> Self {
        StoreError::Unavailable(err.into())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

impl From<StoreError> for CoordinatorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { shard_id } => CoordinatorError::LeaseConflict { shard_id },
            StoreError::Unavailable(e) => CoordinatorError::StoreUnavailable(e.to_string()),
        }
    }
}

/// Error returned by a stream source
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Iterator expired for shard {0}")]
    ExpiredIterator(String),

    #[error("Read throughput exceeded")]
    Throttled,

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Transient source failure: {0}")]
    Transient(#[source] anyhow::Error),
}

impl SourceError {
    /// Whether the call may succeed if retried after a delay
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SourceError::ExpiredIterator(_) | SourceError::Throttled | SourceError::Transient(_)
        )
    }
}

impl From<SourceError> for CoordinatorError {
    fn from(err: SourceError) -> Self {
        if err.is_retryable() {
            CoordinatorError::TransientSource(err.to_string())
        } else {
            CoordinatorError::Source(err.to_string())
        }
    }
}

impl From<JoinError> for CoordinatorError {
    fn from(err: JoinError) -> Self {
        CoordinatorError::Other(err.into())
    }
}

/// Failure reported by a user record processor
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("Soft failure (retriable): {0}")]
    SoftFailure(#[source] anyhow::Error),

    #[error("Hard failure (non-retriable): {0}")]
    HardFailure(#[source] anyhow::Error),
}

impl ProcessingError {
    pub fn soft(err: impl Into<anyhow::Error>) -> Self {
        ProcessingError::SoftFailure(err.into())
    }

    pub fn hard(err: impl Into<anyhow::Error>) -> Self {
        ProcessingError::HardFailure(err.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ProcessingError::SoftFailure(_))
    }
}
