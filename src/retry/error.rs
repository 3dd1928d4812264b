use crate::CoordinatorError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RetryError {
    #[error("Maximum retries ({0}) exceeded: {1}")]
    MaxRetriesExceeded(u32, String),

    #[error("Retry interrupted by shutdown signal")]
    Interrupted,
}

impl From<RetryError> for CoordinatorError {
    fn from(err: RetryError) -> Self {
        match err {
            RetryError::MaxRetriesExceeded(attempts, msg) => CoordinatorError::MaxRetriesExceeded(
                format!("After {} attempts: {}", attempts, msg),
            ),
            RetryError::Interrupted => CoordinatorError::Shutdown,
        }
    }
}
