//! Retry and backoff helpers shared by the coordinator and the consumers

mod backoff;
mod error;

pub use backoff::{Backoff, ExponentialBackoff, ExponentialBackoffBuilder};
pub use error::RetryError;

use std::future::Future;
use std::time::Duration;
use tokio::select;
use tracing::{debug, trace, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (None for infinite)
    pub max_retries: Option<u32>,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: Some(3),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::builder()
            .initial_delay(self.initial_backoff)
            .max_delay(self.max_backoff)
            .jitter_factor(self.jitter_factor)
            .build()
    }

    pub fn handle(&self) -> RetryHandle<ExponentialBackoff> {
        RetryHandle::new(self.clone(), self.backoff())
    }
}

/// Helper for retrying operations with backoff
pub struct RetryHandle<B: Backoff> {
    config: RetryConfig,
    backoff: B,
    attempts: u32,
}

impl<B: Backoff> RetryHandle<B> {
    pub fn new(config: RetryConfig, backoff: B) -> Self {
        Self {
            config,
            backoff,
            attempts: 0,
        }
    }

    /// Retry an operation with backoff until it succeeds, the attempt budget
    /// runs out, or `cancel` resolves.
    pub async fn retry<F, Fut, T, E, C>(
        &mut self,
        mut operation: F,
        cancel: C,
    ) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        C: Future<Output = ()>,
    {
        tokio::pin!(cancel);

        loop {
            self.attempts += 1;
            trace!(attempt = self.attempts, "Executing operation");

            select! {
                result = operation() => {
                    match result {
                        Ok(value) => {
                            debug!(attempts = self.attempts, "Operation succeeded");
                            return Ok(value);
                        }
                        Err(e) => {
                            if let Some(max) = self.config.max_retries {
                                if self.attempts >= max {
                                    warn!(
                                        attempts = self.attempts,
                                        error = %e,
                                        "Maximum retry attempts exceeded"
                                    );
                                    return Err(RetryError::MaxRetriesExceeded(self.attempts, e.to_string()));
                                }
                            }

                            let delay = self.backoff.next_delay(self.attempts - 1);
                            warn!(
                                attempt = self.attempts,
                                delay_ms = ?delay.as_millis(),
                                error = %e,
                                "Operation failed, retrying after delay"
                            );

                            select! {
                                _ = tokio::time::sleep(delay) => continue,
                                _ = &mut cancel => {
                                    debug!("Retry interrupted by shutdown signal");
                                    return Err(RetryError::Interrupted);
                                }
                            }
                        }
                    }
                }
                _ = &mut cancel => {
                    debug!("Operation interrupted by shutdown signal");
                    return Err(RetryError::Interrupted);
                }
            }
        }
    }

    /// Retry an operation that must not be abandoned half way
    pub async fn retry_to_completion<F, Fut, T, E>(&mut self, operation: F) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.retry(operation, std::future::pending::<()>()).await
    }

    /// Get the current attempt count
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Resolves once the watch channel carries `true`.
///
/// A dropped sender never resolves, so a detached receiver cannot be
/// mistaken for a shutdown request.
pub async fn shutdown_signalled(shutdown: &mut tokio::sync::watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}
