use rand::Rng;
use std::time::Duration;
use tracing::trace;

/// Computes how long to wait before the next attempt
pub trait Backoff: Send + Sync {
    /// Delay before retrying after the given zero-based failed attempt
    fn next_delay(&self, attempt: u32) -> Duration;
}

const MULTIPLIER: f64 = 2.0;

/// Doubling backoff with symmetric jitter, capped at `max_delay`
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    jitter_factor: f64,
}

impl ExponentialBackoff {
    pub fn builder() -> ExponentialBackoffBuilder {
        ExponentialBackoffBuilder::default()
    }

    /// The un-jittered delay for an attempt
    pub fn base_delay(&self, attempt: u32) -> Duration {
        // Past 2^32 every realistic curve is already pinned at max_delay
        let exponent = attempt.min(32) as i32;
        let millis = self.initial_delay.as_millis() as f64 * MULTIPLIER.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

impl Backoff for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).as_millis() as f64;
        let spread = base * self.jitter_factor;
        let jitter = if spread > 0.0 {
            rand::thread_rng().gen_range(-spread..=spread)
        } else {
            0.0
        };
        let delay = (base + jitter).clamp(0.0, self.max_delay.as_millis() as f64);

        trace!(
            attempt = attempt,
            base_delay_ms = base,
            jitter_ms = jitter,
            delay_ms = delay,
            "Calculated backoff delay"
        );

        Duration::from_millis(delay as u64)
    }
}

#[derive(Debug)]
pub struct ExponentialBackoffBuilder {
    initial_delay: Duration,
    max_delay: Duration,
    jitter_factor: f64,
}

impl Default for ExponentialBackoffBuilder {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.1,
        }
    }
}

impl ExponentialBackoffBuilder {
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    pub fn build(self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_delay: self.initial_delay,
            max_delay: self.max_delay.max(self.initial_delay),
            jitter_factor: self.jitter_factor,
        }
    }
}
