//! Wall-clock source for lease expiry

use chrono::{DateTime, Utc};
use std::fmt::Debug;

/// Lease expiry is stored as an absolute UTC timestamp shared by every
/// worker, so it is judged against wall-clock time rather than a monotonic
/// clock.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to
#[cfg(any(test, feature = "test-utils"))]
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: std::sync::Arc<parking_lot::Mutex<DateTime<Utc>>>,
}

#[cfg(any(test, feature = "test-utils"))]
impl ManualClock {
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self {
            now: std::sync::Arc::new(parking_lot::Mutex::new(now)),
        }
    }

    pub fn advance(&self, by: std::time::Duration) {
        let step = chrono::Duration::from_std(by).expect("clock step out of range");
        let mut now = self.now.lock();
        *now = *now + step;
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}
