//! Wall clock used to stamp local mutations.
//!
//! `updatedAt` is the only ordering field for last-write-wins, so every
//! timestamp the engine writes comes from a [`Clock`]. Tests inject a
//! [`ManualClock`] to make orderings deterministic.

use crate::Timestamp;
use chrono::{Duration, Utc};
use parking_lot::Mutex;

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now()
    }
}

/// A clock that only moves when told to.
///
/// Every call to [`Clock::now`] returns the current value and then advances it
/// by one millisecond, so two consecutive mutations never share a timestamp.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Timestamp>,
}

impl ManualClock {
    /// Create a clock starting at `start`.
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Create a clock starting at the given unix time in milliseconds.
    pub fn at_millis(millis: i64) -> Self {
        let start = chrono::DateTime::from_timestamp_millis(millis).unwrap_or_default();
        Self::new(start)
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    /// Peek at the current value without advancing.
    pub fn peek(&self) -> Timestamp {
        *self.now.lock()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        let mut now = self.now.lock();
        let current = *now;
        *now += Duration::milliseconds(1);
        current
    }
}
