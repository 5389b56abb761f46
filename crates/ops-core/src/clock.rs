//! Clock abstraction
//!
//! Components that reason about elapsed time (idle reaping, dedup windows,
//! deployment timestamps) take an `Arc<dyn Clock>` instead of calling
//! `Utc::now()` directly, so tests can advance time without sleeping.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::sync::Arc;

/// Source of the current wall-clock time
pub trait Clock: Send + Sync {
    /// Current instant
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    /// Create a clock frozen at the given instant
    #[must_use]
    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    /// Create a clock frozen at the current system time
    #[must_use]
    pub fn from_system() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Advance the clock by the given number of milliseconds
    pub fn advance_ms(&self, ms: i64) {
        *self.now.lock() += Duration::milliseconds(ms);
    }

    /// Advance the clock by the given number of minutes
    pub fn advance_minutes(&self, minutes: i64) {
        *self.now.lock() += Duration::minutes(minutes);
    }

    /// Pin the clock to a specific instant
    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}
