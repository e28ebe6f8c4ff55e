//! Conversion between wall-clock time and sorted-set scores.
//!
//! A score is the number of milliseconds since the Unix epoch at which an item becomes due.
//! Everything that reads "now" goes through a [`Clock`] so tests can drive time explicitly.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{TimeZone, Utc};

use crate::core::queue::ConfigError;
use crate::core::{DateTime, Duration};

/// Sorted-set score: milliseconds since the Unix epoch.
pub type Score = i64;

/// Lowest possible score. Used as the open lower bound of due-item scans.
pub const MIN_SCORE: Score = i64::MIN;

/// Source of the current time.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime;

    fn now_score(&self) -> Score {
        to_score(self.now())
    }
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime {
        Utc::now()
    }
}

/// A clock that only moves when told to. Clones share the same time.
///
/// # Example
///
/// ```rust
/// use deferral::core::score_clock::{Clock, ManualClock};
/// use deferral::core::Duration;
///
/// let clock = ManualClock::at_millis(1_000);
/// clock.advance(Duration::seconds(2));
/// assert_eq!(clock.now_score(), 3_000);
/// ```
#[derive(Debug, Clone)]
pub struct ManualClock {
    millis: Arc<AtomicI64>,
}

impl ManualClock {
    /// Start at the current wall-clock time.
    pub fn new() -> Self {
        Self::at_millis(Utc::now().timestamp_millis())
    }

    pub fn at_millis(millis: i64) -> Self {
        Self {
            millis: Arc::new(AtomicI64::new(millis)),
        }
    }

    pub fn set_millis(&self, millis: i64) {
        self.millis.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.millis
            .fetch_add(by.num_milliseconds(), Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime {
        let millis = self.millis.load(Ordering::SeqCst);
        Utc.timestamp_millis_opt(millis)
            .single()
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC)
    }

    fn now_score(&self) -> Score {
        self.millis.load(Ordering::SeqCst)
    }
}

pub fn to_score(at: DateTime) -> Score {
    at.timestamp_millis()
}

/// Compute the score at which an item delayed by `delay` from `now` becomes due.
///
/// Negative delays are rejected, not clamped to zero.
pub fn ready_at(now: Score, delay: Duration) -> Result<Score, ConfigError> {
    if delay < Duration::zero() {
        return Err(ConfigError::NegativeDelay(delay));
    }
    now.checked_add(delay.num_milliseconds())
        .ok_or(ConfigError::DelayOverflow(delay))
}

/// Like [`ready_at`] but for non-negative std durations (visibility timeouts, backoff).
pub(crate) fn after(now: Score, delay: std::time::Duration) -> Score {
    let millis = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
    now.saturating_add(millis)
}
