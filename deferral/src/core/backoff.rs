//! Retry delays for items whose handler reported a retryable failure.

use std::time::Duration;

use rand::Rng;

use crate::core::queue::ConfigError;

/// Computes how long to wait before redelivering an item that has failed `attempts` times.
///
/// Any `Fn(u32) -> Duration` closure is a backoff too:
///
/// ```rust
/// use deferral::core::backoff::Backoff;
/// use std::time::Duration;
///
/// let linear = |attempts: u32| Duration::from_secs(u64::from(attempts) * 10);
/// assert_eq!(linear.delay(3), Duration::from_secs(30));
/// ```
pub trait Backoff: Send + Sync {
    /// `attempts` is the failure count including the one that just happened, so it starts at 1.
    fn delay(&self, attempts: u32) -> Duration;
}

impl<F> Backoff for F
where
    F: Fn(u32) -> Duration + Send + Sync,
{
    fn delay(&self, attempts: u32) -> Duration {
        self(attempts)
    }
}

/// `base * 2^(attempts - 1)`, capped at `max`, then spread by `±jitter`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    jitter: f64,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: 0.0,
        }
    }

    /// Randomize each delay within `delay * (1 ± jitter)`; `jitter` must be in `0.0..=1.0`.
    pub fn with_jitter(mut self, jitter: f64) -> Result<Self, ConfigError> {
        if !(0.0..=1.0).contains(&jitter) {
            return Err(ConfigError::InvalidJitter(jitter.to_string()));
        }
        self.jitter = jitter;
        Ok(self)
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    fn undithered(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(300),
            jitter: 0.2,
        }
    }
}

impl Backoff for ExponentialBackoff {
    fn delay(&self, attempts: u32) -> Duration {
        let delay = self.undithered(attempts);
        if self.jitter == 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        delay.mul_f64(factor).min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_doubles() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(60));
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
        assert_eq!(backoff.delay(4), Duration::from_millis(800));
    }

    #[test]
    fn test_exponential_backoff_caps_at_max() {
        let backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(10));
        assert_eq!(backoff.delay(5), Duration::from_secs(10));
        assert_eq!(backoff.delay(64), Duration::from_secs(10));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_exponential_backoff_zeroth_attempt_is_base() {
        let backoff = ExponentialBackoff::new(Duration::from_secs(2), Duration::from_secs(10));
        assert_eq!(backoff.delay(0), Duration::from_secs(2));
    }

    #[test]
    fn test_exponential_backoff_jitter_stays_in_bounds() {
        let backoff = ExponentialBackoff::new(Duration::from_secs(10), Duration::from_secs(600))
            .with_jitter(0.5)
            .unwrap();
        for _ in 0..1_000 {
            let delay = backoff.delay(1);
            assert!(delay >= Duration::from_secs(5), "{:?}", delay);
            assert!(delay <= Duration::from_secs(15), "{:?}", delay);
        }
    }

    #[test]
    fn test_exponential_backoff_jitter_never_exceeds_max() {
        let backoff = ExponentialBackoff::new(Duration::from_secs(10), Duration::from_secs(10))
            .with_jitter(1.0)
            .unwrap();
        for _ in 0..1_000 {
            assert!(backoff.delay(3) <= Duration::from_secs(10));
        }
    }

    #[test]
    fn test_exponential_backoff_rejects_bad_jitter() {
        let backoff = ExponentialBackoff::default();
        assert!(backoff.clone().with_jitter(-0.1).is_err());
        assert!(backoff.clone().with_jitter(1.5).is_err());
        assert!(backoff.with_jitter(f64::NAN).is_err());
    }

    #[test]
    fn test_default_backoff() {
        let backoff = ExponentialBackoff::default();
        assert_eq!(backoff.base(), Duration::from_secs(1));
        assert_eq!(backoff.max(), Duration::from_secs(300));
        assert_eq!(backoff.jitter(), 0.2);
    }

    #[test]
    fn test_closure_backoff() {
        let fixed = |_attempts: u32| Duration::from_millis(5);
        let boxed: Box<dyn Backoff> = Box::new(fixed);
        assert_eq!(boxed.delay(1), Duration::from_millis(5));
        assert_eq!(boxed.delay(9), Duration::from_millis(5));
    }
}
