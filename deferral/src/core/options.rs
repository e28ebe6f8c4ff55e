use serde::Deserialize;
use std::time::Duration;

use crate::core::queue::ConfigError;

/// Options of a running delay queue.
///
/// Every knob has a default. Durations deserialize from human-readable strings
/// (`"500ms"`, `"30s"`) so the struct can be embedded in an application's config file.
///
/// # Examples
///
/// ```rust
/// use deferral::core::options::QueueOptions;
/// use std::time::Duration;
///
/// let options = QueueOptions::default()
///     .with_poll_interval(Duration::from_millis(250))
///     .with_max_attempts(10);
/// assert!(options.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
#[non_exhaustive]
pub struct QueueOptions {
    /// Time between two scans of the queue (default: 500ms).
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Maximum due items fetched per scan (default: 100).
    pub page_size: usize,

    /// How long a claimed item stays hidden before it is redelivered (default: 30 seconds).
    #[serde(with = "humantime_serde")]
    pub visibility_timeout: Duration,

    /// Deliveries an item gets before it is dead-lettered (default: 5).
    pub max_attempts: u32,

    /// Handlers allowed to run at once (default: 8).
    pub worker_pool_size: usize,

    /// Upper bound of a single store round trip (default: 5 seconds).
    #[serde(with = "humantime_serde")]
    pub store_timeout: Duration,

    /// How long a cancelled handler may keep running before it is abandoned (default: 5 seconds).
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            page_size: 100,
            visibility_timeout: Duration::from_secs(30),
            max_attempts: 5,
            worker_pool_size: 8,
            store_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl QueueOptions {
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_visibility_timeout(mut self, visibility_timeout: Duration) -> Self {
        self.visibility_timeout = visibility_timeout;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_worker_pool_size(mut self, worker_pool_size: usize) -> Self {
        self.worker_pool_size = worker_pool_size;
        self
    }

    pub fn with_store_timeout(mut self, store_timeout: Duration) -> Self {
        self.store_timeout = store_timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self
    }

    /// Reject zero intervals, sizes and timeouts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Zero("poll_interval"));
        }
        if self.page_size == 0 {
            return Err(ConfigError::Zero("page_size"));
        }
        if self.visibility_timeout.is_zero() {
            return Err(ConfigError::Zero("visibility_timeout"));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Zero("max_attempts"));
        }
        if self.worker_pool_size == 0 {
            return Err(ConfigError::Zero("worker_pool_size"));
        }
        if self.store_timeout.is_zero() {
            return Err(ConfigError::Zero("store_timeout"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opts = QueueOptions::default();
        assert_eq!(opts.poll_interval, Duration::from_millis(500));
        assert_eq!(opts.page_size, 100);
        assert_eq!(opts.visibility_timeout, Duration::from_secs(30));
        assert_eq!(opts.max_attempts, 5);
        assert_eq!(opts.worker_pool_size, 8);
        assert_eq!(opts.store_timeout, Duration::from_secs(5));
        assert_eq!(opts.shutdown_timeout, Duration::from_secs(5));
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let cases = [
            (
                QueueOptions::default().with_poll_interval(Duration::ZERO),
                "poll_interval",
            ),
            (QueueOptions::default().with_page_size(0), "page_size"),
            (
                QueueOptions::default().with_visibility_timeout(Duration::ZERO),
                "visibility_timeout",
            ),
            (QueueOptions::default().with_max_attempts(0), "max_attempts"),
            (
                QueueOptions::default().with_worker_pool_size(0),
                "worker_pool_size",
            ),
            (
                QueueOptions::default().with_store_timeout(Duration::ZERO),
                "store_timeout",
            ),
        ];

        for (opts, field) in cases {
            assert_eq!(opts.validate(), Err(ConfigError::Zero(field)));
        }
    }

    #[test]
    fn test_zero_shutdown_timeout_is_allowed() {
        let opts = QueueOptions::default().with_shutdown_timeout(Duration::ZERO);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_deserialize_human_readable_durations() {
        let opts: QueueOptions = serde_json::from_value(serde_json::json!({
            "poll_interval": "250ms",
            "visibility_timeout": "1m",
            "max_attempts": 3
        }))
        .unwrap();

        assert_eq!(opts.poll_interval, Duration::from_millis(250));
        assert_eq!(opts.visibility_timeout, Duration::from_secs(60));
        assert_eq!(opts.max_attempts, 3);
        // Missing fields keep their defaults.
        assert_eq!(opts.page_size, 100);
        assert_eq!(opts.worker_pool_size, 8);
    }

    #[test]
    fn test_deserialize_rejects_unknown_fields() {
        let result = serde_json::from_value::<QueueOptions>(serde_json::json!({
            "poll_intervall": "1s"
        }));
        assert!(result.is_err());
    }
}
