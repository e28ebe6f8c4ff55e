use std::fmt;

use thiserror::Error;

use crate::core::item::ItemId;
use crate::core::store::StoreError;
use crate::core::Duration;

/// Suffixes of the keys a backend derives from a queue name. A queue named with one of them would
/// share a key with another queue's records or dead letters.
pub const RESERVED_SUFFIXES: &[&str] = &[":records", ":dead"];

/// Name of a logical queue. Used verbatim as the sorted-set key, so several queues can share one
/// store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueName(String);

impl QueueName {
    /// Validate and wrap a queue name. Empty and whitespace-only names are rejected, and so are
    /// names ending in one of [`RESERVED_SUFFIXES`].
    pub fn new(name: impl Into<String>) -> Result<Self, ConfigError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ConfigError::EmptyQueueName);
        }
        if RESERVED_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)) {
            return Err(ConfigError::ReservedQueueName(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for QueueName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for QueueName {
    type Error = ConfigError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

/// Errors related to queue operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum QueueError {
    /// The store failed or timed out. Transient; the operation may be retried.
    #[error(transparent)]
    StoreUnavailable(#[from] StoreError),

    /// Another consumer claimed or resolved the item first. Benign, callers skip it.
    #[error("Claim on item {item_id} was lost to another consumer")]
    ClaimLost { item_id: ItemId },

    /// Invalid argument or option, rejected before touching the store.
    #[error("Invalid configuration: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Queue '{queue}' is already running")]
    AlreadyRunning { queue: QueueName },

    #[error("Queue '{queue}' is not running")]
    NotRunning { queue: QueueName },

    /// Failed to serialize a typed payload.
    #[error("Failed to serialize payload of type '{payload_type}': {error}")]
    SerializeError {
        payload_type: String,
        #[source]
        error: serde_json::Error,
    },

    /// The stored record of an item could not be decoded.
    #[error("Record of item {item_id} is corrupt: {error}")]
    CorruptRecord {
        item_id: ItemId,
        #[source]
        error: serde_json::Error,
    },
}

impl QueueError {
    pub fn claim_lost(item_id: ItemId) -> Self {
        Self::ClaimLost { item_id }
    }

    pub fn serialize_error(payload_type: impl Into<String>, error: serde_json::Error) -> Self {
        Self::SerializeError {
            payload_type: payload_type.into(),
            error,
        }
    }

    /// `true` for the benign claim race.
    pub fn is_claim_lost(&self) -> bool {
        matches!(self, Self::ClaimLost { .. })
    }

    /// `true` when retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}

/// Invalid delays, names and options. Always raised at call time.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("Delay must not be negative (got {0})")]
    NegativeDelay(Duration),

    #[error("Delay of {0} overflows the score range")]
    DelayOverflow(Duration),

    #[error("Queue name must not be empty")]
    EmptyQueueName,

    #[error("Queue name '{0}' ends with a reserved suffix")]
    ReservedQueueName(String),

    #[error("Option '{0}' must be greater than zero")]
    Zero(&'static str),

    #[error("Jitter must be within 0.0..=1.0 (got {0})")]
    InvalidJitter(String),
}
