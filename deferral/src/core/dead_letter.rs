use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::core::item::ItemId;
use crate::core::DateTime;

/// Why an item ended up in the dead-letter sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// The handler kept failing until the item ran out of attempts.
    Exhausted,
    /// The handler reported a failure that will never succeed.
    Fatal,
    /// The stored record was missing or could not be decoded.
    Corrupt,
}

/// Terminal record of an item that will not be delivered again.
///
/// Provides enough context to inspect or replay the item by hand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub item_id: ItemId,

    /// Queue the item was taken from.
    pub queue: String,

    /// The original payload (or the raw record bytes for corrupt items).
    pub payload: Bytes,

    /// Failed deliveries, including the last one.
    pub attempts: u32,

    /// The error message from the last failure.
    pub last_error: String,

    pub reason: DeadLetterReason,

    /// When the item was dead-lettered.
    pub dead_at: DateTime,

    /// Additional metadata (e.g. the consumer that gave up on the item).
    pub metadata: HashMap<String, serde_json::Value>,
}

impl DeadLetter {
    /// Add metadata to the dead letter.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use deferral::core::dead_letter::{DeadLetter, DeadLetterReason};
    /// use deferral::core::item::ItemId;
    /// use deferral::core::{Bytes, Utc};
    /// use serde_json::json;
    ///
    /// let letter = DeadLetter {
    ///     item_id: ItemId::generate(),
    ///     queue: "emails".to_string(),
    ///     payload: Bytes::from_static(b"hello"),
    ///     attempts: 3,
    ///     last_error: "smtp timeout".to_string(),
    ///     reason: DeadLetterReason::Exhausted,
    ///     dead_at: Utc::now(),
    ///     metadata: Default::default(),
    /// }
    /// .with_metadata("owner".to_string(), json!("worker-1"));
    /// assert_eq!(letter.metadata.len(), 1);
    /// ```
    pub fn with_metadata(mut self, key: String, value: serde_json::Value) -> Self {
        self.metadata.insert(key, value);
        self
    }
}

/// Terminal sink for items that exhausted their attempts or failed fatally.
///
/// Recording is fire-and-forget from the queue's point of view: a failing sink is logged and the
/// item is still removed from the active set.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn record(&self, letter: DeadLetter) -> Result<(), DeadLetterError>;
}

/// Errors raised by a [`DeadLetterSink`].
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DeadLetterError {
    #[error("Failed to encode dead letter: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Dead-letter sink error: {0:#}")]
    Sink(#[from] anyhow::Error),
}

/// Sink that only writes dead letters to the log. The default when no sink is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingDeadLetterSink;

#[async_trait]
impl DeadLetterSink for LoggingDeadLetterSink {
    async fn record(&self, letter: DeadLetter) -> Result<(), DeadLetterError> {
        tracing::error!(
            item_id = %letter.item_id,
            queue = %letter.queue,
            attempts = letter.attempts,
            reason = ?letter.reason,
            payload_size = letter.payload.len(),
            last_error = %letter.last_error,
            "Item dead-lettered"
        );
        Ok(())
    }
}
