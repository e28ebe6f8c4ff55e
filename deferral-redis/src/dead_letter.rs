use anyhow::Context;
use async_trait::async_trait;
use deferral::core::dead_letter::{DeadLetter, DeadLetterError, DeadLetterSink};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::instrument;

use crate::keys;

/// Pushes dead letters as JSON onto the list `<queue>:dead`, newest first.
///
/// Inspect with `LRANGE <queue>:dead 0 -1`; replaying means enqueueing the payload again.
#[derive(Clone)]
pub struct RedisDeadLetterSink {
    manager: ConnectionManager,
    max_len: Option<usize>,
}

impl RedisDeadLetterSink {
    pub fn new(manager: ConnectionManager) -> Self {
        Self {
            manager,
            max_len: None,
        }
    }

    /// Keep only the newest `max_len` letters per queue.
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = Some(max_len);
        self
    }

    /// Dead letters of `queue`, newest first.
    pub async fn list(&self, queue: &str) -> Result<Vec<DeadLetter>, DeadLetterError> {
        let mut conn = self.manager.clone();
        let raw: Vec<Vec<u8>> = conn
            .lrange(keys::dead_letters(queue), 0, -1)
            .await
            .context("Failed to read dead letters")?;
        raw.iter()
            .map(|letter| serde_json::from_slice(letter).map_err(DeadLetterError::from))
            .collect()
    }
}

#[async_trait]
impl DeadLetterSink for RedisDeadLetterSink {
    #[instrument(skip_all, err, fields(queue = %letter.queue, item_id = %letter.item_id))]
    async fn record(&self, letter: DeadLetter) -> Result<(), DeadLetterError> {
        let encoded = serde_json::to_vec(&letter)?;
        let key = keys::dead_letters(&letter.queue);
        let mut conn = self.manager.clone();

        match self.max_len {
            Some(max_len) => {
                let last = isize::try_from(max_len).unwrap_or(isize::MAX).saturating_sub(1);
                let _: () = redis::pipe()
                    .atomic()
                    .lpush(&key, encoded)
                    .ignore()
                    .ltrim(&key, 0, last)
                    .ignore()
                    .query_async(&mut conn)
                    .await
                    .context("Failed to push dead letter")?;
            }
            None => {
                let _: () = conn
                    .lpush(&key, encoded)
                    .await
                    .context("Failed to push dead letter")?;
            }
        }

        tracing::warn!(
            attempts = letter.attempts,
            reason = ?letter.reason,
            "Item dead-lettered"
        );
        Ok(())
    }
}
