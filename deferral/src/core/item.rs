use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::queue::QueueError;
use crate::core::score_clock::Score;
use crate::core::DateTime;

/// Identifier of a queued item; also its sorted-set member.
///
/// Generated ids are UUIDv7 strings: a millisecond timestamp followed by a monotonic counter and
/// random bits. Two calls never return the same id, so an enqueue can never overwrite the score or
/// payload of an existing member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ItemId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ItemId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Everything about an item except its score. Stored next to the sorted set, keyed by item id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub id: ItemId,
    pub payload: Bytes,
    /// Failed deliveries so far.
    pub attempts: u32,
    /// Per-item override of the queue's `max_attempts`.
    pub max_attempts: Option<u32>,
    /// Score the item was last scheduled at.
    pub ready_at: Score,
    pub enqueued_at: DateTime,
    pub last_error: Option<String>,
}

impl ItemRecord {
    pub fn new(id: ItemId, payload: Bytes, ready_at: Score, enqueued_at: DateTime) -> Self {
        Self {
            id,
            payload,
            attempts: 0,
            max_attempts: None,
            ready_at,
            enqueued_at,
            last_error: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn encode(&self) -> Result<Bytes, QueueError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| QueueError::serialize_error("ItemRecord", e))
    }

    pub fn decode(item_id: &ItemId, raw: &[u8]) -> Result<Self, QueueError> {
        serde_json::from_slice(raw).map_err(|error| QueueError::CorruptRecord {
            item_id: item_id.clone(),
            error,
        })
    }

    /// Attempts allowed for this item, given the queue-wide default.
    pub fn effective_max_attempts(&self, queue_default: u32) -> u32 {
        self.max_attempts.unwrap_or(queue_default).max(1)
    }
}

/// Proof that a consumer holds an item for the length of a visibility window.
///
/// Never persisted. The store only sees `in_flight_score`, which doubles as the ownership check:
/// resolution only succeeds while the member still carries exactly that score.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimToken {
    pub item_id: ItemId,
    pub claimed_at: DateTime,
    /// Consumer that issued the claim.
    pub owner: String,
    /// Score the claim moved the member to; the item turns visible again once it is due.
    pub in_flight_score: Score,
}

/// A claimed item, ready to be handed to a handler.
#[derive(Debug, Clone)]
pub struct Item {
    pub token: ClaimToken,
    pub record: ItemRecord,
}

impl Item {
    pub fn id(&self) -> &ItemId {
        &self.token.item_id
    }

    pub fn payload(&self) -> Bytes {
        self.record.payload.clone()
    }

    pub fn attempts(&self) -> u32 {
        self.record.attempts
    }
}
