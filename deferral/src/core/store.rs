use async_trait::async_trait;
use bytes::Bytes;
use std::future::Future;
use thiserror::Error;

use crate::core::score_clock::Score;

/// A member of a sorted set together with its score.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScoredMember {
    pub member: String,
    pub score: Score,
}

impl ScoredMember {
    pub fn new(member: impl Into<String>, score: Score) -> Self {
        Self {
            member: member.into(),
            score,
        }
    }
}

/// The sorted-set-capable key-value store a delay queue runs on.
///
/// Every method touches a single key and must be atomic on its own. The queue never needs a
/// multi-key transaction: the claim protocol (conditional rescore plus visibility timeout) takes
/// its place.
///
/// Besides the sorted set, each queue key owns a table of item records keyed by member. Backends
/// decide where that table lives (Redis uses a hash next to the set).
///
/// ### Ordering
///
/// `range_by_score` returns members by ascending score, ties broken by ascending member.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert `member` with `score`, overwriting the score if the member already exists.
    async fn add(&self, key: &str, member: &str, score: Score) -> Result<(), StoreError>;

    /// Members with `min <= score <= max`, ascending, at most `limit` of them.
    async fn range_by_score(
        &self,
        key: &str,
        min: Score,
        max: Score,
        limit: usize,
    ) -> Result<Vec<ScoredMember>, StoreError>;

    /// Remove `member`. Returns `true` if it was present.
    async fn remove_if_present(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// Move `member` to `score` only if its current score is exactly `expected`.
    ///
    /// Returns `false` when the member is gone or its score changed, meaning somebody else got
    /// there first.
    async fn compare_and_rescore(
        &self,
        key: &str,
        member: &str,
        expected: Score,
        score: Score,
    ) -> Result<bool, StoreError>;

    /// Remove `member` only if its current score is exactly `expected`.
    async fn remove_if_score(
        &self,
        key: &str,
        member: &str,
        expected: Score,
    ) -> Result<bool, StoreError>;

    /// Number of members in the set.
    async fn count(&self, key: &str) -> Result<usize, StoreError>;

    /// Store the record for `member`, replacing any previous one.
    async fn put_record(&self, key: &str, member: &str, record: Bytes) -> Result<(), StoreError>;

    async fn get_record(&self, key: &str, member: &str) -> Result<Option<Bytes>, StoreError>;

    /// Delete the record for `member`. Returns `true` if it existed.
    async fn remove_record(&self, key: &str, member: &str) -> Result<bool, StoreError>;
}

/// Errors raised by a [`Store`] implementation.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StoreError {
    /// The backend could not be reached or rejected the command.
    #[error("Store unavailable: {0:#}")]
    Unavailable(#[from] anyhow::Error),

    /// The round trip did not finish in time.
    #[error("Store operation timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Bound a store round trip by `timeout`.
pub async fn bounded<T, F>(timeout: std::time::Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(timeout)),
    }
}
