use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use deferral::core::score_clock::Score;
use deferral::core::store::{ScoredMember, Store, StoreError};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::time::Duration;
use tracing::instrument;

use crate::keys;

/// `ZADD XX` to ARGV[3] only while the member's score equals ARGV[2].
///
/// KEYS: 1. sorted set
/// ARGV: 1. member, 2. expected score, 3. new score
const RESCORE_SCRIPT: &str = r#"
local current = redis.call('ZSCORE', KEYS[1], ARGV[1])
if not current or tonumber(current) ~= tonumber(ARGV[2]) then
    return 0
end
redis.call('ZADD', KEYS[1], 'XX', ARGV[3], ARGV[1])
return 1
"#;

/// `ZREM` only while the member's score equals ARGV[2].
///
/// KEYS: 1. sorted set
/// ARGV: 1. member, 2. expected score
const REMOVE_IF_SCORE_SCRIPT: &str = r#"
local current = redis.call('ZSCORE', KEYS[1], ARGV[1])
if not current or tonumber(current) ~= tonumber(ARGV[2]) then
    return 0
end
return redis.call('ZREM', KEYS[1], ARGV[1])
"#;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// A [`Store`] backed by Redis sorted sets.
///
/// Each call runs a single command or Lua script against one queue's keys, so every operation is
/// atomic on the server. Scores are sent as integers; Redis keeps them as doubles, which is exact
/// for millisecond timestamps.
#[derive(Clone)]
pub struct RedisStore {
    pub(crate) manager: ConnectionManager,
    rescore: Script,
    remove_if_score: Script,
}

impl RedisStore {
    pub fn with_manager(manager: ConnectionManager) -> Self {
        Self {
            manager,
            rescore: Script::new(RESCORE_SCRIPT),
            remove_if_score: Script::new(REMOVE_IF_SCORE_SCRIPT),
        }
    }

    /// Connect to `url` (e.g. `redis://127.0.0.1:6379/0`) and make sure the server answers.
    #[instrument(skip_all, err)]
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).context("Invalid redis url")?;
        let manager = tokio::time::timeout(CONNECT_TIMEOUT, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Timeout(CONNECT_TIMEOUT))?
            .context("Failed to connect to redis")?;

        let store = Self::with_manager(manager);
        store.ping().await?;
        Ok(store)
    }

    /// Round trip to the server; fails unless it replies `PONG`.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let reply: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("Failed to ping redis")?;
        if reply != "PONG" {
            return Err(anyhow::anyhow!("Unexpected reply to PING: {reply}").into());
        }
        Ok(())
    }
}

#[async_trait]
impl Store for RedisStore {
    #[instrument(skip(self), err)]
    async fn add(&self, key: &str, member: &str, score: Score) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let _: () = conn
            .zadd(key, member, score)
            .await
            .context("Failed to add member")?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn range_by_score(
        &self,
        key: &str,
        min: Score,
        max: Score,
        limit: usize,
    ) -> Result<Vec<ScoredMember>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let count = isize::try_from(limit).unwrap_or(isize::MAX);
        let mut conn = self.manager.clone();
        let entries: Vec<(String, f64)> = conn
            .zrangebyscore_limit_withscores(key, keys::bound(min), keys::bound(max), 0, count)
            .await
            .context("Failed to range over scores")?;

        Ok(entries
            .into_iter()
            .map(|(member, score)| ScoredMember::new(member, score as Score))
            .collect())
    }

    #[instrument(skip(self), err)]
    async fn remove_if_present(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.manager.clone();
        let removed: i64 = conn
            .zrem(key, member)
            .await
            .context("Failed to remove member")?;
        Ok(removed > 0)
    }

    #[instrument(skip(self), err)]
    async fn compare_and_rescore(
        &self,
        key: &str,
        member: &str,
        expected: Score,
        score: Score,
    ) -> Result<bool, StoreError> {
        let mut conn = self.manager.clone();
        let moved: i64 = self
            .rescore
            .key(key)
            .arg(member)
            .arg(expected)
            .arg(score)
            .invoke_async(&mut conn)
            .await
            .context("Failed to rescore member")?;
        Ok(moved == 1)
    }

    #[instrument(skip(self), err)]
    async fn remove_if_score(
        &self,
        key: &str,
        member: &str,
        expected: Score,
    ) -> Result<bool, StoreError> {
        let mut conn = self.manager.clone();
        let removed: i64 = self
            .remove_if_score
            .key(key)
            .arg(member)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .context("Failed to conditionally remove member")?;
        Ok(removed == 1)
    }

    #[instrument(skip(self), err)]
    async fn count(&self, key: &str) -> Result<usize, StoreError> {
        let mut conn = self.manager.clone();
        let count: usize = conn.zcard(key).await.context("Failed to count members")?;
        Ok(count)
    }

    #[instrument(skip(self, record), err, fields(size = record.len()))]
    async fn put_record(&self, key: &str, member: &str, record: Bytes) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let _: () = conn
            .hset(keys::records(key), member, record.as_ref())
            .await
            .context("Failed to store item record")?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn get_record(&self, key: &str, member: &str) -> Result<Option<Bytes>, StoreError> {
        let mut conn = self.manager.clone();
        let record: Option<Vec<u8>> = conn
            .hget(keys::records(key), member)
            .await
            .context("Failed to load item record")?;
        Ok(record.map(Bytes::from))
    }

    #[instrument(skip(self), err)]
    async fn remove_record(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.manager.clone();
        let removed: i64 = conn
            .hdel(keys::records(key), member)
            .await
            .context("Failed to delete item record")?;
        Ok(removed > 0)
    }
}
