//! In-process implementations of the store and dead-letter contracts.
//!
//! Useful for tests and single-process deployments. Nothing survives a restart.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::core::dead_letter::{DeadLetter, DeadLetterError, DeadLetterSink};
use crate::core::score_clock::Score;
use crate::core::store::{ScoredMember, Store, StoreError};

#[derive(Default)]
struct SortedSet {
    scores: HashMap<String, Score>,
    ordered: BTreeSet<(Score, String)>,
    records: HashMap<String, Bytes>,
}

impl SortedSet {
    fn insert(&mut self, member: &str, score: Score) {
        if let Some(previous) = self.scores.insert(member.to_string(), score) {
            self.ordered.remove(&(previous, member.to_string()));
        }
        self.ordered.insert((score, member.to_string()));
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.ordered.remove(&(score, member.to_string()));
                true
            }
            None => false,
        }
    }
}

/// A [`Store`] kept in a mutex-guarded map. Every operation holds the lock for its whole
/// duration, which makes the conditional operations trivially atomic.
#[derive(Default)]
pub struct MemoryStore {
    sets: Mutex<HashMap<String, SortedSet>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following call fail with [`StoreError::Unavailable`] until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Current score of `member`, if present.
    pub fn score_of(&self, key: &str, member: &str) -> Option<Score> {
        self.sets
            .lock()
            .ok()?
            .get(key)
            .and_then(|set| set.scores.get(member).copied())
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, SortedSet>>, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(anyhow::anyhow!(
                "memory store switched to unavailable"
            )));
        }
        self.sets
            .lock()
            .map_err(|_| StoreError::Unavailable(anyhow::anyhow!("memory store lock poisoned")))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn add(&self, key: &str, member: &str, score: Score) -> Result<(), StoreError> {
        self.lock()?
            .entry(key.to_string())
            .or_default()
            .insert(member, score);
        Ok(())
    }

    async fn range_by_score(
        &self,
        key: &str,
        min: Score,
        max: Score,
        limit: usize,
    ) -> Result<Vec<ScoredMember>, StoreError> {
        let sets = self.lock()?;
        let Some(set) = sets.get(key) else {
            return Ok(Vec::new());
        };
        Ok(set
            .ordered
            .range((min, String::new())..)
            .take_while(|(score, _)| *score <= max)
            .take(limit)
            .map(|(score, member)| ScoredMember::new(member.clone(), *score))
            .collect())
    }

    async fn remove_if_present(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        Ok(self
            .lock()?
            .get_mut(key)
            .map(|set| set.remove(member))
            .unwrap_or(false))
    }

    async fn compare_and_rescore(
        &self,
        key: &str,
        member: &str,
        expected: Score,
        score: Score,
    ) -> Result<bool, StoreError> {
        let mut sets = self.lock()?;
        let Some(set) = sets.get_mut(key) else {
            return Ok(false);
        };
        if set.scores.get(member) != Some(&expected) {
            return Ok(false);
        }
        set.insert(member, score);
        Ok(true)
    }

    async fn remove_if_score(
        &self,
        key: &str,
        member: &str,
        expected: Score,
    ) -> Result<bool, StoreError> {
        let mut sets = self.lock()?;
        let Some(set) = sets.get_mut(key) else {
            return Ok(false);
        };
        if set.scores.get(member) != Some(&expected) {
            return Ok(false);
        }
        Ok(set.remove(member))
    }

    async fn count(&self, key: &str) -> Result<usize, StoreError> {
        Ok(self
            .lock()?
            .get(key)
            .map(|set| set.scores.len())
            .unwrap_or(0))
    }

    async fn put_record(&self, key: &str, member: &str, record: Bytes) -> Result<(), StoreError> {
        self.lock()?
            .entry(key.to_string())
            .or_default()
            .records
            .insert(member.to_string(), record);
        Ok(())
    }

    async fn get_record(&self, key: &str, member: &str) -> Result<Option<Bytes>, StoreError> {
        Ok(self
            .lock()?
            .get(key)
            .and_then(|set| set.records.get(member).cloned()))
    }

    async fn remove_record(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        Ok(self
            .lock()?
            .get_mut(key)
            .map(|set| set.records.remove(member).is_some())
            .unwrap_or(false))
    }
}

/// Dead-letter sink that keeps every letter in memory.
#[derive(Default)]
pub struct MemoryDeadLetterSink {
    letters: Mutex<Vec<DeadLetter>>,
    failing: AtomicBool,
}

impl MemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far, oldest first.
    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters
            .lock()
            .map(|letters| letters.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.letters.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make `record` fail (without storing anything) until switched back.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterSink {
    async fn record(&self, letter: DeadLetter) -> Result<(), DeadLetterError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("memory sink switched to failing").into());
        }
        self.letters
            .lock()
            .map_err(|_| anyhow::anyhow!("memory sink lock poisoned"))?
            .push(letter);
        Ok(())
    }
}
