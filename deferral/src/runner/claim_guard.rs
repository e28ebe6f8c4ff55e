use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

use crate::core::item::{ClaimToken, ItemId};
use crate::core::queue::{QueueError, QueueName};
use crate::core::score_clock::{self, Clock};
use crate::core::store::{bounded, ScoredMember, Store};

/// Hands each due item to at most one consumer.
///
/// A claim atomically moves the member from the score it was scanned at to
/// `now + visibility_timeout`. Whoever loses that race (another poller scanned the same member)
/// gets [`QueueError::ClaimLost`]. A claim that is never resolved decays: once the in-flight score
/// is in the past the item is due again and will be delivered once more.
pub struct ClaimGuard<S: ?Sized> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    queue: QueueName,
    owner: String,
    visibility_timeout: Duration,
    store_timeout: Duration,
}

impl<S> ClaimGuard<S>
where
    S: Store + ?Sized,
{
    pub fn new(
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        queue: QueueName,
        owner: impl Into<String>,
        visibility_timeout: Duration,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            queue,
            owner: owner.into(),
            visibility_timeout,
            store_timeout,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Try to claim a scanned candidate.
    #[instrument(skip_all, err(level = "debug"), fields(queue = %self.queue, item_id = %candidate.member))]
    pub async fn claim(&self, candidate: &ScoredMember) -> Result<ClaimToken, QueueError> {
        let claimed_at = self.clock.now();
        let in_flight_score =
            score_clock::after(score_clock::to_score(claimed_at), self.visibility_timeout);

        let claimed = bounded(
            self.store_timeout,
            self.store.compare_and_rescore(
                self.queue.as_str(),
                &candidate.member,
                candidate.score,
                in_flight_score,
            ),
        )
        .await?;

        let item_id = ItemId::from(candidate.member.as_str());
        if !claimed {
            return Err(QueueError::claim_lost(item_id));
        }

        Ok(ClaimToken {
            item_id,
            claimed_at,
            owner: self.owner.clone(),
            in_flight_score,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::score_clock::{ManualClock, MIN_SCORE};
    use crate::core::Duration as ChronoDuration;
    use crate::memory::MemoryStore;
    use crate::runner::poller::Poller;

    fn guard(
        store: Arc<MemoryStore>,
        clock: &ManualClock,
        owner: &str,
    ) -> ClaimGuard<MemoryStore> {
        ClaimGuard::new(
            store,
            Arc::new(clock.clone()),
            QueueName::new("q").unwrap(),
            owner,
            Duration::from_secs(30),
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn test_claim_hides_item_for_visibility_timeout() {
        let store = Arc::new(MemoryStore::new());
        store.add("q", "job", 100).await.unwrap();
        let clock = ManualClock::at_millis(1_000);
        let guard = guard(store.clone(), &clock, "worker-1");

        let token = guard.claim(&ScoredMember::new("job", 100)).await.unwrap();

        assert_eq!(token.item_id, ItemId::from("job"));
        assert_eq!(token.owner, "worker-1");
        assert_eq!(token.in_flight_score, 31_000);
        assert_eq!(store.score_of("q", "job"), Some(31_000));
        assert!(store
            .range_by_score("q", MIN_SCORE, 1_000, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_claim_of_vanished_item_is_lost() {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::at_millis(1_000);
        let guard = guard(store, &clock, "worker-1");

        let err = guard
            .claim(&ScoredMember::new("gone", 100))
            .await
            .unwrap_err();
        assert!(err.is_claim_lost());
    }

    #[tokio::test]
    async fn test_stale_candidate_is_lost() {
        let store = Arc::new(MemoryStore::new());
        store.add("q", "job", 100).await.unwrap();
        let clock = ManualClock::at_millis(1_000);
        let first = guard(store.clone(), &clock, "worker-1");
        let second = guard(store.clone(), &clock, "worker-2");

        // Both scanned the item at score 100.
        let candidate = ScoredMember::new("job", 100);
        first.claim(&candidate).await.unwrap();
        let err = second.claim(&candidate).await.unwrap_err();

        assert!(matches!(err, QueueError::ClaimLost { item_id } if item_id.as_str() == "job"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_have_exactly_one_winner() {
        let store = Arc::new(MemoryStore::new());
        store.add("q", "job", 100).await.unwrap();
        let clock = ManualClock::at_millis(1_000);

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..16 {
            let guard = guard(store.clone(), &clock, &format!("worker-{i}"));
            tasks.spawn(async move { guard.claim(&ScoredMember::new("job", 100)).await });
        }

        let mut winners = 0;
        let mut lost = 0;
        while let Some(result) = tasks.join_next().await {
            match result.unwrap() {
                Ok(_) => winners += 1,
                Err(e) if e.is_claim_lost() => lost += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(lost, 15);
    }

    #[tokio::test]
    async fn test_unresolved_claim_decays_back_to_visible() {
        let store = Arc::new(MemoryStore::new());
        store.add("q", "job", 100).await.unwrap();
        let clock = ManualClock::at_millis(1_000);
        let guard = guard(store.clone(), &clock, "worker-1");
        let poller = Poller::new(
            store.clone(),
            Arc::new(clock.clone()),
            QueueName::new("q").unwrap(),
            10,
            Duration::from_secs(1),
        );

        let token = guard.claim(&ScoredMember::new("job", 100)).await.unwrap();
        assert!(poller.scan().await.unwrap().is_empty());

        clock.advance(ChronoDuration::seconds(29));
        assert!(poller.scan().await.unwrap().is_empty());

        clock.advance(ChronoDuration::seconds(1));
        let candidates = poller.scan().await.unwrap();
        assert_eq!(
            candidates,
            vec![ScoredMember::new("job", token.in_flight_score)]
        );

        // And it can be claimed again.
        let again = guard.claim(&candidates[0]).await.unwrap();
        assert!(again.in_flight_score > token.in_flight_score);
    }
}
