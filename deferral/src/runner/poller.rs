use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

use crate::core::queue::{QueueError, QueueName};
use crate::core::score_clock::{Clock, MIN_SCORE};
use crate::core::store::{bounded, ScoredMember, Store};

/// Finds due items. One call to [`scan`](Poller::scan) is one page of `[-inf, now]`.
///
/// Scans keep no cursor: a failed scan is simply repeated on the next tick, and claimed items drop
/// out of the due range on their own.
pub struct Poller<S: ?Sized> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    queue: QueueName,
    page_size: usize,
    store_timeout: Duration,
}

impl<S> Poller<S>
where
    S: Store + ?Sized,
{
    pub fn new(
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        queue: QueueName,
        page_size: usize,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            queue,
            page_size,
            store_timeout,
        }
    }

    /// Due candidates in delivery order: ascending score, ties by ascending item id.
    #[instrument(skip_all, err, fields(queue = %self.queue, candidates))]
    pub async fn scan(&self) -> Result<Vec<ScoredMember>, QueueError> {
        let now = self.clock.now_score();
        let mut candidates = bounded(
            self.store_timeout,
            self.store
                .range_by_score(self.queue.as_str(), MIN_SCORE, now, self.page_size),
        )
        .await?;

        // Delivery order does not depend on the backend's tie-breaking.
        candidates.sort_by(|a, b| a.score.cmp(&b.score).then_with(|| a.member.cmp(&b.member)));
        candidates.truncate(self.page_size);

        tracing::Span::current().record("candidates", candidates.len());
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::score_clock::ManualClock;
    use crate::memory::MemoryStore;

    fn poller(store: Arc<MemoryStore>, clock: &ManualClock, page_size: usize) -> Poller<MemoryStore> {
        Poller::new(
            store,
            Arc::new(clock.clone()),
            QueueName::new("q").unwrap(),
            page_size,
            Duration::from_secs(1),
        )
    }

    fn members(candidates: &[ScoredMember]) -> Vec<&str> {
        candidates.iter().map(|c| c.member.as_str()).collect()
    }

    #[tokio::test]
    async fn test_scan_orders_by_score_then_id() {
        let store = Arc::new(MemoryStore::new());
        store.add("q", "B", 100).await.unwrap();
        store.add("q", "A", 100).await.unwrap();
        store.add("q", "C", 90).await.unwrap();
        let clock = ManualClock::at_millis(200);

        let candidates = poller(store, &clock, 10).scan().await.unwrap();
        assert_eq!(members(&candidates), vec!["C", "A", "B"]);
    }

    #[tokio::test]
    async fn test_scan_never_returns_future_items() {
        let store = Arc::new(MemoryStore::new());
        store.add("q", "due", 1_000).await.unwrap();
        store.add("q", "future", 1_001).await.unwrap();
        let clock = ManualClock::at_millis(1_000);
        let poller = poller(store, &clock, 10);

        assert_eq!(members(&poller.scan().await.unwrap()), vec!["due"]);

        clock.set_millis(1_001);
        assert_eq!(
            members(&poller.scan().await.unwrap()),
            vec!["due", "future"]
        );
    }

    #[tokio::test]
    async fn test_scan_is_bounded_by_page_size() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..50 {
            store.add("q", &format!("item-{:02}", i), i).await.unwrap();
        }
        let clock = ManualClock::at_millis(1_000);

        let candidates = poller(store, &clock, 5).scan().await.unwrap();
        assert_eq!(
            members(&candidates),
            vec!["item-00", "item-01", "item-02", "item-03", "item-04"]
        );
    }

    #[tokio::test]
    async fn test_failed_scan_can_be_retried() {
        let store = Arc::new(MemoryStore::new());
        store.add("q", "a", 1).await.unwrap();
        let clock = ManualClock::at_millis(10);
        let poller = poller(store.clone(), &clock, 10);

        store.set_unavailable(true);
        assert!(poller.scan().await.unwrap_err().is_transient());

        store.set_unavailable(false);
        assert_eq!(members(&poller.scan().await.unwrap()), vec!["a"]);
    }
}
