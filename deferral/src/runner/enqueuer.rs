use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::instrument;

use crate::core::item::{ItemId, ItemRecord};
use crate::core::queue::{QueueError, QueueName};
use crate::core::score_clock::{self, Clock, SystemClock};
use crate::core::store::{bounded, Store};
use crate::core::Duration;

/// Per-item enqueue options.
///
/// # Examples
///
/// ```rust
/// use deferral::runner::enqueuer::EnqueueOptions;
/// use deferral::core::Duration;
///
/// let opts = EnqueueOptions::new()
///     .in_duration(Duration::minutes(5))
///     .with_max_attempts(10);
/// ```
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    pub(crate) delay: Duration,
    pub(crate) max_attempts: Option<u32>,
}

impl EnqueueOptions {
    /// Due on the next poll cycle, queue-wide attempt limit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the item due `delay` from now.
    pub fn in_duration(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Override the queue's `max_attempts` for this item.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            delay: Duration::zero(),
            max_attempts: None,
        }
    }
}

/// Turns `(payload, delay)` into a scored member of a queue.
///
/// The record is written first; the add-with-score call is the single step that makes the item
/// visible to pollers.
pub struct Enqueuer<S: ?Sized> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    store_timeout: StdDuration,
}

impl<S> Clone for Enqueuer<S>
where
    S: ?Sized,
{
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            clock: self.clock.clone(),
            store_timeout: self.store_timeout,
        }
    }
}

impl<S> Enqueuer<S>
where
    S: Store + ?Sized,
{
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            store_timeout: StdDuration::from_secs(5),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_store_timeout(mut self, store_timeout: StdDuration) -> Self {
        self.store_timeout = store_timeout;
        self
    }

    /// Schedule `payload` on `queue`, due `delay` from now.
    ///
    /// A zero delay makes the item eligible on the next poll cycle.
    pub async fn enqueue(
        &self,
        queue: &QueueName,
        payload: Bytes,
        delay: Duration,
    ) -> Result<ItemId, QueueError> {
        self.enqueue_with(queue, payload, EnqueueOptions::new().in_duration(delay))
            .await
    }

    /// Serialize `payload` as JSON and schedule it. Pairs with
    /// [`TypedHandler`](crate::core::handler::TypedHandler) on the consumer side.
    pub async fn enqueue_json<T>(
        &self,
        queue: &QueueName,
        payload: &T,
        options: EnqueueOptions,
    ) -> Result<ItemId, QueueError>
    where
        T: Serialize + ?Sized,
    {
        let bytes = serde_json::to_vec(payload)
            .map_err(|e| QueueError::serialize_error(std::any::type_name::<T>(), e))?;
        self.enqueue_with(queue, Bytes::from(bytes), options).await
    }

    #[instrument(skip_all, err, fields(queue = %queue, item_id, ready_at))]
    pub async fn enqueue_with(
        &self,
        queue: &QueueName,
        payload: Bytes,
        options: EnqueueOptions,
    ) -> Result<ItemId, QueueError> {
        let now = self.clock.now();
        let ready_at = score_clock::ready_at(score_clock::to_score(now), options.delay)?;
        let item_id = ItemId::generate();

        let span = tracing::Span::current();
        span.record("item_id", tracing::field::display(&item_id));
        span.record("ready_at", ready_at);

        let record = ItemRecord::new(item_id.clone(), payload, ready_at, now)
            .with_max_attempts(options.max_attempts);
        let key = queue.as_str();
        let member = item_id.as_str();

        bounded(
            self.store_timeout,
            self.store.put_record(key, member, record.encode()?),
        )
        .await?;

        if let Err(e) = bounded(self.store_timeout, self.store.add(key, member, ready_at)).await {
            self.discard_unqueued(key, member).await;
            return Err(e.into());
        }

        tracing::debug!("Item enqueued");
        Ok(item_id)
    }

    /// Undo a failed enqueue. A failed `add` may still have been applied, so the member goes
    /// first and the record is only deleted once the member is known to be gone.
    async fn discard_unqueued(&self, key: &str, member: &str) {
        if let Err(e) = bounded(self.store_timeout, self.store.remove_if_present(key, member)).await
        {
            tracing::warn!(error = %e, "Could not confirm item is unqueued, keeping its record");
            return;
        }
        if let Err(e) = bounded(self.store_timeout, self.store.remove_record(key, member)).await {
            tracing::warn!(error = %e, "Failed to remove record of unqueued item");
        }
    }
}
