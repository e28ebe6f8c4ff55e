use bytes::Bytes;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::core::backoff::Backoff;
use crate::core::dead_letter::{DeadLetter, DeadLetterReason, DeadLetterSink};
use crate::core::handler::{Handler, Outcome};
use crate::core::item::{ClaimToken, Item, ItemRecord};
use crate::core::queue::{QueueError, QueueName};
use crate::core::score_clock::{self, Clock, Score};
use crate::core::store::{bounded, Store, StoreError};

/// What happened to an item after a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Handled successfully and removed.
    Completed,
    /// Failed, attempts left; due again at `ready_at`.
    Rescheduled { attempts: u32, ready_at: Score },
    /// Recorded in the dead-letter sink and removed.
    DeadLettered {
        reason: DeadLetterReason,
        attempts: u32,
    },
    /// Handler outlived the shutdown timeout. Nothing was written; the claim decays.
    Abandoned,
}

/// Invokes the handler for claimed items and drives each item to its next state.
///
/// Every write is conditional on the member still carrying the claim's in-flight score, so only
/// the current claim holder can complete, reschedule or dead-letter an item. A holder whose claim
/// already decayed gets [`QueueError::ClaimLost`] and leaves the item to the new holder.
pub struct ConsumerDispatcher<S: ?Sized> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    queue: QueueName,
    handler: Arc<dyn Handler>,
    dead_letters: Arc<dyn DeadLetterSink>,
    backoff: Arc<dyn Backoff>,
    max_attempts: u32,
    store_timeout: Duration,
    shutdown_timeout: Duration,
}

/// Construction parameters of a [`ConsumerDispatcher`].
pub struct DispatcherParts<S: ?Sized> {
    pub store: Arc<S>,
    pub clock: Arc<dyn Clock>,
    pub queue: QueueName,
    pub handler: Arc<dyn Handler>,
    pub dead_letters: Arc<dyn DeadLetterSink>,
    pub backoff: Arc<dyn Backoff>,
    pub max_attempts: u32,
    pub store_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl<S> ConsumerDispatcher<S>
where
    S: Store + ?Sized,
{
    pub fn new(parts: DispatcherParts<S>) -> Self {
        Self {
            store: parts.store,
            clock: parts.clock,
            queue: parts.queue,
            handler: parts.handler,
            dead_letters: parts.dead_letters,
            backoff: parts.backoff,
            max_attempts: parts.max_attempts,
            store_timeout: parts.store_timeout,
            shutdown_timeout: parts.shutdown_timeout,
        }
    }

    /// Load the claimed item, run the handler and resolve the outcome.
    #[instrument(skip_all, err(level = "debug"), fields(queue = %self.queue, item_id = %token.item_id, attempts))]
    pub async fn dispatch(
        &self,
        token: ClaimToken,
        cancellation_token: CancellationToken,
    ) -> Result<Resolution, QueueError> {
        let item = match self.load(token).await? {
            Loaded::Item(item) => item,
            Loaded::Buried(resolution) => return Ok(resolution),
        };
        tracing::Span::current().record("attempts", item.attempts());

        let handled = tokio::select! {
            result = self.handler.handle(item.id(), item.payload(), cancellation_token.child_token()) => Some(result),
            _ = abandon_after(self.shutdown_timeout, cancellation_token.child_token()) => None,
        };

        match handled {
            Some(result) => self.resolve(&item, Outcome::from_result(result)).await,
            None => {
                tracing::warn!(
                    shutdown_timeout = ?self.shutdown_timeout,
                    "Handler did not finish after shutdown was requested, abandoning claim"
                );
                Ok(Resolution::Abandoned)
            }
        }
    }

    /// Apply `outcome` to a claimed item.
    ///
    /// Removal only ever follows a confirmed terminal outcome. Store failures are retried until the
    /// claim's visibility window closes; after that the item is left to reappear on its own.
    #[instrument(skip_all, err(level = "debug"), fields(queue = %self.queue, item_id = %item.id()))]
    pub async fn resolve(&self, item: &Item, outcome: Outcome) -> Result<Resolution, QueueError> {
        match outcome {
            Outcome::Success => self.complete(&item.token).await,
            Outcome::RetryableFailure(error) => {
                let attempts = item.record.attempts.saturating_add(1);
                let max_attempts = item.record.effective_max_attempts(self.max_attempts);
                if attempts < max_attempts {
                    self.reschedule(item, attempts, error).await
                } else {
                    tracing::warn!(attempts, max_attempts, "Item ran out of attempts");
                    self.dead_letter(
                        &item.token,
                        item.payload(),
                        attempts,
                        error,
                        DeadLetterReason::Exhausted,
                    )
                    .await
                }
            }
            Outcome::Exhausted(error) => {
                self.dead_letter(
                    &item.token,
                    item.payload(),
                    item.record.attempts.saturating_add(1),
                    error,
                    DeadLetterReason::Exhausted,
                )
                .await
            }
            Outcome::FatalFailure(error) => {
                self.dead_letter(
                    &item.token,
                    item.payload(),
                    item.record.attempts.saturating_add(1),
                    error,
                    DeadLetterReason::Fatal,
                )
                .await
            }
        }
    }

    async fn load(&self, token: ClaimToken) -> Result<Loaded, QueueError> {
        let key = self.queue.as_str();
        let member = token.item_id.as_str();
        let raw = self
            .with_retry(&token, || self.store.get_record(key, member))
            .await?;

        let (payload, error) = match raw {
            Some(raw) => match ItemRecord::decode(&token.item_id, &raw) {
                Ok(record) => return Ok(Loaded::Item(Item { token, record })),
                Err(e) => (raw, e.to_string()),
            },
            None => (Bytes::new(), "Item record is missing".to_string()),
        };

        tracing::error!(error = %error, "Cannot deliver item");
        self.dead_letter(&token, payload, 0, error, DeadLetterReason::Corrupt)
            .await
            .map(Loaded::Buried)
    }

    async fn complete(&self, token: &ClaimToken) -> Result<Resolution, QueueError> {
        let key = self.queue.as_str();
        let member = token.item_id.as_str();

        let removed = self
            .with_retry(token, || {
                self.store
                    .remove_if_score(key, member, token.in_flight_score)
            })
            .await?;
        if !removed {
            return Err(QueueError::claim_lost(token.item_id.clone()));
        }

        self.forget_record(token).await;
        tracing::debug!("Item completed");
        Ok(Resolution::Completed)
    }

    async fn reschedule(
        &self,
        item: &Item,
        attempts: u32,
        error: String,
    ) -> Result<Resolution, QueueError> {
        let token = &item.token;
        self.confirm_ownership(token).await?;

        let delay = self.backoff.delay(attempts);
        let ready_at = score_clock::after(self.clock.now_score(), delay);
        let record = ItemRecord {
            attempts,
            ready_at,
            last_error: Some(error),
            ..item.record.clone()
        };
        let encoded = record.encode()?;

        let key = self.queue.as_str();
        let member = token.item_id.as_str();
        let moved = self
            .with_retry(token, || {
                self.store
                    .compare_and_rescore(key, member, token.in_flight_score, ready_at)
            })
            .await?;
        if !moved {
            return Err(QueueError::claim_lost(token.item_id.clone()));
        }

        // Only the holder that moved the member writes its record.
        if let Err(e) = bounded(
            self.store_timeout,
            self.store.put_record(key, member, encoded),
        )
        .await
        {
            tracing::warn!(error = %e, "Failed to record attempt count of rescheduled item");
        }

        tracing::info!(attempts, delay = ?delay, "Item failed, rescheduled");
        Ok(Resolution::Rescheduled { attempts, ready_at })
    }

    async fn dead_letter(
        &self,
        token: &ClaimToken,
        payload: Bytes,
        attempts: u32,
        error: String,
        reason: DeadLetterReason,
    ) -> Result<Resolution, QueueError> {
        self.confirm_ownership(token).await?;

        tracing::warn!(attempts, reason = ?reason, "Moving item to dead-letter sink");
        let letter = DeadLetter {
            item_id: token.item_id.clone(),
            queue: self.queue.to_string(),
            payload,
            attempts,
            last_error: error,
            reason,
            dead_at: self.clock.now(),
            metadata: HashMap::new(),
        }
        .with_metadata("owner".to_string(), token.owner.clone().into());

        match tokio::time::timeout(self.store_timeout, self.dead_letters.record(letter)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "Failed to record dead letter"),
            Err(_) => tracing::error!(
                timeout = ?self.store_timeout,
                "Timed out recording dead letter"
            ),
        }

        let key = self.queue.as_str();
        let member = token.item_id.as_str();
        let removed = self
            .with_retry(token, || {
                self.store
                    .remove_if_score(key, member, token.in_flight_score)
            })
            .await?;
        if !removed {
            return Err(QueueError::claim_lost(token.item_id.clone()));
        }

        self.forget_record(token).await;
        Ok(Resolution::DeadLettered { reason, attempts })
    }

    /// Fail with `ClaimLost` unless the member still carries this claim's in-flight score.
    async fn confirm_ownership(&self, token: &ClaimToken) -> Result<(), QueueError> {
        let key = self.queue.as_str();
        let member = token.item_id.as_str();
        let owned = self
            .with_retry(token, || {
                self.store.compare_and_rescore(
                    key,
                    member,
                    token.in_flight_score,
                    token.in_flight_score,
                )
            })
            .await?;
        if owned {
            Ok(())
        } else {
            Err(QueueError::claim_lost(token.item_id.clone()))
        }
    }

    /// Delete the record of an item that already left the set. A leftover record is harmless.
    async fn forget_record(&self, token: &ClaimToken) {
        let key = self.queue.as_str();
        let member = token.item_id.as_str();
        if let Err(e) = self
            .with_retry(token, || self.store.remove_record(key, member))
            .await
        {
            tracing::warn!(error = %e, "Failed to delete record of resolved item");
        }
    }

    /// Run a store call, retrying failures with capped exponential backoff for as long as the
    /// claim's visibility window stays open.
    async fn with_retry<T, F, Fut>(&self, token: &ClaimToken, mut op: F) -> Result<T, QueueError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let window = token
            .in_flight_score
            .saturating_sub(self.clock.now_score())
            .max(0);
        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(u64::try_from(window).unwrap_or(0));
        let mut delay = Duration::from_millis(50);

        loop {
            match bounded(self.store_timeout, op()).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if tokio::time::Instant::now() + delay >= deadline {
                        tracing::warn!(
                            error = %e,
                            "Store still failing at the end of the visibility window, giving up"
                        );
                        return Err(e.into());
                    }
                    tracing::warn!(error = %e, retry_in = ?delay, "Store call failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(1));
                }
            }
        }
    }
}

enum Loaded {
    Item(Item),
    Buried(Resolution),
}

async fn abandon_after(shutdown_timeout: Duration, cancellation_token: CancellationToken) {
    cancellation_token.cancelled().await;
    // The handler gets `shutdown_timeout` to react to the cancellation before it is dropped.
    tokio::time::sleep(shutdown_timeout).await;
}
