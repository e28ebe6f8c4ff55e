//! A delay queue with a background consumer.
//!
//! [`DelayQueue`] ties the pieces together: producers call [`enqueue`](DelayQueue::enqueue) from
//! anywhere, while [`start`](DelayQueue::start) spawns a poll loop that scans for due items,
//! claims them and hands them to a bounded pool of handler tasks.

use bytes::Bytes;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::instrument;

use super::claim_guard::ClaimGuard;
use super::dispatcher::{ConsumerDispatcher, DispatcherParts, Resolution};
use super::enqueuer::{EnqueueOptions, Enqueuer};
use super::poller::Poller;
use crate::core::backoff::{Backoff, ExponentialBackoff};
use crate::core::dead_letter::{DeadLetterSink, LoggingDeadLetterSink};
use crate::core::handler::{Handler, Outcome};
use crate::core::item::{Item, ItemId};
use crate::core::options::QueueOptions;
use crate::core::queue::{QueueError, QueueName};
use crate::core::score_clock::{Clock, SystemClock};
use crate::core::store::{bounded, Store};
use crate::core::Duration;

/// Lifecycle of the consumer side of a [`DelayQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Stopped,
    Running,
    /// No new claims; outstanding handlers are finishing.
    Stopping,
}

/// Summary of a [`DelayQueue::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StopReport {
    /// Handlers still running when the grace period ran out. They were cancelled; items they
    /// did not resolve reappear once their visibility timeout passes.
    pub abandoned: usize,
}

/// Delay queue on a sorted-set store.
///
/// ## Example
/// ```rust
/// use deferral::memory::MemoryStore;
/// use deferral::prelude::*;
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), QueueError> {
/// let queue = DelayQueue::new(Arc::new(MemoryStore::new()), QueueName::new("reminders")?)
///     .with_options(QueueOptions::default().with_worker_pool_size(4));
///
/// queue.enqueue(Bytes::from_static(b"call mom"), Duration::minutes(5)).await?;
///
/// queue
///     .start(handler_fn(|payload: Bytes| async move {
///         println!("{}", String::from_utf8_lossy(&payload));
///         Ok::<(), HandlerError>(())
///     }))
///     .await?;
///
/// let report = queue.stop(std::time::Duration::from_secs(5)).await?;
/// assert_eq!(report.abandoned, 0);
/// # Ok(())
/// # }
/// ```
pub struct DelayQueue<S: ?Sized> {
    name: QueueName,
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    options: QueueOptions,
    backoff: Arc<dyn Backoff>,
    dead_letters: Arc<dyn DeadLetterSink>,
    owner: String,
    state: watch::Sender<QueueState>,
    consumer: Mutex<Option<Consumer<S>>>,
}

/// Handles of a started consumer.
struct Consumer<S: ?Sized> {
    dispatcher: Arc<ConsumerDispatcher<S>>,
    /// Stops the poll loop.
    shutdown: CancellationToken,
    /// Cancels running handlers.
    workers: CancellationToken,
    tracker: TaskTracker,
    poll_task: Option<JoinHandle<()>>,
}

impl<S> DelayQueue<S>
where
    S: Store + ?Sized + 'static,
{
    pub fn new(store: Arc<S>, name: QueueName) -> Self {
        let (state, _) = watch::channel(QueueState::Stopped);
        Self {
            name,
            store,
            clock: Arc::new(SystemClock),
            options: QueueOptions::default(),
            backoff: Arc::new(ExponentialBackoff::default()),
            dead_letters: Arc::new(LoggingDeadLetterSink),
            owner: format!("consumer-{}", ItemId::generate()),
            state,
            consumer: Mutex::new(None),
        }
    }

    pub fn with_options(mut self, options: QueueOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_backoff(mut self, backoff: impl Backoff + 'static) -> Self {
        self.backoff = Arc::new(backoff);
        self
    }

    pub fn with_dead_letters(mut self, dead_letters: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = dead_letters;
        self
    }

    /// Name recorded on claims and dead letters. Defaults to a random `consumer-<uuid>`.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn name(&self) -> &QueueName {
        &self.name
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    pub fn state(&self) -> QueueState {
        *self.state.borrow()
    }

    /// Watch state transitions, e.g. to wait until a stop has completed.
    pub fn subscribe(&self) -> watch::Receiver<QueueState> {
        self.state.subscribe()
    }

    fn enqueuer(&self) -> Enqueuer<S> {
        Enqueuer::new(self.store.clone())
            .with_clock(self.clock.clone())
            .with_store_timeout(self.options.store_timeout)
    }

    /// Schedule `payload`, due `delay` from now. Allowed in every state.
    pub async fn enqueue(&self, payload: Bytes, delay: Duration) -> Result<ItemId, QueueError> {
        self.enqueuer().enqueue(&self.name, payload, delay).await
    }

    pub async fn enqueue_with(
        &self,
        payload: Bytes,
        options: EnqueueOptions,
    ) -> Result<ItemId, QueueError> {
        self.enqueuer().enqueue_with(&self.name, payload, options).await
    }

    pub async fn enqueue_json<T>(
        &self,
        payload: &T,
        options: EnqueueOptions,
    ) -> Result<ItemId, QueueError>
    where
        T: Serialize + ?Sized,
    {
        self.enqueuer().enqueue_json(&self.name, payload, options).await
    }

    /// Remove a scheduled item before it is delivered. Returns `false` if it was not queued.
    ///
    /// An item that is being handled right now is removed too; its handler's resolution then
    /// fails with [`QueueError::ClaimLost`].
    #[instrument(skip(self), err, fields(queue = %self.name))]
    pub async fn cancel(&self, item_id: &ItemId) -> Result<bool, QueueError> {
        let key = self.name.as_str();
        let timeout = self.options.store_timeout;
        let removed = bounded(
            timeout,
            self.store.remove_if_present(key, item_id.as_str()),
        )
        .await?;
        if removed {
            bounded(timeout, self.store.remove_record(key, item_id.as_str())).await?;
            tracing::debug!("Item cancelled");
        }
        Ok(removed)
    }

    /// Items in the queue: scheduled, due and in flight.
    pub async fn pending(&self) -> Result<usize, QueueError> {
        Ok(bounded(self.options.store_timeout, self.store.count(self.name.as_str())).await?)
    }

    /// Start consuming with `handler`.
    ///
    /// Spawns the poll loop on the current tokio runtime. Fails with
    /// [`QueueError::AlreadyRunning`] unless the queue is stopped.
    pub async fn start<H>(&self, handler: H) -> Result<(), QueueError>
    where
        H: Handler + 'static,
    {
        self.options.validate()?;

        let mut consumer = self.lock_consumer();
        if self.state() != QueueState::Stopped || consumer.is_some() {
            return Err(QueueError::AlreadyRunning {
                queue: self.name.clone(),
            });
        }

        let dispatcher = Arc::new(ConsumerDispatcher::new(DispatcherParts {
            store: self.store.clone(),
            clock: self.clock.clone(),
            queue: self.name.clone(),
            handler: Arc::new(handler),
            dead_letters: self.dead_letters.clone(),
            backoff: self.backoff.clone(),
            max_attempts: self.options.max_attempts,
            store_timeout: self.options.store_timeout,
            shutdown_timeout: self.options.shutdown_timeout,
        }));
        let shutdown = CancellationToken::new();
        let workers = CancellationToken::new();
        let tracker = TaskTracker::new();

        let poll_loop = PollLoop {
            poller: Poller::new(
                self.store.clone(),
                self.clock.clone(),
                self.name.clone(),
                self.options.page_size,
                self.options.store_timeout,
            ),
            guard: ClaimGuard::new(
                self.store.clone(),
                self.clock.clone(),
                self.name.clone(),
                self.owner.clone(),
                self.options.visibility_timeout,
                self.options.store_timeout,
            ),
            dispatcher: dispatcher.clone(),
            permits: Arc::new(Semaphore::new(self.options.worker_pool_size)),
            tracker: tracker.clone(),
            shutdown: shutdown.clone(),
            workers: workers.clone(),
        };
        let poll_task = tokio::spawn(poll_loop.run(self.options.poll_interval));

        *consumer = Some(Consumer {
            dispatcher,
            shutdown,
            workers,
            tracker,
            poll_task: Some(poll_task),
        });
        self.state.send_replace(QueueState::Running);

        tracing::info!(
            queue = %self.name,
            owner = %self.owner,
            poll_interval = ?self.options.poll_interval,
            worker_pool_size = self.options.worker_pool_size,
            "Delay queue started"
        );
        Ok(())
    }

    /// Stop consuming.
    ///
    /// The poll loop finishes its current page and claims nothing new. Running handlers get
    /// `grace` to finish. Once it runs out the rest are cancelled and reported as abandoned
    /// without being awaited; their claims decay back to due. Fails with
    /// [`QueueError::NotRunning`] unless the queue is running.
    pub async fn stop(&self, grace: StdDuration) -> Result<StopReport, QueueError> {
        let (shutdown, workers, tracker, poll_task) = {
            let mut consumer = self.lock_consumer();
            match consumer.as_mut() {
                Some(consumer) if self.state() == QueueState::Running => (
                    consumer.shutdown.clone(),
                    consumer.workers.clone(),
                    consumer.tracker.clone(),
                    consumer.poll_task.take(),
                ),
                _ => {
                    return Err(QueueError::NotRunning {
                        queue: self.name.clone(),
                    })
                }
            }
        };
        self.state.send_replace(QueueState::Stopping);
        tracing::info!(queue = %self.name, grace = ?grace, "Stopping delay queue");

        shutdown.cancel();
        if let Some(poll_task) = poll_task {
            if let Err(e) = poll_task.await {
                tracing::error!(error = %e, "Poll loop terminated abnormally");
            }
        }

        tracker.close();
        let mut report = StopReport::default();
        if tokio::time::timeout(grace, tracker.wait()).await.is_err() {
            report.abandoned = tracker.len();
            tracing::warn!(
                abandoned = report.abandoned,
                "Grace period over, cancelling running handlers"
            );
            workers.cancel();
        }

        self.lock_consumer().take();
        self.state.send_replace(QueueState::Stopped);
        tracing::info!(queue = %self.name, abandoned = report.abandoned, "Delay queue stopped");
        Ok(report)
    }

    /// Resolve a claimed item by hand. Requires a running or stopping queue.
    pub async fn resolve(&self, item: &Item, outcome: Outcome) -> Result<Resolution, QueueError> {
        let dispatcher = self
            .lock_consumer()
            .as_ref()
            .map(|consumer| consumer.dispatcher.clone());
        match dispatcher {
            Some(dispatcher) if self.state() != QueueState::Stopped => {
                dispatcher.resolve(item, outcome).await
            }
            _ => Err(QueueError::NotRunning {
                queue: self.name.clone(),
            }),
        }
    }

    fn lock_consumer(&self) -> std::sync::MutexGuard<'_, Option<Consumer<S>>> {
        // The guarded value stays consistent even if a holder panicked.
        self.consumer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl<S: ?Sized> Drop for DelayQueue<S> {
    fn drop(&mut self) {
        let consumer = self
            .consumer
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(consumer) = consumer.take() {
            consumer.shutdown.cancel();
            consumer.workers.cancel();
        }
    }
}

struct PollLoop<S: ?Sized> {
    poller: Poller<S>,
    guard: ClaimGuard<S>,
    dispatcher: Arc<ConsumerDispatcher<S>>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    workers: CancellationToken,
}

impl<S> PollLoop<S>
where
    S: Store + ?Sized + 'static,
{
    async fn run(self, poll_interval: StdDuration) {
        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => self.poll_once().await,
            }
        }
        tracing::debug!("Poll loop finished");
    }

    /// Scan one page and spawn a worker for every candidate that can be claimed.
    async fn poll_once(&self) {
        if self.permits.available_permits() == 0 {
            tracing::trace!("Worker pool saturated, skipping scan");
            return;
        }

        let candidates = match self.poller.scan().await {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::error!(error = %e, "Failed to scan for due items");
                return;
            }
        };
        if candidates.is_empty() {
            tracing::debug!("No due items");
            return;
        }

        for candidate in candidates {
            if self.shutdown.is_cancelled() {
                break;
            }
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                tracing::debug!("Worker pool saturated, leaving the rest of the page");
                break;
            };

            let token = match self.guard.claim(&candidate).await {
                Ok(token) => token,
                Err(e) if e.is_claim_lost() => continue,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to claim item");
                    break;
                }
            };

            let dispatcher = self.dispatcher.clone();
            let cancellation_token = self.workers.child_token();
            self.tracker.spawn(async move {
                let _permit = permit;
                match dispatcher.dispatch(token, cancellation_token).await {
                    Ok(resolution) => tracing::trace!(?resolution, "Item resolved"),
                    Err(e) if e.is_claim_lost() => {
                        tracing::debug!(error = %e, "Item was taken over by another consumer")
                    }
                    Err(e) => tracing::error!(
                        error = %e,
                        "Failed to resolve item, it will be redelivered after its visibility timeout"
                    ),
                }
            });
        }
    }
}
