use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use std::future::Future;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::core::item::ItemId;

/// Processes the payload of a due item.
///
/// Delivery is at-least-once: the same item may reach a handler more than once (after a consumer
/// crash, or when a handler outlives the visibility timeout), so handlers must be idempotent.
///
/// ## Example
/// ```rust
/// use deferral::prelude::{Bytes, CancellationToken, Handler, HandlerError, ItemId};
/// use async_trait::async_trait;
///
/// struct SendReminder;
///
/// #[async_trait]
/// impl Handler for SendReminder {
///     async fn handle(
///         &self,
///         item_id: &ItemId,
///         payload: Bytes,
///         cancellation_token: CancellationToken,
///     ) -> Result<(), HandlerError> {
///         if payload.is_empty() {
///             return Err(HandlerError::fatal(anyhow::anyhow!("empty reminder {item_id}")));
///         }
///         tokio::select! {
///             _ = cancellation_token.cancelled() => Err(HandlerError::retryable(anyhow::anyhow!("shutting down"))),
///             _ = async { /* deliver the reminder */ } => Ok(()),
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handle one delivery.
    ///
    /// Should listen for `cancellation_token.cancelled()` to wind down on shutdown; a handler that
    /// does not return within the queue's shutdown timeout is abandoned and its item redelivered
    /// later.
    async fn handle(
        &self,
        item_id: &ItemId,
        payload: Bytes,
        cancellation_token: CancellationToken,
    ) -> Result<(), HandlerError>;
}

#[async_trait]
impl<H> Handler for std::sync::Arc<H>
where
    H: Handler + ?Sized,
{
    async fn handle(
        &self,
        item_id: &ItemId,
        payload: Bytes,
        cancellation_token: CancellationToken,
    ) -> Result<(), HandlerError> {
        (**self).handle(item_id, payload, cancellation_token).await
    }
}

/// Shorthand for a boxed handler trait object.
pub type BoxedHandler = Box<dyn Handler>;

/// Failure reported by a handler.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// Worth another try later. Counts towards the item's attempts.
    #[error("Retryable handler failure: {0:#}")]
    Retryable(#[source] anyhow::Error),

    /// Will never succeed. The item is dead-lettered right away.
    #[error("Fatal handler failure: {0:#}")]
    Fatal(#[source] anyhow::Error),

    /// Payload did not decode into the handler's payload type. Treated as fatal.
    #[error("Failed to deserialize payload: {error}\nPayload sample: {payload_sample}")]
    Deserialization {
        #[source]
        error: serde_json::Error,
        payload_sample: String,
    },
}

impl HandlerError {
    pub fn retryable(error: impl Into<anyhow::Error>) -> Self {
        Self::Retryable(error.into())
    }

    pub fn fatal(error: impl Into<anyhow::Error>) -> Self {
        Self::Fatal(error.into())
    }

    /// Create a deserialization error with a sample (first 500 chars) of the payload.
    pub fn deserialization_error(error: serde_json::Error, payload: &[u8]) -> Self {
        let payload_sample = String::from_utf8_lossy(payload).chars().take(500).collect();

        Self::Deserialization {
            error,
            payload_sample,
        }
    }

    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Retryable(_))
    }

    /// Map to the outcome the dispatcher resolves.
    pub fn into_outcome(self) -> Outcome {
        let message = self.to_string();
        if self.is_fatal() {
            Outcome::FatalFailure(message)
        } else {
            Outcome::RetryableFailure(message)
        }
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(error: anyhow::Error) -> Self {
        Self::Retryable(error)
    }
}

/// Result of one delivery, as resolved by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Remove the item for good.
    Success,
    /// Count an attempt and reschedule with backoff, or exhaust once out of attempts.
    RetryableFailure(String),
    /// Out of attempts: dead-letter, then remove.
    Exhausted(String),
    /// Dead-letter immediately, ignoring attempts.
    FatalFailure(String),
}

impl Outcome {
    pub fn from_result(result: Result<(), HandlerError>) -> Self {
        match result {
            Ok(()) => Self::Success,
            Err(e) => e.into_outcome(),
        }
    }
}

/// Handler built from an async closure over the payload.
pub struct FnHandler<F> {
    f: F,
}

/// Wrap `f` as a [`Handler`].
///
/// ```rust
/// use deferral::prelude::{handler_fn, Bytes, HandlerError};
///
/// let handler = handler_fn(|payload: Bytes| async move {
///     println!("got {} bytes", payload.len());
///     Ok::<(), HandlerError>(())
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Bytes) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Bytes) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(
        &self,
        _item_id: &ItemId,
        payload: Bytes,
        _cancellation_token: CancellationToken,
    ) -> Result<(), HandlerError> {
        (self.f)(payload).await
    }
}

/// A handler whose payload is a JSON-encoded `serde` type.
///
/// Wrap it with [`TypedHandler`] to get a [`Handler`]. Pair with
/// `Enqueuer::enqueue_json` on the producer side.
#[async_trait]
pub trait TypedJob: Send + Sync {
    type Payload: DeserializeOwned + Send;

    async fn handle(
        &self,
        item_id: &ItemId,
        payload: Self::Payload,
        cancellation_token: CancellationToken,
    ) -> Result<(), HandlerError>;
}

/// Object-safe adapter that decodes the payload before calling a [`TypedJob`].
pub struct TypedHandler<J> {
    job: J,
}

impl<J: TypedJob> TypedHandler<J> {
    pub fn new(job: J) -> Self {
        Self { job }
    }

    pub fn boxed(self) -> BoxedHandler
    where
        J: 'static,
    {
        Box::new(self)
    }
}

impl<J: TypedJob> From<J> for TypedHandler<J> {
    fn from(job: J) -> Self {
        Self::new(job)
    }
}

#[async_trait]
impl<J: TypedJob> Handler for TypedHandler<J> {
    #[instrument(skip_all, err, fields(item_id = %item_id, payload_type = %std::any::type_name::<J::Payload>()))]
    async fn handle(
        &self,
        item_id: &ItemId,
        payload: Bytes,
        cancellation_token: CancellationToken,
    ) -> Result<(), HandlerError> {
        let typed_payload: J::Payload = serde_json::from_slice(payload.as_ref())
            .map_err(|error| HandlerError::deserialization_error(error, payload.as_ref()))?;

        self.job
            .handle(item_id, typed_payload, cancellation_token)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    };

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct TestPayload {
        value: String,
    }

    struct MockJob {
        should_fail: Arc<AtomicBool>,
        execution_count: Arc<AtomicU32>,
    }

    impl MockJob {
        fn new() -> Self {
            Self {
                should_fail: Arc::new(AtomicBool::new(false)),
                execution_count: Arc::new(AtomicU32::new(0)),
            }
        }

        fn fail_next(&self) {
            self.should_fail.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl TypedJob for MockJob {
        type Payload = TestPayload;

        async fn handle(
            &self,
            _item_id: &ItemId,
            _payload: Self::Payload,
            _cancellation_token: CancellationToken,
        ) -> Result<(), HandlerError> {
            self.execution_count.fetch_add(1, Ordering::SeqCst);

            if self.should_fail.load(Ordering::SeqCst) {
                Err(anyhow::anyhow!("test error").into())
            } else {
                Ok(())
            }
        }
    }

    fn encode(payload: &TestPayload) -> Bytes {
        Bytes::from(serde_json::to_vec(payload).unwrap())
    }

    #[tokio::test]
    async fn test_typed_handler_deserialize_success() {
        let job = MockJob::new();
        let execution_count = job.execution_count.clone();
        let handler = TypedHandler::new(job);

        let payload = encode(&TestPayload {
            value: "test".to_string(),
        });
        let result = handler
            .handle(&ItemId::generate(), payload, CancellationToken::new())
            .await;

        assert!(result.is_ok());
        assert_eq!(execution_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_typed_handler_deserialize_failure_is_fatal() {
        let handler = TypedHandler::new(MockJob::new());

        let result = handler
            .handle(
                &ItemId::generate(),
                Bytes::from("{invalid json}"),
                CancellationToken::new(),
            )
            .await;

        match result.unwrap_err() {
            error @ HandlerError::Deserialization { .. } => assert!(error.is_fatal()),
            other => panic!("Expected Deserialization error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_typed_handler_wrong_shape() {
        let handler = TypedHandler::new(MockJob::new());

        let result = handler
            .handle(
                &ItemId::generate(),
                Bytes::from(r#"{"wrong_field": "value"}"#),
                CancellationToken::new(),
            )
            .await;

        assert!(matches!(
            result.unwrap_err(),
            HandlerError::Deserialization { .. }
        ));
    }

    #[tokio::test]
    async fn test_typed_handler_execution_failure_is_retryable() {
        let job = MockJob::new();
        job.fail_next();
        let handler = TypedHandler::new(job);

        let payload = encode(&TestPayload {
            value: "fail".to_string(),
        });
        let result = handler
            .handle(&ItemId::generate(), payload, CancellationToken::new())
            .await;

        match result.unwrap_err() {
            HandlerError::Retryable(e) => assert_eq!(e.to_string(), "test error"),
            other => panic!("Expected Retryable, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handler_fn_and_boxing() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let handler: BoxedHandler = Box::new(handler_fn(move |payload: Bytes| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(payload.len() as u32, Ordering::SeqCst);
                Ok(())
            }
        }));

        handler
            .handle(
                &ItemId::generate(),
                Bytes::from_static(b"abc"),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_outcome_from_result() {
        assert_eq!(Outcome::from_result(Ok(())), Outcome::Success);

        let outcome = Outcome::from_result(Err(HandlerError::retryable(anyhow::anyhow!("busy"))));
        assert!(matches!(outcome, Outcome::RetryableFailure(msg) if msg.contains("busy")));

        let outcome = Outcome::from_result(Err(HandlerError::fatal(anyhow::anyhow!("bad input"))));
        assert!(matches!(outcome, Outcome::FatalFailure(msg) if msg.contains("bad input")));
    }

    #[test]
    fn test_deserialization_error_truncates_sample() {
        let large_payload = "x".repeat(1000);
        let serde_error =
            serde_json::from_slice::<serde_json::Value>(large_payload.as_bytes()).unwrap_err();
        let error = HandlerError::deserialization_error(serde_error, large_payload.as_bytes());

        match error {
            HandlerError::Deserialization { payload_sample, .. } => {
                assert_eq!(payload_sample.len(), 500)
            }
            other => panic!("Expected Deserialization error, got {:?}", other),
        }
    }

    #[test]
    fn test_anyhow_converts_to_retryable() {
        let error: HandlerError = anyhow::anyhow!("flaky").into();
        assert!(!error.is_fatal());
    }
}
