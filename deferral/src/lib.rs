#![doc = include_str!("../README.md")]

pub mod core;

/// In-process store and dead-letter sink.
pub mod memory;

/// Shared test specifications for store implementations.
///
/// These test functions ensure consistent behavior across all `Store` implementations
/// (in-memory, Redis, etc.). Backend tests should expand `generate_store_spec_tests!` with their
/// store instance.
#[doc(hidden)]
pub mod store_spec;

#[doc(hidden)]
pub use paste;

/// Default consumer: poller, claim guard, dispatcher and the `DelayQueue` facade on top.
#[cfg(feature = "runner")]
pub mod runner {
    pub mod claim_guard;
    pub mod delay_queue;
    pub mod dispatcher;
    pub mod enqueuer;
    pub mod poller;
}

/// Re-exports to simplify importing this crate types.
pub mod prelude {
    pub use super::core::{
        backoff::{Backoff, ExponentialBackoff},
        dead_letter::{DeadLetter, DeadLetterReason, DeadLetterSink},
        handler::{handler_fn, Handler, HandlerError, Outcome, TypedHandler, TypedJob},
        item::{Item, ItemId},
        options::QueueOptions,
        queue::{ConfigError, QueueError, QueueName},
        store::{Store, StoreError},
        Bytes, CancellationToken, Duration,
    };
    #[cfg(feature = "runner")]
    pub use super::runner::{
        delay_queue::{DelayQueue, QueueState, StopReport},
        dispatcher::Resolution,
        enqueuer::{EnqueueOptions, Enqueuer},
    };
    pub use serde::{Deserialize, Serialize};
}
