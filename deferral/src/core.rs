//! Implementation agnostic traits and types for delay queues, plus re-exports of 3rd party types
//! used in the public interface.

pub use uuid::Uuid;

/// An alias for `chrono::DateTime<chrono::Utc>`
pub type DateTime = chrono::DateTime<chrono::Utc>;
pub use bytes::Bytes;
pub use chrono::{Duration, Utc};
pub use serde_json;
pub use tokio_util::sync::CancellationToken;

pub mod backoff;
pub mod dead_letter;
pub mod handler;
pub mod item;
pub mod options;
pub mod queue;
pub mod score_clock;
pub mod store;
