//! Redis key layout of a queue.
//!
//! A queue named `q` owns three keys:
//!
//! | key         | type       | content                              |
//! |-------------|------------|--------------------------------------|
//! | `q`         | sorted set | item ids scored by due time (ms)     |
//! | `q:records` | hash       | item id to JSON-encoded item record  |
//! | `q:dead`    | list       | JSON-encoded dead letters, newest first |
//!
//! `QueueName` refuses names with these suffixes, so two queues never share a key.

use deferral::core::score_clock::{Score, MIN_SCORE};

pub(crate) fn records(key: &str) -> String {
    format!("{key}:records")
}

pub(crate) fn dead_letters(queue: &str) -> String {
    format!("{queue}:dead")
}

/// Score bound as a `ZRANGEBYSCORE` argument; the extremes map to the infinities.
pub(crate) fn bound(score: Score) -> String {
    match score {
        MIN_SCORE => "-inf".to_string(),
        Score::MAX => "+inf".to_string(),
        score => score.to_string(),
    }
}
