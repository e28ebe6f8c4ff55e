//! Redis implementation of the `Store` and `DeadLetterSink` traits from deferral.

pub mod dead_letter;
mod keys;
pub mod store;

pub use dead_letter::RedisDeadLetterSink;
pub use store::RedisStore;

#[cfg(test)]
mod test {
    use crate::{RedisDeadLetterSink, RedisStore};
    use deferral::core::dead_letter::{DeadLetterReason, DeadLetterSink};
    use deferral::memory::MemoryDeadLetterSink;
    use deferral::prelude::*;
    use deferral::store_spec::unique_key;
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    fn redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/0".to_string())
    }

    pub fn setup_logger() {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .try_init();
    }

    deferral::generate_store_spec_tests! {
        backend = "redis",
        #[ignore = "requires a running redis server"]
        setup = RedisStore::connect(&redis_url()).await.unwrap()
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_server_fails() {
        let err = RedisStore::connect("redis://127.0.0.1:1/0").await.err();
        assert!(err.is_some());
    }

    #[tokio::test]
    async fn test_connect_rejects_malformed_url() {
        let err = RedisStore::connect("not a url").await.err().unwrap();
        assert!(err.to_string().contains("Invalid redis url"));
    }

    #[tokio::test]
    #[ignore = "requires a running redis server"]
    async fn test_scores_survive_the_double_round_trip() {
        let store = RedisStore::connect(&redis_url()).await.unwrap();
        let key = unique_key("millis");
        let score = 1_760_000_000_123;
        store.add(&key, "a", score).await.unwrap();

        let due = store.range_by_score(&key, score, score, 1).await.unwrap();
        assert_eq!(due[0].score, score);
        assert!(store
            .compare_and_rescore(&key, "a", score, score + 30_000)
            .await
            .unwrap());
    }

    #[tokio::test]
    #[ignore = "requires a running redis server"]
    async fn test_dead_letter_sink_pushes_json() {
        setup_logger();
        let store = RedisStore::connect(&redis_url()).await.unwrap();
        let sink = RedisDeadLetterSink::new(store.manager.clone()).with_max_len(2);
        let queue = unique_key("dead");

        for attempts in 1..=3 {
            sink.record(DeadLetter {
                item_id: ItemId::generate(),
                queue: queue.clone(),
                payload: Bytes::from_static(b"payload"),
                attempts,
                last_error: "boom".to_string(),
                reason: DeadLetterReason::Exhausted,
                dead_at: deferral::core::Utc::now(),
                metadata: Default::default(),
            })
            .await
            .unwrap();
        }

        let letters = sink.list(&queue).await.unwrap();
        assert_eq!(letters.len(), 2);
        assert_eq!(letters[0].attempts, 3);
        assert_eq!(letters[1].attempts, 2);
    }

    #[tokio::test]
    #[ignore = "requires a running redis server"]
    async fn test_delay_queue_end_to_end() {
        setup_logger();
        let store = Arc::new(RedisStore::connect(&redis_url()).await.unwrap());
        let name = QueueName::new(unique_key("e2e")).unwrap();
        let sink = Arc::new(MemoryDeadLetterSink::new());
        let queue = DelayQueue::new(store, name)
            .with_options(
                QueueOptions::default()
                    .with_poll_interval(StdDuration::from_millis(20))
                    .with_max_attempts(2),
            )
            .with_backoff(|_attempts: u32| StdDuration::ZERO)
            .with_dead_letters(sink.clone());

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        queue.enqueue(Bytes::from_static(b"ok"), Duration::zero()).await.unwrap();
        queue
            .enqueue(Bytes::from_static(b"fail"), Duration::zero())
            .await
            .unwrap();
        queue
            .start(handler_fn(move |payload: Bytes| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(payload.clone());
                    if &payload[..] == b"fail" {
                        Err(HandlerError::retryable(anyhow::anyhow!("always fails")))
                    } else {
                        Ok(())
                    }
                }
            }))
            .await
            .unwrap();

        tokio::time::timeout(StdDuration::from_secs(10), async {
            while queue.pending().await.unwrap() > 0 {
                tokio::time::sleep(StdDuration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        queue.stop(StdDuration::from_secs(5)).await.unwrap();

        let mut delivered = Vec::new();
        while let Ok(payload) = rx.try_recv() {
            delivered.push(payload);
        }
        assert_eq!(delivered.iter().filter(|p| &p[..] == b"ok").count(), 1);
        assert_eq!(delivered.iter().filter(|p| &p[..] == b"fail").count(), 2);

        let letters = sink.letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].payload, Bytes::from_static(b"fail"));
    }
}
