//! Appending batches to a topic's partition logs.

use std::sync::Arc;

use crate::codec::encode_batch;
use crate::config::ProducerConfig;
use crate::error::ProduceError;
use crate::event::EventEnvelope;
use crate::store::{LogStore, retry_fixed};
use crate::topic::{PartitionKeys, Topic};

/// Writes batches for every partition of one topic.
///
/// Each partition has its own local mutex held from the index increment
/// through the entry write, so two `produce` calls from this process can
/// never store their entries out of index order.
pub struct Producer {
    store: Arc<dyn LogStore>,
    topic: Topic,
    keys: Vec<PartitionKeys>,
    locks: Vec<tokio::sync::Mutex<()>>,
    config: ProducerConfig,
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("topic", &self.topic.name())
            .field("partitions", &self.keys.len())
            .finish_non_exhaustive()
    }
}

impl Producer {
    /// Create a producer for `topic`, naming keys under `prefix`.
    pub fn new(
        store: Arc<dyn LogStore>,
        prefix: &str,
        topic: Topic,
        config: ProducerConfig,
    ) -> Self {
        let keys = (0..topic.partitions())
            .map(|p| PartitionKeys::new(prefix, topic.name(), p))
            .collect();
        let locks = (0..topic.partitions())
            .map(|_| tokio::sync::Mutex::new(()))
            .collect();
        Self {
            store,
            topic,
            keys,
            locks,
            config,
        }
    }

    /// The topic this producer writes to.
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Append `events` as one entry on `partition`.
    ///
    /// Acquires the next write index with `INCRBY 1`, stores the encoded
    /// batch under it with the topic's TTL, then publishes a change
    /// notification. Both store steps are retried with a fixed delay; the
    /// notification is best effort.
    ///
    /// # Arguments
    ///
    /// * `partition` - Target partition, `0..topic.partitions()`.
    /// * `events` - Non-empty batch, stored in the given order.
    ///
    /// # Returns
    ///
    /// The write index the batch was stored at.
    ///
    /// # Errors
    ///
    /// Returns [`ProduceError::EmptyBatch`] or
    /// [`ProduceError::PartitionOutOfRange`] for invalid input,
    /// [`ProduceError::Codec`] if the batch cannot be encoded, and
    /// [`ProduceError::Store`] once the retry budget is exhausted.
    pub async fn produce(
        &self,
        partition: u32,
        events: &[EventEnvelope],
    ) -> Result<u64, ProduceError> {
        if events.is_empty() {
            return Err(ProduceError::EmptyBatch);
        }
        let (Some(keys), Some(lock)) = (
            self.keys.get(partition as usize),
            self.locks.get(partition as usize),
        ) else {
            return Err(ProduceError::PartitionOutOfRange {
                partition,
                partitions: self.topic.partitions(),
            });
        };

        let payload = encode_batch(events, self.config.compress)?;
        let store = &*self.store;
        let write_key = keys.write_index();

        let index = {
            let _guard = lock.lock().await;

            let index = retry_fixed(
                self.config.attempts,
                self.config.retry_delay,
                "INCRBY",
                || store.incr_by(&write_key, 1),
            )
            .await
            .map_err(|e| self.store_failure(partition, None, e))?;

            let entry_key = keys.entry(index);
            let ttl = self.topic.ttl_seconds();
            retry_fixed(
                self.config.attempts,
                self.config.retry_delay,
                "SETEX",
                || store.set_entry(&entry_key, &payload, ttl),
            )
            .await
            .map_err(|e| self.store_failure(partition, Some(index), e))?;

            index
        };

        if let Err(e) = store
            .publish(&keys.changed_channel(), &index.to_string())
            .await
        {
            tracing::warn!(
                topic = %self.topic.name(),
                partition,
                index,
                error = %e,
                "failed to publish change notification"
            );
        }

        tracing::debug!(
            topic = %self.topic.name(),
            partition,
            index,
            events = events.len(),
            "produced batch"
        );
        Ok(index)
    }

    fn store_failure(
        &self,
        partition: u32,
        index: Option<u64>,
        source: crate::error::StoreError,
    ) -> ProduceError {
        tracing::error!(
            topic = %self.topic.name(),
            partition,
            index = ?index,
            error = %source,
            "produce failed after exhausting retries"
        );
        ProduceError::Store {
            topic: self.topic.name().to_string(),
            partition,
            index,
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::codec::decode_batch;
    use crate::store::MemoryLogStore;

    fn producer(store: &MemoryLogStore, config: ProducerConfig) -> Producer {
        let topic = Topic::builder("orders")
            .partitions(4)
            .ttl_minutes(10)
            .build()
            .expect("valid topic");
        Producer::new(Arc::new(store.clone()), "app", topic, config)
    }

    fn fast_config() -> ProducerConfig {
        ProducerConfig {
            attempts: 3,
            retry_delay: Duration::from_millis(1),
            compress: true,
        }
    }

    #[tokio::test]
    async fn produce_assigns_contiguous_indices() {
        let store = MemoryLogStore::new();
        let producer = producer(&store, fast_config());
        let a = producer
            .produce(1, &[EventEnvelope::new("A", "k")])
            .await
            .expect("produce should succeed");
        let b = producer
            .produce(1, &[EventEnvelope::new("B", "k")])
            .await
            .expect("produce should succeed");
        assert_eq!((a, b), (1, 2));

        let keys = PartitionKeys::new("app", "orders", 1);
        assert_eq!(store.ttl(&keys.entry(1)), Some(600));
        let batch = decode_batch(&store.raw(&keys.entry(2)).expect("entry stored"))
            .expect("decode should succeed");
        assert_eq!(batch[0]["name"], "B");
    }

    #[tokio::test]
    async fn produce_rejects_empty_and_out_of_range() {
        let store = MemoryLogStore::new();
        let producer = producer(&store, fast_config());
        assert!(matches!(
            producer.produce(0, &[]).await,
            Err(ProduceError::EmptyBatch)
        ));
        assert!(matches!(
            producer.produce(4, &[EventEnvelope::new("A", "k")]).await,
            Err(ProduceError::PartitionOutOfRange { partition: 4, .. })
        ));
    }

    #[tokio::test]
    async fn produce_retries_transient_failures() {
        let store = MemoryLogStore::new();
        let producer = producer(&store, fast_config());
        store.fail_next_operations(2);
        let index = producer
            .produce(0, &[EventEnvelope::new("A", "k")])
            .await
            .expect("produce should succeed within the retry budget");
        assert_eq!(index, 1);
    }

    #[tokio::test]
    async fn produce_fails_after_budget() {
        let store = MemoryLogStore::new();
        let producer = producer(&store, fast_config());
        store.fail_next_operations(3);
        let err = producer
            .produce(2, &[EventEnvelope::new("A", "k")])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProduceError::Store {
                partition: 2,
                index: None,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn concurrent_produces_store_every_index() {
        let store = MemoryLogStore::new();
        let producer = Arc::new(producer(&store, fast_config()));
        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..20 {
            let producer = Arc::clone(&producer);
            tasks.spawn(async move {
                producer
                    .produce(3, &[EventEnvelope::new(format!("E{i}"), "k")])
                    .await
                    .expect("produce should succeed")
            });
        }
        let mut indices = Vec::new();
        while let Some(result) = tasks.join_next().await {
            indices.push(result.expect("task should not panic"));
        }
        indices.sort_unstable();
        assert_eq!(indices, (1..=20).collect::<Vec<u64>>());
        let keys = PartitionKeys::new("app", "orders", 3);
        for index in 1..=20 {
            assert!(store.raw(&keys.entry(index)).is_some());
        }
    }
}
