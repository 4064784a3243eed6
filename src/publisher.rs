//! Publishing events to topics, and observer fan-out.
//!
//! [`Publisher::publish`] groups a list of events by mapped partition and
//! stores one batch per partition. Events tagged with an
//! [`Observable`](crate::event::Observable) are also delivered to every
//! observer currently subscribed to `(observableType, observableId,
//! eventName)`: each subscriber gets an [`ObserverNotification`] on the
//! observer topic, partitioned by its own id.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::config::ProducerConfig;
use crate::error::{ProduceError, StoreError};
use crate::event::{EventEnvelope, ObserverNotification};
use crate::partition::{PartitionMapper, default_mapper, map_to_partition};
use crate::producer::Producer;
use crate::store::{LogStore, retry_fixed};

/// One observer subscribed to one event type of one aggregate instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    /// Observing aggregate type.
    pub observer_type: String,
    /// Observing aggregate instance.
    pub observer_id: String,
    /// Observed aggregate type.
    pub observable_type: String,
    /// Observed aggregate instance.
    pub observable_id: String,
    /// Observed event name.
    pub event_type: String,
}

impl Observation {
    fn member(&self) -> String {
        format!("{}:{}", self.observer_type, self.observer_id)
    }
}

/// Key of the set holding the observers of `event_type` on one aggregate
/// instance.
pub fn observers_key(
    prefix: &str,
    observable_type: &str,
    observable_id: &str,
    event_type: &str,
) -> String {
    format!("{prefix}-observers-{observable_type}-{observable_id}-{event_type}")
}

/// Front door for writing events.
pub struct Publisher {
    store: Arc<dyn LogStore>,
    prefix: String,
    producers: HashMap<String, Arc<Producer>>,
    mapper: PartitionMapper,
    observer_topic: Option<String>,
    config: ProducerConfig,
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut topics: Vec<&String> = self.producers.keys().collect();
        topics.sort();
        f.debug_struct("Publisher")
            .field("prefix", &self.prefix)
            .field("topics", &topics)
            .field("observer_topic", &self.observer_topic)
            .finish_non_exhaustive()
    }
}

impl Publisher {
    /// Create a publisher over `producers`, one per topic.
    pub fn new(
        store: Arc<dyn LogStore>,
        prefix: impl Into<String>,
        producers: impl IntoIterator<Item = Arc<Producer>>,
        config: ProducerConfig,
    ) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            producers: producers
                .into_iter()
                .map(|p| (p.topic().name().to_string(), p))
                .collect(),
            mapper: default_mapper(),
            observer_topic: None,
            config,
        }
    }

    /// Override how the partition key is derived from an event.
    pub fn with_mapper(mut self, mapper: PartitionMapper) -> Self {
        self.mapper = mapper;
        self
    }

    /// Send observer notifications to `topic`. Without one, fan-out is
    /// disabled.
    pub fn with_observer_topic(mut self, topic: Option<String>) -> Self {
        self.observer_topic = topic;
        self
    }

    /// The producer for `topic`, if configured.
    pub fn producer(&self, topic: &str) -> Option<&Arc<Producer>> {
        self.producers.get(topic)
    }

    /// Publish `events` to `topic`.
    ///
    /// Events are grouped by partition, keeping their relative order, and
    /// each group is stored as one batch. Observer notifications for
    /// tagged events are published after all groups are stored.
    ///
    /// # Returns
    ///
    /// The write index of the batch stored on each partition.
    ///
    /// # Errors
    ///
    /// Returns [`ProduceError::UnknownTopic`], [`ProduceError::TopicDisabled`]
    /// or [`ProduceError::EmptyBatch`] for invalid input, and whatever
    /// [`Producer::produce`] returns for a failed write.
    pub async fn publish(
        &self,
        topic: &str,
        events: Vec<EventEnvelope>,
    ) -> Result<BTreeMap<u32, u64>, ProduceError> {
        let producer = self.enabled_producer(topic)?;
        if events.is_empty() {
            return Err(ProduceError::EmptyBatch);
        }

        let indices = store_batches(producer, &events, &*self.mapper).await?;

        let notifications = self.notifications(&events).await?;
        if let Some(observer_topic) = &self.observer_topic
            && !notifications.is_empty()
        {
            tracing::debug!(
                topic = %observer_topic,
                notifications = notifications.len(),
                "publishing observer notifications"
            );
            let observer_producer = self.enabled_producer(observer_topic)?;
            // Notifications are always partitioned by observer id.
            let by_observer = |e: &EventEnvelope| e.partition_key.clone();
            store_batches(observer_producer, &notifications, &by_observer).await?;
        }
        Ok(indices)
    }

    fn enabled_producer(&self, topic: &str) -> Result<&Arc<Producer>, ProduceError> {
        let producer = self
            .producers
            .get(topic)
            .ok_or_else(|| ProduceError::UnknownTopic(topic.to_string()))?;
        if producer.topic().is_disabled() {
            return Err(ProduceError::TopicDisabled(topic.to_string()));
        }
        Ok(producer)
    }

    /// Build one notification per subscribed observer of each tagged
    /// event. Empty when no observer topic is configured.
    async fn notifications(
        &self,
        events: &[EventEnvelope],
    ) -> Result<Vec<EventEnvelope>, ProduceError> {
        let mut notifications = Vec::new();
        if self.observer_topic.is_none() {
            return Ok(notifications);
        }
        for event in events {
            let Some(observable) = &event.observable else {
                continue;
            };
            let key = observers_key(
                &self.prefix,
                &observable.observable_type,
                &observable.observable_id,
                &event.name,
            );
            let store = &*self.store;
            let members = retry_fixed(
                self.config.attempts,
                self.config.retry_delay,
                "SMEMBERS",
                || store.set_members(&key),
            )
            .await
            .map_err(|source| ProduceError::Observers {
                key: key.clone(),
                source,
            })?;

            for member in members {
                let Some((observer_type, observer_id)) = member.split_once(':') else {
                    tracing::warn!(key = %key, member = %member, "malformed observer entry");
                    continue;
                };
                notifications.push(
                    ObserverNotification {
                        observer_type: observer_type.to_string(),
                        observer_id: observer_id.to_string(),
                        event: event.clone(),
                    }
                    .into_envelope(),
                );
            }
        }
        Ok(notifications)
    }

    /// Subscribe an observer. Takes effect for events published after the
    /// call returns.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the subscription set cannot be written.
    pub async fn observe(&self, observation: &Observation) -> Result<(), StoreError> {
        self.store
            .set_add(&self.observation_key(observation), &observation.member())
            .await
    }

    /// Remove an observer subscription.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the subscription set cannot be written.
    pub async fn unobserve(&self, observation: &Observation) -> Result<(), StoreError> {
        self.store
            .set_remove(&self.observation_key(observation), &observation.member())
            .await
    }

    fn observation_key(&self, observation: &Observation) -> String {
        observers_key(
            &self.prefix,
            &observation.observable_type,
            &observation.observable_id,
            &observation.event_type,
        )
    }
}

/// Group `events` by mapped partition, keeping their relative order, and
/// store each group as one batch.
async fn store_batches(
    producer: &Producer,
    events: &[EventEnvelope],
    mapper: &(dyn Fn(&EventEnvelope) -> String + Send + Sync),
) -> Result<BTreeMap<u32, u64>, ProduceError> {
    let partitions = producer.topic().partitions();
    let mut groups: BTreeMap<u32, Vec<EventEnvelope>> = BTreeMap::new();
    for event in events {
        let Some(partition) = map_to_partition(&mapper(event), partitions) else {
            return Err(ProduceError::PartitionOutOfRange {
                partition: 0,
                partitions,
            });
        };
        groups.entry(partition).or_default().push(event.clone());
    }

    let mut indices = BTreeMap::new();
    for (partition, group) in groups {
        let index = producer.produce(partition, &group).await?;
        indices.insert(partition, index);
    }
    Ok(indices)
}
