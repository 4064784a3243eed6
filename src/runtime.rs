//! Bootstrap: from a builder to a running set of brokers.
//!
//! [`EdaRuntimeBuilder`] collects topics, handler registrations, processor
//! kinds and tuning, validates them, connects the store, and produces an
//! immutable [`EdaRuntime`]. Because [`build`](EdaRuntimeBuilder::build)
//! consumes the builder, nothing can be reconfigured after bootstrap.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::task::JoinSet;

use crate::broker::Broker;
use crate::config::{ConsumerConfig, MonitorConfig, ProducerConfig, ProxyConfig, RetryPolicy};
use crate::consumer::Consumer;
use crate::error::{ConfigError, ProduceError, StoreError};
use crate::event::EventEnvelope;
use crate::monitor::Monitor;
use crate::partition::{PartitionMapper, default_mapper};
use crate::processor::{
    EventProcessor, GrpcProcessor, HttpProcessor, LambdaProcessor, LocalProcessor, Processor,
};
use crate::producer::Producer;
use crate::publisher::{Observation, Publisher};
use crate::registration::HandlerRegistry;
use crate::store::{ChangeFeed, LogStore, RedisLogStore};
use crate::topic::{PartitionKeys, Topic};

/// Where the events of a topic are processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessorKind {
    /// In process, by the registered handler factories.
    Local,
    /// By `POST {base_url}/process`.
    Http(String),
    /// By the `Process` RPC at the given endpoint.
    Grpc(String),
    /// By invoking the named function.
    Lambda(String),
}

/// Collects runtime configuration.
///
/// # Examples
///
/// ```no_run
/// use eda_runtime::{EdaRuntime, HandlerRegistry, Topic};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let runtime = EdaRuntime::builder("shop")
///     .redis_url("redis://127.0.0.1:6379")
///     .topic(Topic::builder("orders").partitions(4).build()?)
///     .handlers(HandlerRegistry::builder().build()?)
///     .build()
///     .await?;
/// runtime.start().await?;
/// # Ok(())
/// # }
/// ```
pub struct EdaRuntimeBuilder {
    prefix: String,
    store: Option<(Arc<dyn LogStore>, Arc<dyn ChangeFeed>)>,
    redis_url: Option<String>,
    topics: Vec<Topic>,
    registry: HandlerRegistry,
    default_processor: ProcessorKind,
    topic_processors: HashMap<String, ProcessorKind>,
    consumer_config: ConsumerConfig,
    producer_config: ProducerConfig,
    retry_policy: RetryPolicy,
    proxy_config: ProxyConfig,
    monitor_config: MonitorConfig,
    mapper: Option<PartitionMapper>,
    observer_topic: Option<String>,
    dead_letter_path: Option<PathBuf>,
}

impl EdaRuntimeBuilder {
    /// Create a builder whose store keys all start with `prefix`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            store: None,
            redis_url: None,
            topics: Vec::new(),
            registry: HandlerRegistry::default(),
            default_processor: ProcessorKind::Local,
            topic_processors: HashMap::new(),
            consumer_config: ConsumerConfig::default(),
            producer_config: ProducerConfig::default(),
            retry_policy: RetryPolicy::default(),
            proxy_config: ProxyConfig::default(),
            monitor_config: MonitorConfig::default(),
            mapper: None,
            observer_topic: None,
            dead_letter_path: None,
        }
    }

    /// Use `store` for both data operations and change notifications.
    ///
    /// Takes precedence over [`redis_url`](EdaRuntimeBuilder::redis_url).
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn store<S>(mut self, store: S) -> Self
    where
        S: LogStore + ChangeFeed,
    {
        let store = Arc::new(store);
        let log: Arc<dyn LogStore> = store.clone();
        let feed: Arc<dyn ChangeFeed> = store;
        self.store = Some((log, feed));
        self
    }

    /// Connect to the Redis server at `url` on
    /// [`build`](EdaRuntimeBuilder::build).
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    /// Add a topic.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn topic(mut self, topic: Topic) -> Self {
        self.topics.push(topic);
        self
    }

    /// Set the handler registrations consumers resolve events against.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn handlers(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Set where topics without an explicit processor kind are processed.
    /// Defaults to [`ProcessorKind::Local`].
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn processor(mut self, kind: ProcessorKind) -> Self {
        self.default_processor = kind;
        self
    }

    /// Set where the events of `topic` are processed.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn topic_processor(mut self, topic: impl Into<String>, kind: ProcessorKind) -> Self {
        self.topic_processors.insert(topic.into(), kind);
        self
    }

    /// Set the consumer poll-loop configuration.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn consumer_config(mut self, config: ConsumerConfig) -> Self {
        self.consumer_config = config;
        self
    }

    /// Set the producer retry configuration.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn producer_config(mut self, config: ProducerConfig) -> Self {
        self.producer_config = config;
        self
    }

    /// Set the processor retry policy.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Set timeouts and credentials for remote processors.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn proxy_config(mut self, config: ProxyConfig) -> Self {
        self.proxy_config = config;
        self
    }

    /// Set the change-notification reconnect backoff.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn monitor_config(mut self, config: MonitorConfig) -> Self {
        self.monitor_config = config;
        self
    }

    /// Derive partition keys with `mapper` instead of each event's
    /// `partitionKey`. The derived key picks the partition on publish and
    /// is the key the scheduler serializes on.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn partition_mapper(mut self, mapper: PartitionMapper) -> Self {
        self.mapper = Some(mapper);
        self
    }

    /// Publish observer notifications on `topic`.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn observer_topic(mut self, topic: impl Into<String>) -> Self {
        self.observer_topic = Some(topic.into());
        self
    }

    /// Append events that fail every retry to the JSONL file at `path`.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn dead_letter_path(mut self, path: impl AsRef<Path>) -> Self {
        self.dead_letter_path = Some(path.as_ref().to_owned());
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for topic in &self.topics {
            if !names.insert(topic.name()) {
                return Err(ConfigError::DuplicateTopic(topic.name().to_string()));
            }
        }
        for topic in self
            .topic_processors
            .keys()
            .chain(self.observer_topic.as_ref())
        {
            if !names.contains(topic.as_str()) {
                return Err(ConfigError::UnknownTopic(topic.clone()));
            }
        }
        if self.consumer_config.max_batch == 0 {
            return Err(ConfigError::Invalid("max_batch must be at least 1".to_string()));
        }
        if self.consumer_config.tracked_low_water >= self.consumer_config.tracked_high_water {
            return Err(ConfigError::Invalid(
                "tracked_low_water must be below tracked_high_water".to_string(),
            ));
        }
        if self.retry_policy.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    async fn event_processor(
        &self,
        kind: &ProcessorKind,
    ) -> Result<Arc<dyn EventProcessor>, ConfigError> {
        let processor: Arc<dyn EventProcessor> = match kind {
            ProcessorKind::Local => Arc::new(LocalProcessor::new()),
            ProcessorKind::Http(url) => {
                Arc::new(HttpProcessor::new(url.clone(), &self.proxy_config)?)
            }
            ProcessorKind::Grpc(url) => {
                Arc::new(GrpcProcessor::new(url.clone(), &self.proxy_config)?)
            }
            ProcessorKind::Lambda(function) => {
                Arc::new(LambdaProcessor::new(function.clone(), &self.proxy_config).await)
            }
        };
        Ok(processor)
    }

    /// Validate the configuration, connect the store, and wire producers,
    /// consumers, processors and brokers. Nothing is started.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for inconsistent configuration, a missing or
    /// unreachable store, or a remote processor client that cannot be
    /// built.
    pub async fn build(self) -> Result<EdaRuntime, ConfigError> {
        self.validate()?;

        let (store, feed) = match (&self.store, &self.redis_url) {
            (Some((store, feed)), _) => (Arc::clone(store), Arc::clone(feed)),
            (None, Some(url)) => {
                let redis = Arc::new(RedisLogStore::connect(url).await?);
                let log: Arc<dyn LogStore> = redis.clone();
                let feed: Arc<dyn ChangeFeed> = redis;
                (log, feed)
            }
            (None, None) => return Err(ConfigError::MissingStore),
        };

        let producers: Vec<Arc<Producer>> = self
            .topics
            .iter()
            .map(|topic| {
                Arc::new(Producer::new(
                    Arc::clone(&store),
                    &self.prefix,
                    topic.clone(),
                    self.producer_config.clone(),
                ))
            })
            .collect();
        // Publishers partition and consumers serialize on the same key.
        let mapper = self.mapper.clone().unwrap_or_else(default_mapper);
        let publisher = Publisher::new(
            Arc::clone(&store),
            self.prefix.clone(),
            producers,
            self.producer_config.clone(),
        )
        .with_observer_topic(self.observer_topic.clone())
        .with_mapper(Arc::clone(&mapper));

        let monitor = Arc::new(Monitor::new(feed, self.monitor_config.clone()));
        let registry = Arc::new(self.registry.clone());
        let mut brokers = Vec::new();

        for topic in &self.topics {
            let partitions = topic.consumed_partitions();
            if partitions.is_empty() {
                continue;
            }
            let kind = self
                .topic_processors
                .get(topic.name())
                .unwrap_or(&self.default_processor);
            let inner = self.event_processor(kind).await?;

            let mut consumers = Vec::with_capacity(partitions.len());
            let mut processors = Vec::with_capacity(partitions.len());
            for partition in partitions {
                let keys = PartitionKeys::new(&self.prefix, topic.name(), partition);
                let wake = monitor.register(keys.changed_channel());
                consumers.push(Arc::new(
                    Consumer::new(
                        Arc::clone(&store),
                        &self.prefix,
                        topic.clone(),
                        partition,
                        Arc::clone(&registry),
                        self.consumer_config.clone(),
                    )
                    .with_wake(wake)
                    .with_mapper(Arc::clone(&mapper)),
                ));
                processors.push(Arc::new(
                    Processor::new(
                        format!("{}-{partition}", topic.name()),
                        Arc::clone(&inner),
                        self.retry_policy.clone(),
                    )
                    .with_dead_letter_path(self.dead_letter_path.clone()),
                ));
            }
            brokers.push(Broker::new(topic.name(), consumers, processors)?);
        }

        tracing::info!(
            prefix = %self.prefix,
            topics = self.topics.len(),
            brokers = brokers.len(),
            handlers = registry.len(),
            "runtime built"
        );
        Ok(EdaRuntime {
            publisher,
            brokers,
            monitor,
            started: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        })
    }
}

/// A configured runtime: publish events, and once started, consume them.
pub struct EdaRuntime {
    publisher: Publisher,
    brokers: Vec<Arc<Broker>>,
    monitor: Arc<Monitor>,
    started: AtomicBool,
    disposed: AtomicBool,
}

impl std::fmt::Debug for EdaRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EdaRuntime")
            .field("publisher", &self.publisher)
            .field("brokers", &self.brokers)
            .field("started", &self.started.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl EdaRuntime {
    /// Start collecting configuration.
    pub fn builder(prefix: impl Into<String>) -> EdaRuntimeBuilder {
        EdaRuntimeBuilder::new(prefix)
    }

    /// Start the change monitor and every broker.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::AlreadyStarted`] on a second call.
    pub async fn start(&self) -> Result<(), ConfigError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ConfigError::AlreadyStarted);
        }
        self.monitor.start().await;
        for broker in &self.brokers {
            broker.initialize().await;
        }
        Ok(())
    }

    /// Publish `events` to `topic`. See [`Publisher::publish`].
    ///
    /// # Errors
    ///
    /// Returns [`ProduceError`] if the events cannot be stored.
    pub async fn publish(
        &self,
        topic: &str,
        events: Vec<EventEnvelope>,
    ) -> Result<BTreeMap<u32, u64>, ProduceError> {
        self.publisher.publish(topic, events).await
    }

    /// Subscribe an observer. See [`Publisher::observe`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the subscription cannot be stored.
    pub async fn observe(&self, observation: &Observation) -> Result<(), StoreError> {
        self.publisher.observe(observation).await
    }

    /// Remove an observer subscription.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the subscription cannot be removed.
    pub async fn unobserve(&self, observation: &Observation) -> Result<(), StoreError> {
        self.publisher.unobserve(observation).await
    }

    /// Make every consumer of `topic` forget its tracked ids, by writing
    /// the control event to each partition.
    ///
    /// # Errors
    ///
    /// Returns [`ProduceError::UnknownTopic`] or the first failed write.
    pub async fn clear_tracked_keys(&self, topic: &str) -> Result<(), ProduceError> {
        let producer = self
            .publisher
            .producer(topic)
            .ok_or_else(|| ProduceError::UnknownTopic(topic.to_string()))?;
        for partition in 0..producer.topic().partitions() {
            let control = EventEnvelope::clear_tracked_keys(format!("{topic}-{partition}"));
            producer.produce(partition, &[control]).await?;
        }
        Ok(())
    }

    /// The publisher.
    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    /// One broker per consumed topic.
    pub fn brokers(&self) -> &[Arc<Broker>] {
        &self.brokers
    }

    /// Dispose every broker concurrently, then stop the monitor.
    ///
    /// Calling `dispose` more than once is safe.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut tasks = JoinSet::new();
        for broker in &self.brokers {
            let broker = Arc::clone(broker);
            tasks.spawn(async move { broker.dispose().await });
        }
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "broker disposal task failed");
            }
        }
        self.monitor.dispose().await;
        tracing::info!("runtime disposed");
    }
}
