//! Binding of consumers to a processor pool through one scheduler.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::task::JoinSet;

use crate::consumer::Consumer;
use crate::error::{ConfigError, RouteError};
use crate::event::RoutedEvent;
use crate::processor::Processor;
use crate::scheduler::{Completion, Scheduler};

/// Accepts resolved events from a [`Consumer`] for processing.
pub trait EventRouter: Send + Sync + 'static {
    /// Queue `event` and return a handle that resolves once it has been
    /// processed or rejected.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::Disposed`] once the router has been disposed.
    fn route(&self, event: RoutedEvent) -> Result<Completion, RouteError>;
}

/// Routes events from a set of consumers onto an equally sized set of
/// processors.
pub struct Broker {
    name: String,
    consumers: Vec<Arc<Consumer>>,
    processors: Vec<Arc<Processor>>,
    scheduler: Arc<Scheduler>,
    disposed: AtomicBool,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("name", &self.name)
            .field("consumers", &self.consumers.len())
            .field("processors", &self.processors.len())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl Broker {
    /// Bind `consumers` to `processors`. The scheduler is built over the
    /// processors.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::CardinalityMismatch`] unless there is at least
    /// one consumer and exactly one processor per consumer.
    pub fn new(
        name: impl Into<String>,
        consumers: Vec<Arc<Consumer>>,
        processors: Vec<Arc<Processor>>,
    ) -> Result<Arc<Self>, ConfigError> {
        if consumers.is_empty() || consumers.len() != processors.len() {
            return Err(ConfigError::CardinalityMismatch {
                consumers: consumers.len(),
                processors: processors.len(),
            });
        }
        let name = name.into();
        let scheduler = Scheduler::new(name.clone(), processors.clone());
        Ok(Arc::new(Self {
            name,
            consumers,
            processors,
            scheduler,
            disposed: AtomicBool::new(false),
        }))
    }

    /// Broker name, for logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The bound consumers.
    pub fn consumers(&self) -> &[Arc<Consumer>] {
        &self.consumers
    }

    /// The scheduler work is routed through.
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Returns `true` once [`dispose`](Broker::dispose) has been called.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Start the scheduler sweep and every consumer's poll loop, with this
    /// broker as their router.
    pub async fn initialize(self: &Arc<Self>) {
        self.scheduler.start().await;
        let router: Arc<dyn EventRouter> = Arc::clone(self) as Arc<dyn EventRouter>;
        for consumer in &self.consumers {
            consumer.start(Arc::clone(&router)).await;
        }
        tracing::info!(
            broker = %self.name,
            consumers = self.consumers.len(),
            "broker initialized"
        );
    }

    /// Dispose every consumer, processor and the scheduler concurrently.
    ///
    /// Disposal never fails; a panicking disposal task is logged. Calling
    /// `dispose` more than once is safe.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut tasks = JoinSet::new();
        for consumer in &self.consumers {
            let consumer = Arc::clone(consumer);
            tasks.spawn(async move { consumer.dispose().await });
        }
        for processor in &self.processors {
            let processor = Arc::clone(processor);
            tasks.spawn(async move { processor.dispose().await });
        }
        let scheduler = Arc::clone(&self.scheduler);
        tasks.spawn(async move { scheduler.dispose().await });

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                tracing::error!(broker = %self.name, error = %e, "disposal task failed");
            }
        }
        tracing::info!(broker = %self.name, "broker disposed");
    }
}

impl EventRouter for Broker {
    fn route(&self, event: RoutedEvent) -> Result<Completion, RouteError> {
        if self.is_disposed() {
            return Err(RouteError::Disposed);
        }
        self.scheduler.schedule(event)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::{ConsumerConfig, ProducerConfig, RetryPolicy};
    use crate::consumer::ConsumerState;
    use crate::event::EventEnvelope;
    use crate::processor::EventProcessor;
    use crate::processor::test_support::{flaky, routed};
    use crate::producer::Producer;
    use crate::registration::{HandlerRegistry, RegistrationKey};
    use crate::store::MemoryLogStore;
    use crate::topic::Topic;

    fn consumers(store: &MemoryLogStore, topic: &Topic) -> Vec<Arc<Consumer>> {
        let registry = Arc::new(
            HandlerRegistry::builder()
                .remote(RegistrationKey::Event("A".to_string()), "AHandler")
                .build()
                .expect("build should succeed"),
        );
        (0..topic.partitions())
            .map(|p| {
                Arc::new(Consumer::new(
                    Arc::new(store.clone()),
                    "app",
                    topic.clone(),
                    p,
                    Arc::clone(&registry),
                    ConsumerConfig {
                        idle_jitter: Duration::from_millis(5)..Duration::from_millis(10),
                        ..ConsumerConfig::default()
                    },
                ))
            })
            .collect()
    }

    fn processors(inner: Arc<dyn EventProcessor>, count: u32) -> Vec<Arc<Processor>> {
        (0..count)
            .map(|i| {
                Arc::new(Processor::new(
                    format!("p{i}"),
                    Arc::clone(&inner),
                    RetryPolicy::default(),
                ))
            })
            .collect()
    }

    #[test]
    fn cardinality_must_match() {
        let store = MemoryLogStore::new();
        let topic = Topic::builder("orders").partitions(2).build().expect("topic");
        let err = Broker::new("b", consumers(&store, &topic), processors(flaky(0), 1)).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::CardinalityMismatch {
                consumers: 2,
                processors: 1
            }
        ));
        assert!(Broker::new("b", Vec::new(), Vec::new()).is_err());
    }

    #[tokio::test]
    async fn consumed_events_reach_processors() {
        let store = MemoryLogStore::new();
        let topic = Topic::builder("orders").partitions(2).build().expect("topic");
        let inner = flaky(0);
        let broker = Broker::new("b", consumers(&store, &topic), processors(inner.clone(), 2))
            .expect("broker");
        broker.initialize().await;

        let producer = Producer::new(
            Arc::new(store.clone()),
            "app",
            topic,
            ProducerConfig::default(),
        );
        producer
            .produce(1, &[EventEnvelope::new("A", "k")])
            .await
            .expect("produce should succeed");

        tokio::time::timeout(Duration::from_secs(2), async {
            while inner.calls.load(std::sync::atomic::Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("event should be processed");

        broker.dispose().await;
        for consumer in broker.consumers() {
            assert_eq!(consumer.state(), ConsumerState::Disposed);
        }
    }

    #[tokio::test]
    async fn disposed_broker_rejects_routing() {
        let store = MemoryLogStore::new();
        let topic = Topic::builder("orders").partitions(1).build().expect("topic");
        let broker =
            Broker::new("b", consumers(&store, &topic), processors(flaky(0), 1)).expect("broker");
        broker.dispose().await;
        broker.dispose().await;
        assert!(broker.is_disposed());
        assert!(broker.scheduler().is_disposed());
        assert!(matches!(
            broker.route(routed("A", "e1", "k")),
            Err(RouteError::Disposed)
        ));
    }
}
