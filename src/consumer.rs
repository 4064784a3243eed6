//! The per-partition poll loop.
//!
//! A [`Consumer`] tails one partition of one topic for one consumer group.
//! Each poll step reads the write and read indices in one round-trip,
//! fetches the window of entries between them in another, routes every
//! event through the [`EventRouter`], waits for all of them to complete,
//! and only then persists the newly tracked ids and advances the read
//! index. A crash anywhere before the advance redelivers the whole window;
//! the tracked-id set makes that redelivery idempotent.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Notify;
use tracing::Instrument;

use crate::broker::EventRouter;
use crate::codec::decode_batch;
use crate::config::ConsumerConfig;
use crate::error::{PollError, ProcessError};
use crate::event::{EventEnvelope, ObserverNotification, RoutedEvent};
use crate::partition::{PartitionMapper, default_mapper};
use crate::registration::HandlerRegistry;
use crate::scheduler::Completion;
use crate::store::{LogStore, retry_fixed};
use crate::topic::{PartitionKeys, Topic};
use crate::tracked::TrackedIds;

/// Where a consumer's poll loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Not started, or sleeping until new entries arrive.
    Idle,
    /// Reading indices and entries.
    Polling,
    /// Waiting for the routed events of a window to complete.
    Draining,
    /// Stopped for good.
    Disposed,
}

/// Result of one poll step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollOutcome {
    /// The read index has caught up with the write index.
    CaughtUp,
    /// The read index moved to `read_index`.
    Advanced {
        /// New read index.
        read_index: u64,
        /// Events routed from the window.
        routed: usize,
    },
}

/// Polls one topic partition for one consumer group.
pub struct Consumer {
    store: Arc<dyn LogStore>,
    topic: Topic,
    partition: u32,
    keys: PartitionKeys,
    consumer_id: String,
    registry: Arc<HandlerRegistry>,
    config: ConsumerConfig,
    mapper: PartitionMapper,
    wake: Arc<Notify>,
    state_tx: tokio::sync::watch::Sender<ConsumerState>,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("consumer_id", &self.consumer_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Consumer {
    /// Create a consumer for `partition` of `topic`, naming keys under
    /// `prefix`.
    pub fn new(
        store: Arc<dyn LogStore>,
        prefix: &str,
        topic: Topic,
        partition: u32,
        registry: Arc<HandlerRegistry>,
        config: ConsumerConfig,
    ) -> Self {
        let keys = PartitionKeys::new(prefix, topic.name(), partition);
        let consumer_id = keys.consumer_id(&config.consumer_group);
        let (state_tx, _) = tokio::sync::watch::channel(ConsumerState::Idle);
        let (shutdown_tx, _) = tokio::sync::watch::channel(false);
        Self {
            store,
            topic,
            partition,
            keys,
            consumer_id,
            registry,
            config,
            mapper: default_mapper(),
            wake: Arc::new(Notify::new()),
            state_tx,
            shutdown_tx,
            task: tokio::sync::Mutex::new(None),
        }
    }

    /// Use `wake` as the signal that cuts idle sleeps short, typically one
    /// obtained from [`Monitor::register`](crate::Monitor::register).
    pub fn with_wake(mut self, wake: Arc<Notify>) -> Self {
        self.wake = wake;
        self
    }

    /// Serialize events on the key `mapper` derives, matching the mapper
    /// the publisher partitions with.
    pub fn with_mapper(mut self, mapper: PartitionMapper) -> Self {
        self.mapper = mapper;
        self
    }

    /// `{prefix-topic-partition}-{group}`.
    pub fn id(&self) -> &str {
        &self.consumer_id
    }

    /// The topic being consumed.
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// The partition being consumed.
    pub fn partition(&self) -> u32 {
        self.partition
    }

    /// Key names for the consumed partition.
    pub fn keys(&self) -> &PartitionKeys {
        &self.keys
    }

    /// Current loop state.
    pub fn state(&self) -> ConsumerState {
        *self.state_tx.borrow()
    }

    /// Wait until the loop is in `state`.
    pub async fn wait_for_state(&self, state: ConsumerState) {
        let mut rx = self.state_tx.subscribe();
        let _ = rx.wait_for(|s| *s == state).await;
    }

    /// Wake the loop if it is sleeping.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    fn set_state(&self, state: ConsumerState) {
        self.state_tx.send_if_modified(|current| {
            if *current == ConsumerState::Disposed || *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    /// Spawn the poll loop, routing events through `router`.
    ///
    /// Calling `start` while the loop runs, or after disposal, is a no-op.
    pub async fn start(self: &Arc<Self>, router: Arc<dyn EventRouter>) {
        let mut task = self.task.lock().await;
        if task.is_some() || self.state() == ConsumerState::Disposed {
            return;
        }
        let consumer = Arc::clone(self);
        let shutdown_rx = self.shutdown_tx.subscribe();
        let span = tracing::info_span!("consumer", consumer_id = %self.consumer_id);
        *task = Some(tokio::spawn(
            async move { consumer.run(router, shutdown_rx).await }.instrument(span),
        ));
    }

    async fn run(
        &self,
        router: Arc<dyn EventRouter>,
        mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
    ) {
        let Some(mut tracked) = self.load_tracked(&mut shutdown_rx).await else {
            return;
        };
        tracing::info!(
            topic = %self.topic.name(),
            partition = self.partition,
            tracked = tracked.len(),
            "consumer started"
        );

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            self.set_state(ConsumerState::Polling);
            let span = tracing::debug_span!("poll_step", partition = self.partition);
            let pause = match self.poll_once(&mut tracked, &*router).instrument(span).await {
                Ok(PollOutcome::Advanced { .. }) => continue,
                Ok(PollOutcome::CaughtUp) => {
                    self.set_state(ConsumerState::Idle);
                    self.idle_delay()
                }
                Err(PollError::Disposed) => break,
                Err(e) => {
                    tracing::error!(
                        topic = %self.topic.name(),
                        partition = self.partition,
                        error = %e,
                        backoff_ms = self.config.loop_error_backoff.as_millis() as u64,
                        "poll step failed"
                    );
                    self.set_state(ConsumerState::Idle);
                    self.config.loop_error_backoff
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = self.wake.notified() => {}
                _ = shutdown_rx.wait_for(|stop| *stop) => break,
            }
        }
        tracing::info!(
            topic = %self.topic.name(),
            partition = self.partition,
            "consumer stopped"
        );
    }

    /// Load the persisted tracked ids, retrying until it succeeds or the
    /// consumer is disposed.
    async fn load_tracked(
        &self,
        shutdown_rx: &mut tokio::sync::watch::Receiver<bool>,
    ) -> Option<TrackedIds> {
        let key = self.keys.tracked_ids(&self.config.consumer_group);
        loop {
            match TrackedIds::load(
                &*self.store,
                key.clone(),
                self.config.tracked_high_water,
                self.config.tracked_low_water,
            )
            .await
            {
                Ok(tracked) => return Some(tracked),
                Err(e) => {
                    tracing::error!(key = %key, error = %e, "failed to load tracked ids");
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.loop_error_backoff) => {}
                _ = shutdown_rx.wait_for(|stop| *stop) => return None,
            }
        }
    }

    fn idle_delay(&self) -> Duration {
        let jitter = &self.config.idle_jitter;
        if jitter.is_empty() {
            jitter.start
        } else {
            rand::rng().random_range(jitter.clone())
        }
    }

    /// Run one poll step.
    pub(crate) async fn poll_once(
        &self,
        tracked: &mut TrackedIds,
        router: &dyn EventRouter,
    ) -> Result<PollOutcome, PollError> {
        let store = &*self.store;
        let read_key = self.keys.read_index(&self.config.consumer_group);
        let index_keys = [self.keys.write_index(), read_key.clone()];
        let counters = self
            .retry("MGET", || store.get_counters(&index_keys))
            .await?;
        let (write_index, read_index) = match counters.as_slice() {
            [write, read] => (*write, *read),
            _ => return Ok(PollOutcome::CaughtUp),
        };
        if read_index >= write_index {
            return Ok(PollOutcome::CaughtUp);
        }

        let upper = write_index.min(read_index + self.config.max_batch.max(1));
        let indices: Vec<u64> = (read_index + 1..=upper).collect();
        let entry_keys: Vec<String> = indices.iter().map(|&i| self.keys.entry(i)).collect();

        if self.topic.is_flush() {
            self.retry("SET", || store.set_counter(&read_key, upper))
                .await?;
            self.retry("UNLINK", || store.unlink(&entry_keys)).await?;
            tracing::info!(
                topic = %self.topic.name(),
                partition = self.partition,
                from = read_index + 1,
                to = upper,
                "flushed window without processing"
            );
            return Ok(PollOutcome::Advanced {
                read_index: upper,
                routed: 0,
            });
        }

        let entries = self
            .retry("MGET", || store.get_entries(&entry_keys))
            .await?;

        self.set_state(ConsumerState::Draining);
        let mut seen = HashSet::new();
        let mut pending: Vec<(String, Completion)> = Vec::new();
        let mut disposed = false;

        'window: for ((index, key), entry) in indices.iter().zip(&entry_keys).zip(entries) {
            let bytes = match entry {
                Some(bytes) => bytes,
                None => match self.recover_missing(*index, key).await {
                    Some(bytes) => bytes,
                    None => continue,
                },
            };
            let values = match decode_batch(&bytes) {
                Ok(values) => values,
                Err(e) => {
                    tracing::error!(
                        topic = %self.topic.name(),
                        partition = self.partition,
                        index,
                        error = %e,
                        "undecodable entry, skipping"
                    );
                    continue;
                }
            };

            for value in values {
                let event: EventEnvelope = match serde_json::from_value(value) {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::warn!(
                            topic = %self.topic.name(),
                            partition = self.partition,
                            index,
                            error = %e,
                            "malformed event, skipping"
                        );
                        continue;
                    }
                };
                if tracked.contains(&event.id) || !seen.insert(event.id.clone()) {
                    tracing::debug!(event_id = %event.id, "already processed, skipping");
                    continue;
                }
                if event.is_clear_tracked_keys() {
                    match tracked.clear(store).await {
                        Ok(()) => {
                            tracing::info!(consumer_id = %self.consumer_id, "cleared tracked ids")
                        }
                        // Memory is already clear; the next persist deletes
                        // the stale list.
                        Err(e) => tracing::warn!(
                            consumer_id = %self.consumer_id,
                            error = %e,
                            "cleared tracked ids in memory only"
                        ),
                    }
                    continue;
                }
                let id = event.id.clone();
                let Some(routed) = self.resolve(event) else {
                    continue;
                };
                match router.route(routed) {
                    Ok(completion) => pending.push((id, completion)),
                    Err(_) => {
                        disposed = true;
                        break 'window;
                    }
                }
            }
        }

        let routed = pending.len();
        let mut abandoned = 0;
        for (id, completion) in pending {
            match completion.wait().await {
                Ok(()) => {
                    tracked.track(&id);
                }
                Err(ProcessError::Disposed) if *self.shutdown_tx.borrow() => disposed = true,
                Err(ProcessError::Disposed) => {
                    tracing::warn!(event_id = %id, "event abandoned before completing");
                    abandoned += 1;
                }
                // Terminal failures were logged by the processor; the event
                // is dropped so it cannot stall its partition key.
                Err(_) => {
                    tracked.track(&id);
                }
            }
        }

        if let Err(e) = tracked.persist(store).await {
            if disposed {
                tracing::warn!(error = %e, "failed to persist tracked ids during disposal");
            } else {
                return Err(e.into());
            }
        }
        if disposed {
            return Err(PollError::Disposed);
        }
        if abandoned > 0 {
            return Err(PollError::Incomplete { abandoned });
        }

        self.retry("SET", || store.set_counter(&read_key, upper))
            .await?;
        if self.config.clean_keys
            && let Err(e) = store.unlink(&entry_keys).await
        {
            tracing::warn!(
                topic = %self.topic.name(),
                partition = self.partition,
                error = %e,
                "failed to delete consumed entries"
            );
        }
        tracing::debug!(
            topic = %self.topic.name(),
            partition = self.partition,
            read_index = upper,
            routed,
            "window processed"
        );
        Ok(PollOutcome::Advanced {
            read_index: upper,
            routed,
        })
    }

    async fn retry<T, F, Fut>(&self, operation: &str, op: F) -> Result<T, crate::error::StoreError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, crate::error::StoreError>>,
    {
        retry_fixed(
            self.config.store_attempts,
            self.config.store_retry_delay,
            operation,
            op,
        )
        .await
    }

    /// Re-read an entry the window fetch did not return. A read can race a
    /// producer that has incremented the index but not yet stored the
    /// batch.
    async fn recover_missing(&self, index: u64, key: &str) -> Option<Vec<u8>> {
        tracing::warn!(
            topic = %self.topic.name(),
            partition = self.partition,
            index,
            "entry missing, waiting for it"
        );
        for _ in 0..self.config.missing_entry_attempts {
            tokio::time::sleep(self.config.missing_entry_delay).await;
            match self.store.get_entry(key).await {
                Ok(Some(bytes)) => return Some(bytes),
                Ok(None) => {}
                Err(e) => tracing::warn!(key, error = %e, "entry read failed"),
            }
        }
        tracing::error!(
            topic = %self.topic.name(),
            partition = self.partition,
            index,
            attempts = self.config.missing_entry_attempts,
            "entry lost, skipping"
        );
        None
    }

    /// Resolve `event` to its registration. Unregistered names are expected
    /// during rolling deployments and are skipped quietly.
    fn resolve(&self, event: EventEnvelope) -> Option<RoutedEvent> {
        if event.is_observer_notification() {
            let notification = match ObserverNotification::from_envelope(&event) {
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(event_id = %event.id, error = %e, "malformed observer notification");
                    return None;
                }
            };
            let key = notification.observer_key()?;
            let Some(registration) = self.registry.resolve(&key) else {
                tracing::debug!(observer_key = %key, "no observer registered, skipping");
                return None;
            };
            return Some(RoutedEvent {
                event: notification.event,
                partition_key: event.partition_key,
                topic: self.topic.name().to_string(),
                partition: self.partition,
                consumer_id: self.consumer_id.clone(),
                registration,
                observer_id: Some(notification.observer_id),
            });
        }

        let Some(registration) = self.registry.resolve(&event.name) else {
            tracing::debug!(event_name = %event.name, "no handler registered, skipping");
            return None;
        };
        Some(RoutedEvent {
            partition_key: (self.mapper)(&event),
            event,
            topic: self.topic.name().to_string(),
            partition: self.partition,
            consumer_id: self.consumer_id.clone(),
            registration,
            observer_id: None,
        })
    }

    /// Stop the poll loop and wait for it to exit. A window being drained
    /// is waited for; its read index is only advanced if every event in it
    /// completed.
    ///
    /// Calling `dispose` more than once is safe.
    pub async fn dispose(&self) {
        self.shutdown_tx.send_replace(true);
        let task = self.task.lock().await.take();
        if let Some(join_handle) = task
            && let Err(e) = join_handle.await
        {
            tracing::error!(consumer_id = %self.consumer_id, error = %e, "consumer task panicked");
        }
        self.state_tx.send_replace(ConsumerState::Disposed);
    }
}
