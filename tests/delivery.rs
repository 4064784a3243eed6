use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use eda_runtime::{
    ConsumerConfig, EdaRuntime, EventEnvelope, EventHandler, HandlerError, HandlerRegistry,
    LogStore, MemoryLogStore, Observation, PartitionKeys, RetryPolicy, Topic, map_to_partition,
    read_dead_letters,
};

const PREFIX: &str = "test";

/// What every handler invocation saw, in call order.
#[derive(Default)]
struct Journal {
    calls: Mutex<Vec<Call>>,
    in_flight: Mutex<HashMap<String, usize>>,
    max_total_in_flight: Mutex<usize>,
    overlaps: Mutex<Vec<String>>,
}

#[derive(Debug, Clone)]
struct Call {
    id: String,
    key: String,
    seq: Option<u64>,
    observer_id: Option<String>,
}

impl Journal {
    fn ids(&self) -> Vec<String> {
        self.calls
            .lock()
            .expect("journal lock")
            .iter()
            .map(|c| c.id.clone())
            .collect()
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().expect("journal lock").clone()
    }

    fn count(&self, id: &str) -> usize {
        self.ids().iter().filter(|i| *i == id).count()
    }

    fn assert_no_overlaps(&self) {
        let overlaps = self.overlaps.lock().expect("journal lock");
        assert!(overlaps.is_empty(), "keys ran concurrently: {overlaps:?}");
    }
}

/// Records the call, holds the key for `work`, fails events whose id
/// starts with `poison`, and panics on events whose id starts with `panic`.
/// Observer calls are recorded but not counted as running on the event's
/// key.
struct Recording {
    journal: Arc<Journal>,
    work: Duration,
    key_of: fn(&EventEnvelope) -> String,
}

fn raw_key(event: &EventEnvelope) -> String {
    event.partition_key.clone()
}

#[tonic::async_trait]
impl EventHandler for Recording {
    async fn handle(
        &self,
        event: &EventEnvelope,
        observer_id: Option<&str>,
    ) -> Result<(), HandlerError> {
        let exclusive = observer_id.is_none();
        let key = (self.key_of)(event);
        if exclusive {
            let mut in_flight = self.journal.in_flight.lock().expect("journal lock");
            let running = in_flight.entry(key.clone()).or_default();
            *running += 1;
            if *running > 1 {
                self.journal
                    .overlaps
                    .lock()
                    .expect("journal lock")
                    .push(key.clone());
            }
            let total: usize = in_flight.values().sum();
            let mut max = self.journal.max_total_in_flight.lock().expect("journal lock");
            *max = (*max).max(total);
        }
        self.journal.calls.lock().expect("journal lock").push(Call {
            id: event.id.clone(),
            key: event.partition_key.clone(),
            seq: event.payload.get("seq").and_then(|v| v.as_u64()),
            observer_id: observer_id.map(str::to_string),
        });

        tokio::time::sleep(self.work).await;

        if exclusive
            && let Some(running) = self
                .journal
                .in_flight
                .lock()
                .expect("journal lock")
                .get_mut(&key)
        {
            *running -= 1;
        }

        if event.id.starts_with("poison") {
            return Err("poisoned".into());
        }
        if event.id.starts_with("panic") {
            panic!("handler for {} panicked", event.id);
        }
        Ok(())
    }
}

fn registry(journal: &Arc<Journal>, work: Duration) -> HandlerRegistry {
    keyed_registry(journal, work, raw_key)
}

/// Like [`registry`], but counts exclusivity on `key_of(event)`.
fn keyed_registry(
    journal: &Arc<Journal>,
    work: Duration,
    key_of: fn(&EventEnvelope) -> String,
) -> HandlerRegistry {
    let handler_journal = Arc::clone(journal);
    let observer_journal = Arc::clone(journal);
    HandlerRegistry::builder()
        .handler("Step", move |_scope| Recording {
            journal: Arc::clone(&handler_journal),
            work,
            key_of,
        })
        .observer("Customer", "Order", "Step", move |_scope| Recording {
            journal: Arc::clone(&observer_journal),
            work: Duration::ZERO,
            key_of,
        })
        .build()
        .expect("registry should build")
}

fn fast_consumers() -> ConsumerConfig {
    ConsumerConfig {
        idle_jitter: Duration::from_millis(5)..Duration::from_millis(10),
        missing_entry_delay: Duration::from_millis(1),
        store_retry_delay: Duration::from_millis(1),
        loop_error_backoff: Duration::from_millis(10),
        ..ConsumerConfig::default()
    }
}

fn fast_retries() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 10,
        delay_unit: Duration::from_millis(1),
    }
}

async fn runtime(
    store: &MemoryLogStore,
    topic: Topic,
    journal: &Arc<Journal>,
    work: Duration,
) -> EdaRuntime {
    EdaRuntime::builder(PREFIX)
        .store(store.clone())
        .topic(topic)
        .handlers(registry(journal, work))
        .consumer_config(fast_consumers())
        .retry_policy(fast_retries())
        .build()
        .await
        .expect("runtime should build")
}

async fn counter(store: &MemoryLogStore, key: &str) -> u64 {
    store
        .get_counters(&[key.to_string()])
        .await
        .expect("counter read should succeed")[0]
}

async fn wait_for_read_index(store: &MemoryLogStore, keys: &PartitionKeys, expected: u64) {
    let key = keys.read_index("default");
    tokio::time::timeout(Duration::from_secs(5), async {
        while counter(store, &key).await < expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("read index of {} never reached {expected}", keys.id()));
}

fn step(key: &str, seq: u64) -> EventEnvelope {
    EventEnvelope::new("Step", key).with_field("seq", serde_json::json!(seq))
}

#[tokio::test]
async fn single_event_is_handled_once_and_advances_read_index() {
    let store = MemoryLogStore::new();
    let journal = Arc::new(Journal::default());
    let topic = Topic::builder("orders").partitions(4).build().expect("topic");
    let runtime = runtime(&store, topic, &journal, Duration::ZERO).await;
    runtime.start().await.expect("start should succeed");

    let written = runtime
        .publish("orders", vec![EventEnvelope::new("Step", "p1").with_id("e1")])
        .await
        .expect("publish should succeed");
    let partition = map_to_partition("p1", 4).expect("partitions");
    assert_eq!(written.get(&partition), Some(&1));

    let keys = PartitionKeys::new(PREFIX, "orders", partition);
    wait_for_read_index(&store, &keys, 1).await;
    assert_eq!(counter(&store, &keys.write_index()).await, 1);
    assert_eq!(journal.ids(), vec!["e1".to_string()]);

    runtime.dispose().await;
}

#[tokio::test]
async fn redelivered_window_skips_tracked_events() {
    let store = MemoryLogStore::new();
    let journal = Arc::new(Journal::default());
    let topic = Topic::builder("orders").partitions(1).build().expect("topic");
    let keys = PartitionKeys::new(PREFIX, "orders", 0);

    // A consumer that crashed after handling e1 and e2 but before moving
    // its read index left them tracked.
    store
        .push_list(
            &keys.tracked_ids("default"),
            &["e1".to_string(), "e2".to_string()],
        )
        .await
        .expect("seed should succeed");

    let first = runtime(&store, topic.clone(), &journal, Duration::ZERO).await;
    first
        .publish(
            "orders",
            vec![
                step("p1", 1).with_id("e1"),
                step("p1", 2).with_id("e2"),
                step("p1", 3).with_id("e3"),
            ],
        )
        .await
        .expect("publish should succeed");
    first.start().await.expect("start should succeed");
    wait_for_read_index(&store, &keys, 1).await;
    first.dispose().await;
    assert_eq!(journal.ids(), vec!["e3".to_string()]);

    // Crash again before the read index write: the whole window comes back.
    store
        .set_counter(&keys.read_index("default"), 0)
        .await
        .expect("reset should succeed");
    let second = runtime(&store, topic, &journal, Duration::ZERO).await;
    second.start().await.expect("start should succeed");
    wait_for_read_index(&store, &keys, 1).await;
    second.dispose().await;

    assert_eq!(journal.count("e1"), 0);
    assert_eq!(journal.count("e2"), 0);
    assert_eq!(journal.count("e3"), 1);
}

#[tokio::test]
async fn republished_id_is_handled_once() {
    let store = MemoryLogStore::new();
    let journal = Arc::new(Journal::default());
    let topic = Topic::builder("orders").partitions(1).build().expect("topic");
    let runtime = runtime(&store, topic, &journal, Duration::ZERO).await;
    runtime.start().await.expect("start should succeed");

    for _ in 0..3 {
        runtime
            .publish("orders", vec![step("p1", 1).with_id("same")])
            .await
            .expect("publish should succeed");
    }
    wait_for_read_index(&store, &PartitionKeys::new(PREFIX, "orders", 0), 3).await;
    runtime.dispose().await;

    assert_eq!(journal.count("same"), 1);
}

#[tokio::test]
async fn single_processor_runs_unrelated_keys_one_at_a_time() {
    let store = MemoryLogStore::new();
    let journal = Arc::new(Journal::default());
    let topic = Topic::builder("orders").partitions(1).build().expect("topic");
    let runtime = runtime(&store, topic, &journal, Duration::from_millis(30)).await;

    runtime
        .publish("orders", vec![step("a", 1), step("b", 1)])
        .await
        .expect("publish should succeed");
    runtime.start().await.expect("start should succeed");
    wait_for_read_index(&store, &PartitionKeys::new(PREFIX, "orders", 0), 1).await;
    runtime.dispose().await;

    let keys: Vec<String> = journal.calls().into_iter().map(|c| c.key).collect();
    assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(*journal.max_total_in_flight.lock().expect("journal lock"), 1);
    journal.assert_no_overlaps();
}

#[tokio::test]
async fn deep_key_does_not_starve_others() {
    let store = MemoryLogStore::new();
    let journal = Arc::new(Journal::default());
    let topic = Topic::builder("orders").partitions(1).build().expect("topic");
    let runtime = runtime(&store, topic, &journal, Duration::from_millis(10)).await;

    let events = vec![
        step("a", 1).with_id("a1"),
        step("a", 2).with_id("a2"),
        step("a", 3).with_id("a3"),
        step("a", 4).with_id("a4"),
        step("b", 1).with_id("b1"),
        step("c", 1).with_id("c1"),
    ];
    runtime
        .publish("orders", events)
        .await
        .expect("publish should succeed");
    runtime.start().await.expect("start should succeed");
    wait_for_read_index(&store, &PartitionKeys::new(PREFIX, "orders", 0), 1).await;
    runtime.dispose().await;

    assert_eq!(journal.ids(), vec!["a1", "b1", "c1", "a2", "a3", "a4"]);
}

#[tokio::test]
async fn same_key_events_run_in_publish_order() {
    let store = MemoryLogStore::new();
    let journal = Arc::new(Journal::default());
    let topic = Topic::builder("orders").partitions(4).build().expect("topic");
    let runtime = runtime(&store, topic, &journal, Duration::from_millis(1)).await;
    runtime.start().await.expect("start should succeed");

    let keys = ["k0", "k1", "k2", "k3", "k4"];
    for seq in 1..=10 {
        let batch = keys.iter().map(|k| step(k, seq)).collect();
        runtime
            .publish("orders", batch)
            .await
            .expect("publish should succeed");
    }

    tokio::time::timeout(Duration::from_secs(10), async {
        while journal.calls().len() < 50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("all events should be handled");
    runtime.dispose().await;

    for key in keys {
        let seqs: Vec<u64> = journal
            .calls()
            .into_iter()
            .filter(|c| c.key == key)
            .filter_map(|c| c.seq)
            .collect();
        assert_eq!(seqs, (1..=10).collect::<Vec<_>>(), "order broken for {key}");
    }
    journal.assert_no_overlaps();
}

#[tokio::test]
async fn poison_event_is_dead_lettered_and_partition_advances() {
    let dir = tempfile::tempdir().expect("tempdir");
    let dead_letters = dir.path().join("dead.jsonl");
    let store = MemoryLogStore::new();
    let journal = Arc::new(Journal::default());
    let runtime = EdaRuntime::builder(PREFIX)
        .store(store.clone())
        .topic(Topic::builder("orders").partitions(1).build().expect("topic"))
        .handlers(registry(&journal, Duration::ZERO))
        .consumer_config(fast_consumers())
        .retry_policy(fast_retries())
        .dead_letter_path(&dead_letters)
        .build()
        .await
        .expect("runtime should build");
    runtime.start().await.expect("start should succeed");

    runtime
        .publish("orders", vec![step("p1", 1).with_id("poison-1")])
        .await
        .expect("publish should succeed");
    runtime
        .publish("orders", vec![step("p1", 2).with_id("next")])
        .await
        .expect("publish should succeed");
    wait_for_read_index(&store, &PartitionKeys::new(PREFIX, "orders", 0), 2).await;
    runtime.dispose().await;

    assert_eq!(journal.count("poison-1"), 10);
    assert_eq!(journal.count("next"), 1);
    let ids = journal.ids();
    let last_poison = ids.iter().rposition(|id| id == "poison-1").expect("poison ran");
    let next = ids.iter().position(|id| id == "next").expect("next ran");
    assert!(last_poison < next);

    let entries = read_dead_letters(&dead_letters).expect("dead letters should be readable");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].event.id, "poison-1");
    assert_eq!(entries[0].topic, "orders");
}

#[tokio::test]
async fn panicking_handler_is_retried_and_key_keeps_flowing() {
    let store = MemoryLogStore::new();
    let journal = Arc::new(Journal::default());
    let topic = Topic::builder("orders").partitions(1).build().expect("topic");
    let runtime = runtime(&store, topic, &journal, Duration::ZERO).await;
    runtime.start().await.expect("start should succeed");

    runtime
        .publish("orders", vec![step("p1", 1).with_id("panic-1")])
        .await
        .expect("publish should succeed");
    runtime
        .publish("orders", vec![step("p1", 2).with_id("after")])
        .await
        .expect("publish should succeed");
    wait_for_read_index(&store, &PartitionKeys::new(PREFIX, "orders", 0), 2).await;

    runtime
        .publish("orders", vec![step("p1", 3).with_id("later")])
        .await
        .expect("publish should succeed");
    wait_for_read_index(&store, &PartitionKeys::new(PREFIX, "orders", 0), 3).await;
    runtime.dispose().await;

    assert_eq!(journal.count("panic-1"), 10);
    assert_eq!(journal.count("after"), 1);
    assert_eq!(journal.count("later"), 1);
    journal.assert_no_overlaps();
}

#[tokio::test]
async fn partition_mapper_key_serializes_processing() {
    fn tenant(_event: &EventEnvelope) -> String {
        "tenant".to_string()
    }

    let store = MemoryLogStore::new();
    let journal = Arc::new(Journal::default());
    let runtime = EdaRuntime::builder(PREFIX)
        .store(store.clone())
        .topic(Topic::builder("orders").partitions(2).build().expect("topic"))
        .handlers(keyed_registry(&journal, Duration::from_millis(20), tenant))
        .partition_mapper(Arc::new(tenant))
        .consumer_config(fast_consumers())
        .retry_policy(fast_retries())
        .build()
        .await
        .expect("runtime should build");
    runtime.start().await.expect("start should succeed");

    let written = runtime
        .publish(
            "orders",
            vec![step("a", 1).with_id("e1"), step("b", 2).with_id("e2")],
        )
        .await
        .expect("publish should succeed");
    let partition = map_to_partition("tenant", 2).expect("partitions");
    assert_eq!(written.len(), 1);
    assert_eq!(written.get(&partition), Some(&1));

    wait_for_read_index(&store, &PartitionKeys::new(PREFIX, "orders", partition), 1).await;
    runtime.dispose().await;

    assert_eq!(journal.ids(), vec!["e1", "e2"]);
    assert_eq!(*journal.max_total_in_flight.lock().expect("journal lock"), 1);
    journal.assert_no_overlaps();
}

#[tokio::test]
async fn tracked_ids_stay_bounded() {
    let store = MemoryLogStore::new();
    let journal = Arc::new(Journal::default());
    let runtime = EdaRuntime::builder(PREFIX)
        .store(store.clone())
        .topic(Topic::builder("orders").partitions(1).build().expect("topic"))
        .handlers(registry(&journal, Duration::ZERO))
        .consumer_config(ConsumerConfig {
            max_batch: 3,
            tracked_high_water: 4,
            tracked_low_water: 2,
            ..fast_consumers()
        })
        .retry_policy(fast_retries())
        .build()
        .await
        .expect("runtime should build");
    runtime.start().await.expect("start should succeed");

    for seq in 0..10 {
        runtime
            .publish("orders", vec![step(&format!("k{seq}"), seq)])
            .await
            .expect("publish should succeed");
    }
    let keys = PartitionKeys::new(PREFIX, "orders", 0);
    wait_for_read_index(&store, &keys, 10).await;
    runtime.dispose().await;

    let tracked = store
        .list_range(&keys.tracked_ids("default"))
        .await
        .expect("list read should succeed");
    assert!(!tracked.is_empty());
    assert!(tracked.len() <= 4, "{} ids tracked", tracked.len());
}

#[tokio::test]
async fn observers_receive_notifications() {
    let store = MemoryLogStore::new();
    let journal = Arc::new(Journal::default());
    let runtime = EdaRuntime::builder(PREFIX)
        .store(store.clone())
        .topic(Topic::builder("orders").partitions(2).build().expect("topic"))
        .topic(Topic::builder("observers").partitions(2).build().expect("topic"))
        .observer_topic("observers")
        .handlers(registry(&journal, Duration::ZERO))
        .consumer_config(fast_consumers())
        .retry_policy(fast_retries())
        .build()
        .await
        .expect("runtime should build");
    runtime
        .observe(&Observation {
            observer_type: "Customer".to_string(),
            observer_id: "c-9".to_string(),
            observable_type: "Order".to_string(),
            observable_id: "o-1".to_string(),
            event_type: "Step".to_string(),
        })
        .await
        .expect("observe should succeed");
    runtime.start().await.expect("start should succeed");

    runtime
        .publish(
            "orders",
            vec![step("o-1", 1).with_id("tagged").observed_as("Order", "o-1")],
        )
        .await
        .expect("publish should succeed");

    tokio::time::timeout(Duration::from_secs(5), async {
        while !journal.calls().iter().any(|c| c.observer_id.is_some()) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("observer should be notified");
    runtime.dispose().await;

    let calls = journal.calls();
    let notified: Vec<&Call> = calls.iter().filter(|c| c.observer_id.is_some()).collect();
    assert_eq!(notified.len(), 1);
    assert_eq!(notified[0].observer_id.as_deref(), Some("c-9"));
    assert_eq!(notified[0].id, "tagged");
    assert!(calls.iter().any(|c| c.id == "tagged" && c.observer_id.is_none()));
}
