//! In-process [`LogStore`] and [`ChangeFeed`], used by tests and by
//! single-process deployments that do not need durability.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;

use super::{ChangeFeed, ChangeStream, LogStore, parse_counter};
use crate::error::StoreError;

/// Capacity of the pub/sub ring. Slow subscribers miss old wake-ups, which
/// only costs them one idle sleep.
const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct State {
    strings: HashMap<String, Vec<u8>>,
    ttls: HashMap<String, u64>,
    lists: HashMap<String, VecDeque<String>>,
    sets: HashMap<String, BTreeSet<String>>,
    calls: HashMap<&'static str, usize>,
}

/// A log store held entirely in memory.
///
/// Entry time-to-live is recorded but never enforced. `Clone` shares the
/// same underlying state.
#[derive(Debug, Clone)]
pub struct MemoryLogStore {
    state: Arc<Mutex<State>>,
    changes: broadcast::Sender<String>,
    fail_next: Arc<AtomicU32>,
}

impl Default for MemoryLogStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLogStore {
    /// Create an empty store.
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(State::default())),
            changes,
            fail_next: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Make the next `count` data operations fail with
    /// [`StoreError::Unavailable`].
    pub fn fail_next_operations(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Raw bytes stored under `key`, if any.
    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().strings.get(key).cloned()
    }

    /// Store raw bytes under `key` without a TTL.
    pub fn insert_raw(&self, key: &str, value: Vec<u8>) {
        self.lock().strings.insert(key.to_string(), value);
    }

    /// Remove `key` from every keyspace.
    pub fn remove(&self, key: &str) {
        let mut state = self.lock();
        state.strings.remove(key);
        state.ttls.remove(key);
        state.lists.remove(key);
        state.sets.remove(key);
    }

    /// Returns `true` if `key` exists in any keyspace.
    pub fn contains_key(&self, key: &str) -> bool {
        let state = self.lock();
        state.strings.contains_key(key)
            || state.lists.contains_key(key)
            || state.sets.contains_key(key)
    }

    /// TTL recorded by the last `SETEX` on `key`.
    pub fn ttl(&self, key: &str) -> Option<u64> {
        self.lock().ttls.get(key).copied()
    }

    /// Number of times the named operation (e.g. `"MGET"`) was called.
    pub fn calls(&self, operation: &str) -> usize {
        self.lock().calls.get(operation).copied().unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("memory store lock poisoned")
    }

    /// Record the call and apply any injected failure.
    fn enter(&self, operation: &'static str) -> Result<MutexGuard<'_, State>, StoreError> {
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable(format!("injected failure in {operation}")));
        }
        let mut state = self.lock();
        *state.calls.entry(operation).or_default() += 1;
        Ok(state)
    }
}

#[tonic::async_trait]
impl LogStore for MemoryLogStore {
    async fn incr_by(&self, key: &str, by: u64) -> Result<u64, StoreError> {
        let mut state = self.enter("INCRBY")?;
        let current = parse_counter(
            key,
            state
                .strings
                .get(key)
                .map(|raw| String::from_utf8_lossy(raw).into_owned()),
        )?;
        let next = current + by;
        state.strings.insert(key.to_string(), next.to_string().into_bytes());
        Ok(next)
    }

    async fn get_counters(&self, keys: &[String]) -> Result<Vec<u64>, StoreError> {
        let state = self.enter("MGET")?;
        keys.iter()
            .map(|key| {
                let raw = state
                    .strings
                    .get(key)
                    .map(|raw| String::from_utf8_lossy(raw).into_owned());
                parse_counter(key, raw)
            })
            .collect()
    }

    async fn set_counter(&self, key: &str, value: u64) -> Result<(), StoreError> {
        let mut state = self.enter("SET")?;
        state.strings.insert(key.to_string(), value.to_string().into_bytes());
        Ok(())
    }

    async fn set_entry(
        &self,
        key: &str,
        value: &[u8],
        ttl_seconds: u64,
    ) -> Result<(), StoreError> {
        let mut state = self.enter("SETEX")?;
        state.strings.insert(key.to_string(), value.to_vec());
        state.ttls.insert(key.to_string(), ttl_seconds);
        Ok(())
    }

    async fn get_entries(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, StoreError> {
        let state = self.enter("MGET")?;
        Ok(keys.iter().map(|key| state.strings.get(key).cloned()).collect())
    }

    async fn get_entry(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let state = self.enter("GET")?;
        Ok(state.strings.get(key).cloned())
    }

    async fn unlink(&self, keys: &[String]) -> Result<(), StoreError> {
        let mut state = self.enter("UNLINK")?;
        for key in keys {
            state.strings.remove(key);
            state.ttls.remove(key);
            state.lists.remove(key);
            state.sets.remove(key);
        }
        Ok(())
    }

    async fn push_list(&self, key: &str, values: &[String]) -> Result<(), StoreError> {
        let mut state = self.enter("LPUSH")?;
        let list = state.lists.entry(key.to_string()).or_default();
        for value in values {
            list.push_front(value.clone());
        }
        Ok(())
    }

    async fn list_range(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let state = self.enter("LRANGE")?;
        Ok(state
            .lists
            .get(key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn trim_list(&self, key: &str, len: usize) -> Result<(), StoreError> {
        let mut state = self.enter("LTRIM")?;
        if len == 0 {
            state.lists.remove(key);
        } else if let Some(list) = state.lists.get_mut(key) {
            list.truncate(len);
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, _message: &str) -> Result<(), StoreError> {
        drop(self.enter("PUBLISH")?);
        // No subscribers is not an error.
        let _ = self.changes.send(channel.to_string());
        Ok(())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut state = self.enter("SADD")?;
        state
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut state = self.enter("SREM")?;
        if let Some(set) = state.sets.get_mut(key) {
            set.remove(member);
            if set.is_empty() {
                state.sets.remove(key);
            }
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let state = self.enter("SMEMBERS")?;
        Ok(state
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }
}

#[tonic::async_trait]
impl ChangeFeed for MemoryLogStore {
    async fn subscribe(&self, channels: &[String]) -> Result<ChangeStream, StoreError> {
        let wanted: BTreeSet<String> = channels.iter().cloned().collect();
        let stream = BroadcastStream::new(self.changes.subscribe())
            .filter_map(move |msg| msg.ok().filter(|channel| wanted.contains(channel)));
        Ok(Box::pin(stream))
    }
}
