//! Bounded set of recently processed event ids, mirrored to a store list.
//!
//! The in-memory set is the source of truth while the consumer runs. The
//! list under the tracked-ids key is only read on startup and is brought
//! back in line with memory on every [`persist`](TrackedIds::persist).

use std::collections::{HashSet, VecDeque};

use crate::error::StoreError;
use crate::store::LogStore;

/// Tracked event ids for one consumer.
#[derive(Debug)]
pub struct TrackedIds {
    key: String,
    /// Most recent first, mirroring the store list.
    ids: VecDeque<String>,
    index: HashSet<String>,
    /// Ids tracked since the last persist, oldest first.
    pending: Vec<String>,
    /// Whether memory was trimmed since the last persist.
    trimmed: bool,
    /// A clear reached memory but not the store list.
    stale: bool,
    high_water: usize,
    low_water: usize,
}

impl TrackedIds {
    /// An empty set persisted under `key`.
    ///
    /// `low_water` is clamped below `high_water`.
    pub fn new(key: impl Into<String>, high_water: usize, low_water: usize) -> Self {
        let high_water = high_water.max(1);
        Self {
            key: key.into(),
            ids: VecDeque::new(),
            index: HashSet::new(),
            pending: Vec::new(),
            trimmed: false,
            stale: false,
            high_water,
            low_water: low_water.min(high_water - 1),
        }
    }

    /// Load the persisted list for `key`.
    ///
    /// A list longer than the high-water mark is trimmed in memory and
    /// truncated in the store on the next persist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the list cannot be read.
    pub async fn load(
        store: &dyn LogStore,
        key: impl Into<String>,
        high_water: usize,
        low_water: usize,
    ) -> Result<Self, StoreError> {
        let mut tracked = Self::new(key, high_water, low_water);
        for id in store.list_range(&tracked.key).await? {
            if tracked.index.insert(id.clone()) {
                tracked.ids.push_back(id);
            }
        }
        tracked.enforce_bound();
        Ok(tracked)
    }

    /// Returns `true` if `id` has been processed.
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains(id)
    }

    /// Record `id` as processed. Returns `false` if it was already tracked.
    pub fn track(&mut self, id: &str) -> bool {
        if !self.index.insert(id.to_string()) {
            return false;
        }
        self.ids.push_front(id.to_string());
        self.pending.push(id.to_string());
        self.enforce_bound();
        true
    }

    /// Number of ids held in memory.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Returns `true` if nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Push newly tracked ids to the store and truncate the store list if
    /// memory was trimmed. A list left behind by a failed
    /// [`clear`](TrackedIds::clear) is deleted first. Pending state is kept
    /// on failure so the next persist retries it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the push or trim fails.
    pub async fn persist(&mut self, store: &dyn LogStore) -> Result<(), StoreError> {
        if self.pending.is_empty() && !self.trimmed && !self.stale {
            return Ok(());
        }
        if self.stale {
            store.unlink(std::slice::from_ref(&self.key)).await?;
            self.stale = false;
        }
        store.push_list(&self.key, &self.pending).await?;
        if self.trimmed {
            store.trim_list(&self.key, self.ids.len()).await?;
        }
        self.pending.clear();
        self.trimmed = false;
        Ok(())
    }

    /// Forget every id, in memory and in the store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store key cannot be deleted. Memory is
    /// cleared regardless, and the next [`persist`](TrackedIds::persist)
    /// deletes the store list before pushing.
    pub async fn clear(&mut self, store: &dyn LogStore) -> Result<(), StoreError> {
        self.ids.clear();
        self.index.clear();
        self.pending.clear();
        self.trimmed = false;
        let result = store.unlink(std::slice::from_ref(&self.key)).await;
        self.stale = result.is_err();
        result
    }

    fn enforce_bound(&mut self) {
        if self.ids.len() <= self.high_water {
            return;
        }
        for dropped in self.ids.drain(self.low_water..) {
            self.index.remove(&dropped);
        }
        // Only the newest `low_water` ids survive; older pending ones would
        // be trimmed straight back out of the list.
        if self.pending.len() > self.ids.len() {
            let excess = self.pending.len() - self.ids.len();
            self.pending.drain(..excess);
        }
        self.trimmed = true;
    }
}
