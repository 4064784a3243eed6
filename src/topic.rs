//! Topic configuration and per-partition key naming.
//!
//! A [`Topic`] is built once at startup and never changes. [`PartitionKeys`]
//! derives every store key used by one `(topic, partition)` pair; all of
//! them share a `{...}` hash tag so a clustered store places them on the
//! same shard.

use std::ops::Range;

use crate::error::ConfigError;

/// Default entry time-to-live: one day.
pub const DEFAULT_TTL_MINUTES: u64 = 24 * 60;

/// The contiguous range of partitions a process is responsible for
/// consuming. `end` is exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionAffinity {
    /// First partition consumed.
    pub start: u32,
    /// One past the last partition consumed.
    pub end: u32,
}

impl PartitionAffinity {
    /// Returns `true` if `partition` lies inside the range.
    pub fn contains(&self, partition: u32) -> bool {
        (self.start..self.end).contains(&partition)
    }
}

impl From<Range<u32>> for PartitionAffinity {
    fn from(range: Range<u32>) -> Self {
        Self {
            start: range.start,
            end: range.end,
        }
    }
}

/// Immutable topic configuration.
///
/// # Examples
///
/// ```
/// use eda_runtime::Topic;
///
/// let topic = Topic::builder("orders")
///     .partitions(8)
///     .affinity(0..4)
///     .build()
///     .expect("topic should be valid");
/// assert_eq!(topic.consumed_partitions(), vec![0, 1, 2, 3]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    name: String,
    ttl_minutes: u64,
    partitions: u32,
    affinity: Option<PartitionAffinity>,
    publish_only: bool,
    disabled: bool,
    flush: bool,
}

impl Topic {
    /// Start building a topic called `name`.
    pub fn builder(name: impl Into<String>) -> TopicBuilder {
        TopicBuilder {
            topic: Topic {
                name: name.into(),
                ttl_minutes: DEFAULT_TTL_MINUTES,
                partitions: 1,
                affinity: None,
                publish_only: false,
                disabled: false,
                flush: false,
            },
        }
    }

    /// Topic name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Entry time-to-live in minutes.
    pub fn ttl_minutes(&self) -> u64 {
        self.ttl_minutes
    }

    /// Entry time-to-live in seconds, as passed to `SETEX`.
    pub fn ttl_seconds(&self) -> u64 {
        self.ttl_minutes.saturating_mul(60)
    }

    /// Number of partitions.
    pub fn partitions(&self) -> u32 {
        self.partitions
    }

    /// Partition range this process consumes, if restricted.
    pub fn affinity(&self) -> Option<PartitionAffinity> {
        self.affinity
    }

    /// Events may be published but this process runs no consumers.
    pub fn is_publish_only(&self) -> bool {
        self.publish_only
    }

    /// Publishing is rejected and no consumers run.
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Consumers advance past entries and delete them without dispatching.
    pub fn is_flush(&self) -> bool {
        self.flush
    }

    /// Partitions this process should run consumers for, in ascending order.
    ///
    /// Empty for publish-only and disabled topics.
    pub fn consumed_partitions(&self) -> Vec<u32> {
        if self.publish_only || self.disabled {
            return Vec::new();
        }
        (0..self.partitions)
            .filter(|p| self.affinity.is_none_or(|a| a.contains(*p)))
            .collect()
    }
}

/// Builder for [`Topic`].
#[derive(Debug, Clone)]
pub struct TopicBuilder {
    topic: Topic,
}

impl TopicBuilder {
    /// Set the partition count. Default: 1.
    pub fn partitions(mut self, partitions: u32) -> Self {
        self.topic.partitions = partitions;
        self
    }

    /// Set the entry time-to-live in minutes. Default: one day.
    pub fn ttl_minutes(mut self, minutes: u64) -> Self {
        self.topic.ttl_minutes = minutes;
        self
    }

    /// Restrict consumption to a contiguous partition range.
    pub fn affinity(mut self, range: impl Into<PartitionAffinity>) -> Self {
        self.topic.affinity = Some(range.into());
        self
    }

    /// Mark the topic publish-only for this process.
    pub fn publish_only(mut self) -> Self {
        self.topic.publish_only = true;
        self
    }

    /// Mark the topic disabled.
    pub fn disabled(mut self) -> Self {
        self.topic.disabled = true;
        self
    }

    /// Drain the topic without dispatching.
    pub fn flush(mut self) -> Self {
        self.topic.flush = true;
        self
    }

    /// Validate and produce the topic.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidTopic`] if the name is empty, the
    /// partition count or TTL is zero, or the affinity range is empty or
    /// reaches past the last partition.
    pub fn build(self) -> Result<Topic, ConfigError> {
        let topic = self.topic;
        let invalid = |reason: &str| ConfigError::InvalidTopic {
            topic: topic.name.clone(),
            reason: reason.to_string(),
        };
        if topic.name.is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if topic.partitions == 0 {
            return Err(invalid("partition count must be at least 1"));
        }
        if topic.ttl_minutes == 0 {
            return Err(invalid("ttl must be at least one minute"));
        }
        if let Some(affinity) = topic.affinity
            && (affinity.start >= affinity.end || affinity.end > topic.partitions)
        {
            return Err(invalid(&format!(
                "affinity {}..{} is not a non-empty subrange of 0..{}",
                affinity.start, affinity.end, topic.partitions
            )));
        }
        Ok(topic)
    }
}

// --- Key naming ---

/// Store keys for a single `(topic, partition)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionKeys {
    id: String,
}

impl PartitionKeys {
    /// Derive the keys for `partition` of `topic` under `prefix`.
    pub fn new(prefix: &str, topic: &str, partition: u32) -> Self {
        Self {
            id: format!("{{{prefix}-{topic}-{partition}}}"),
        }
    }

    /// The hash-tagged partition id every key starts with.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Counter holding the index of the latest appended entry.
    pub fn write_index(&self) -> String {
        format!("{}-write-index", self.id)
    }

    /// Counter holding the index of the latest entry `group` has processed.
    pub fn read_index(&self, group: &str) -> String {
        format!("{}-{group}-read-index", self.id)
    }

    /// Key of the entry stored at `index`.
    pub fn entry(&self, index: u64) -> String {
        format!("{}-{index}", self.id)
    }

    /// Pub/sub channel notified after each append.
    pub fn changed_channel(&self) -> String {
        format!("{}-changed", self.id)
    }

    /// Identifier of the consumer for `group` on this partition.
    pub fn consumer_id(&self, group: &str) -> String {
        format!("{}-{group}", self.id)
    }

    /// List holding the ids the consumer for `group` has processed.
    pub fn tracked_ids(&self, group: &str) -> String {
        format!("{}-tracked_keys", self.consumer_id(group))
    }
}
