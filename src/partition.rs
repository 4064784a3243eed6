//! Partition-key hashing.

use std::io::Cursor;
use std::sync::Arc;

use crate::event::EventEnvelope;

/// Picks the partition key for an event. The default uses the event's own
/// `partitionKey` field.
pub type PartitionMapper = Arc<dyn Fn(&EventEnvelope) -> String + Send + Sync>;

/// The mapper used when none is configured.
pub fn default_mapper() -> PartitionMapper {
    Arc::new(|event: &EventEnvelope| event.partition_key.clone())
}

/// Map a partition key onto `0..partitions` with murmur3 x86_32 (seed 0).
///
/// The result depends only on `key` and `partitions`, so every process in
/// a deployment agrees on where a key lives. Returns `None` if
/// `partitions` is zero.
pub fn map_to_partition(key: &str, partitions: u32) -> Option<u32> {
    hash32(key).checked_rem(partitions)
}

fn hash32(key: &str) -> u32 {
    // Reading from an in-memory cursor cannot fail.
    murmur3::murmur3_32(&mut Cursor::new(key.as_bytes()), 0)
        .expect("hashing an in-memory buffer cannot fail")
}
