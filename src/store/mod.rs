//! The key-value operations the log protocol needs.
//!
//! [`LogStore`] covers data operations (counters, entries, lists, sets,
//! publish) and [`ChangeFeed`] covers the subscribe side of pub/sub, which
//! runs on its own connection. [`RedisLogStore`] implements both against a
//! Redis-compatible server; [`MemoryLogStore`] implements both in process.

mod memory;
mod redis_store;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

pub use self::memory::MemoryLogStore;
pub use self::redis_store::RedisLogStore;
use crate::error::StoreError;

/// Stream of channel names, one item per message received.
pub type ChangeStream = Pin<Box<dyn tokio_stream::Stream<Item = String> + Send>>;

/// Data operations on the shared store. No operation spans more than one
/// key atomically, except the multi-key reads.
#[tonic::async_trait]
pub trait LogStore: Send + Sync + 'static {
    /// `INCRBY key by`, returning the new value.
    async fn incr_by(&self, key: &str, by: u64) -> Result<u64, StoreError>;

    /// `MGET` of counter keys in one round-trip. Missing keys read as 0.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidIndex`] if a key holds a non-integer.
    async fn get_counters(&self, keys: &[String]) -> Result<Vec<u64>, StoreError>;

    /// `SET key value` on a counter.
    async fn set_counter(&self, key: &str, value: u64) -> Result<(), StoreError>;

    /// `SETEX key ttl value`.
    async fn set_entry(&self, key: &str, value: &[u8], ttl_seconds: u64)
    -> Result<(), StoreError>;

    /// `MGET` of entry keys, in key order. Missing keys are `None`.
    async fn get_entries(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, StoreError>;

    /// `GET` of a single entry key.
    async fn get_entry(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// `UNLINK` the given keys. An empty slice is a no-op.
    async fn unlink(&self, keys: &[String]) -> Result<(), StoreError>;

    /// `LPUSH key values...`. The last value ends up at the head.
    async fn push_list(&self, key: &str, values: &[String]) -> Result<(), StoreError>;

    /// `LRANGE key 0 -1`, head first.
    async fn list_range(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// `LTRIM key 0 len-1`, keeping the `len` values nearest the head.
    async fn trim_list(&self, key: &str, len: usize) -> Result<(), StoreError>;

    /// `PUBLISH channel message`.
    async fn publish(&self, channel: &str, message: &str) -> Result<(), StoreError>;

    /// `SADD key member`.
    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError>;

    /// `SREM key member`.
    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError>;

    /// `SMEMBERS key`.
    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;
}

/// The subscribe side of pub/sub.
#[tonic::async_trait]
pub trait ChangeFeed: Send + Sync + 'static {
    /// Subscribe to `channels` and yield the channel name of every message.
    ///
    /// The stream ends when the underlying connection drops; callers
    /// resubscribe.
    async fn subscribe(&self, channels: &[String]) -> Result<ChangeStream, StoreError>;
}

/// Parse a counter value read from the store. Absent keys are 0.
pub(crate) fn parse_counter(key: &str, raw: Option<String>) -> Result<u64, StoreError> {
    match raw {
        None => Ok(0),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| StoreError::InvalidIndex {
                key: key.to_string(),
                value,
            }),
    }
}

/// Run `op` up to `attempts` times with a fixed `delay` between failures.
///
/// Each failure before the last is logged at `warn`; the last error is
/// returned to the caller.
pub(crate) async fn retry_fixed<T, F, Fut>(
    attempts: u32,
    delay: Duration,
    operation: &str,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => {
                tracing::warn!(
                    operation,
                    attempt,
                    attempts,
                    error = %e,
                    "store operation failed, retrying"
                );
                attempt += 1;
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn parse_counter_handles_absent_and_garbage() {
        assert_eq!(parse_counter("k", None).expect("absent is zero"), 0);
        assert_eq!(parse_counter("k", Some("17".to_string())).expect("valid"), 17);
        let err = parse_counter("k", Some("x".to_string())).unwrap_err();
        assert!(matches!(err, StoreError::InvalidIndex { .. }));
    }

    #[tokio::test]
    async fn retry_fixed_succeeds_after_transient_failures() {
        let calls = &AtomicU32::new(0);
        let value = retry_fixed(5, Duration::from_millis(1), "test", move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(StoreError::Unavailable("flaky".to_string()))
            } else {
                Ok(7)
            }
        })
        .await
        .expect("third attempt should succeed");
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_fixed_returns_last_error() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), _> = retry_fixed(3, Duration::from_millis(1), "test", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Unavailable("down".to_string()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
