//! [`LogStore`] and [`ChangeFeed`] over a Redis-compatible server.

use tokio_stream::StreamExt;

use super::{ChangeFeed, ChangeStream, LogStore, parse_counter};
use crate::error::StoreError;

/// A Redis-backed log store.
///
/// Data operations share one multiplexed connection; every call to
/// [`ChangeFeed::subscribe`] opens its own dedicated pub/sub connection.
/// `Clone` is cheap and shares the data connection.
#[derive(Clone)]
pub struct RedisLogStore {
    client: ::redis::Client,
    conn: ::redis::aio::MultiplexedConnection,
}

impl std::fmt::Debug for RedisLogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisLogStore")
            .field("addr", &self.client.get_connection_info().addr)
            .finish_non_exhaustive()
    }
}

impl RedisLogStore {
    /// Connect to the server at `url` (e.g. `"redis://127.0.0.1:6379/0"`).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Redis`] if the URL is invalid or the server
    /// cannot be reached.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = ::redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        tracing::info!(addr = %client.get_connection_info().addr, "connected to log store");
        Ok(Self { client, conn })
    }
}

#[tonic::async_trait]
impl LogStore for RedisLogStore {
    async fn incr_by(&self, key: &str, by: u64) -> Result<u64, StoreError> {
        let value: u64 = ::redis::cmd("INCRBY")
            .arg(key)
            .arg(by)
            .query_async(&mut self.conn.clone())
            .await?;
        Ok(value)
    }

    async fn get_counters(&self, keys: &[String]) -> Result<Vec<u64>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let raw: Vec<Option<String>> = ::redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut self.conn.clone())
            .await?;
        keys.iter()
            .zip(raw)
            .map(|(key, value)| parse_counter(key, value))
            .collect()
    }

    async fn set_counter(&self, key: &str, value: u64) -> Result<(), StoreError> {
        let () = ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async(&mut self.conn.clone())
            .await?;
        Ok(())
    }

    async fn set_entry(
        &self,
        key: &str,
        value: &[u8],
        ttl_seconds: u64,
    ) -> Result<(), StoreError> {
        let () = ::redis::cmd("SETEX")
            .arg(key)
            .arg(ttl_seconds)
            .arg(value)
            .query_async(&mut self.conn.clone())
            .await?;
        Ok(())
    }

    async fn get_entries(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let values: Vec<Option<Vec<u8>>> = ::redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut self.conn.clone())
            .await?;
        Ok(values)
    }

    async fn get_entry(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let value: Option<Vec<u8>> = ::redis::cmd("GET")
            .arg(key)
            .query_async(&mut self.conn.clone())
            .await?;
        Ok(value)
    }

    async fn unlink(&self, keys: &[String]) -> Result<(), StoreError> {
        if keys.is_empty() {
            return Ok(());
        }
        let _removed: u64 = ::redis::cmd("UNLINK")
            .arg(keys)
            .query_async(&mut self.conn.clone())
            .await?;
        Ok(())
    }

    async fn push_list(&self, key: &str, values: &[String]) -> Result<(), StoreError> {
        if values.is_empty() {
            return Ok(());
        }
        let _len: u64 = ::redis::cmd("LPUSH")
            .arg(key)
            .arg(values)
            .query_async(&mut self.conn.clone())
            .await?;
        Ok(())
    }

    async fn list_range(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let values: Vec<String> = ::redis::cmd("LRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .query_async(&mut self.conn.clone())
            .await?;
        Ok(values)
    }

    async fn trim_list(&self, key: &str, len: usize) -> Result<(), StoreError> {
        // LTRIM with stop -1 would keep everything, so an empty trim deletes.
        if len == 0 {
            return self.unlink(&[key.to_string()]).await;
        }
        let () = ::redis::cmd("LTRIM")
            .arg(key)
            .arg(0)
            .arg(len - 1)
            .query_async(&mut self.conn.clone())
            .await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), StoreError> {
        let _receivers: u64 = ::redis::cmd("PUBLISH")
            .arg(channel)
            .arg(message)
            .query_async(&mut self.conn.clone())
            .await?;
        Ok(())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let _added: u64 = ::redis::cmd("SADD")
            .arg(key)
            .arg(member)
            .query_async(&mut self.conn.clone())
            .await?;
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let _removed: u64 = ::redis::cmd("SREM")
            .arg(key)
            .arg(member)
            .query_async(&mut self.conn.clone())
            .await?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let members: Vec<String> = ::redis::cmd("SMEMBERS")
            .arg(key)
            .query_async(&mut self.conn.clone())
            .await?;
        Ok(members)
    }
}

#[tonic::async_trait]
impl ChangeFeed for RedisLogStore {
    async fn subscribe(&self, channels: &[String]) -> Result<ChangeStream, StoreError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        if !channels.is_empty() {
            pubsub.subscribe(channels).await?;
        }
        let stream = pubsub
            .into_on_message()
            .map(|msg| msg.get_channel_name().to_string());
        Ok(Box::pin(stream))
    }
}
