use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::services::store::{Store, StoreError};

/// Bound on the connectivity probe so a dead Redis does not stall a tick.
const PING_TIMEOUT: Duration = Duration::from_secs(2);

/// Redis-backed [`Store`].
///
/// Holds one multiplexed connection, opened lazily and dropped again on I/O
/// errors so the next call reconnects.
pub struct RedisStore {
    client: redis::Client,
    conn: Mutex<Option<MultiplexedConnection>>,
}

impl RedisStore {
    pub fn new(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url).map_err(StoreError::Redis)?;
        Ok(Self {
            client,
            conn: Mutex::new(None),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        let mut cached = self.conn.lock().await;
        if let Some(conn) = cached.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(StoreError::Redis)?;
        *cached = Some(conn.clone());
        Ok(conn)
    }

    async fn check<T>(&self, result: redis::RedisResult<T>) -> Result<T, StoreError> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
                    tracing::warn!(error = %e, "Dropping Redis connection after I/O error");
                    self.conn.lock().await.take();
                }
                Err(StoreError::Redis(e))
            }
        }
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn set_json(&self, key: &str, value: &serde_json::Value) -> Result<(), StoreError> {
        let payload = serde_json::to_string(value).map_err(StoreError::Serialize)?;
        let mut conn = self.connection().await?;
        let result = conn.set::<_, _, ()>(key, payload).await;
        self.check(result).await
    }

    async fn get_json(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        let mut conn = self.connection().await?;
        let result = conn.get::<_, Option<String>>(key).await;
        match self.check(result).await? {
            Some(payload) => Ok(Some(
                serde_json::from_str(&payload).map_err(StoreError::Serialize)?,
            )),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let result = conn.del::<_, ()>(key).await;
        self.check(result).await
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let result = conn.sadd::<_, _, ()>(key, member).await;
        self.check(result).await
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let result = conn.srem::<_, _, u64>(key, member).await;
        Ok(self.check(result).await? > 0)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection().await?;
        let result = conn.smembers::<_, Vec<String>>(key).await;
        self.check(result).await
    }

    async fn set_len(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        let result = conn.scard::<_, u64>(key).await;
        self.check(result).await
    }

    async fn sorted_add(&self, key: &str, member: &str, score: i64) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let result = conn.zadd::<_, _, _, ()>(key, member, score).await;
        self.check(result).await
    }

    async fn sorted_remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let result = conn.zrem::<_, _, u64>(key, member).await;
        Ok(self.check(result).await? > 0)
    }

    async fn sorted_range_by_score(
        &self,
        key: &str,
        max_score: i64,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection().await?;
        let count = isize::try_from(limit).unwrap_or(isize::MAX);
        let result = conn
            .zrangebyscore_limit::<_, _, _, Vec<String>>(key, "-inf", max_score, 0, count)
            .await;
        self.check(result).await
    }

    async fn sorted_len(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        let result = conn.zcard::<_, u64>(key).await;
        self.check(result).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let seconds = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let result = conn.expire::<_, bool>(key, seconds).await;
        self.check(result).await
    }

    async fn is_connected(&self) -> bool {
        let probe = async {
            let mut conn = self.connection().await?;
            let result = redis::cmd("PING").query_async::<String>(&mut conn).await;
            self.check(result).await
        };
        matches!(tokio::time::timeout(PING_TIMEOUT, probe).await, Ok(Ok(_)))
    }
}
