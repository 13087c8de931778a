//! Redis implementation of [`KvClient`].

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::{debug, warn};

use super::{KvClient, StoreError};

/// Redis (or any protocol-compatible service such as Dragonfly) client.
///
/// Every command is bounded by `timeout`; a slow backend is reported the
/// same way as a dead one.
#[derive(Clone)]
pub struct RedisKv {
    connection: ConnectionManager,
    timeout: Duration,
}

impl RedisKv {
    /// Connect to `url` and verify the connection with a `PING`.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(|e| {
            warn!(error = %e, "Invalid Redis URL for rate limiting");
            StoreError::Unavailable(e.to_string())
        })?;

        let connection = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Timeout(timeout))?
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let kv = Self {
            connection,
            timeout,
        };
        kv.ping().await?;

        debug!("Connected to Redis for rate limiting");
        Ok(kv)
    }

    async fn bounded<T, F>(&self, command: F) -> Result<T, StoreError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        tokio::time::timeout(self.timeout, command)
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))?
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}

#[async_trait]
impl KvClient for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection.clone();
        self.bounded(redis::cmd("GET").arg(key).query_async::<Option<String>>(&mut conn))
            .await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        self.bounded(
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("EX")
                .arg(ttl_secs)
                .query_async::<()>(&mut conn),
        )
        .await
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        self.bounded(redis::cmd("DEL").arg(key).query_async::<i64>(&mut conn))
            .await
            .map(|_| ())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        self.bounded(redis::cmd("PING").query_async::<String>(&mut conn))
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_url_is_unavailable() {
        let result = RedisKv::connect("not-a-url", Duration::from_millis(50)).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }
}
