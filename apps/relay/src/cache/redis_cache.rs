use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::{debug, instrument, warn};

use super::{CacheBackend, CacheError, CacheKey};
use crate::models::optimization::OptimizationResult;

/// Shared cache backed by Redis. Values are stored as JSON strings with a
/// server-side expiry, so every worker on every host sees the same entries.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    /// Opens the connection and proves it with a `PING`. Fails fast instead
    /// of letting the reconnecting manager retry in the background.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;

        let probe = async {
            let mut probe = client.get_multiplexed_tokio_connection().await?;
            redis::cmd("PING")
                .query_async::<_, String>(&mut probe)
                .await?;
            ConnectionManager::new(client.clone()).await
        };

        let conn = tokio::time::timeout(timeout, probe)
            .await
            .map_err(|_| CacheError::Unavailable(format!("no answer within {timeout:?}")))??;

        Ok(Self { conn })
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    fn name(&self) -> &'static str {
        "redis"
    }

    #[instrument(skip(self), level = "debug")]
    async fn get(&self, key: &CacheKey) -> Result<Option<OptimizationResult>, CacheError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(key.as_str())
            .query_async(&mut conn)
            .await?;

        let Some(raw) = raw else {
            debug!("Cache miss");
            return Ok(None);
        };

        match serde_json::from_str(&raw) {
            Ok(result) => Ok(Some(result)),
            Err(e) => {
                // Unreadable entries are overwritten by the next successful score.
                warn!("Discarding unreadable cache entry {key}: {e}");
                Ok(None)
            }
        }
    }

    #[instrument(skip(self, value), level = "debug")]
    async fn put(
        &self,
        key: &CacheKey,
        value: &OptimizationResult,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let payload = serde_json::to_string(value)?;
        let mut conn = self.conn.clone();
        redis::cmd("SETEX")
            .arg(key.as_str())
            .arg(ttl.as_secs().max(1))
            .arg(payload)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }
}
