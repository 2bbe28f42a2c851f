use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::future::Cache;
use moka::Expiry;
use tracing::debug;

use super::{CacheBackend, CacheError, CacheKey};
use crate::models::optimization::OptimizationResult;

/// Upper bound on locally cached results.
const MAX_ENTRIES: u64 = 10_000;

#[derive(Debug, Clone)]
struct Entry {
    result: OptimizationResult,
    ttl: Duration,
}

/// Expires each entry `ttl` after its latest write.
struct PerEntryTtl;

impl Expiry<String, Entry> for PerEntryTtl {
    fn expire_after_create(&self, _key: &String, value: &Entry, _created_at: Instant) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Entry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// In-process fallback cache for offline/local mode.
///
/// Not shared between worker processes: a hit is only guaranteed on the
/// worker that stored the entry.
#[derive(Clone)]
pub struct LocalCache {
    cache: Cache<String, Entry>,
}

impl LocalCache {
    pub fn new() -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(MAX_ENTRIES)
                .expire_after(PerEntryTtl)
                .build(),
        }
    }
}

impl Default for LocalCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for LocalCache {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<OptimizationResult>, CacheError> {
        let hit = self.cache.get(key.as_str()).await.map(|entry| entry.result);
        debug!(key = %key, hit = hit.is_some(), "Local cache lookup");
        Ok(hit)
    }

    async fn put(
        &self,
        key: &CacheKey,
        value: &OptimizationResult,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        self.cache
            .insert(
                key.as_str().to_string(),
                Entry {
                    result: value.clone(),
                    ttl,
                },
            )
            .await;
        Ok(())
    }
}
