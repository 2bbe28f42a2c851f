//! Response cache: content-addressed storage for scorer results.
//!
//! Two backends sit behind `CacheBackend`:
//! - `RedisCache`: shared across all workers, server-side expiry via `SETEX`
//! - `LocalCache`: in-process fallback for offline/local mode only
//!
//! The backend is chosen once at worker start-up by `connect_cache` and
//! injected into `AppState`; it is never rebuilt per request.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::Config;
use crate::models::optimization::{OptimizationRequest, OptimizationResult};

mod local;
mod redis_cache;

pub use local::LocalCache;
pub use redis_cache::RedisCache;

const KEY_PREFIX: &str = "ats";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("cache value serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Deterministic fingerprint of a request's exact bytes.
///
/// Each field is length-prefixed before hashing, so moving bytes between
/// `resume` and `jobDescription` always yields a different key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn for_request(request: &OptimizationRequest) -> Self {
        let mut hasher = blake3::Hasher::new();
        for field in [&request.resume, &request.job_description] {
            hasher.update(&(field.len() as u64).to_le_bytes());
            hasher.update(field.as_bytes());
        }
        CacheKey(format!("{KEY_PREFIX}:{}", hasher.finalize().to_hex()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Get/put interface shared by both backends. Entries are replace-only:
/// a second `put` for the same key overwrites, never merges.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Short backend label for logs.
    fn name(&self) -> &'static str;

    async fn get(&self, key: &CacheKey) -> Result<Option<OptimizationResult>, CacheError>;

    async fn put(
        &self,
        key: &CacheKey,
        value: &OptimizationResult,
        ttl: Duration,
    ) -> Result<(), CacheError>;
}

/// Connects the cache backend for this worker.
///
/// Redis is tried first. If it is unreachable, local mode degrades to the
/// in-process cache; any other mode returns `CacheError::Unavailable`, which
/// the worker treats as fatal.
pub async fn connect_cache(config: &Config) -> Result<Arc<dyn CacheBackend>, CacheError> {
    match RedisCache::connect(&config.redis_url, CONNECT_TIMEOUT).await {
        Ok(redis) => {
            info!("Redis cache connected");
            Ok(Arc::new(redis))
        }
        Err(e) if config.local_fallback => {
            warn!("Redis not available, falling back to in-memory caching: {e}");
            Ok(Arc::new(LocalCache::new()))
        }
        Err(e) => Err(CacheError::Unavailable(e.to_string())),
    }
}
