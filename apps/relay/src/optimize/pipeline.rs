use tracing::{info, warn};

use crate::cache::CacheKey;
use crate::errors::AppError;
use crate::metrics::Outcome;
use crate::models::optimization::{OptimizationRequest, OptimizationResult};
use crate::state::AppState;

/// Cache lookup → score → store for one validated request.
///
/// A hit skips the scorer entirely. A failed score is never cached, so an
/// identical retry runs the scorer again. A failed store is logged and
/// swallowed: the caller still gets the computed result.
pub async fn optimize(
    state: &AppState,
    request: &OptimizationRequest,
) -> Result<(OptimizationResult, Outcome), AppError> {
    let pid = std::process::id();
    let key = CacheKey::for_request(request);

    if let Some(cached) = state.cache.get(&key).await? {
        info!("Worker {pid} - Cache hit for {key}");
        return Ok((cached, Outcome::Cached));
    }

    let result = state.scorer.score(request).await?;
    info!(
        "Worker {pid} - Scorer response: atsScore={}",
        result.ats_score
    );

    if let Err(e) = state
        .cache
        .put(&key, &result, state.config.cache_ttl)
        .await
    {
        warn!(
            "Worker {pid} - Failed to cache result in {} backend: {e}",
            state.cache.name()
        );
    }

    Ok((result, Outcome::Processed))
}
