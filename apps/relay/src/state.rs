use std::sync::Arc;

use crate::broadcast::EventBroadcaster;
use crate::cache::CacheBackend;
use crate::config::Config;
use crate::metrics::MetricsRecorder;
use crate::middleware::rate_limit::RateLimiter;
use crate::scorer::Scorer;

/// Shared worker state injected into all route handlers via Axum extractors.
/// Built once at worker start-up; every field is process-wide.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    /// Redis in scaled mode, in-process fallback in local mode.
    pub cache: Arc<dyn CacheBackend>,
    /// Pluggable scorer. Default: `ProcessScorer` running the external program.
    pub scorer: Arc<dyn Scorer>,
    pub metrics: Arc<MetricsRecorder>,
    /// `None` in local mode, where the real-time channel is disabled.
    pub broadcaster: Option<EventBroadcaster>,
    pub rate_limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(
        config: Config,
        cache: Arc<dyn CacheBackend>,
        scorer: Arc<dyn Scorer>,
        broadcaster: Option<EventBroadcaster>,
    ) -> Self {
        let metrics = Arc::new(MetricsRecorder::new(config.environment));
        let rate_limiter = Arc::new(RateLimiter::new(
            config.rate_limit_window,
            config.rate_limit_max,
        ));
        Self {
            config,
            cache,
            scorer,
            metrics,
            broadcaster,
            rate_limiter,
        }
    }
}
