pub mod health;
pub mod metrics;

use axum::{
    http::{header, HeaderName, HeaderValue, Method},
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    set_header::SetResponseHeaderLayer,
    trace::TraceLayer,
};
use tracing::warn;

use crate::middleware::rate_limit::rate_limit;
use crate::optimize::handlers;
use crate::state::AppState;

/// Full worker router: API, health and metrics, with CORS, security headers
/// and access logging applied. Rate limiting covers the API only.
pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.allowed_origins);

    let api = Router::new()
        .route(
            "/api/optimize-resume",
            post(handlers::handle_optimize_resume),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), rate_limit));

    let router = Router::new()
        .route("/health", get(health::health_handler))
        .route("/metrics", get(metrics::metrics_handler))
        .merge(api)
        .with_state(state);

    with_security_headers(router)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Router for the optional dedicated metrics port.
pub fn metrics_router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(metrics::metrics_handler))
        .with_state(state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true);

    // A literal `*` cannot be combined with credentials; echo the caller's
    // origin instead.
    if allowed_origins.iter().any(|origin| origin == "*") {
        return base.allow_origin(AllowOrigin::mirror_request());
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin '{origin}'");
                None
            }
        })
        .collect();

    base.allow_origin(AllowOrigin::list(origins))
}

fn with_security_headers(router: Router) -> Router {
    const HEADERS: [(HeaderName, &str); 5] = [
        (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
        (header::X_FRAME_OPTIONS, "SAMEORIGIN"),
        (header::REFERRER_POLICY, "no-referrer"),
        (header::X_DNS_PREFETCH_CONTROL, "off"),
        (
            header::STRICT_TRANSPORT_SECURITY,
            "max-age=15552000; includeSubDomains",
        ),
    ];

    HEADERS.into_iter().fold(router, |router, (name, value)| {
        router.layer(SetResponseHeaderLayer::if_not_present(
            name,
            HeaderValue::from_static(value),
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::broadcast::EventBroadcaster;
    use crate::cache::{CacheBackend, CacheError, CacheKey, LocalCache};
    use crate::config::Config;
    use crate::errors::{OPTIMIZATION_FAILED_MESSAGE, RATE_LIMITED_MESSAGE, VALIDATION_MESSAGE};
    use crate::metrics::Outcome;
    use crate::models::optimization::{OptimizationRequest, OptimizationResult};
    use crate::scorer::{Scorer, ScorerError};

    // ── Fakes ───────────────────────────────────────────────────────────────

    /// Returns a fixed result, optionally failing its first call.
    struct FakeScorer {
        result: OptimizationResult,
        calls: AtomicUsize,
        fail_first: AtomicBool,
        delay: Duration,
    }

    impl FakeScorer {
        fn build(score: u8, suggestions: &str, fail_first: bool, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                result: OptimizationResult {
                    ats_score: score,
                    suggestions: suggestions.to_string(),
                },
                calls: AtomicUsize::new(0),
                fail_first: AtomicBool::new(fail_first),
                delay,
            })
        }

        fn new(score: u8, suggestions: &str) -> Arc<Self> {
            Self::build(score, suggestions, false, Duration::ZERO)
        }

        fn failing_once(score: u8, suggestions: &str) -> Arc<Self> {
            Self::build(score, suggestions, true, Duration::ZERO)
        }

        fn slow(score: u8, delay: Duration) -> Arc<Self> {
            Self::build(score, "slow", false, delay)
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Scorer for FakeScorer {
        async fn score(
            &self,
            _request: &OptimizationRequest,
        ) -> Result<OptimizationResult, ScorerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail_first.swap(false, Ordering::SeqCst) {
                return Err(ScorerError::NonZeroExit {
                    code: Some(1),
                    stderr: "model load failed".to_string(),
                });
            }
            Ok(self.result.clone())
        }
    }

    /// Cache whose writes always fail and reads always miss.
    struct BrokenStoreCache;

    #[async_trait]
    impl CacheBackend for BrokenStoreCache {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn get(&self, _key: &CacheKey) -> Result<Option<OptimizationResult>, CacheError> {
            Ok(None)
        }

        async fn put(
            &self,
            _key: &CacheKey,
            _value: &OptimizationResult,
            _ttl: Duration,
        ) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("write refused".to_string()))
        }
    }

    /// Cache whose reads fail.
    struct BrokenLookupCache;

    #[async_trait]
    impl CacheBackend for BrokenLookupCache {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn get(&self, _key: &CacheKey) -> Result<Option<OptimizationResult>, CacheError> {
            Err(CacheError::Unavailable("connection reset".to_string()))
        }

        async fn put(
            &self,
            _key: &CacheKey,
            _value: &OptimizationResult,
            _ttl: Duration,
        ) -> Result<(), CacheError> {
            Ok(())
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────────────

    fn state_with(
        config: Config,
        scorer: Arc<dyn Scorer>,
        cache: Arc<dyn CacheBackend>,
        broadcaster: Option<EventBroadcaster>,
    ) -> AppState {
        AppState::new(config, cache, scorer, broadcaster)
    }

    fn local_state(scorer: Arc<dyn Scorer>) -> (AppState, Arc<LocalCache>) {
        let cache = Arc::new(LocalCache::new());
        let state = state_with(Config::for_tests(), scorer, cache.clone(), None);
        (state, cache)
    }

    fn optimize_request(body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/optimize-resume")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn example_body() -> Value {
        json!({
            "resume": "Experienced engineer...",
            "jobDescription": "Looking for backend engineer..."
        })
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    // ── Pipeline ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_example_scenario_then_cache_hit() {
        let scorer = FakeScorer::new(82, "Add more keywords");
        let (state, _cache) = local_state(scorer.clone());
        let metrics = state.metrics.clone();
        let router = build_router(state);

        let (status, first) = send(&router, optimize_request(example_body())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            first,
            json!({"atsScore": 82, "suggestions": "Add more keywords"})
        );

        let (status, second) = send(&router, optimize_request(example_body())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(second, first);

        assert_eq!(scorer.calls(), 1);
        assert_eq!(metrics.requests_total(Outcome::Processed), 1);
        assert_eq!(metrics.requests_total(Outcome::Cached), 1);
        assert_eq!(metrics.requests_total(Outcome::Error), 0);
    }

    #[tokio::test]
    async fn test_different_input_is_not_a_cache_hit() {
        let scorer = FakeScorer::new(60, "s");
        let (state, _cache) = local_state(scorer.clone());
        let router = build_router(state);

        send(&router, optimize_request(example_body())).await;
        send(
            &router,
            optimize_request(json!({
                "resume": "Experienced engineer...!",
                "jobDescription": "Looking for backend engineer..."
            })),
        )
        .await;

        assert_eq!(scorer.calls(), 2);
    }

    #[tokio::test]
    async fn test_missing_resume_is_400() {
        let scorer = FakeScorer::new(82, "s");
        let (state, _cache) = local_state(scorer.clone());
        let metrics = state.metrics.clone();
        let router = build_router(state);

        let (status, body) = send(
            &router,
            optimize_request(json!({"jobDescription": "Looking for backend engineer..."})),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({"error": VALIDATION_MESSAGE}));
        assert_eq!(scorer.calls(), 0);
        assert_eq!(metrics.requests_total(Outcome::Error), 1);
    }

    #[tokio::test]
    async fn test_missing_job_description_is_400() {
        let (state, _cache) = local_state(FakeScorer::new(82, "s"));
        let router = build_router(state);

        let (status, body) = send(
            &router,
            optimize_request(json!({"resume": "Experienced engineer..."})),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({"error": VALIDATION_MESSAGE}));
    }

    #[tokio::test]
    async fn test_blank_fields_are_400() {
        let (state, _cache) = local_state(FakeScorer::new(82, "s"));
        let router = build_router(state);

        let (status, _) = send(
            &router,
            optimize_request(json!({"resume": "  ", "jobDescription": "jd"})),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_malformed_json_is_400() {
        let (state, _cache) = local_state(FakeScorer::new(82, "s"));
        let router = build_router(state);

        let request = Request::builder()
            .method("POST")
            .uri("/api/optimize-resume")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, body) = send(&router, request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({"error": VALIDATION_MESSAGE}));
    }

    #[tokio::test]
    async fn test_scorer_failure_is_500_and_not_cached() {
        let scorer = FakeScorer::failing_once(82, "Add more keywords");
        let (state, cache) = local_state(scorer.clone());
        let metrics = state.metrics.clone();
        let router = build_router(state);

        let (status, body) = send(&router, optimize_request(example_body())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, json!({"error": OPTIMIZATION_FAILED_MESSAGE}));

        let key = CacheKey::for_request(&OptimizationRequest {
            resume: "Experienced engineer...".to_string(),
            job_description: "Looking for backend engineer...".to_string(),
        });
        assert_eq!(cache.get(&key).await.unwrap(), None);

        let (status, _) = send(&router, optimize_request(example_body())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(scorer.calls(), 2);
        assert_eq!(metrics.requests_total(Outcome::Error), 1);
        assert_eq!(metrics.requests_total(Outcome::Processed), 1);
    }

    #[tokio::test]
    async fn test_store_failure_still_returns_result() {
        let scorer = FakeScorer::new(75, "ok");
        let state = state_with(
            Config::for_tests(),
            scorer.clone(),
            Arc::new(BrokenStoreCache),
            None,
        );
        let router = build_router(state);

        let (status, body) = send(&router, optimize_request(example_body())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["atsScore"], 75);
    }

    #[tokio::test]
    async fn test_lookup_failure_is_500() {
        let scorer = FakeScorer::new(75, "ok");
        let state = state_with(
            Config::for_tests(),
            scorer.clone(),
            Arc::new(BrokenLookupCache),
            None,
        );
        let router = build_router(state);

        let (status, body) = send(&router, optimize_request(example_body())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, json!({"error": OPTIMIZATION_FAILED_MESSAGE}));
        assert_eq!(scorer.calls(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_first_requests_all_succeed() {
        let scorer = FakeScorer::slow(88, Duration::from_millis(50));
        let (state, cache) = local_state(scorer.clone());
        let router = build_router(state);

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let router = router.clone();
            tasks.spawn(async move { send(&router, optimize_request(example_body())).await });
        }
        while let Some(joined) = tasks.join_next().await {
            let (status, body) = joined.unwrap();
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["atsScore"], 88);
        }

        let calls = scorer.calls();
        assert!((1..=8).contains(&calls), "unexpected scorer calls: {calls}");

        let key = CacheKey::for_request(&OptimizationRequest {
            resume: "Experienced engineer...".to_string(),
            job_description: "Looking for backend engineer...".to_string(),
        });
        assert_eq!(cache.get(&key).await.unwrap().unwrap().ats_score, 88);
    }

    #[tokio::test]
    async fn test_completion_event_is_broadcast() {
        let broadcaster = EventBroadcaster::new(crate::config::Environment::Production);
        let mut events = broadcaster.subscribe();
        let state = state_with(
            Config::for_tests(),
            FakeScorer::new(82, "Add more keywords"),
            Arc::new(LocalCache::new()),
            Some(broadcaster),
        );
        let router = build_router(state);

        send(&router, optimize_request(example_body())).await;

        let event = events.recv().await.unwrap();
        assert_eq!(event.ats_score, 82);
        assert_eq!(event.pid, std::process::id());
        assert!(event.latency >= 0.0);
    }

    // ── Ambient routes & layers ─────────────────────────────────────────────

    #[tokio::test]
    async fn test_health_reports_pid_and_environment() {
        let (state, _cache) = local_state(FakeScorer::new(1, "s"));
        let router = build_router(state);

        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, body) = send(&router, request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["pid"], std::process::id());
        assert_eq!(body["environment"], "development");
    }

    #[tokio::test]
    async fn test_metrics_endpoint_exposes_counters() {
        let (state, _cache) = local_state(FakeScorer::new(82, "s"));
        let router = build_router(state);

        send(&router, optimize_request(example_body())).await;
        send(&router, optimize_request(example_body())).await;

        let response = router
            .clone()
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/plain"));

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("ats_requests_total{environment=\"development\",status=\"processed\"} 1"));
        assert!(text.contains("ats_requests_total{environment=\"development\",status=\"cached\"} 1"));
    }

    #[tokio::test]
    async fn test_rate_limit_applies_to_api_only() {
        let mut config = Config::for_tests();
        config.rate_limit_max = 2;
        let state = state_with(
            config,
            FakeScorer::new(82, "s"),
            Arc::new(LocalCache::new()),
            None,
        );
        let metrics = Arc::clone(&state.metrics);
        let router = build_router(state);

        for _ in 0..2 {
            let (status, _) = send(&router, optimize_request(example_body())).await;
            assert_eq!(status, StatusCode::OK);
        }
        let (status, body) = send(&router, optimize_request(example_body())).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body, json!({"error": RATE_LIMITED_MESSAGE}));
        assert_eq!(metrics.requests_total(Outcome::Error), 1);
        assert_eq!(
            metrics.requests_total(Outcome::Processed) + metrics.requests_total(Outcome::Cached),
            2
        );

        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, _) = send(&router, request).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_cors_allows_configured_origin_only() {
        let (state, _cache) = local_state(FakeScorer::new(1, "s"));
        let router = build_router(state);

        let preflight = |origin: &str| {
            Request::builder()
                .method("OPTIONS")
                .uri("/api/optimize-resume")
                .header(header::ORIGIN, origin)
                .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
                .body(Body::empty())
                .unwrap()
        };

        let allowed = router
            .clone()
            .oneshot(preflight("http://localhost:3000"))
            .await
            .unwrap();
        assert_eq!(
            allowed.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "http://localhost:3000"
        );
        assert_eq!(
            allowed.headers()[header::ACCESS_CONTROL_ALLOW_CREDENTIALS],
            "true"
        );

        let denied = router
            .clone()
            .oneshot(preflight("https://evil.example"))
            .await
            .unwrap();
        assert!(denied
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .is_none());
    }

    #[tokio::test]
    async fn test_wildcard_origin_echoes_caller() {
        let mut config = Config::for_tests();
        config.allowed_origins = vec!["https://a.example".to_string(), "*".to_string()];
        let state = state_with(
            config,
            FakeScorer::new(1, "s"),
            Arc::new(LocalCache::new()),
            None,
        );
        let router = build_router(state);

        let response = router
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/api/optimize-resume")
                    .header(header::ORIGIN, "https://anywhere.example")
                    .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "https://anywhere.example"
        );
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_CREDENTIALS],
            "true"
        );
    }

    #[tokio::test]
    async fn test_security_headers_are_set() {
        let (state, _cache) = local_state(FakeScorer::new(1, "s"));
        let router = build_router(state);

        let response = router
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.headers()[header::X_CONTENT_TYPE_OPTIONS], "nosniff");
        assert_eq!(response.headers()[header::X_FRAME_OPTIONS], "SAMEORIGIN");
    }

    #[tokio::test]
    async fn test_metrics_router_serves_only_metrics() {
        let (state, _cache) = local_state(FakeScorer::new(1, "s"));
        let router = metrics_router(state);

        let ok = router
            .clone()
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);

        let missing = router
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }
}
