//! Axum route handler for the optimization endpoint.

use axum::{
    extract::{rejection::JsonRejection, State},
    Json,
};
use chrono::Utc;
use tracing::info;

use crate::errors::AppError;
use crate::metrics::Outcome;
use crate::models::event::CompletionEvent;
use crate::models::optimization::{OptimizationRequest, OptimizationResult, OptimizeResumeBody};
use crate::optimize::pipeline::optimize;
use crate::state::AppState;

/// POST /api/optimize-resume
///
/// Returns `{atsScore, suggestions}` for a resume/JD pair, from cache when
/// an identical pair was scored before. Records exactly one metrics
/// observation per call and, in scaled mode, broadcasts a completion event.
pub async fn handle_optimize_resume(
    State(state): State<AppState>,
    body: Result<Json<OptimizeResumeBody>, JsonRejection>,
) -> Result<Json<OptimizationResult>, AppError> {
    let pid = std::process::id();
    let timer = state.metrics.start_timer();
    info!(
        "Worker {pid} - optimize-resume POST called in {} environment",
        state.config.environment
    );

    let outcome = match validate(body) {
        Ok(request) => optimize(&state, &request).await,
        Err(e) => Err(e),
    };

    match outcome {
        Ok((result, outcome)) => {
            let latency = timer.observe(outcome);
            notify(&state, &result, latency);
            Ok(Json(result))
        }
        Err(e) => {
            timer.observe(Outcome::Error);
            Err(e)
        }
    }
}

fn validate(
    body: Result<Json<OptimizeResumeBody>, JsonRejection>,
) -> Result<OptimizationRequest, AppError> {
    let Json(body) = body.map_err(|rejection| AppError::Validation(rejection.body_text()))?;
    body.validate()
        .ok_or_else(|| AppError::Validation("missing resume or job description".to_string()))
}

/// Fire-and-forget completion event; a no-op in local mode.
fn notify(state: &AppState, result: &OptimizationResult, latency: f64) {
    let Some(broadcaster) = &state.broadcaster else {
        return;
    };
    broadcaster.publish(CompletionEvent {
        pid: std::process::id(),
        ats_score: result.ats_score,
        timestamp: Utc::now(),
        latency: (latency * 1000.0).round() / 1000.0,
        environment: state.config.environment,
    });
}
