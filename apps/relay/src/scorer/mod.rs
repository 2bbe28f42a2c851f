//! Scorer adapter: the single point where resume/JD pairs leave this service.
//!
//! The scoring algorithm itself is an opaque external program. `AppState`
//! holds an `Arc<dyn Scorer>`; production wires in `ProcessScorer`, tests
//! swap in in-memory fakes.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::models::optimization::{OptimizationRequest, OptimizationResult};

mod process;

pub use process::ProcessScorer;

#[derive(Debug, Error)]
pub enum ScorerError {
    #[error("failed to start scorer '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("scorer I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("scorer exited with code {code:?}: {stderr}")]
    NonZeroExit { code: Option<i32>, stderr: String },

    #[error("scorer produced no output")]
    EmptyOutput,

    #[error("scorer output is not valid JSON: {0}")]
    InvalidOutput(#[from] serde_json::Error),

    #[error("scorer reported a failure: {0}")]
    Reported(String),

    #[error("scorer returned out-of-range score {0}")]
    ScoreOutOfRange(f64),

    #[error("scorer did not finish within {0:?}")]
    Timeout(Duration),

    #[error("scorer is shutting down")]
    Unavailable,
}

/// Turns a validated request into a score. Implement this to swap backends
/// without touching the pipeline or the handlers.
#[async_trait]
pub trait Scorer: Send + Sync {
    async fn score(&self, request: &OptimizationRequest)
        -> Result<OptimizationResult, ScorerError>;
}

/// Shape of the scorer's JSON line. Extra fields (`optimizedResume`,
/// `processingTime`, ...) are ignored.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScorerPayload {
    ats_score: f64,
    suggestions: String,
    #[serde(default)]
    error: Option<String>,
}

/// Parses the scorer's standard output. Output lines are joined without
/// separators, so a JSON document split across lines still parses.
pub fn parse_scorer_output(stdout: &[u8]) -> Result<OptimizationResult, ScorerError> {
    let text = String::from_utf8_lossy(stdout);
    let combined: String = text.lines().collect();
    let combined = combined.trim();

    if combined.is_empty() {
        return Err(ScorerError::EmptyOutput);
    }

    let payload: ScorerPayload = serde_json::from_str(combined)?;

    if let Some(message) = payload.error.filter(|m| !m.is_empty()) {
        return Err(ScorerError::Reported(message));
    }

    if !payload.ats_score.is_finite() || !(0.0..=100.0).contains(&payload.ats_score) {
        return Err(ScorerError::ScoreOutOfRange(payload.ats_score));
    }

    Ok(OptimizationResult {
        ats_score: payload.ats_score.round() as u8,
        suggestions: payload.suggestions,
    })
}
