use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::cache::CacheError;
use crate::scorer::ScorerError;

pub const VALIDATION_MESSAGE: &str = "Resume and job description are required";
pub const OPTIMIZATION_FAILED_MESSAGE: &str = "Optimization failed. Please try again.";
pub const RATE_LIMITED_MESSAGE: &str = "Too many requests, please try again later.";

/// Application-level error type.
/// Implements `IntoResponse` so Axum handlers can return `Result<T, AppError>`.
/// Bodies are `{"error": "<message>"}` and never carry internal detail.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Scorer error: {0}")]
    Scorer(#[from] ScorerError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Rate limit exceeded")]
    RateLimited,
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AppError::Scorer(_) | AppError::Cache(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let pid = std::process::id();
        let message = match &self {
            AppError::Validation(detail) => {
                tracing::info!(pid, "Rejected request: {detail}");
                VALIDATION_MESSAGE
            }
            AppError::RateLimited => RATE_LIMITED_MESSAGE,
            AppError::Scorer(e) => {
                tracing::error!(pid, "Scorer error: {e}");
                OPTIMIZATION_FAILED_MESSAGE
            }
            AppError::Cache(e) => {
                tracing::error!(pid, "Cache error: {e}");
                OPTIMIZATION_FAILED_MESSAGE
            }
        };

        (self.status(), Json(json!({ "error": message }))).into_response()
    }
}
