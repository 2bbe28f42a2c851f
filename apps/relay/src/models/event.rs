use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::Environment;

/// Pushed to real-time subscribers after a request completes.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionEvent {
    pub pid: u32,
    pub ats_score: u8,
    pub timestamp: DateTime<Utc>,
    /// Request latency in seconds.
    pub latency: f64,
    pub environment: Environment,
}

/// First frame every subscriber receives.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectedEvent {
    pub pid: u32,
    pub status: &'static str,
    pub environment: Environment,
}

impl ConnectedEvent {
    pub fn new(pid: u32, environment: Environment) -> Self {
        Self {
            pid,
            status: "connected",
            environment,
        }
    }
}
