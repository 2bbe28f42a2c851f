use serde::{Deserialize, Serialize};

/// A validated (resume, job description) pair. Immutable once received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimizationRequest {
    pub resume: String,
    pub job_description: String,
}

/// Raw request body as sent by the browser. Fields are optional so that a
/// missing field surfaces as a validation error rather than a JSON rejection.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizeResumeBody {
    #[serde(default)]
    pub resume: Option<String>,
    #[serde(default)]
    pub job_description: Option<String>,
}

impl OptimizeResumeBody {
    /// Both fields must be present and non-blank. The original bytes are kept
    /// untouched: trimming only decides emptiness, never the cache key.
    pub fn validate(self) -> Option<OptimizationRequest> {
        let resume = self.resume.filter(|s| !s.trim().is_empty())?;
        let job_description = self.job_description.filter(|s| !s.trim().is_empty())?;
        Some(OptimizationRequest {
            resume,
            job_description,
        })
    }
}

/// Scorer output as returned to callers and stored in the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationResult {
    pub ats_score: u8, // 0 – 100
    pub suggestions: String,
}
