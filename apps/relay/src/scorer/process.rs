use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

use super::{parse_scorer_output, Scorer, ScorerError};
use crate::config::Config;
use crate::models::optimization::{OptimizationRequest, OptimizationResult};

/// Runs the external scoring program once per call:
/// `<program> <leading args...> <resume> <jobDescription>`.
///
/// Every run is bounded by `timeout`, and at most `max_concurrency` runs are
/// in flight per worker. The child is killed if the call is dropped.
#[derive(Debug, Clone)]
pub struct ProcessScorer {
    program: String,
    leading_args: Vec<String>,
    timeout: Duration,
    permits: Arc<Semaphore>,
}

impl ProcessScorer {
    pub fn new(
        program: impl Into<String>,
        leading_args: Vec<String>,
        timeout: Duration,
        max_concurrency: usize,
    ) -> Self {
        Self {
            program: program.into(),
            leading_args,
            timeout,
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.scorer_program.clone(),
            config.scorer_args.clone(),
            config.scorer_timeout,
            config.scorer_max_concurrency,
        )
    }

    async fn run(&self, request: &OptimizationRequest) -> Result<Vec<u8>, ScorerError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ScorerError::Unavailable)?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.leading_args)
            .arg(&request.resume)
            .arg(&request.job_description)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|source| ScorerError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                warn!(
                    "Scorer '{}' exceeded {:?}; process killed",
                    self.program, self.timeout
                );
                return Err(ScorerError::Timeout(self.timeout));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ScorerError::NonZeroExit {
                code: output.status.code(),
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(output.stdout)
    }
}

#[async_trait]
impl Scorer for ProcessScorer {
    #[instrument(
        skip(self, request),
        fields(resume_len = request.resume.len(), jd_len = request.job_description.len())
    )]
    async fn score(
        &self,
        request: &OptimizationRequest,
    ) -> Result<OptimizationResult, ScorerError> {
        let started = Instant::now();
        let stdout = self.run(request).await?;
        let result = parse_scorer_output(&stdout)?;

        debug!(
            "Scorer finished in {}ms: atsScore={}",
            started.elapsed().as_millis(),
            result.ats_score
        );

        Ok(result)
    }
}
