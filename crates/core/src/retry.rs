use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{
    config::RetryPolicy,
    error::{PipelineError, Result},
    llm::{LanguageModel, SchemaHint},
};

/// Cooperative cancellation handle for one job's external calls.
#[derive(Debug, Clone)]
pub struct JobGuard {
    video_id: String,
    token: CancellationToken,
}

impl JobGuard {
    pub fn new(video_id: &str, token: CancellationToken) -> Self {
        Self {
            video_id: video_id.to_string(),
            token,
        }
    }

    pub fn video_id(&self) -> &str {
        &self.video_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn check(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(PipelineError::Cancelled {
                video_id: self.video_id.clone(),
            });
        }
        Ok(())
    }
}

/// Bounds an external call, turning an elapsed deadline into a retryable `Timeout`.
pub async fn with_timeout<T>(
    stage: &'static str,
    after: Duration,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(after, call)
        .await
        .map_err(|_| PipelineError::Timeout { stage, after })?
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the policy's attempts
/// are spent.
///
/// No attempt starts once the guard is cancelled, and the result of an attempt that was
/// in flight when cancellation arrived is discarded.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    stage: &'static str,
    guard: &JobGuard,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        guard.check()?;
        let result = op().await;
        guard.check()?;

        match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.backoff(attempt).max(e.retry_after().unwrap_or_default());
                warn!(
                    video_id = guard.video_id(),
                    stage,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying after failure"
                );
                tokio::select! {
                    _ = guard.token.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Language model decorator applying the provider retry policy, a per-call timeout, and
/// the job's cancellation to every generation.
pub struct ResilientModel {
    inner: Arc<dyn LanguageModel>,
    policy: RetryPolicy,
    timeout: Duration,
    guard: JobGuard,
}

impl ResilientModel {
    pub fn new(
        inner: Arc<dyn LanguageModel>,
        policy: RetryPolicy,
        timeout: Duration,
        guard: JobGuard,
    ) -> Self {
        Self {
            inner,
            policy,
            timeout,
            guard,
        }
    }
}

#[async_trait]
impl LanguageModel for ResilientModel {
    async fn generate(&self, prompt: &str, schema: SchemaHint) -> Result<String> {
        with_retry(&self.policy, "generate", &self.guard, || {
            with_timeout(
                "generate",
                self.timeout,
                self.inner.generate(prompt, schema),
            )
        })
        .await
    }
}
