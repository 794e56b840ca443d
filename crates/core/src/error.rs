use std::time::Duration;

use thiserror::Error;

use crate::types::{JobStatus, ReviewDecision};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Source unavailable for {url}: {reason}")]
    SourceUnavailable { url: String, reason: String },

    #[error("Source rate limited for {url}")]
    SourceRateLimited { url: String },

    #[error("Rate limit exceeded for provider {provider}, retry after {retry_after:?}")]
    RateLimitExceeded {
        provider: String,
        retry_after: Duration,
    },

    #[error("Transcription failed: {reason}")]
    TranscriptionError { reason: String },

    #[error("Language model provider error: {reason}")]
    ProviderError { reason: String },

    #[error("Quiz validation failed for module {module_index}: {reason}")]
    QuizValidationError { module_index: u32, reason: String },

    #[error("Quiz generation failed for module(s) {}", failed_modules(.failures))]
    QuizGenerationFailed { failures: Vec<(u32, String)> },

    #[error("Job {video_id} has no quiz awaiting review")]
    NothingToReview { video_id: String },

    #[error("{stage} timed out after {after:?}")]
    Timeout { stage: &'static str, after: Duration },

    #[error("Job {video_id} is already running ({status})")]
    DuplicateJob { video_id: String, status: JobStatus },

    #[error("Invalid review transition from {from} to {to}")]
    InvalidTransition {
        from: ReviewDecision,
        to: ReviewDecision,
    },

    #[error("Job {video_id} cannot be retried from status {status}")]
    NotRetryable { video_id: String, status: JobStatus },

    #[error("Job {video_id} was cancelled")]
    Cancelled { video_id: String },

    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("Content not available: {key}")]
    NotAvailable { key: String },

    #[error("Option {chosen} is not one of the question's options")]
    InvalidAnswer { chosen: String },

    #[error("Invalid source URL: {url}")]
    InvalidSource { url: String },

    #[error("Concurrent update of job {video_id}, expected version {expected}")]
    Conflict { video_id: String, expected: u64 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("API request failed: {0}")]
    ApiError(#[from] reqwest::Error),
}

impl PipelineError {
    /// Whether a stage may retry the failed call with backoff before giving up.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::SourceUnavailable { .. }
                | PipelineError::SourceRateLimited { .. }
                | PipelineError::RateLimitExceeded { .. }
                | PipelineError::TranscriptionError { .. }
                | PipelineError::ProviderError { .. }
                | PipelineError::Timeout { .. }
                | PipelineError::ApiError(_)
        )
    }

    /// Minimum delay the caller must wait before retrying, when the error carries one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            PipelineError::RateLimitExceeded { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

fn failed_modules(failures: &[(u32, String)]) -> String {
    failures
        .iter()
        .map(|(index, reason)| format!("{index} ({reason})"))
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, PipelineError>;
