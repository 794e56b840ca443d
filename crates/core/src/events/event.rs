use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use uuid::Uuid;

use crate::types::{JobStatus, ReviewDecision};

/// Lifecycle notifications published by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    JobQueued {
        video_id: String,
        run: u32,
    },
    StageStarted {
        video_id: String,
        stage: JobStatus,
    },
    TranscriptStored {
        video_id: String,
        segments: usize,
    },
    ModulesPlanned {
        video_id: String,
        modules: usize,
    },
    QuizReady {
        video_id: String,
        module_index: u32,
        revision: u32,
    },
    QuizFailed {
        video_id: String,
        module_index: u32,
        reason: String,
    },
    AwaitingReview {
        video_id: String,
        pending: usize,
    },
    ReviewDecided {
        video_id: String,
        module_index: u32,
        decision: ReviewDecision,
    },
    JobPublished {
        video_id: String,
    },
    JobRejected {
        video_id: String,
    },
    JobFailed {
        video_id: String,
        reason: String,
    },
    JobCancelled {
        video_id: String,
    },
}

impl PipelineEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            PipelineEvent::JobQueued { .. } => "job.queued",
            PipelineEvent::StageStarted { .. } => "job.stage_started",
            PipelineEvent::TranscriptStored { .. } => "transcript.stored",
            PipelineEvent::ModulesPlanned { .. } => "modules.planned",
            PipelineEvent::QuizReady { .. } => "quiz.ready",
            PipelineEvent::QuizFailed { .. } => "quiz.failed",
            PipelineEvent::AwaitingReview { .. } => "job.awaiting_review",
            PipelineEvent::ReviewDecided { .. } => "review.decided",
            PipelineEvent::JobPublished { .. } => "job.published",
            PipelineEvent::JobRejected { .. } => "job.rejected",
            PipelineEvent::JobFailed { .. } => "job.failed",
            PipelineEvent::JobCancelled { .. } => "job.cancelled",
        }
    }

    pub fn video_id(&self) -> &str {
        match self {
            PipelineEvent::JobQueued { video_id, .. }
            | PipelineEvent::StageStarted { video_id, .. }
            | PipelineEvent::TranscriptStored { video_id, .. }
            | PipelineEvent::ModulesPlanned { video_id, .. }
            | PipelineEvent::QuizReady { video_id, .. }
            | PipelineEvent::QuizFailed { video_id, .. }
            | PipelineEvent::AwaitingReview { video_id, .. }
            | PipelineEvent::ReviewDecided { video_id, .. }
            | PipelineEvent::JobPublished { video_id }
            | PipelineEvent::JobRejected { video_id }
            | PipelineEvent::JobFailed { video_id, .. }
            | PipelineEvent::JobCancelled { video_id } => video_id,
        }
    }

    /// Events after which the job waits on someone outside the pipeline.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            PipelineEvent::AwaitingReview { .. }
                | PipelineEvent::JobPublished { .. }
                | PipelineEvent::JobRejected { .. }
                | PipelineEvent::JobFailed { .. }
                | PipelineEvent::JobCancelled { .. }
        )
    }
}

pub struct EnrichedEvent {
    pub event: PipelineEvent,
    pub event_id: Uuid,
    pub session_id: Uuid,
    pub ingest_seq: u64,
    pub timestamp: DateTime<Utc>,
    pub ingested_at: Instant,
}
