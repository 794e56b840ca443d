//! Human approval of generated content.
//!
//! `pending` is the only state a record can leave, and it can only go to `approved` or
//! `rejected`. A rejected module is resubmitted through a fresh record; the rejected one
//! stays as it was for audit.

use chrono::{DateTime, Utc};

use crate::{
    error::{PipelineError, Result},
    types::{QuizRecord, ReviewDecision, ReviewRecord},
};

#[derive(Debug, Default, Clone, Copy)]
pub struct ReviewGate;

impl ReviewGate {
    /// Pending record for a freshly generated quiz revision.
    pub fn open(&self, quiz: &QuizRecord, now: DateTime<Utc>) -> ReviewRecord {
        ReviewRecord {
            video_id: quiz.quiz.video_id.clone(),
            module_index: quiz.quiz.module_index,
            run: quiz.run,
            revision: quiz.revision,
            decision: ReviewDecision::Pending,
            reviewer: None,
            created_at: now,
            decided_at: None,
        }
    }

    pub fn can_transition(from: ReviewDecision, to: ReviewDecision) -> bool {
        matches!(
            (from, to),
            (
                ReviewDecision::Pending,
                ReviewDecision::Approved | ReviewDecision::Rejected
            )
        )
    }

    /// Applies an administrator's decision, returning the decided record.
    pub fn decide(
        &self,
        record: &ReviewRecord,
        decision: ReviewDecision,
        reviewer: &str,
        now: DateTime<Utc>,
    ) -> Result<ReviewRecord> {
        if !Self::can_transition(record.decision, decision) {
            return Err(PipelineError::InvalidTransition {
                from: record.decision,
                to: decision,
            });
        }

        Ok(ReviewRecord {
            decision,
            reviewer: Some(reviewer.to_string()),
            decided_at: Some(now),
            ..record.clone()
        })
    }

    /// Whether a module may get a new quiz revision: only after its latest one was rejected.
    pub fn allows_resubmission(latest: &ReviewRecord) -> bool {
        latest.decision == ReviewDecision::Rejected
    }
}
