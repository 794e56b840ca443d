use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    path::PathBuf,
    str::FromStr,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Fetching,
    Transcribing,
    Segmenting,
    GeneratingQuiz,
    PendingReview,
    Published,
    Rejected,
    Failed,
}

impl JobStatus {
    /// Terminal statuses release the per-video run slot.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Published | JobStatus::Rejected | JobStatus::Failed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Fetching => "fetching",
            JobStatus::Transcribing => "transcribing",
            JobStatus::Segmenting => "segmenting",
            JobStatus::GeneratingQuiz => "generating_quiz",
            JobStatus::PendingReview => "pending_review",
            JobStatus::Published => "published",
            JobStatus::Rejected => "rejected",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub title: String,
    pub duration_ms: u64,
    pub embed_url: String,
    pub audio_handle: String,
}

/// Transient audio file produced by the video source. Referenced from the job, never embedded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioArtifact {
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoJob {
    pub video_id: String,
    pub source_url: String,
    pub status: JobStatus,
    pub difficulty: Difficulty,
    /// Incremented each time reprocessing is requested.
    pub run: u32,
    /// Optimistic concurrency token, bumped by the store on every update.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub failure_reason: Option<String>,
    pub metadata: Option<VideoMetadata>,
    pub audio: Option<AudioArtifact>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub start_ms: u64,
    pub end_ms: u64,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub video_id: String,
    pub segments: Vec<TranscriptSegment>,
}

impl Transcript {
    /// Orders segments by start time and clamps overlapping ends onto the next start.
    pub fn from_segments(video_id: &str, mut segments: Vec<TranscriptSegment>) -> Result<Self> {
        if segments.is_empty() {
            return Err(PipelineError::TranscriptionError {
                reason: "transcript has no segments".to_string(),
            });
        }

        segments.sort_by_key(|s| s.start_ms);

        for i in 0..segments.len() {
            if segments[i].end_ms < segments[i].start_ms {
                return Err(PipelineError::TranscriptionError {
                    reason: format!(
                        "segment {} ends before it starts ({} < {})",
                        i, segments[i].end_ms, segments[i].start_ms
                    ),
                });
            }
            if let Some(next_start) = segments.get(i + 1).map(|n| n.start_ms) {
                segments[i].end_ms = segments[i].end_ms.min(next_start);
            }
        }

        Ok(Self {
            video_id: video_id.to_string(),
            segments,
        })
    }

    pub fn start_ms(&self) -> u64 {
        self.segments.first().map(|s| s.start_ms).unwrap_or(0)
    }

    pub fn end_ms(&self) -> u64 {
        self.segments.last().map(|s| s.end_ms).unwrap_or(0)
    }

    /// Text of every segment starting inside `[start_ms, end_ms)`.
    pub fn text_between(&self, start_ms: u64, end_ms: u64) -> String {
        self.segments
            .iter()
            .filter(|s| s.start_ms >= start_ms && s.start_ms < end_ms)
            .map(|s| s.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleStatus {
    #[default]
    NotStarted,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub video_id: String,
    pub module_index: u32,
    pub title: String,
    pub start_ms: u64,
    pub end_ms: u64,
    pub key_concepts: BTreeSet<String>,
    pub status: ModuleStatus,
}

impl Module {
    pub fn duration_ms(&self) -> u64 {
        self.end_ms - self.start_ms
    }
}

/// Modules produced by one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleSet {
    pub run: u32,
    pub modules: Vec<Module>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Easy,
    #[default]
    Medium,
    Hard,
}

impl Difficulty {
    pub fn as_str(self) -> &'static str {
        match self {
            Difficulty::Easy => "easy",
            Difficulty::Medium => "medium",
            Difficulty::Hard => "hard",
        }
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Difficulty {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "easy" => Ok(Difficulty::Easy),
            "medium" => Ok(Difficulty::Medium),
            "hard" => Ok(Difficulty::Hard),
            other => Err(PipelineError::Config(format!("unknown difficulty '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub prompt: String,
    /// Option key (a single uppercase letter) to option text.
    pub options: BTreeMap<String, String>,
    pub correct_answer: String,
    pub explanation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quiz {
    pub video_id: String,
    pub module_index: u32,
    pub difficulty: Difficulty,
    pub questions: Vec<Question>,
}

/// A generated quiz together with the module it was generated for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuizRecord {
    pub run: u32,
    pub revision: u32,
    pub module: Module,
    pub quiz: Quiz,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Pending,
    Approved,
    Rejected,
}

impl ReviewDecision {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ReviewDecision::Pending)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReviewDecision::Pending => "pending",
            ReviewDecision::Approved => "approved",
            ReviewDecision::Rejected => "rejected",
        }
    }
}

impl fmt::Display for ReviewDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub video_id: String,
    pub module_index: u32,
    pub run: u32,
    pub revision: u32,
    pub decision: ReviewDecision,
    pub reviewer: Option<String>,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub learner_id: String,
    pub video_id: String,
    pub module_index: u32,
    pub question_index: u32,
    pub chosen_option: String,
    pub correct: bool,
    /// Set on a missed question so the learner UI can resurface it first.
    pub flagged: bool,
    pub attempted_at: DateTime<Utc>,
    pub next_due_at: DateTime<Utc>,
}

impl AttemptRecord {
    pub fn question_key(&self) -> (&str, u32, u32) {
        (&self.video_id, self.module_index, self.question_index)
    }
}

/// An approved module with its published quiz.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedModule {
    pub module: Module,
    pub quiz: Quiz,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DueQuestion {
    pub video_id: String,
    pub module_index: u32,
    pub question_index: u32,
    pub question: Question,
    pub next_due_at: DateTime<Utc>,
    pub flagged: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(start_ms: u64, end_ms: u64, text: &str) -> TranscriptSegment {
        TranscriptSegment {
            start_ms,
            end_ms,
            text: text.to_string(),
        }
    }

    #[test]
    fn transcript_orders_and_clamps_segments() {
        let transcript = Transcript::from_segments(
            "abc123",
            vec![seg(5_000, 9_000, "b"), seg(0, 6_000, "a")],
        )
        .unwrap();

        assert_eq!(transcript.segments[0].start_ms, 0);
        assert_eq!(transcript.segments[0].end_ms, 5_000);
        for pair in transcript.segments.windows(2) {
            assert!(pair[0].end_ms <= pair[1].start_ms);
        }
    }

    #[test]
    fn transcript_rejects_inverted_segment() {
        let err = Transcript::from_segments("abc123", vec![seg(10, 5, "x")]).unwrap_err();
        assert!(matches!(err, PipelineError::TranscriptionError { .. }));
    }

    #[test]
    fn transcript_rejects_empty() {
        assert!(Transcript::from_segments("abc123", Vec::new()).is_err());
    }

    #[test]
    fn text_between_uses_segment_starts() {
        let transcript = Transcript::from_segments(
            "abc123",
            vec![seg(0, 10, " one "), seg(10, 20, "two"), seg(20, 30, "three")],
        )
        .unwrap();
        assert_eq!(transcript.text_between(0, 20), "one two");
        assert_eq!(transcript.text_between(20, 30), "three");
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Published.is_terminal());
        assert!(!JobStatus::PendingReview.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
    }

    #[test]
    fn difficulty_parses_case_insensitively() {
        assert_eq!("HARD".parse::<Difficulty>().unwrap(), Difficulty::Hard);
        assert!("extreme".parse::<Difficulty>().is_err());
    }
}
