// Repository traits for every persisted entity, and `Store`, the implementation the
// pipeline ships with: an in-memory state that can be mirrored to a JSON snapshot.
//
// The job repository carries the per-video exclusivity primitive: `claim_job` is atomic
// and `update_job` is an optimistic compare-and-set on `VideoJob::version`.

use std::{
    collections::BTreeMap,
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{
    error::{PipelineError, Result},
    types::{
        AttemptRecord, Difficulty, JobStatus, ModuleSet, QuizRecord, ReviewDecision,
        ReviewRecord, Transcript, VideoJob,
    },
};

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Atomically claims `video_id` for a new run.
    ///
    /// Creates the job on first sight. A job in a terminal status starts its next run,
    /// any other status fails with `DuplicateJob`.
    async fn claim_job(
        &self,
        video_id: &str,
        source_url: &str,
        difficulty: Difficulty,
        now: DateTime<Utc>,
    ) -> Result<VideoJob>;

    async fn get_job(&self, video_id: &str) -> Result<Option<VideoJob>>;

    /// Replaces the stored job if its version still matches, returning it with the
    /// version bumped. A stale version fails with `Conflict`.
    async fn update_job(&self, job: VideoJob) -> Result<VideoJob>;

    async fn list_jobs(&self) -> Result<Vec<VideoJob>>;
}

// ---------------------------------------------------------------------------
// Stage outputs
// ---------------------------------------------------------------------------

#[async_trait]
pub trait TranscriptRepository: Send + Sync {
    /// Stores the transcript unless one already exists; transcripts are immutable.
    /// Returns the stored transcript either way.
    async fn put_transcript(&self, transcript: Transcript) -> Result<Transcript>;

    async fn get_transcript(&self, video_id: &str) -> Result<Option<Transcript>>;
}

#[async_trait]
pub trait ModuleRepository: Send + Sync {
    async fn put_modules(&self, video_id: &str, modules: ModuleSet) -> Result<()>;

    async fn get_modules(&self, video_id: &str, run: u32) -> Result<Option<ModuleSet>>;
}

#[async_trait]
pub trait QuizRepository: Send + Sync {
    /// Stores a quiz revision together with its pending review in one write, so a stored
    /// quiz always has a review. Fails with `InvalidTransition` if the review exists.
    async fn put_quiz_for_review(&self, record: QuizRecord, review: ReviewRecord) -> Result<()>;

    async fn get_quiz(
        &self,
        video_id: &str,
        module_index: u32,
        run: u32,
        revision: u32,
    ) -> Result<Option<QuizRecord>>;
}

// ---------------------------------------------------------------------------
// Reviews and attempts
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ReviewRepository: Send + Sync {
    /// Replaces the record with the same key if its decision is still `expected`.
    /// A record decided concurrently fails with `InvalidTransition`.
    async fn replace_review(&self, expected: ReviewDecision, record: ReviewRecord) -> Result<()>;

    async fn list_reviews(&self, video_id: Option<&str>) -> Result<Vec<ReviewRecord>>;
}

#[async_trait]
pub trait AttemptRepository: Send + Sync {
    async fn append_attempt(&self, attempt: AttemptRecord) -> Result<()>;

    /// A learner's attempts in the order they were recorded.
    async fn attempts_for(&self, learner_id: &str) -> Result<Vec<AttemptRecord>>;
}

pub trait Repository:
    JobRepository
    + TranscriptRepository
    + ModuleRepository
    + QuizRepository
    + ReviewRepository
    + AttemptRepository
{
}

impl<T> Repository for T where
    T: JobRepository
        + TranscriptRepository
        + ModuleRepository
        + QuizRepository
        + ReviewRepository
        + AttemptRepository
{
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
    jobs: BTreeMap<String, VideoJob>,
    transcripts: BTreeMap<String, Transcript>,
    modules: BTreeMap<String, Vec<ModuleSet>>,
    quizzes: Vec<QuizRecord>,
    reviews: Vec<ReviewRecord>,
    attempts: Vec<AttemptRecord>,
}

/// In-memory state, optionally mirrored to a JSON snapshot shared between processes.
///
/// A file-backed store re-reads the snapshot before every operation. Mutations hold an
/// exclusive advisory lock on `<path>.lock` from that read until the new snapshot is
/// renamed into place, so two stores on the same path never lose each other's writes.
pub struct Store {
    state: Mutex<StoreState>,
    path: Option<PathBuf>,
}

impl Store {
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            path: None,
        }
    }

    /// Opens (or starts) a store mirrored to the JSON snapshot at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let state = load_snapshot(&path).await?;
        info!(
            path = %path.display(),
            jobs = state.jobs.len(),
            "Loaded pipeline store"
        );

        Ok(Self {
            state: Mutex::new(state),
            path: Some(path),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Runs `f` against the latest state.
    async fn read<T>(&self, f: impl FnOnce(&StoreState) -> T + Send) -> Result<T> {
        let mut state = self.state.lock().await;
        if let Some(path) = &self.path {
            // Snapshots are replaced by rename, so an unlocked read never sees half a file.
            *state = load_snapshot(path).await?;
        }
        Ok(f(&state))
    }

    /// Applies `f` to the latest state and persists the result.
    ///
    /// When `f` fails nothing is written.
    async fn write<T: Send>(
        &self,
        f: impl FnOnce(&mut StoreState) -> Result<T> + Send,
    ) -> Result<T> {
        let mut state = self.state.lock().await;
        let Some(path) = &self.path else {
            return f(&mut state);
        };

        let _lock = lock_snapshot(path).await?;
        *state = load_snapshot(path).await?;
        let out = f(&mut state)?;
        write_snapshot(path, &state).await?;
        Ok(out)
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

/// Blocks on the exclusive snapshot lock. Dropping the returned file releases it.
async fn lock_snapshot(path: &Path) -> Result<File> {
    let lock_path = lock_path(path);
    let file = tokio::task::spawn_blocking(move || -> std::io::Result<File> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        file.lock()?;
        Ok(file)
    })
    .await
    .map_err(std::io::Error::other)??;
    Ok(file)
}

async fn load_snapshot(path: &Path) -> Result<StoreState> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StoreState::default()),
        Err(e) => Err(e.into()),
    }
}

/// Writes the snapshot next to the target and renames it into place.
async fn write_snapshot(path: &Path, state: &StoreState) -> Result<()> {
    let json = serde_json::to_vec_pretty(state)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    debug!(path = %path.display(), "Store snapshot written");
    Ok(())
}

#[async_trait]
impl JobRepository for Store {
    async fn claim_job(
        &self,
        video_id: &str,
        source_url: &str,
        difficulty: Difficulty,
        now: DateTime<Utc>,
    ) -> Result<VideoJob> {
        self.write(|state| {
            let job = match state.jobs.get(video_id) {
                Some(existing) if !existing.status.is_terminal() => {
                    return Err(PipelineError::DuplicateJob {
                        video_id: video_id.to_string(),
                        status: existing.status,
                    });
                }
                Some(existing) => VideoJob {
                    source_url: source_url.to_string(),
                    status: JobStatus::Queued,
                    difficulty,
                    run: existing.run + 1,
                    version: existing.version + 1,
                    updated_at: now,
                    failure_reason: None,
                    audio: None,
                    ..existing.clone()
                },
                None => VideoJob {
                    video_id: video_id.to_string(),
                    source_url: source_url.to_string(),
                    status: JobStatus::Queued,
                    difficulty,
                    run: 1,
                    version: 0,
                    created_at: now,
                    updated_at: now,
                    failure_reason: None,
                    metadata: None,
                    audio: None,
                },
            };

            state.jobs.insert(video_id.to_string(), job.clone());
            Ok(job)
        })
        .await
    }

    async fn get_job(&self, video_id: &str) -> Result<Option<VideoJob>> {
        self.read(|state| state.jobs.get(video_id).cloned()).await
    }

    async fn update_job(&self, mut job: VideoJob) -> Result<VideoJob> {
        self.write(move |state| {
            let stored = state
                .jobs
                .get_mut(&job.video_id)
                .ok_or_else(|| PipelineError::NotFound {
                    entity: "job",
                    key: job.video_id.clone(),
                })?;
            if stored.version != job.version {
                return Err(PipelineError::Conflict {
                    video_id: job.video_id,
                    expected: job.version,
                });
            }

            job.version += 1;
            *stored = job.clone();
            Ok(job)
        })
        .await
    }

    async fn list_jobs(&self) -> Result<Vec<VideoJob>> {
        self.read(|state| state.jobs.values().cloned().collect())
            .await
    }
}

#[async_trait]
impl TranscriptRepository for Store {
    async fn put_transcript(&self, transcript: Transcript) -> Result<Transcript> {
        self.write(move |state| {
            if let Some(existing) = state.transcripts.get(&transcript.video_id) {
                return Ok(existing.clone());
            }
            state
                .transcripts
                .insert(transcript.video_id.clone(), transcript.clone());
            Ok(transcript)
        })
        .await
    }

    async fn get_transcript(&self, video_id: &str) -> Result<Option<Transcript>> {
        self.read(|state| state.transcripts.get(video_id).cloned())
            .await
    }
}

#[async_trait]
impl ModuleRepository for Store {
    async fn put_modules(&self, video_id: &str, modules: ModuleSet) -> Result<()> {
        self.write(move |state| {
            let runs = state.modules.entry(video_id.to_string()).or_default();
            runs.retain(|set| set.run != modules.run);
            runs.push(modules);
            Ok(())
        })
        .await
    }

    async fn get_modules(&self, video_id: &str, run: u32) -> Result<Option<ModuleSet>> {
        self.read(|state| {
            state
                .modules
                .get(video_id)
                .and_then(|runs| runs.iter().find(|set| set.run == run))
                .cloned()
        })
        .await
    }
}

fn same_quiz(a: &QuizRecord, b: &QuizRecord) -> bool {
    a.quiz.video_id == b.quiz.video_id
        && a.quiz.module_index == b.quiz.module_index
        && a.run == b.run
        && a.revision == b.revision
}

#[async_trait]
impl QuizRepository for Store {
    async fn put_quiz_for_review(&self, record: QuizRecord, review: ReviewRecord) -> Result<()> {
        self.write(move |state| {
            if let Some(existing) = state.reviews.iter().find(|r| same_review(r, &review)) {
                return Err(PipelineError::InvalidTransition {
                    from: existing.decision,
                    to: review.decision,
                });
            }
            state.quizzes.retain(|q| !same_quiz(q, &record));
            state.quizzes.push(record);
            state.reviews.push(review);
            Ok(())
        })
        .await
    }

    async fn get_quiz(
        &self,
        video_id: &str,
        module_index: u32,
        run: u32,
        revision: u32,
    ) -> Result<Option<QuizRecord>> {
        self.read(|state| {
            state
                .quizzes
                .iter()
                .find(|q| {
                    q.quiz.video_id == video_id
                        && q.quiz.module_index == module_index
                        && q.run == run
                        && q.revision == revision
                })
                .cloned()
        })
        .await
    }
}

fn same_review(a: &ReviewRecord, b: &ReviewRecord) -> bool {
    a.video_id == b.video_id
        && a.module_index == b.module_index
        && a.run == b.run
        && a.revision == b.revision
}

#[async_trait]
impl ReviewRepository for Store {
    async fn replace_review(&self, expected: ReviewDecision, record: ReviewRecord) -> Result<()> {
        self.write(move |state| {
            let stored = state
                .reviews
                .iter_mut()
                .find(|r| same_review(r, &record))
                .ok_or_else(|| PipelineError::NotFound {
                    entity: "review",
                    key: format!(
                        "{}/{} run {} revision {}",
                        record.video_id, record.module_index, record.run, record.revision
                    ),
                })?;
            if stored.decision != expected {
                return Err(PipelineError::InvalidTransition {
                    from: stored.decision,
                    to: record.decision,
                });
            }

            *stored = record;
            Ok(())
        })
        .await
    }

    async fn list_reviews(&self, video_id: Option<&str>) -> Result<Vec<ReviewRecord>> {
        self.read(|state| {
            state
                .reviews
                .iter()
                .filter(|r| video_id.is_none_or(|id| r.video_id == id))
                .cloned()
                .collect()
        })
        .await
    }
}

#[async_trait]
impl AttemptRepository for Store {
    async fn append_attempt(&self, attempt: AttemptRecord) -> Result<()> {
        self.write(move |state| {
            state.attempts.push(attempt);
            Ok(())
        })
        .await
    }

    async fn attempts_for(&self, learner_id: &str) -> Result<Vec<AttemptRecord>> {
        self.read(|state| {
            state
                .attempts
                .iter()
                .filter(|a| a.learner_id == learner_id)
                .cloned()
                .collect()
        })
        .await
    }
}
