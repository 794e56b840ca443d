//! Per-video pipeline: fetch, transcribe, segment, generate quizzes, then wait for review.
//!
//! Every stage output is persisted as soon as it exists and `run_job` skips any stage whose
//! output is already stored, so a failed or cancelled job resumes where it stopped.
//! `VideoJob::status` is only written through the store's versioned update.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};
use futures::{StreamExt, stream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    clock::Clock,
    config::PipelineConfig,
    error::{PipelineError, Result},
    events::{EventBus, PipelineEvent},
    gate::{FetchGate, ResourceClass},
    llm::LanguageModel,
    quiz::QuizGenerator,
    retry::{JobGuard, ResilientModel, with_retry, with_timeout},
    review::ReviewGate,
    scheduler::SpacedRepetitionScheduler,
    segmenter::{ModuleSegmenter, module_text},
    source::{SourceMetadata, VideoSource, embed_url, extract_video_id},
    store::{
        AttemptRepository, JobRepository, ModuleRepository, QuizRepository, Repository,
        ReviewRepository, TranscriptRepository,
    },
    transcription::Transcriber,
    types::{
        AttemptRecord, AudioArtifact, Difficulty, DueQuestion, JobStatus, Module, ModuleSet,
        ModuleStatus, PublishedModule, QuizRecord, ReviewDecision, ReviewRecord, Transcript,
        VideoJob, VideoMetadata,
    },
};

const CANCELLED_REASON: &str = "cancelled";

/// External systems the pipeline drives.
pub struct Collaborators {
    pub source: Arc<dyn VideoSource>,
    pub transcriber: Arc<dyn Transcriber>,
    pub llm: Arc<dyn LanguageModel>,
}

pub struct Orchestrator {
    config: PipelineConfig,
    store: Arc<dyn Repository>,
    source: Arc<dyn VideoSource>,
    transcriber: Arc<dyn Transcriber>,
    llm: Arc<dyn LanguageModel>,
    gate: FetchGate,
    review: ReviewGate,
    scheduler: SpacedRepetitionScheduler,
    clock: Arc<dyn Clock>,
    bus: EventBus,
    running: Mutex<HashMap<String, CancellationToken>>,
}

impl Orchestrator {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn Repository>,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            gate: FetchGate::new(config.gate.clone()),
            scheduler: SpacedRepetitionScheduler::new(config.scheduler.clone()),
            review: ReviewGate,
            store,
            source: collaborators.source,
            transcriber: collaborators.transcriber,
            llm: collaborators.llm,
            clock,
            bus: EventBus::default(),
            running: Mutex::new(HashMap::new()),
            config,
        })
    }

    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = bus;
        self
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // ---------------------------------------------------------------------
    // Ingestion
    // ---------------------------------------------------------------------

    /// Registers a video for processing and returns its natural key.
    ///
    /// Fails with `DuplicateJob` while a run for the same video is still active. Submitting
    /// a video whose job is published, rejected or failed starts a new run.
    pub async fn submit_video(
        &self,
        source_url: &str,
        difficulty: Option<Difficulty>,
    ) -> Result<String> {
        let video_id = extract_video_id(source_url)?;
        let difficulty = difficulty.unwrap_or(self.config.quiz.default_difficulty);

        let job = self
            .store
            .claim_job(&video_id, source_url.trim(), difficulty, self.clock.now())
            .await?;

        info!(
            video_id = video_id.as_str(),
            run = job.run,
            %difficulty,
            "Video job queued"
        );
        self.bus.publish(PipelineEvent::JobQueued {
            video_id: video_id.clone(),
            run: job.run,
        });
        Ok(video_id)
    }

    /// Submits and runs a video to the review gate.
    pub async fn process(
        &self,
        source_url: &str,
        difficulty: Option<Difficulty>,
    ) -> Result<VideoJob> {
        let video_id = self.submit_video(source_url, difficulty).await?;
        self.run_job(&video_id).await
    }

    /// Runs a queued job through every stage it has not completed yet.
    ///
    /// The caller whose versioned update moves the job out of `queued` owns the run; any
    /// concurrent caller gets `DuplicateJob` and leaves the job alone. On failure the job is
    /// left `failed` with the error as its reason and the error is returned. A job already
    /// in a terminal status is returned untouched.
    pub async fn run_job(&self, video_id: &str) -> Result<VideoJob> {
        let mut job = self.load_job(video_id).await?;
        if job.status.is_terminal() {
            debug!(video_id, status = %job.status, "Job already settled");
            return Ok(job);
        }
        if job.status != JobStatus::Queued {
            return Err(PipelineError::DuplicateJob {
                video_id: video_id.to_string(),
                status: job.status,
            });
        }

        let token = {
            let mut running = self.running.lock().expect("running jobs poisoned");
            if running.contains_key(video_id) {
                return Err(PipelineError::DuplicateJob {
                    video_id: video_id.to_string(),
                    status: job.status,
                });
            }
            let token = CancellationToken::new();
            running.insert(video_id.to_string(), token.clone());
            token
        };

        let result = match self.start_run(&mut job).await {
            Ok(()) => {
                let guard = JobGuard::new(video_id, token);
                self.drive(job, &guard).await.map_err(RunError::Owned)
            }
            Err(e) => Err(RunError::NotStarted(e)),
        };
        self.running
            .lock()
            .expect("running jobs poisoned")
            .remove(video_id);

        match result {
            Ok(job) => Ok(job),
            Err(RunError::NotStarted(e)) => Err(e),
            Err(RunError::Owned(e @ PipelineError::Conflict { .. })) => {
                Err(self.superseded(video_id, e).await)
            }
            Err(RunError::Owned(e)) => {
                if let Err(store_err) = self.record_failure(video_id, &e).await {
                    error!(video_id, error = %store_err, "Could not record job failure");
                }
                Err(e)
            }
        }
    }

    /// Moves a queued job to its first outstanding stage.
    async fn start_run(&self, job: &mut VideoJob) -> Result<()> {
        let first = self.first_stage(job).await?;
        job.status = first;
        job.failure_reason = None;

        match self.save(job).await {
            Err(PipelineError::Conflict { .. }) => {
                let status = self
                    .store
                    .get_job(&job.video_id)
                    .await?
                    .map_or(first, |current| current.status);
                debug!(video_id = job.video_id.as_str(), %status, "Run claimed elsewhere");
                Err(PipelineError::DuplicateJob {
                    video_id: job.video_id.clone(),
                    status,
                })
            }
            other => other,
        }
    }

    async fn first_stage(&self, job: &VideoJob) -> Result<JobStatus> {
        if self.store.get_transcript(&job.video_id).await?.is_none() {
            return Ok(if job.audio.is_some() {
                JobStatus::Transcribing
            } else {
                JobStatus::Fetching
            });
        }
        if self.store.get_modules(&job.video_id, job.run).await?.is_none() {
            return Ok(JobStatus::Segmenting);
        }
        Ok(JobStatus::GeneratingQuiz)
    }

    /// A running job was updated by someone else, typically `cancel` from another
    /// process. Whatever they wrote stands.
    async fn superseded(&self, video_id: &str, cause: PipelineError) -> PipelineError {
        match self.store.get_job(video_id).await {
            Ok(Some(job)) if job.failure_reason.as_deref() == Some(CANCELLED_REASON) => {
                info!(video_id, "Job cancelled by another process");
                self.bus.publish(PipelineEvent::JobCancelled {
                    video_id: video_id.to_string(),
                });
                PipelineError::Cancelled {
                    video_id: video_id.to_string(),
                }
            }
            Ok(_) => {
                warn!(video_id, error = %cause, "Job changed while running, stopping");
                cause
            }
            Err(e) => {
                error!(video_id, error = %e, "Could not reload job");
                cause
            }
        }
    }

    /// Puts a failed job back in the queue without running it.
    pub async fn requeue(&self, video_id: &str) -> Result<VideoJob> {
        let mut job = self.load_job(video_id).await?;
        if job.status != JobStatus::Failed {
            return Err(PipelineError::NotRetryable {
                video_id: video_id.to_string(),
                status: job.status,
            });
        }

        job.status = JobStatus::Queued;
        job.failure_reason = None;
        self.save(&mut job).await?;

        info!(video_id, run = job.run, "Job requeued");
        self.bus.publish(PipelineEvent::JobQueued {
            video_id: video_id.to_string(),
            run: job.run,
        });
        Ok(job)
    }

    /// Resumes a failed job from its first incomplete stage.
    pub async fn retry(&self, video_id: &str) -> Result<VideoJob> {
        self.requeue(video_id).await?;
        self.run_job(video_id).await
    }

    /// Stops a job from issuing further external calls.
    ///
    /// A running job finishes its in-flight call, discards the result and ends `failed`
    /// with reason `cancelled`. A job that is not running in this process but sits in an
    /// active stage is marked the same way, and a run in another process sharing the store
    /// stops at its next job update. Returns false when there was nothing to cancel.
    pub async fn cancel(&self, video_id: &str) -> Result<bool> {
        let token = self
            .running
            .lock()
            .expect("running jobs poisoned")
            .get(video_id)
            .cloned();
        if let Some(token) = token {
            info!(video_id, "Cancelling running job");
            token.cancel();
            return Ok(true);
        }

        let mut job = self.load_job(video_id).await?;
        if job.status.is_terminal() || job.status == JobStatus::PendingReview {
            return Ok(false);
        }

        job.status = JobStatus::Failed;
        job.failure_reason = Some(CANCELLED_REASON.to_string());
        self.save(&mut job).await?;
        info!(video_id, "Cancelled idle job");
        self.bus.publish(PipelineEvent::JobCancelled {
            video_id: video_id.to_string(),
        });
        Ok(true)
    }

    // ---------------------------------------------------------------------
    // Stages
    // ---------------------------------------------------------------------

    async fn drive(&self, mut job: VideoJob, guard: &JobGuard) -> Result<VideoJob> {
        let transcript = match self.store.get_transcript(&job.video_id).await? {
            Some(transcript) => {
                debug!(video_id = job.video_id.as_str(), "Reusing stored transcript");
                transcript
            }
            None => self.ingest(&mut job, guard).await?,
        };
        self.release_audio(&mut job).await?;

        let modules = match self.store.get_modules(&job.video_id, job.run).await? {
            Some(set) => set.modules,
            None => self.segment(&mut job, &transcript, guard).await?,
        };

        self.generate_quizzes(&mut job, &transcript, &modules, guard)
            .await?;
        self.settle(&mut job).await?;
        Ok(job)
    }

    async fn ingest(&self, job: &mut VideoJob, guard: &JobGuard) -> Result<Transcript> {
        let audio = match job.audio.clone() {
            Some(audio) => audio,
            None => {
                self.advance(job, JobStatus::Fetching).await?;

                let metadata = match job.metadata.clone() {
                    Some(metadata) => metadata,
                    None => {
                        let fetched = self.fetch_metadata(&job.source_url, guard).await?;
                        let metadata = VideoMetadata {
                            embed_url: embed_url_for(&job.video_id, &job.source_url),
                            title: fetched.title,
                            duration_ms: fetched.duration_ms,
                            audio_handle: fetched.audio_handle,
                        };
                        job.metadata = Some(metadata.clone());
                        self.save(job).await?;
                        metadata
                    }
                };

                let audio = self
                    .download_audio(&job.video_id, &metadata.audio_handle, guard)
                    .await?;
                job.audio = Some(audio.clone());
                self.save(job).await?;
                audio
            }
        };

        self.advance(job, JobStatus::Transcribing).await?;
        let segments = with_retry(
            &self.config.retry.transcription,
            "transcribe",
            guard,
            || {
                with_timeout(
                    "transcribe",
                    self.config.timeouts.transcribe,
                    self.transcriber.transcribe(&audio),
                )
            },
        )
        .await?;

        let transcript = Transcript::from_segments(&job.video_id, segments)?;
        let transcript = self.store.put_transcript(transcript).await?;
        info!(
            video_id = job.video_id.as_str(),
            segments = transcript.segments.len(),
            "Transcript stored"
        );
        self.bus.publish(PipelineEvent::TranscriptStored {
            video_id: job.video_id.clone(),
            segments: transcript.segments.len(),
        });
        Ok(transcript)
    }

    async fn fetch_metadata(&self, source_url: &str, guard: &JobGuard) -> Result<SourceMetadata> {
        with_retry(&self.config.retry.source, "fetch_metadata", guard, || async {
            let _permit = self
                .gate
                .acquire(ResourceClass::Metadata, self.source.provider())
                .await?;
            with_timeout(
                "fetch_metadata",
                self.config.timeouts.fetch,
                self.source.fetch_metadata(source_url),
            )
            .await
        })
        .await
    }

    async fn download_audio(
        &self,
        video_id: &str,
        audio_handle: &str,
        guard: &JobGuard,
    ) -> Result<AudioArtifact> {
        with_retry(&self.config.retry.source, "download_audio", guard, || async {
            let _permit = self
                .gate
                .acquire(ResourceClass::Download, self.source.provider())
                .await?;
            with_timeout(
                "download_audio",
                self.config.timeouts.fetch,
                self.source.download_audio(video_id, audio_handle),
            )
            .await
        })
        .await
    }

    /// Drops the audio reference once a transcript exists. Release failures only warn.
    async fn release_audio(&self, job: &mut VideoJob) -> Result<()> {
        let Some(audio) = job.audio.take() else {
            return Ok(());
        };

        if let Err(e) = self.source.release_audio(&audio).await {
            warn!(
                video_id = job.video_id.as_str(),
                path = %audio.path.display(),
                error = %e,
                "Could not release audio artifact"
            );
        }
        self.save(job).await
    }

    async fn segment(
        &self,
        job: &mut VideoJob,
        transcript: &Transcript,
        guard: &JobGuard,
    ) -> Result<Vec<Module>> {
        self.advance(job, JobStatus::Segmenting).await?;

        let segmenter = ModuleSegmenter::new(self.model_for(guard), self.config.segmenter.clone());
        let modules = segmenter.segment(transcript).await?;
        guard.check()?;

        self.store
            .put_modules(
                &job.video_id,
                ModuleSet {
                    run: job.run,
                    modules: modules.clone(),
                },
            )
            .await?;
        info!(
            video_id = job.video_id.as_str(),
            modules = modules.len(),
            "Modules planned"
        );
        self.bus.publish(PipelineEvent::ModulesPlanned {
            video_id: job.video_id.clone(),
            modules: modules.len(),
        });
        Ok(modules)
    }

    /// Generates the quizzes this run is still missing, `fan_out` modules at a time.
    ///
    /// Each module succeeds or fails on its own; successful quizzes are stored with a
    /// pending review even when a sibling fails.
    async fn generate_quizzes(
        &self,
        job: &mut VideoJob,
        transcript: &Transcript,
        modules: &[Module],
        guard: &JobGuard,
    ) -> Result<()> {
        let done: HashSet<u32> = self
            .latest_reviews(&job.video_id, job.run)
            .await?
            .into_keys()
            .collect();
        let missing: Vec<Module> = modules
            .iter()
            .filter(|m| !done.contains(&m.module_index))
            .cloned()
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        self.advance(job, JobStatus::GeneratingQuiz).await?;

        let generator = QuizGenerator::new(self.model_for(guard), self.config.quiz.clone());
        let (run, difficulty) = (job.run, job.difficulty);
        let generator = &generator;

        let outcomes: Vec<(u32, Result<(QuizRecord, ReviewRecord)>)> = stream::iter(missing)
            .map(|module: Module| async move {
                let outcome = self
                    .generate_module_quiz(generator, &module, transcript, run, 1, difficulty, guard)
                    .await;
                (module.module_index, outcome)
            })
            .buffer_unordered(self.config.quiz.fan_out)
            .collect()
            .await;
        guard.check()?;

        let mut failures: Vec<(u32, String)> = outcomes
            .into_iter()
            .filter_map(|(index, outcome)| outcome.err().map(|e| (index, e.to_string())))
            .collect();
        if failures.is_empty() {
            return Ok(());
        }
        failures.sort_by_key(|(index, _)| *index);
        Err(PipelineError::QuizGenerationFailed { failures })
    }

    #[allow(clippy::too_many_arguments)]
    async fn generate_module_quiz(
        &self,
        generator: &QuizGenerator,
        module: &Module,
        transcript: &Transcript,
        run: u32,
        revision: u32,
        difficulty: Difficulty,
        guard: &JobGuard,
    ) -> Result<(QuizRecord, ReviewRecord)> {
        let result: Result<(QuizRecord, ReviewRecord)> = async {
            guard.check()?;
            let text = module_text(transcript, module);
            let quiz = generator.generate(module, &text, difficulty).await?;
            guard.check()?;

            let record = QuizRecord {
                run,
                revision,
                module: module.clone(),
                quiz,
            };
            let review = self.review.open(&record, self.clock.now());
            self.store
                .put_quiz_for_review(record.clone(), review.clone())
                .await?;
            Ok((record, review))
        }
        .await;

        match &result {
            Ok((record, _)) => {
                info!(
                    video_id = module.video_id.as_str(),
                    module_index = module.module_index,
                    revision,
                    questions = record.quiz.questions.len(),
                    "Quiz awaiting review"
                );
                self.bus.publish(PipelineEvent::QuizReady {
                    video_id: module.video_id.clone(),
                    module_index: module.module_index,
                    revision,
                });
            }
            Err(PipelineError::Cancelled { .. }) => {}
            Err(e) => {
                warn!(
                    video_id = module.video_id.as_str(),
                    module_index = module.module_index,
                    error = %e,
                    "Quiz generation failed"
                );
                self.bus.publish(PipelineEvent::QuizFailed {
                    video_id: module.video_id.clone(),
                    module_index: module.module_index,
                    reason: e.to_string(),
                });
            }
        }
        result
    }

    /// Derives the job status from the latest review of each module in the current run.
    ///
    /// A run without any review has nothing to settle on and fails with `NothingToReview`.
    async fn settle(&self, job: &mut VideoJob) -> Result<()> {
        let latest = self.latest_reviews(&job.video_id, job.run).await?;
        if latest.is_empty() {
            return Err(PipelineError::NothingToReview {
                video_id: job.video_id.clone(),
            });
        }
        let pending = latest
            .values()
            .filter(|r| r.decision == ReviewDecision::Pending)
            .count();

        let status = if pending > 0 {
            JobStatus::PendingReview
        } else if latest
            .values()
            .any(|r| r.decision == ReviewDecision::Approved)
        {
            JobStatus::Published
        } else {
            JobStatus::Rejected
        };

        if job.status != status {
            job.status = status;
            job.failure_reason = None;
            self.save(job).await?;
        }

        let video_id = job.video_id.clone();
        info!(video_id = video_id.as_str(), status = %status, pending, "Job settled");
        self.bus.publish(match status {
            JobStatus::PendingReview => PipelineEvent::AwaitingReview { video_id, pending },
            JobStatus::Published => PipelineEvent::JobPublished { video_id },
            _ => PipelineEvent::JobRejected { video_id },
        });
        Ok(())
    }

    /// Re-settles a job waiting on review, reloading it if a concurrent decision won the race.
    async fn settle_after_review(&self, video_id: &str) -> Result<()> {
        let mut attempts = 0;
        loop {
            let mut job = self.load_job(video_id).await?;
            if job.status != JobStatus::PendingReview {
                return Ok(());
            }
            match self.settle(&mut job).await {
                Err(PipelineError::Conflict { .. }) if attempts < 3 => attempts += 1,
                other => return other,
            }
        }
    }

    async fn record_failure(&self, video_id: &str, cause: &PipelineError) -> Result<()> {
        let mut job = self.load_job(video_id).await?;
        if job.status.is_terminal() {
            return Ok(());
        }

        let cancelled = matches!(cause, PipelineError::Cancelled { .. });
        let reason = if cancelled {
            CANCELLED_REASON.to_string()
        } else {
            cause.to_string()
        };

        job.status = JobStatus::Failed;
        job.failure_reason = Some(reason.clone());
        self.save(&mut job).await?;

        if cancelled {
            info!(video_id, "Job cancelled");
            self.bus.publish(PipelineEvent::JobCancelled {
                video_id: video_id.to_string(),
            });
        } else {
            warn!(video_id, reason = reason.as_str(), "Job failed");
            self.bus.publish(PipelineEvent::JobFailed {
                video_id: video_id.to_string(),
                reason,
            });
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Administration
    // ---------------------------------------------------------------------

    pub async fn get_job_status(&self, video_id: &str) -> Result<VideoJob> {
        self.load_job(video_id).await
    }

    pub async fn list_failed_jobs(&self) -> Result<Vec<VideoJob>> {
        let mut jobs: Vec<VideoJob> = self
            .store
            .list_jobs()
            .await?
            .into_iter()
            .filter(|j| j.status == JobStatus::Failed)
            .collect();
        jobs.sort_by(|a, b| {
            a.updated_at
                .cmp(&b.updated_at)
                .then_with(|| a.video_id.cmp(&b.video_id))
        });
        Ok(jobs)
    }

    /// Pending reviews of every job's current run, one per module.
    pub async fn list_pending_reviews(&self) -> Result<Vec<ReviewRecord>> {
        let runs: HashMap<String, u32> = self
            .store
            .list_jobs()
            .await?
            .into_iter()
            .map(|j| (j.video_id, j.run))
            .collect();

        let mut latest: BTreeMap<(String, u32), ReviewRecord> = BTreeMap::new();
        for review in self.store.list_reviews(None).await? {
            if runs.get(&review.video_id) != Some(&review.run) {
                continue;
            }
            let key = (review.video_id.clone(), review.module_index);
            match latest.get(&key) {
                Some(current) if current.revision >= review.revision => {}
                _ => {
                    latest.insert(key, review);
                }
            }
        }

        Ok(latest
            .into_values()
            .filter(|r| r.decision == ReviewDecision::Pending)
            .collect())
    }

    /// Records an administrator's decision on a module's latest quiz revision.
    pub async fn decide_review(
        &self,
        video_id: &str,
        module_index: u32,
        decision: ReviewDecision,
        reviewer: &str,
    ) -> Result<ReviewRecord> {
        let job = self.load_job(video_id).await?;
        let latest = self
            .latest_reviews(video_id, job.run)
            .await?
            .remove(&module_index)
            .ok_or_else(|| PipelineError::NotFound {
                entity: "review",
                key: format!("{video_id}/{module_index}"),
            })?;

        let decided = self
            .review
            .decide(&latest, decision, reviewer, self.clock.now())?;
        self.store
            .replace_review(latest.decision, decided.clone())
            .await?;

        info!(
            video_id,
            module_index,
            revision = decided.revision,
            %decision,
            reviewer,
            "Review decided"
        );
        self.bus.publish(PipelineEvent::ReviewDecided {
            video_id: video_id.to_string(),
            module_index,
            decision,
        });

        self.settle_after_review(video_id).await?;
        Ok(decided)
    }

    /// Generates a fresh quiz revision for a module whose latest review was rejected.
    ///
    /// The rejected record stays as it is; the new revision gets its own pending review.
    pub async fn regenerate_quiz(
        &self,
        video_id: &str,
        module_index: u32,
        difficulty: Option<Difficulty>,
    ) -> Result<ReviewRecord> {
        let mut job = self.load_job(video_id).await?;
        let through_review = match job.status {
            JobStatus::PendingReview | JobStatus::Published | JobStatus::Rejected => true,
            JobStatus::Failed => false,
            status => {
                return Err(PipelineError::DuplicateJob {
                    video_id: video_id.to_string(),
                    status,
                });
            }
        };

        let latest = self
            .latest_reviews(video_id, job.run)
            .await?
            .remove(&module_index)
            .ok_or_else(|| PipelineError::NotFound {
                entity: "review",
                key: format!("{video_id}/{module_index}"),
            })?;
        if !ReviewGate::allows_resubmission(&latest) {
            return Err(PipelineError::InvalidTransition {
                from: latest.decision,
                to: ReviewDecision::Pending,
            });
        }

        let previous = self
            .store
            .get_quiz(video_id, module_index, latest.run, latest.revision)
            .await?
            .ok_or_else(|| PipelineError::NotFound {
                entity: "quiz",
                key: format!("{video_id}/{module_index}"),
            })?;
        let transcript = self
            .store
            .get_transcript(video_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound {
                entity: "transcript",
                key: video_id.to_string(),
            })?;
        let difficulty = difficulty.unwrap_or(previous.quiz.difficulty);

        let prior_status = job.status;
        if through_review {
            self.advance(&mut job, JobStatus::GeneratingQuiz).await?;
        }

        let guard = JobGuard::new(video_id, CancellationToken::new());
        let generator = QuizGenerator::new(self.model_for(&guard), self.config.quiz.clone());
        let outcome = self
            .generate_module_quiz(
                &generator,
                &previous.module,
                &transcript,
                latest.run,
                latest.revision + 1,
                difficulty,
                &guard,
            )
            .await;

        match outcome {
            Ok((_, review)) => {
                if through_review {
                    self.settle(&mut job).await?;
                }
                Ok(review)
            }
            Err(e) => {
                if through_review {
                    job.status = prior_status;
                    self.save(&mut job).await?;
                }
                Err(e)
            }
        }
    }

    // ---------------------------------------------------------------------
    // Learners
    // ---------------------------------------------------------------------

    /// Approved modules with their quizzes, in module order.
    ///
    /// Content comes from the most recent run with an approval, so a reprocessed video keeps
    /// showing its previous content until something from the new run is approved. Unknown
    /// and unapproved videos both yield an empty list.
    pub async fn get_published_content(&self, video_id: &str) -> Result<Vec<PublishedModule>> {
        let approved: Vec<ReviewRecord> = self
            .store
            .list_reviews(Some(video_id))
            .await?
            .into_iter()
            .filter(|r| r.decision == ReviewDecision::Approved)
            .collect();
        let Some(run) = approved.iter().map(|r| r.run).max() else {
            return Ok(Vec::new());
        };

        let mut latest: BTreeMap<u32, ReviewRecord> = BTreeMap::new();
        for review in approved.into_iter().filter(|r| r.run == run) {
            match latest.get(&review.module_index) {
                Some(current) if current.revision >= review.revision => {}
                _ => {
                    latest.insert(review.module_index, review);
                }
            }
        }

        let mut published = Vec::with_capacity(latest.len());
        for review in latest.values() {
            if let Some(record) = self
                .store
                .get_quiz(video_id, review.module_index, review.run, review.revision)
                .await?
            {
                published.push(PublishedModule {
                    module: record.module,
                    quiz: record.quiz,
                });
            }
        }
        Ok(published)
    }

    /// Grades an answer to a published question and schedules its next review.
    pub async fn record_attempt(
        &self,
        learner_id: &str,
        video_id: &str,
        module_index: u32,
        question_index: u32,
        chosen_option: &str,
        now: DateTime<Utc>,
    ) -> Result<AttemptRecord> {
        let content = self.get_published_content(video_id).await?;
        let question = content
            .iter()
            .find(|p| p.module.module_index == module_index)
            .and_then(|p| p.quiz.questions.get(question_index as usize))
            .ok_or_else(|| PipelineError::NotAvailable {
                key: format!("{video_id}/{module_index}/{question_index}"),
            })?;

        let chosen = chosen_option.trim().to_ascii_uppercase();
        if !question.options.contains_key(&chosen) {
            return Err(PipelineError::InvalidAnswer {
                chosen: chosen_option.to_string(),
            });
        }
        let correct = chosen == question.correct_answer;

        let history = self.store.attempts_for(learner_id).await?;
        let latest = SpacedRepetitionScheduler::latest_per_question(&history);
        let prior = latest.get(&(video_id, module_index, question_index)).copied();

        let attempt = AttemptRecord {
            learner_id: learner_id.to_string(),
            video_id: video_id.to_string(),
            module_index,
            question_index,
            chosen_option: chosen,
            correct,
            flagged: !correct,
            attempted_at: now,
            next_due_at: self.scheduler.next_due(prior, correct, now),
        };
        self.store.append_attempt(attempt.clone()).await?;

        debug!(
            learner_id,
            video_id,
            module_index,
            question_index,
            correct,
            next_due_at = %attempt.next_due_at,
            "Attempt recorded"
        );
        Ok(attempt)
    }

    /// Questions the learner should see again at `now`, soonest due first.
    pub async fn get_due_questions(
        &self,
        learner_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<DueQuestion>> {
        let history = self.store.attempts_for(learner_id).await?;
        let due = self.scheduler.due(&history, now);

        let mut content: HashMap<String, Vec<PublishedModule>> = HashMap::new();
        let mut questions = Vec::with_capacity(due.len());
        for attempt in due {
            if !content.contains_key(&attempt.video_id) {
                let published = self.get_published_content(&attempt.video_id).await?;
                content.insert(attempt.video_id.clone(), published);
            }

            let question = content
                .get(&attempt.video_id)
                .and_then(|modules| {
                    modules
                        .iter()
                        .find(|p| p.module.module_index == attempt.module_index)
                })
                .and_then(|p| p.quiz.questions.get(attempt.question_index as usize));
            if let Some(question) = question {
                questions.push(DueQuestion {
                    video_id: attempt.video_id.clone(),
                    module_index: attempt.module_index,
                    question_index: attempt.question_index,
                    question: question.clone(),
                    next_due_at: attempt.next_due_at,
                    flagged: attempt.flagged,
                });
            }
        }
        Ok(questions)
    }

    /// A learner's progress through a published module, derived from their attempts.
    pub async fn module_progress(
        &self,
        learner_id: &str,
        video_id: &str,
        module_index: u32,
    ) -> Result<ModuleStatus> {
        let content = self.get_published_content(video_id).await?;
        let module = content
            .iter()
            .find(|p| p.module.module_index == module_index)
            .ok_or_else(|| PipelineError::NotAvailable {
                key: format!("{video_id}/{module_index}"),
            })?;

        let history = self.store.attempts_for(learner_id).await?;
        let latest = SpacedRepetitionScheduler::latest_per_question(&history);
        let answered: Vec<&AttemptRecord> = latest
            .values()
            .filter(|a| a.video_id == video_id && a.module_index == module_index)
            .copied()
            .collect();
        if answered.is_empty() {
            return Ok(ModuleStatus::NotStarted);
        }

        let correct: BTreeSet<u32> = answered
            .iter()
            .filter(|a| a.correct)
            .map(|a| a.question_index)
            .collect();
        let total = module.quiz.questions.len() as u32;
        if (0..total).all(|i| correct.contains(&i)) {
            Ok(ModuleStatus::Completed)
        } else {
            Ok(ModuleStatus::InProgress)
        }
    }

    // ---------------------------------------------------------------------
    // Helpers
    // ---------------------------------------------------------------------

    async fn load_job(&self, video_id: &str) -> Result<VideoJob> {
        self.store
            .get_job(video_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound {
                entity: "job",
                key: video_id.to_string(),
            })
    }

    async fn save(&self, job: &mut VideoJob) -> Result<()> {
        job.updated_at = self.clock.now();
        *job = self.store.update_job(job.clone()).await?;
        Ok(())
    }

    async fn advance(&self, job: &mut VideoJob, status: JobStatus) -> Result<()> {
        if job.status != status {
            job.status = status;
            job.failure_reason = None;
            self.save(job).await?;
        }

        info!(video_id = job.video_id.as_str(), stage = %status, "Stage started");
        self.bus.publish(PipelineEvent::StageStarted {
            video_id: job.video_id.clone(),
            stage: status,
        });
        Ok(())
    }

    /// Latest review revision per module for one run.
    async fn latest_reviews(&self, video_id: &str, run: u32) -> Result<BTreeMap<u32, ReviewRecord>> {
        let mut latest: BTreeMap<u32, ReviewRecord> = BTreeMap::new();
        for review in self.store.list_reviews(Some(video_id)).await? {
            if review.run != run {
                continue;
            }
            match latest.get(&review.module_index) {
                Some(current) if current.revision >= review.revision => {}
                _ => {
                    latest.insert(review.module_index, review);
                }
            }
        }
        Ok(latest)
    }

    fn model_for(&self, guard: &JobGuard) -> Arc<dyn LanguageModel> {
        Arc::new(ResilientModel::new(
            Arc::clone(&self.llm),
            self.config.retry.provider,
            self.config.timeouts.generate,
            guard.clone(),
        ))
    }
}

/// Errors from `run_job`, split by whether this call owned the run.
enum RunError {
    NotStarted(PipelineError),
    Owned(PipelineError),
}

fn embed_url_for(video_id: &str, source_url: &str) -> String {
    if video_id.starts_with("url-") {
        source_url.to_string()
    } else {
        embed_url(video_id)
    }
}
