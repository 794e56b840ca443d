//! In-process fakes for the pipeline's collaborators.
//!
//! The video source, transcriber and language model are scripted; the store is the real
//! `Store`, in memory unless a test opens one on disk.

#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use lessonforge_core::{
    AttemptRecord, AudioArtifact, Clock, Collaborators, Difficulty, EventReceiver,
    LanguageModel, ManualClock, Module, ModuleSet, Orchestrator, PipelineConfig, PipelineError,
    PipelineEvent, QuizRecord, Repository, Result, ReviewDecision, ReviewRecord, SchemaHint,
    SourceMetadata, Store, SubscriptionSpec, Transcriber, Transcript, TranscriptSegment,
    VideoJob, VideoSource,
    config::RetryPolicy,
    store::{
        AttemptRepository, JobRepository, ModuleRepository, QuizRepository, ReviewRepository,
        TranscriptRepository,
    },
};
use tokio::sync::Notify;

pub const VIDEO_URL: &str = "https://www.youtube.com/watch?v=abc123def45";
pub const VIDEO_ID: &str = "abc123def45";
pub const OTHER_URL: &str = "https://youtu.be/zyx987wvu65";
pub const OTHER_ID: &str = "zyx987wvu65";

/// Proposes three modules; the last one is shorter than a minute and gets merged away.
pub const BOUNDARIES: &str = r#"```json
{"modules": [
  {"start_ms": 0, "title": "ownership basics.", "key_concepts": ["Ownership", "borrowing"], "confidence": 0.9},
  {"start_ms": 200000, "title": "Traits", "key_concepts": ["traits", "generics"], "confidence": 0.8},
  {"start_ms": 550000, "title": "Wrap up", "key_concepts": ["review"], "confidence": 0.3}
]}
```"#;

pub const VALID_QUIZ: &str = r#"[
  {"question": "What does the borrow checker enforce?",
   "options": {"A": "Aliasing rules", "B": "Garbage collection", "C": "Reflection"},
   "correct_answer": "A", "explanation": "References may not outlive or alias mutably."},
  {"question": "Which keyword declares a trait?",
   "options": {"A": "impl", "B": "trait", "C": "struct", "D": "enum"},
   "correct_answer": "b", "explanation": "Traits are declared with `trait`."}
]"#;

pub const REVISED_QUIZ: &str = r#"{"questions": [
  {"question": "Revised: what moves ownership?",
   "options": {"A": "Assignment", "B": "Printing"},
   "correct_answer": "A"},
  {"question": "Revised: what does a borrow lend out?",
   "options": {"A": "A copy", "B": "A reference"},
   "correct_answer": "B"}
]}"#;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 4, 6, 9, 0, 0).unwrap()
}

pub fn test_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.gate.min_request_interval = Duration::ZERO;
    config.retry.source = RetryPolicy::immediate(3);
    config.retry.transcription = RetryPolicy::immediate(2);
    config.retry.provider = RetryPolicy::immediate(3);
    config.quiz.questions_per_module = 2;
    config
}

pub fn transcript_segments() -> Vec<TranscriptSegment> {
    vec![
        TranscriptSegment {
            start_ms: 0,
            end_ms: 200_000,
            text: "Ownership means every value has a single owner and borrowing lends it out."
                .into(),
        },
        TranscriptSegment {
            start_ms: 200_000,
            end_ms: 550_000,
            text: "Traits describe shared behaviour and generics abstract over types.".into(),
        },
        TranscriptSegment {
            start_ms: 550_000,
            end_ms: 600_000,
            text: "That is all for today.".into(),
        },
    ]
}

// ---------------------------------------------------------------------------
// Video source
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeSource {
    pub metadata_calls: AtomicUsize,
    pub download_calls: AtomicUsize,
    pub released: Mutex<Vec<AudioArtifact>>,
    metadata_failures: Mutex<VecDeque<PipelineError>>,
}

impl FakeSource {
    pub fn fail_metadata_with(&self, errors: Vec<PipelineError>) {
        self.metadata_failures.lock().unwrap().extend(errors);
    }

    pub fn metadata_calls(&self) -> usize {
        self.metadata_calls.load(Ordering::SeqCst)
    }

    pub fn download_calls(&self) -> usize {
        self.download_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VideoSource for FakeSource {
    fn provider(&self) -> &str {
        "fake"
    }

    async fn fetch_metadata(&self, source_url: &str) -> Result<SourceMetadata> {
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.metadata_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(SourceMetadata {
            title: "Rust in ten minutes".into(),
            duration_ms: 600_000,
            audio_handle: format!("handle:{source_url}"),
        })
    }

    async fn download_audio(&self, video_id: &str, _audio_handle: &str) -> Result<AudioArtifact> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        Ok(AudioArtifact {
            path: PathBuf::from(format!("/tmp/lessonforge-test/{video_id}.wav")),
        })
    }

    async fn release_audio(&self, artifact: &AudioArtifact) -> Result<()> {
        self.released.lock().unwrap().push(artifact.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Transcriber
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeTranscriber {
    pub calls: AtomicUsize,
    /// Signalled when a transcription starts.
    pub entered: Notify,
    hold: Mutex<Option<Arc<Notify>>>,
}

impl FakeTranscriber {
    /// Makes the next transcriptions wait until `release` is notified.
    pub fn hold_until(&self, release: Arc<Notify>) {
        *self.hold.lock().unwrap() = Some(release);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    async fn transcribe(&self, _audio: &AudioArtifact) -> Result<Vec<TranscriptSegment>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();

        let hold = self.hold.lock().unwrap().take();
        if let Some(release) = hold {
            release.notified().await;
        }
        Ok(transcript_segments())
    }
}

// ---------------------------------------------------------------------------
// Language model
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct ScriptedModel {
    pub boundary_calls: AtomicUsize,
    pub quiz_prompts: Mutex<Vec<String>>,
    quizzes: Mutex<HashMap<String, VecDeque<String>>>,
}

impl ScriptedModel {
    /// Queues responses for quiz prompts about the module titled `title`. Once they run
    /// out the module gets `VALID_QUIZ`.
    pub fn script_quiz(&self, title: &str, responses: &[&str]) {
        self.quizzes
            .lock()
            .unwrap()
            .entry(title.to_string())
            .or_default()
            .extend(responses.iter().map(|r| r.to_string()));
    }

    pub fn quiz_calls(&self) -> usize {
        self.quiz_prompts.lock().unwrap().len()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn generate(&self, prompt: &str, schema: SchemaHint) -> Result<String> {
        match schema {
            SchemaHint::ModuleBoundaries => {
                self.boundary_calls.fetch_add(1, Ordering::SeqCst);
                Ok(BOUNDARIES.to_string())
            }
            SchemaHint::QuizQuestions => {
                self.quiz_prompts.lock().unwrap().push(prompt.to_string());
                let mut quizzes = self.quizzes.lock().unwrap();
                let scripted = quizzes
                    .iter_mut()
                    .find(|(title, _)| prompt.contains(&format!("Module: {title}\n")))
                    .and_then(|(_, responses)| responses.pop_front());
                Ok(scripted.unwrap_or_else(|| VALID_QUIZ.to_string()))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Slow job reads
// ---------------------------------------------------------------------------

/// Delegates to a `Store` but takes a while to read jobs, so two callers racing on the
/// same job both read it before either writes.
pub struct SlowJobReads {
    inner: Arc<Store>,
    delay: Duration,
}

#[async_trait]
impl JobRepository for SlowJobReads {
    async fn claim_job(
        &self,
        video_id: &str,
        source_url: &str,
        difficulty: Difficulty,
        now: DateTime<Utc>,
    ) -> Result<VideoJob> {
        self.inner
            .claim_job(video_id, source_url, difficulty, now)
            .await
    }

    async fn get_job(&self, video_id: &str) -> Result<Option<VideoJob>> {
        tokio::time::sleep(self.delay).await;
        self.inner.get_job(video_id).await
    }

    async fn update_job(&self, job: VideoJob) -> Result<VideoJob> {
        self.inner.update_job(job).await
    }

    async fn list_jobs(&self) -> Result<Vec<VideoJob>> {
        self.inner.list_jobs().await
    }
}

#[async_trait]
impl TranscriptRepository for SlowJobReads {
    async fn put_transcript(&self, transcript: Transcript) -> Result<Transcript> {
        self.inner.put_transcript(transcript).await
    }

    async fn get_transcript(&self, video_id: &str) -> Result<Option<Transcript>> {
        self.inner.get_transcript(video_id).await
    }
}

#[async_trait]
impl ModuleRepository for SlowJobReads {
    async fn put_modules(&self, video_id: &str, modules: ModuleSet) -> Result<()> {
        self.inner.put_modules(video_id, modules).await
    }

    async fn get_modules(&self, video_id: &str, run: u32) -> Result<Option<ModuleSet>> {
        self.inner.get_modules(video_id, run).await
    }
}

#[async_trait]
impl QuizRepository for SlowJobReads {
    async fn put_quiz_for_review(&self, record: QuizRecord, review: ReviewRecord) -> Result<()> {
        self.inner.put_quiz_for_review(record, review).await
    }

    async fn get_quiz(
        &self,
        video_id: &str,
        module_index: u32,
        run: u32,
        revision: u32,
    ) -> Result<Option<QuizRecord>> {
        self.inner
            .get_quiz(video_id, module_index, run, revision)
            .await
    }
}

#[async_trait]
impl ReviewRepository for SlowJobReads {
    async fn replace_review(&self, expected: ReviewDecision, record: ReviewRecord) -> Result<()> {
        self.inner.replace_review(expected, record).await
    }

    async fn list_reviews(&self, video_id: Option<&str>) -> Result<Vec<ReviewRecord>> {
        self.inner.list_reviews(video_id).await
    }
}

#[async_trait]
impl AttemptRepository for SlowJobReads {
    async fn append_attempt(&self, attempt: AttemptRecord) -> Result<()> {
        self.inner.append_attempt(attempt).await
    }

    async fn attempts_for(&self, learner_id: &str) -> Result<Vec<AttemptRecord>> {
        self.inner.attempts_for(learner_id).await
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<Store>,
    pub source: Arc<FakeSource>,
    pub transcriber: Arc<FakeTranscriber>,
    pub model: Arc<ScriptedModel>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(Arc::new(Store::in_memory()))
    }

    pub fn with_store(store: Arc<Store>) -> Self {
        let repository = Arc::clone(&store) as Arc<dyn Repository>;
        Self::build(store, repository, test_config())
    }

    /// An orchestrator over `store` whose job reads are slow.
    pub fn with_slow_job_reads(store: Arc<Store>) -> Self {
        let repository = Arc::new(SlowJobReads {
            inner: Arc::clone(&store),
            delay: Duration::from_millis(20),
        }) as Arc<dyn Repository>;
        Self::build(store, repository, test_config())
    }

    pub fn with_config(config: PipelineConfig) -> Self {
        let store = Arc::new(Store::in_memory());
        let repository = Arc::clone(&store) as Arc<dyn Repository>;
        Self::build(store, repository, config)
    }

    fn build(store: Arc<Store>, repository: Arc<dyn Repository>, config: PipelineConfig) -> Self {
        let source = Arc::new(FakeSource::default());
        let transcriber = Arc::new(FakeTranscriber::default());
        let model = Arc::new(ScriptedModel::default());
        let clock = Arc::new(ManualClock::new(t0()));

        let orchestrator = Orchestrator::new(
            config,
            repository,
            Collaborators {
                source: Arc::clone(&source) as Arc<dyn VideoSource>,
                transcriber: Arc::clone(&transcriber) as Arc<dyn Transcriber>,
                llm: Arc::clone(&model) as Arc<dyn LanguageModel>,
            },
            Arc::clone(&clock) as Arc<dyn Clock>,
        )
        .expect("valid test config");

        Self {
            orchestrator: Arc::new(orchestrator),
            store,
            source,
            transcriber,
            model,
            clock,
        }
    }

    pub fn events(&self, subscriber_id: &'static str) -> EventReceiver {
        self.orchestrator
            .bus()
            .subscribe(SubscriptionSpec::all(subscriber_id, 256))
            .expect("subscription")
    }

    /// Runs the video to the review gate, panicking on any pipeline error.
    pub async fn ingest(&self, url: &str) -> String {
        let job = self
            .orchestrator
            .process(url, None)
            .await
            .expect("pipeline run");
        job.video_id
    }

    pub async fn store_modules(&self, run: u32) -> Vec<Module> {
        self.store
            .get_modules(VIDEO_ID, run)
            .await
            .unwrap()
            .expect("modules stored")
            .modules
    }

    /// Every review record of the video, including superseded revisions.
    pub async fn all_reviews(&self) -> Vec<ReviewRecord> {
        self.store.list_reviews(Some(VIDEO_ID)).await.unwrap()
    }

    pub async fn approve_all(&self, video_id: &str) {
        for review in self.orchestrator.list_pending_reviews().await.unwrap() {
            if review.video_id == video_id {
                self.orchestrator
                    .decide_review(
                        video_id,
                        review.module_index,
                        ReviewDecision::Approved,
                        "admin",
                    )
                    .await
                    .unwrap();
            }
        }
    }
}

pub fn drain(rx: &EventReceiver) -> Vec<PipelineEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.try_recv() {
        events.push(event.event.clone());
    }
    events
}
