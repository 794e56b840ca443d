mod harness;

use std::sync::{Arc, atomic::Ordering};

use harness::{Harness, OTHER_URL, VIDEO_ID, VIDEO_URL, drain, transcript_segments};
use lessonforge_core::{
    JobStatus, ModuleSet, PipelineError, PipelineEvent, ReviewDecision, Store, Transcript,
    WorkerPool,
    store::{ModuleRepository, TranscriptRepository},
};
use tokio::sync::Notify;

// ---------------------------------------------------------------------------
// Happy path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn video_reaches_review_with_partitioned_modules() {
    let h = Harness::new();
    let rx = h.events("observer");

    let job = h.orchestrator.process(VIDEO_URL, None).await.unwrap();

    assert_eq!(job.video_id, VIDEO_ID);
    assert_eq!(job.status, JobStatus::PendingReview);
    assert_eq!(job.run, 1);
    assert!(job.failure_reason.is_none());
    assert!(job.audio.is_none(), "audio reference dropped after transcription");

    let metadata = job.metadata.as_ref().unwrap();
    assert_eq!(metadata.title, "Rust in ten minutes");
    assert_eq!(metadata.embed_url, format!("https://www.youtube.com/embed/{VIDEO_ID}"));

    // The 50s tail merges into its neighbour; modules still cover the whole transcript.
    let modules = h.store_modules(1).await;
    assert_eq!(modules.len(), 2);
    assert_eq!((modules[0].start_ms, modules[0].end_ms), (0, 200_000));
    assert_eq!((modules[1].start_ms, modules[1].end_ms), (200_000, 600_000));
    assert_eq!(modules[0].title, "Ownership Basics");
    assert_eq!(modules[1].title, "Traits");

    let pending = h.orchestrator.list_pending_reviews().await.unwrap();
    assert_eq!(pending.len(), 2);
    assert!(pending.iter().all(|r| r.decision == ReviewDecision::Pending));
    assert!(pending.iter().all(|r| r.revision == 1 && r.run == 1));

    assert_eq!(h.source.released.lock().unwrap().len(), 1);

    let events = drain(&rx);
    assert!(matches!(events.first(), Some(PipelineEvent::JobQueued { run: 1, .. })));
    assert!(events.iter().any(|e| matches!(e, PipelineEvent::TranscriptStored { segments: 3, .. })));
    assert!(events.iter().any(|e| matches!(e, PipelineEvent::ModulesPlanned { modules: 2, .. })));
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, PipelineEvent::QuizReady { .. }))
            .count(),
        2
    );
    assert!(matches!(
        events.last(),
        Some(PipelineEvent::AwaitingReview { pending: 2, .. })
    ));
}

#[tokio::test]
async fn quiz_prompts_carry_module_title_and_text() {
    let h = Harness::new();
    h.ingest(VIDEO_URL).await;

    let prompts = h.model.quiz_prompts.lock().unwrap().clone();
    assert_eq!(prompts.len(), 2);
    let traits = prompts
        .iter()
        .find(|p| p.contains("Module: Traits\n"))
        .expect("prompt for second module");
    assert!(traits.contains("Traits\n\nTraits describe shared behaviour"));
    assert!(traits.contains("That is all for today."));
    assert!(!traits.contains("single owner"));
}

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicate_submission_rejected_while_active() {
    let h = Harness::new();
    h.orchestrator.submit_video(VIDEO_URL, None).await.unwrap();

    let err = h
        .orchestrator
        .submit_video(&format!("https://youtu.be/{VIDEO_ID}"), None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::DuplicateJob { status: JobStatus::Queued, .. }
    ));

    h.orchestrator.run_job(VIDEO_ID).await.unwrap();
    let err = h.orchestrator.submit_video(VIDEO_URL, None).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::DuplicateJob { status: JobStatus::PendingReview, .. }
    ));
}

#[tokio::test]
async fn concurrent_submissions_start_one_run() {
    let h = Harness::new();

    let short_url = format!("https://youtu.be/{VIDEO_ID}");
    let (first, second) = tokio::join!(
        h.orchestrator.process(VIDEO_URL, None),
        h.orchestrator.process(&short_url, None),
    );
    let (job, err) = match (first, second) {
        (Ok(job), Err(err)) | (Err(err), Ok(job)) => (job, err),
        other => panic!("expected exactly one run: {other:?}"),
    };

    assert_eq!(job.status, JobStatus::PendingReview);
    assert!(matches!(err, PipelineError::DuplicateJob { .. }));
    assert_eq!(h.source.metadata_calls(), 1);
    assert_eq!(h.transcriber.calls(), 1);
}

#[tokio::test]
async fn racing_workers_leave_the_run_to_the_winner() {
    let store = Arc::new(Store::in_memory());
    let a = Harness::with_slow_job_reads(Arc::clone(&store));
    let b = Harness::with_slow_job_reads(Arc::clone(&store));
    a.orchestrator.submit_video(VIDEO_URL, None).await.unwrap();

    let (first, second) = tokio::join!(
        a.orchestrator.run_job(VIDEO_ID),
        b.orchestrator.run_job(VIDEO_ID),
    );
    let (job, err) = match (first, second) {
        (Ok(job), Err(err)) | (Err(err), Ok(job)) => (job, err),
        other => panic!("expected exactly one run: {other:?}"),
    };
    assert_eq!(job.status, JobStatus::PendingReview);
    assert!(matches!(err, PipelineError::DuplicateJob { .. }));

    let job = a.orchestrator.get_job_status(VIDEO_ID).await.unwrap();
    assert_eq!(job.status, JobStatus::PendingReview);
    assert!(job.failure_reason.is_none());
    assert_eq!(a.source.metadata_calls() + b.source.metadata_calls(), 1);
}

#[tokio::test]
async fn invalid_source_rejected_before_any_call() {
    let h = Harness::new();
    let err = h.orchestrator.submit_video("not a url", None).await.unwrap_err();
    assert!(matches!(err, PipelineError::InvalidSource { .. }));
    assert_eq!(h.source.metadata_calls(), 0);
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    let h = Harness::new();
    let err = h.orchestrator.get_job_status("missing0000").await.unwrap_err();
    assert!(matches!(err, PipelineError::NotFound { entity: "job", .. }));
}

// ---------------------------------------------------------------------------
// Failures and retry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn transient_source_errors_are_retried() {
    let h = Harness::new();
    h.source.fail_metadata_with(vec![PipelineError::SourceRateLimited {
        url: VIDEO_URL.into(),
    }]);

    let job = h.orchestrator.process(VIDEO_URL, None).await.unwrap();

    assert_eq!(job.status, JobStatus::PendingReview);
    assert_eq!(h.source.metadata_calls(), 2);
}

#[tokio::test]
async fn exhausted_source_retries_fail_the_job() {
    let h = Harness::new();
    let unavailable = || PipelineError::SourceUnavailable {
        url: VIDEO_URL.into(),
        reason: "HTTP 503".into(),
    };
    h.source
        .fail_metadata_with(vec![unavailable(), unavailable(), unavailable()]);
    let rx = h.events("observer");

    let err = h.orchestrator.process(VIDEO_URL, None).await.unwrap_err();
    assert!(matches!(err, PipelineError::SourceUnavailable { .. }));
    assert_eq!(h.source.metadata_calls(), 3);

    let job = h.orchestrator.get_job_status(VIDEO_ID).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.failure_reason.unwrap().contains("HTTP 503"));
    assert!(
        drain(&rx)
            .iter()
            .any(|e| matches!(e, PipelineEvent::JobFailed { .. }))
    );

    let failed = h.orchestrator.list_failed_jobs().await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].video_id, VIDEO_ID);

    let job = h.orchestrator.retry(VIDEO_ID).await.unwrap();
    assert_eq!(job.status, JobStatus::PendingReview);
    assert_eq!(job.run, 1);
    assert!(h.orchestrator.list_failed_jobs().await.unwrap().is_empty());
}

#[tokio::test]
async fn malformed_quiz_for_one_module_is_isolated() {
    let h = Harness::new();
    h.model
        .script_quiz("Traits", &["I'd rather not.", r#"{"questions": []}"#]);
    let rx = h.events("observer");

    let err = h.orchestrator.process(VIDEO_URL, None).await.unwrap_err();
    let PipelineError::QuizGenerationFailed { failures } = &err else {
        panic!("unexpected error: {err}");
    };
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, 1);
    assert!(failures[0].1.contains("Quiz validation failed for module 1"));

    let job = h.orchestrator.get_job_status(VIDEO_ID).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);

    // The sibling module's quiz is kept and waits for review.
    let pending = h.orchestrator.list_pending_reviews().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].module_index, 0);

    // The second attempt for the bad module used the stricter instruction.
    let prompts = h.model.quiz_prompts.lock().unwrap().clone();
    let traits: Vec<&String> = prompts
        .iter()
        .filter(|p| p.contains("Module: Traits\n"))
        .collect();
    assert_eq!(traits.len(), 2);
    assert!(traits[1].contains("Your previous answer was rejected"));

    let events = drain(&rx);
    assert!(events.iter().any(|e| matches!(
        e,
        PipelineEvent::QuizFailed { module_index: 1, .. }
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        PipelineEvent::QuizReady { module_index: 0, .. }
    )));
}

#[tokio::test]
async fn retry_resumes_from_first_incomplete_stage() {
    let h = Harness::new();
    h.model.script_quiz("Traits", &["nope", "still nope"]);
    h.orchestrator.process(VIDEO_URL, None).await.unwrap_err();
    let quiz_calls = h.model.quiz_calls();

    let job = h.orchestrator.retry(VIDEO_ID).await.unwrap();

    assert_eq!(job.status, JobStatus::PendingReview);
    assert_eq!(h.source.metadata_calls(), 1);
    assert_eq!(h.source.download_calls(), 1);
    assert_eq!(h.transcriber.calls(), 1);
    assert_eq!(h.model.boundary_calls.load(Ordering::SeqCst), 1);
    // Only the missing module is generated again.
    assert_eq!(h.model.quiz_calls(), quiz_calls + 1);

    let pending = h.orchestrator.list_pending_reviews().await.unwrap();
    let modules: Vec<u32> = pending.iter().map(|r| r.module_index).collect();
    assert_eq!(modules, vec![0, 1]);
}

#[tokio::test]
async fn run_without_reviews_fails_instead_of_rejecting() {
    let h = Harness::new();
    h.orchestrator.submit_video(VIDEO_URL, None).await.unwrap();
    let transcript = Transcript::from_segments(VIDEO_ID, transcript_segments()).unwrap();
    h.store.put_transcript(transcript).await.unwrap();
    h.store
        .put_modules(
            VIDEO_ID,
            ModuleSet {
                run: 1,
                modules: Vec::new(),
            },
        )
        .await
        .unwrap();

    let err = h.orchestrator.run_job(VIDEO_ID).await.unwrap_err();
    assert!(matches!(err, PipelineError::NothingToReview { .. }));

    let job = h.orchestrator.get_job_status(VIDEO_ID).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(
        job.failure_reason.as_deref(),
        Some("Job abc123def45 has no quiz awaiting review")
    );
}

#[tokio::test]
async fn retry_requires_failed_job() {
    let h = Harness::new();
    h.ingest(VIDEO_URL).await;

    let err = h.orchestrator.retry(VIDEO_ID).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::NotRetryable { status: JobStatus::PendingReview, .. }
    ));
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_discards_in_flight_transcription() {
    let h = Harness::new();
    let release = Arc::new(Notify::new());
    h.transcriber.hold_until(Arc::clone(&release));
    h.orchestrator.submit_video(VIDEO_URL, None).await.unwrap();
    let rx = h.events("observer");

    let orchestrator = Arc::clone(&h.orchestrator);
    let run = tokio::spawn(async move { orchestrator.run_job(VIDEO_ID).await });

    h.transcriber.entered.notified().await;
    assert!(h.orchestrator.cancel(VIDEO_ID).await.unwrap());
    release.notify_one();

    let err = run.await.unwrap().unwrap_err();
    assert!(matches!(err, PipelineError::Cancelled { .. }));

    let job = h.orchestrator.get_job_status(VIDEO_ID).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failure_reason.as_deref(), Some("cancelled"));
    assert!(job.audio.is_some(), "downloaded audio kept for the retry");
    assert!(h.model.quiz_calls() == 0);
    assert!(
        drain(&rx)
            .iter()
            .any(|e| matches!(e, PipelineEvent::JobCancelled { .. }))
    );

    // The retry transcribes the retained audio without fetching again.
    let job = h.orchestrator.retry(VIDEO_ID).await.unwrap();
    assert_eq!(job.status, JobStatus::PendingReview);
    assert_eq!(h.source.metadata_calls(), 1);
    assert_eq!(h.source.download_calls(), 1);
    assert_eq!(h.transcriber.calls(), 2);
}

#[tokio::test]
async fn cancel_from_another_store_handle_stops_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.json");
    let runner = Harness::with_store(Arc::new(Store::open(&path).await.unwrap()));
    let admin = Harness::with_store(Arc::new(Store::open(&path).await.unwrap()));

    let release = Arc::new(Notify::new());
    runner.transcriber.hold_until(Arc::clone(&release));
    runner.orchestrator.submit_video(VIDEO_URL, None).await.unwrap();

    let orchestrator = Arc::clone(&runner.orchestrator);
    let run = tokio::spawn(async move { orchestrator.run_job(VIDEO_ID).await });

    runner.transcriber.entered.notified().await;
    assert!(admin.orchestrator.cancel(VIDEO_ID).await.unwrap());
    release.notify_one();

    let err = run.await.unwrap().unwrap_err();
    assert!(matches!(err, PipelineError::Cancelled { .. }));

    let job = admin.orchestrator.get_job_status(VIDEO_ID).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failure_reason.as_deref(), Some("cancelled"));
    assert_eq!(runner.model.quiz_calls(), 0);
    assert_eq!(runner.model.boundary_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cancel_marks_idle_queued_job() {
    let h = Harness::new();
    h.orchestrator.submit_video(VIDEO_URL, None).await.unwrap();

    assert!(h.orchestrator.cancel(VIDEO_ID).await.unwrap());

    let job = h.orchestrator.run_job(VIDEO_ID).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failure_reason.as_deref(), Some("cancelled"));
    assert_eq!(h.source.metadata_calls(), 0);
}

#[tokio::test]
async fn cancel_leaves_settled_jobs_alone() {
    let h = Harness::new();
    h.ingest(VIDEO_URL).await;

    assert!(!h.orchestrator.cancel(VIDEO_ID).await.unwrap());
    let job = h.orchestrator.get_job_status(VIDEO_ID).await.unwrap();
    assert_eq!(job.status, JobStatus::PendingReview);
}

// ---------------------------------------------------------------------------
// Workers and persistence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn worker_pool_processes_submissions() {
    let h = Harness::new();
    let pool = WorkerPool::start(Arc::clone(&h.orchestrator), 2);

    let first = pool.submit(VIDEO_URL, None).await.unwrap();
    let second = pool.submit(OTHER_URL, None).await.unwrap();
    pool.drain().await;

    for video_id in [first, second] {
        let job = h.orchestrator.get_job_status(&video_id).await.unwrap();
        assert_eq!(job.status, JobStatus::PendingReview, "{video_id}");
    }
    assert_eq!(h.orchestrator.list_pending_reviews().await.unwrap().len(), 4);
}

#[tokio::test]
async fn stored_progress_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.json");

    {
        let store = Arc::new(Store::open(&path).await.unwrap());
        let h = Harness::with_store(store);
        h.model.script_quiz("Traits", &["nope", "still nope"]);
        h.orchestrator.process(VIDEO_URL, None).await.unwrap_err();
    }

    let store = Arc::new(Store::open(&path).await.unwrap());
    let h = Harness::with_store(store);
    let job = h.orchestrator.get_job_status(VIDEO_ID).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);

    let job = h.orchestrator.retry(VIDEO_ID).await.unwrap();
    assert_eq!(job.status, JobStatus::PendingReview);
    assert_eq!(h.source.metadata_calls(), 0);
    assert_eq!(h.transcriber.calls(), 0);
    assert_eq!(h.model.quiz_calls(), 1);
}
