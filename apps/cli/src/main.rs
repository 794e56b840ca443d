use std::{path::PathBuf, sync::Arc, time::Instant};

use anyhow::{Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use console::style;
use lessonforge_core::{
    ChatCompletionsClient, Collaborators, Difficulty, JobStatus, LanguageModel, ModuleStatus,
    Orchestrator, PipelineConfig, Provider, ReviewDecision, Store, SystemClock, VideoJob,
    WorkerPool, format_job_readable, format_module_readable, format_timestamp, get_model_dir,
    get_root_cache_dir, get_store_path,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    adapters::{MODEL_NAME, UnconfiguredModel, WhisperTranscriber, YtDlpSource, ensure_model},
    progress::{StageProgress, format_duration},
};

mod adapters;
mod progress;

/// CLI wrapper for Provider enum (needed for clap ValueEnum)
#[derive(Clone, Default, ValueEnum)]
enum CliProvider {
    #[default]
    Grok,
    Openai,
    Gemini,
    Nebius,
}

impl From<CliProvider> for Provider {
    fn from(cli: CliProvider) -> Self {
        match cli {
            CliProvider::Grok => Provider::Grok,
            CliProvider::Openai => Provider::Openai,
            CliProvider::Gemini => Provider::Gemini,
            CliProvider::Nebius => Provider::Nebius,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum CliDifficulty {
    Easy,
    Medium,
    Hard,
}

impl From<CliDifficulty> for Difficulty {
    fn from(cli: CliDifficulty) -> Self {
        match cli {
            CliDifficulty::Easy => Difficulty::Easy,
            CliDifficulty::Medium => Difficulty::Medium,
            CliDifficulty::Hard => Difficulty::Hard,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum CliDecision {
    Approve,
    Reject,
}

impl From<CliDecision> for ReviewDecision {
    fn from(cli: CliDecision) -> Self {
        match cli {
            CliDecision::Approve => ReviewDecision::Approved,
            CliDecision::Reject => ReviewDecision::Rejected,
        }
    }
}

#[derive(Parser)]
#[command(name = "lessonforge")]
#[command(
    about = "Turn long-form videos into reviewed learning modules with quizzes and spaced repetition"
)]
struct Cli {
    /// AI provider for module planning and quiz generation
    #[arg(short, long, global = true, default_value = "grok")]
    provider: CliProvider,

    /// Pipeline store file. Defaults to store.json in the user cache directory.
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

/// Modules and questions are numbered from 1 on the command line.
#[derive(Subcommand)]
enum Command {
    /// Submit a video and run it up to the review gate
    Submit {
        url: String,
        #[arg(short, long)]
        difficulty: Option<CliDifficulty>,
        /// Only queue the job; run it later with `run`
        #[arg(long)]
        queue_only: bool,
    },
    /// Process several videos concurrently
    Batch {
        #[arg(required = true)]
        urls: Vec<String>,
        #[arg(short, long)]
        difficulty: Option<CliDifficulty>,
    },
    /// Run a queued job
    Run { video_id: String },
    /// Show a job's status
    Status { video_id: String },
    /// List failed jobs
    Failed,
    /// Resume a failed job from its first incomplete stage
    Retry { video_id: String },
    /// Cancel a job
    Cancel { video_id: String },
    /// List quizzes waiting for review
    Reviews,
    /// Approve or reject a module's quiz
    Review {
        video_id: String,
        module: u32,
        decision: CliDecision,
        #[arg(long, default_value = "admin")]
        reviewer: String,
    },
    /// Generate a new quiz for a rejected module
    Regenerate {
        video_id: String,
        module: u32,
        #[arg(short, long)]
        difficulty: Option<CliDifficulty>,
    },
    /// Show a video's published modules and quizzes
    Show { video_id: String },
    /// Answer a published question
    Answer {
        learner: String,
        video_id: String,
        module: u32,
        question: u32,
        option: String,
    },
    /// List the questions a learner should revisit now
    Due { learner: String },
    /// Show a learner's progress through a module
    Progress {
        learner: String,
        video_id: String,
        module: u32,
    },
}

impl Command {
    fn runs_pipeline(&self) -> bool {
        matches!(
            self,
            Command::Submit {
                queue_only: false,
                ..
            } | Command::Batch { .. }
                | Command::Run { .. }
                | Command::Retry { .. }
        )
    }

    fn needs_model(&self) -> bool {
        self.runs_pipeline() || matches!(self, Command::Regenerate { .. })
    }
}

fn index(number: u32, what: &str) -> Result<u32> {
    match number.checked_sub(1) {
        Some(index) => Ok(index),
        None => bail!("{what} numbers start at 1"),
    }
}

fn done() -> console::StyledObject<&'static str> {
    style("✓").green().bold()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lessonforge=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let orchestrator = build_orchestrator(&cli).await?;

    match cli.command {
        Command::Submit {
            url,
            difficulty,
            queue_only,
        } => {
            let video_id = orchestrator
                .submit_video(&url, difficulty.map(Into::into))
                .await?;
            println!("{} Queued {}", done(), style(&video_id).cyan());
            if !queue_only {
                let job = run_with_progress(&orchestrator, &video_id, false).await?;
                print_outcome(&job);
            }
        }
        Command::Batch { urls, difficulty } => {
            let workers = orchestrator.config().workers;
            let pool = WorkerPool::start(Arc::clone(&orchestrator), workers);
            let mut video_ids = Vec::new();
            for url in &urls {
                let video_id = pool.submit(url, difficulty.map(Into::into)).await?;
                println!("{} Queued {}", done(), style(&video_id).cyan());
                video_ids.push(video_id);
            }

            let progress = StageProgress::start(orchestrator.bus())?;
            pool.drain().await;
            progress.finish();

            for video_id in video_ids {
                let job = orchestrator.get_job_status(&video_id).await?;
                print_outcome(&job);
            }
        }
        Command::Run { video_id } => {
            let job = run_with_progress(&orchestrator, &video_id, false).await?;
            print_outcome(&job);
        }
        Command::Status { video_id } => {
            let job = orchestrator.get_job_status(&video_id).await?;
            println!("{}", format_job_readable(&job));
        }
        Command::Failed => {
            let failed = orchestrator.list_failed_jobs().await?;
            if failed.is_empty() {
                println!("No failed jobs");
            }
            for job in failed {
                println!(
                    "{}  run {}  {}",
                    style(&job.video_id).cyan(),
                    job.run,
                    style(job.failure_reason.unwrap_or_default()).dim()
                );
            }
        }
        Command::Retry { video_id } => {
            let job = run_with_progress(&orchestrator, &video_id, true).await?;
            print_outcome(&job);
        }
        Command::Cancel { video_id } => {
            if orchestrator.cancel(&video_id).await? {
                println!("{} Cancelled {}", done(), style(&video_id).cyan());
            } else {
                println!("Nothing to cancel for {}", video_id);
            }
        }
        Command::Reviews => {
            let pending = orchestrator.list_pending_reviews().await?;
            if pending.is_empty() {
                println!("No quizzes waiting for review");
            }
            for review in pending {
                println!(
                    "{}  module {}  revision {}  {}",
                    style(&review.video_id).cyan(),
                    review.module_index + 1,
                    review.revision,
                    style(review.created_at.to_rfc3339()).dim()
                );
            }
        }
        Command::Review {
            video_id,
            module,
            decision,
            reviewer,
        } => {
            let record = orchestrator
                .decide_review(&video_id, index(module, "module")?, decision.into(), &reviewer)
                .await?;
            println!(
                "{} Module {} revision {} {}",
                done(),
                module,
                record.revision,
                record.decision
            );
            let job = orchestrator.get_job_status(&video_id).await?;
            println!("Job is now {}", style(job.status).yellow());
        }
        Command::Regenerate {
            video_id,
            module,
            difficulty,
        } => {
            let record = orchestrator
                .regenerate_quiz(
                    &video_id,
                    index(module, "module")?,
                    difficulty.map(Into::into),
                )
                .await?;
            println!(
                "{} Module {} revision {} is waiting for review",
                done(),
                module,
                record.revision
            );
        }
        Command::Show { video_id } => {
            let job = orchestrator.get_job_status(&video_id).await?;
            let content = orchestrator.get_published_content(&video_id).await?;
            println!("{}", format_job_readable(&job));
            if let Some(metadata) = &job.metadata {
                println!("{} {}\n", style("Watch:").dim(), style(&metadata.embed_url).cyan());
            }
            if content.is_empty() {
                println!("Nothing published yet");
            }
            for published in &content {
                println!("{}", format_module_readable(published));
            }
        }
        Command::Answer {
            learner,
            video_id,
            module,
            question,
            option,
        } => {
            let attempt = orchestrator
                .record_attempt(
                    &learner,
                    &video_id,
                    index(module, "module")?,
                    index(question, "question")?,
                    &option,
                    Utc::now(),
                )
                .await?;
            if attempt.correct {
                println!("{} Correct", done());
            } else {
                println!("{} Incorrect", style("✗").red().bold());
            }
            println!(
                "{} {}",
                style("Next review:").dim(),
                attempt.next_due_at.to_rfc3339()
            );
        }
        Command::Due { learner } => {
            let due = orchestrator.get_due_questions(&learner, Utc::now()).await?;
            if due.is_empty() {
                println!("Nothing due");
            }
            for item in due {
                let marker = if item.flagged {
                    style("!").red().bold()
                } else {
                    style("·").dim()
                };
                println!(
                    "{} {} module {} question {}: {}",
                    marker,
                    style(&item.video_id).cyan(),
                    item.module_index + 1,
                    item.question_index + 1,
                    item.question.prompt
                );
                for (key, text) in &item.question.options {
                    println!("     {}) {}", key, text);
                }
            }
        }
        Command::Progress {
            learner,
            video_id,
            module,
        } => {
            let status = orchestrator
                .module_progress(&learner, &video_id, index(module, "module")?)
                .await?;
            let label = match status {
                ModuleStatus::NotStarted => style("not started").dim(),
                ModuleStatus::InProgress => style("in progress").yellow(),
                ModuleStatus::Completed => style("completed").green(),
            };
            println!("Module {}: {}", module, label);
        }
    }

    Ok(())
}

async fn build_orchestrator(cli: &Cli) -> Result<Arc<Orchestrator>> {
    let config = PipelineConfig::from_env()?;
    let provider: Provider = cli.provider.clone().into();

    let llm: Arc<dyn LanguageModel> = if cli.command.needs_model() {
        // Validate API key early
        if let Err(e) = provider.validate_api_key() {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            std::process::exit(1);
        }
        Arc::new(ChatCompletionsClient::new(provider)?)
    } else {
        Arc::new(UnconfiguredModel::new(provider))
    };

    let root_cache_dir = get_root_cache_dir();
    let model_path = if cli.command.runs_pipeline() {
        println!("{} Checking model...", done());
        ensure_model(&root_cache_dir).await?
    } else {
        get_model_dir(&root_cache_dir).join(MODEL_NAME)
    };

    let store_path = cli.store.clone().unwrap_or_else(get_store_path);
    let store = Store::open(&store_path).await?;
    info!(store = %store_path.display(), provider = provider.name(), "Pipeline ready");

    let orchestrator = Orchestrator::new(
        config,
        Arc::new(store),
        Collaborators {
            source: Arc::new(YtDlpSource::new()),
            transcriber: Arc::new(WhisperTranscriber::new(model_path)),
            llm,
        },
        Arc::new(SystemClock),
    )?;
    Ok(Arc::new(orchestrator))
}

/// Returns whether the job was cancelled. Failures are logged and treated as not cancelled.
async fn cancel_on_interrupt(orchestrator: &Orchestrator, video_id: &str) -> bool {
    match orchestrator.cancel(video_id).await {
        Ok(cancelled) => cancelled,
        Err(e) => {
            warn!(video_id, error = %e, "Could not cancel job");
            false
        }
    }
}

/// Runs (or retries) a job with a spinner; Ctrl-C cancels it cooperatively.
async fn run_with_progress(
    orchestrator: &Arc<Orchestrator>,
    video_id: &str,
    retry: bool,
) -> Result<VideoJob> {
    if retry {
        orchestrator.requeue(video_id).await?;
    }

    let progress = StageProgress::start(orchestrator.bus())?;
    let interrupt = {
        let orchestrator = Arc::clone(orchestrator);
        let video_id = video_id.to_string();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel_on_interrupt(&orchestrator, &video_id).await;
            }
        })
    };

    let started = Instant::now();
    let result = orchestrator.run_job(video_id).await;
    interrupt.abort();
    progress.finish();

    let job = result?;
    println!(
        "\n{} {}\n",
        style("Total time:").dim(),
        style(format_duration(started.elapsed())).cyan().bold()
    );
    Ok(job)
}

fn print_outcome(job: &VideoJob) {
    let status = match job.status {
        JobStatus::PendingReview => style(job.status).yellow(),
        JobStatus::Published => style(job.status).green(),
        JobStatus::Failed | JobStatus::Rejected => style(job.status).red(),
        _ => style(job.status).dim(),
    };
    let title = job
        .metadata
        .as_ref()
        .map(|m| m.title.as_str())
        .unwrap_or("(untitled)");
    println!("{} {}  {}", style(&job.video_id).cyan(), status, title);
    if let Some(end) = job.metadata.as_ref().map(|m| m.duration_ms) {
        println!("  {} {}", style("Duration:").dim(), format_timestamp(end));
    }
    if let Some(reason) = &job.failure_reason {
        println!("  {} {}", style("Reason:").dim(), reason);
    }
}
