use std::time::{Duration, Instant};

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use lessonforge_core::{EventBus, JobStatus, PipelineEvent, SubscriptionSpec};
use tokio::task::JoinHandle;

pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs_f64();
    if secs < 60.0 {
        format!("{:.1}s", secs)
    } else {
        format!("{:.0}m {:.0}s", (secs / 60.0).floor(), secs % 60.0)
    }
}

pub fn create_spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ "),
    );
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

fn stage_message(stage: JobStatus) -> &'static str {
    match stage {
        JobStatus::Fetching => "Fetching video...",
        JobStatus::Transcribing => "Transcribing with Whisper...",
        JobStatus::Segmenting => "Planning modules...",
        JobStatus::GeneratingQuiz => "Generating quizzes...",
        _ => "Working...",
    }
}

/// Renders pipeline events as a spinner with one line per finished step.
pub struct StageProgress {
    spinner: ProgressBar,
    task: JoinHandle<()>,
}

impl StageProgress {
    pub fn start(bus: &EventBus) -> anyhow::Result<Self> {
        let rx = bus.subscribe(SubscriptionSpec::all("cli.progress", 64))?;
        let spinner = create_spinner("Starting...");

        let pb = spinner.clone();
        let task = tokio::spawn(async move {
            let mut step_start = Instant::now();
            loop {
                let event = rx.recv().await;
                let elapsed = style(format!("[{}]", format_duration(step_start.elapsed()))).dim();
                let done = style("✓").green().bold();

                match &event.event {
                    PipelineEvent::StageStarted { stage, .. } => {
                        step_start = Instant::now();
                        pb.set_message(stage_message(*stage));
                    }
                    PipelineEvent::TranscriptStored { segments, .. } => {
                        pb.println(format!("{done} Transcribed: {segments} segments {elapsed}"));
                    }
                    PipelineEvent::ModulesPlanned { modules, .. } => {
                        pb.println(format!("{done} Planned {modules} modules {elapsed}"));
                    }
                    PipelineEvent::QuizReady {
                        module_index,
                        revision,
                        ..
                    } => {
                        pb.println(format!(
                            "{done} Quiz for module {} ready {}",
                            module_index + 1,
                            style(format!("(revision {revision})")).dim()
                        ));
                    }
                    PipelineEvent::QuizFailed {
                        module_index,
                        reason,
                        ..
                    } => {
                        pb.println(format!(
                            "{} Quiz for module {} failed: {}",
                            style("✗").red().bold(),
                            module_index + 1,
                            style(reason).dim()
                        ));
                    }
                    _ => {}
                }
            }
        });

        Ok(Self { spinner, task })
    }

    pub fn finish(self) {
        self.task.abort();
        self.spinner.finish_and_clear();
    }
}
