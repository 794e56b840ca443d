use crate::types::{PublishedModule, TranscriptSegment, VideoJob};

/// Format milliseconds as MM:SS (HH:MM:SS past the hour)
pub fn format_timestamp(ms: u64) -> String {
    let total_secs = ms / 1000;
    let (hours, mins, secs) = (total_secs / 3600, (total_secs / 60) % 60, total_secs % 60);
    if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, mins, secs)
    } else {
        format!("{:02}:{:02}", mins, secs)
    }
}

/// Format transcript segments with their start offsets, one per line
pub fn format_transcript_with_timestamps(segments: &[TranscriptSegment]) -> String {
    segments
        .iter()
        .map(|seg| {
            format!(
                "[{} | start_ms={}] {}",
                format_timestamp(seg.start_ms),
                seg.start_ms,
                seg.text.trim()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn format_job_readable(job: &VideoJob) -> String {
    let mut output = String::new();
    let title = job
        .metadata
        .as_ref()
        .map(|m| m.title.as_str())
        .unwrap_or("(metadata not fetched)");
    output.push_str(&format!("# {} [{}]\n\n", title, job.video_id));
    output.push_str(&format!(
        "**Status:** {} | **Run:** {} | **Difficulty:** {}\n",
        job.status, job.run, job.difficulty
    ));
    if let Some(reason) = &job.failure_reason {
        output.push_str(&format!("**Failure:** {}\n", reason));
    }
    output.push_str(&format!("**Updated:** {}\n", job.updated_at.to_rfc3339()));
    output
}

pub fn format_module_readable(published: &PublishedModule) -> String {
    let module = &published.module;
    let mut output = String::new();
    output.push_str(&format!(
        "## {}. [{}–{}] {}\n\n",
        module.module_index + 1,
        format_timestamp(module.start_ms),
        format_timestamp(module.end_ms),
        module.title
    ));

    if !module.key_concepts.is_empty() {
        let concepts = module
            .key_concepts
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>();
        output.push_str(&format!("**Key concepts:** {}\n\n", concepts.join(", ")));
    }

    for (i, question) in published.quiz.questions.iter().enumerate() {
        output.push_str(&format!("{}. {}\n", i + 1, question.prompt));
        for (key, text) in &question.options {
            output.push_str(&format!("   {}) {}\n", key, text));
        }
    }
    output.push('\n');

    output
}
