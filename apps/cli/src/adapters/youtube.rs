use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Output,
};

use async_trait::async_trait;
use lessonforge_core::{
    AudioArtifact, PipelineError, Result, SourceMetadata, VideoSource, get_audio_path,
    get_video_dir,
};
use serde::Deserialize;
use tokio::{fs, process::Command};
use tracing::{debug, warn};

/// Video source backed by the `yt-dlp` and `ffmpeg` executables.
#[derive(Default)]
pub struct YtDlpSource;

/// The subset of `yt-dlp --dump-single-json` we read.
#[derive(Deserialize)]
struct VideoInfo {
    title: Option<String>,
    /// Seconds.
    duration: Option<f64>,
    webpage_url: Option<String>,
}

impl YtDlpSource {
    pub fn new() -> Self {
        Self
    }

    async fn download_source(url: &str, video_dir: &Path) -> Result<PathBuf> {
        let output_template = video_dir.join("source.%(ext)s");
        let output = Command::new("yt-dlp")
            .arg(url)
            .arg("--no-playlist")
            .arg("--print")
            .arg("after_move:filepath")
            .arg("--extractor-args")
            .arg("youtube:player_client=android,web")
            .arg("-f")
            .arg("bestaudio/best")
            .arg("-o")
            .arg(&output_template)
            .output()
            .await?;
        check(url, &output)?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(PathBuf::from(stdout.trim()))
    }

    /// 16 kHz mono WAV, the format Whisper expects.
    async fn extract_audio(url: &str, source_path: &Path, audio_path: &Path) -> Result<()> {
        let output = Command::new("ffmpeg")
            .arg("-y")
            .arg("-i")
            .arg(source_path)
            .arg("-ar")
            .arg("16000")
            .arg("-ac")
            .arg("1")
            .arg(audio_path)
            .output()
            .await?;

        if !output.status.success() {
            return Err(PipelineError::SourceUnavailable {
                url: url.to_string(),
                reason: format!(
                    "ffmpeg could not extract audio: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl VideoSource for YtDlpSource {
    fn provider(&self) -> &str {
        "youtube"
    }

    async fn fetch_metadata(&self, source_url: &str) -> Result<SourceMetadata> {
        let output = Command::new("yt-dlp")
            .arg("--dump-single-json")
            .arg("--skip-download")
            .arg("--no-playlist")
            .arg(source_url)
            .output()
            .await?;
        check(source_url, &output)?;

        let info: VideoInfo = serde_json::from_slice(&output.stdout)?;
        let duration_ms = info
            .duration
            .map(|secs| (secs * 1000.0).round() as u64)
            .unwrap_or(0);
        debug!(url = source_url, duration_ms, "Fetched video metadata");

        Ok(SourceMetadata {
            title: info.title.unwrap_or_else(|| source_url.to_string()),
            duration_ms,
            audio_handle: info.webpage_url.unwrap_or_else(|| source_url.to_string()),
        })
    }

    async fn download_audio(&self, video_id: &str, audio_handle: &str) -> Result<AudioArtifact> {
        let video_dir = get_video_dir(video_id);
        fs::create_dir_all(&video_dir).await?;

        let source_path = Self::download_source(audio_handle, &video_dir).await?;
        let audio_path = get_audio_path(&video_dir);
        Self::extract_audio(audio_handle, &source_path, &audio_path).await?;

        if let Err(e) = fs::remove_file(&source_path).await {
            warn!(path = %source_path.display(), error = %e, "Could not remove downloaded source");
        }
        Ok(AudioArtifact { path: audio_path })
    }

    async fn release_audio(&self, artifact: &AudioArtifact) -> Result<()> {
        match fs::remove_file(&artifact.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if let Some(dir) = artifact.path.parent() {
            // Only succeeds once the directory is empty.
            let _ = fs::remove_dir(dir).await;
        }
        Ok(())
    }
}

/// Maps a failed yt-dlp run onto the source error taxonomy.
fn check(url: &str, output: &Output) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    if is_rate_limited(&stderr) {
        return Err(PipelineError::SourceRateLimited {
            url: url.to_string(),
        });
    }
    Err(PipelineError::SourceUnavailable {
        url: url.to_string(),
        reason: stderr.trim().to_string(),
    })
}

fn is_rate_limited(stderr: &str) -> bool {
    stderr.contains("HTTP Error 429") || stderr.contains("Too Many Requests")
}
