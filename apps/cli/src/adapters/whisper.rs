use std::path::{Path, PathBuf};

use async_trait::async_trait;
use lessonforge_core::{AudioArtifact, PipelineError, Result, Transcriber, TranscriptSegment};
use tokio::{fs, process::Command};

pub const MODEL_NAME: &str = "ggml-medium-q5_0.bin";

/// Download the whisper.cpp model into the cache if it is not there yet
pub async fn ensure_model(cache_dir: &Path) -> anyhow::Result<PathBuf> {
    let download_url = format!(
        "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/{}",
        MODEL_NAME
    );
    let model_dir = lessonforge_core::get_model_dir(cache_dir);
    fs::create_dir_all(&model_dir).await?;

    let model_path = model_dir.join(MODEL_NAME);
    if !model_path.exists() {
        let output = Command::new("curl")
            .arg("-L")
            .arg("--fail")
            .arg(&download_url)
            .arg("-o")
            .arg(&model_path)
            .output()
            .await?;

        if !output.status.success() {
            anyhow::bail!(
                "Model download from {} failed: {}",
                download_url,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
    }

    Ok(model_path)
}

/// Whisper speech-to-text over a ggml model.
///
/// With the `native-whisper` feature the model runs in-process through whisper-rs;
/// otherwise the whisper.cpp `whisper-cli` executable is invoked.
pub struct WhisperTranscriber {
    model_path: PathBuf,
}

impl WhisperTranscriber {
    pub fn new(model_path: PathBuf) -> Self {
        #[cfg(feature = "native-whisper")]
        native::silence_logs();
        Self { model_path }
    }
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    async fn transcribe(&self, audio: &AudioArtifact) -> Result<Vec<TranscriptSegment>> {
        #[cfg(feature = "native-whisper")]
        {
            let model_path = self.model_path.clone();
            let audio_path = audio.path.clone();
            tokio::task::spawn_blocking(move || native::transcribe(&model_path, &audio_path))
                .await
                .map_err(|e| failure(format!("transcription task failed: {e}")))?
        }

        #[cfg(not(feature = "native-whisper"))]
        {
            transcribe_with_cli(&self.model_path, &audio.path).await
        }
    }
}

fn failure(reason: String) -> PipelineError {
    PipelineError::TranscriptionError { reason }
}

// ---------------------------------------------------------------------------
// whisper-cli
// ---------------------------------------------------------------------------

#[cfg_attr(feature = "native-whisper", allow(dead_code))]
async fn transcribe_with_cli(model_path: &Path, audio_path: &Path) -> Result<Vec<TranscriptSegment>> {
    let output_stem = audio_path.with_extension("");
    let output = Command::new("whisper-cli")
        .arg("-m")
        .arg(model_path)
        .arg("-f")
        .arg(audio_path)
        .arg("-oj")
        .arg("-of")
        .arg(&output_stem)
        .arg("-np")
        .output()
        .await
        .map_err(|e| failure(format!("could not start whisper-cli: {e}")))?;

    if !output.status.success() {
        return Err(failure(format!(
            "whisper-cli exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let json_path = output_stem.with_extension("json");
    let content = fs::read_to_string(&json_path).await?;
    let _ = fs::remove_file(&json_path).await;
    parse_cli_output(&content)
}

#[derive(serde::Deserialize)]
struct CliOutput {
    transcription: Vec<CliSegment>,
}

#[derive(serde::Deserialize)]
struct CliSegment {
    offsets: CliOffsets,
    text: String,
}

/// Milliseconds from the start of the audio.
#[derive(serde::Deserialize)]
struct CliOffsets {
    from: u64,
    to: u64,
}

fn parse_cli_output(content: &str) -> Result<Vec<TranscriptSegment>> {
    let parsed: CliOutput = serde_json::from_str(content)
        .map_err(|e| failure(format!("unreadable whisper-cli output: {e}")))?;

    Ok(parsed
        .transcription
        .into_iter()
        .filter(|s| !s.text.trim().is_empty())
        .map(|s| TranscriptSegment {
            start_ms: s.offsets.from,
            end_ms: s.offsets.to,
            text: s.text.trim().to_string(),
        })
        .collect())
}

// ---------------------------------------------------------------------------
// whisper-rs
// ---------------------------------------------------------------------------

#[cfg(feature = "native-whisper")]
mod native {
    use std::path::Path;

    use lessonforge_core::{Result, TranscriptSegment};
    use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

    use super::failure;

    extern "C" fn whisper_log_callback(
        _level: u32,
        _message: *const std::ffi::c_char,
        _user_data: *mut std::ffi::c_void,
    ) {
        // silent
    }

    pub fn silence_logs() {
        unsafe {
            whisper_rs::set_log_callback(Some(whisper_log_callback), std::ptr::null_mut());
        }
    }

    pub fn transcribe(model_path: &Path, audio_path: &Path) -> Result<Vec<TranscriptSegment>> {
        let mut reader = hound::WavReader::open(audio_path)
            .map_err(|e| failure(format!("cannot open {}: {e}", audio_path.display())))?;
        let samples: Vec<f32> = reader
            .samples::<i16>()
            .map(|s| s.map(|s| s as f32 / i16::MAX as f32))
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| failure(format!("cannot decode {}: {e}", audio_path.display())))?;

        let ctx_params = WhisperContextParameters {
            use_gpu: true,
            flash_attn: true,
            ..Default::default()
        };
        let model_path = model_path.to_string_lossy();
        let ctx = WhisperContext::new_with_params(&model_path, ctx_params)
            .map_err(|e| failure(format!("failed to load model: {e}")))?;

        let params = FullParams::new(SamplingStrategy::Greedy { best_of: 5 });
        let mut state = ctx
            .create_state()
            .map_err(|e| failure(format!("failed to create state: {e}")))?;
        state
            .full(params, &samples)
            .map_err(|e| failure(format!("failed to run model: {e}")))?;

        let mut segments = Vec::new();
        for segment in state.as_iter() {
            let Ok(text) = segment.to_str() else {
                continue;
            };
            if text.trim().is_empty() {
                continue;
            }
            // whisper timestamps are in centiseconds
            segments.push(TranscriptSegment {
                start_ms: segment.start_timestamp().max(0) as u64 * 10,
                end_ms: segment.end_timestamp().max(0) as u64 * 10,
                text: text.trim().to_string(),
            });
        }
        Ok(segments)
    }
}
