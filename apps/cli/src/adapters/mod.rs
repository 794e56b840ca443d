use async_trait::async_trait;
use lessonforge_core::{LanguageModel, PipelineError, Provider, Result, SchemaHint};

pub mod whisper;
pub mod youtube;

pub use whisper::{MODEL_NAME, WhisperTranscriber, ensure_model};
pub use youtube::YtDlpSource;

/// Placeholder model for commands that never generate anything, so they run without an
/// API key.
pub struct UnconfiguredModel {
    provider: Provider,
}

impl UnconfiguredModel {
    pub fn new(provider: Provider) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl LanguageModel for UnconfiguredModel {
    async fn generate(&self, _prompt: &str, _schema: SchemaHint) -> Result<String> {
        Err(PipelineError::Config(format!(
            "{} is not configured for this command",
            self.provider.name()
        )))
    }
}
