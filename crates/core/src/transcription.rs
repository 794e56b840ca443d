use async_trait::async_trait;

use crate::{
    error::Result,
    types::{AudioArtifact, TranscriptSegment},
};

/// Speech-to-text engine. Failures surface as `TranscriptionError`.
#[async_trait]
pub trait Transcriber: Send + Sync + 'static {
    async fn transcribe(&self, audio: &AudioArtifact) -> Result<Vec<TranscriptSegment>>;
}
