use std::{
    hash::{DefaultHasher, Hash, Hasher},
    sync::LazyLock,
};

use async_trait::async_trait;
use regex::Regex;

use crate::{
    error::{PipelineError, Result},
    types::AudioArtifact,
};

#[derive(Debug, Clone, PartialEq)]
pub struct SourceMetadata {
    pub title: String,
    pub duration_ms: u64,
    pub audio_handle: String,
}

/// Where videos come from. Implementations fail with `SourceUnavailable` or `SourceRateLimited`.
#[async_trait]
pub trait VideoSource: Send + Sync + 'static {
    /// Provider name used for rate limiting.
    fn provider(&self) -> &str;

    async fn fetch_metadata(&self, source_url: &str) -> Result<SourceMetadata>;

    async fn download_audio(&self, video_id: &str, audio_handle: &str) -> Result<AudioArtifact>;

    /// Called once the transcript is persisted and the audio is no longer needed.
    async fn release_audio(&self, _artifact: &AudioArtifact) -> Result<()> {
        Ok(())
    }
}

static YOUTUBE_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:youtube\.com/(?:watch\?(?:.*&)?v=|embed/|shorts/|live/)|youtu\.be/)([A-Za-z0-9_-]{11})")
        .expect("valid video id pattern")
});

static BARE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{11}$").expect("valid bare id pattern"));

/// Natural key for a source URL.
///
/// YouTube URLs (and bare 11-character ids) map to the video id; anything else gets a
/// stable hash of the URL.
pub fn extract_video_id(source_url: &str) -> Result<String> {
    let url = source_url.trim();
    if url.is_empty() {
        return Err(PipelineError::InvalidSource {
            url: source_url.to_string(),
        });
    }

    if let Some(caps) = YOUTUBE_ID.captures(url) {
        return Ok(caps[1].to_string());
    }
    if BARE_ID.is_match(url) {
        return Ok(url.to_string());
    }
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(PipelineError::InvalidSource {
            url: source_url.to_string(),
        });
    }

    let mut hasher = DefaultHasher::new();
    url.hash(&mut hasher);
    Ok(format!("url-{:016x}", hasher.finish()))
}

pub fn embed_url(video_id: &str) -> String {
    format!("https://www.youtube.com/embed/{video_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_youtube_ids() {
        for url in [
            "https://www.youtube.com/watch?v=UEtBMyzLBFY",
            "https://www.youtube.com/watch?feature=share&v=UEtBMyzLBFY",
            "https://youtu.be/UEtBMyzLBFY?t=42",
            "https://www.youtube.com/embed/UEtBMyzLBFY",
            "UEtBMyzLBFY",
        ] {
            assert_eq!(extract_video_id(url).unwrap(), "UEtBMyzLBFY", "{url}");
        }
    }

    #[test]
    fn other_urls_hash_stably() {
        let a = extract_video_id("https://example.com/talk.mp4").unwrap();
        let b = extract_video_id("https://example.com/talk.mp4").unwrap();
        let c = extract_video_id("https://example.com/other.mp4").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("url-"));
    }

    #[test]
    fn rejects_garbage() {
        assert!(extract_video_id("").is_err());
        assert!(extract_video_id("not a url").is_err());
    }
}
