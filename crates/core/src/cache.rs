use std::path::{Path, PathBuf};

pub fn get_root_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("lessonforge")
}

/// Working directory for one video's transient artifacts
pub fn get_video_dir(video_id: &str) -> PathBuf {
    get_root_cache_dir().join("videos").join(video_id)
}

pub fn get_model_dir(cache_dir: &Path) -> PathBuf {
    cache_dir.join("models")
}

/// Get the path for a cached audio file
pub fn get_audio_path(video_dir: &Path) -> PathBuf {
    video_dir.join("audio.wav")
}

/// Default location of the pipeline's JSON snapshot
pub fn get_store_path() -> PathBuf {
    get_root_cache_dir().join("store.json")
}
