pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod format;
pub mod gate;
pub mod llm;
pub mod orchestrator;
pub mod provider;
pub mod queues;
pub mod quiz;
pub mod retry;
pub mod review;
pub mod scheduler;
pub mod segmenter;
pub mod source;
pub mod store;
pub mod transcription;
pub mod types;
pub mod workers;

pub use cache::{get_audio_path, get_model_dir, get_root_cache_dir, get_store_path, get_video_dir};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use events::{EventBus, EventReceiver, PipelineEvent, SubscriptionSpec};
pub use format::{
    format_job_readable, format_module_readable, format_timestamp,
    format_transcript_with_timestamps,
};
pub use gate::{FetchGate, FetchPermit, ResourceClass};
pub use llm::{ChatCompletionsClient, LanguageModel, SchemaHint};
pub use orchestrator::{Collaborators, Orchestrator};
pub use provider::{Provider, ProviderConfig};
pub use quiz::QuizGenerator;
pub use review::ReviewGate;
pub use scheduler::SpacedRepetitionScheduler;
pub use segmenter::ModuleSegmenter;
pub use source::{SourceMetadata, VideoSource, extract_video_id};
pub use store::{Repository, Store};
pub use transcription::Transcriber;
pub use types::*;
pub use workers::WorkerPool;
