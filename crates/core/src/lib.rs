pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod format;
pub mod manager;
pub mod media;
pub mod normalize;
pub mod pipeline;
pub mod retry;
mod stop;
pub mod subtitles;
pub mod types;

pub use backend::{AnalysisBackend, AnalysisRequest, BackendRegistry};
pub use config::Config;
pub use error::{BackendError, ChapterlyError, ConfigError, PipelineError, StageError};
pub use events::{Event, EventSink};
pub use manager::BackendManager;
pub use pipeline::{Orchestrator, PipelineOptions};
pub use retry::RetryPolicy;
pub use types::{
    AnalysisResult, BackendDescriptor, BackendKind, Chapter, PipelineResult, RunState, Segment,
    Stage, Transcript,
};
