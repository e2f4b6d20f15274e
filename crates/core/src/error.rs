use std::{path::PathBuf, time::Duration};

use thiserror::Error;

use crate::types::{Attempt, AttemptOutcome, ErrorKind, Stage};

#[derive(Error, Debug)]
pub enum ChapterlyError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Model download failed for {url}: {reason}")]
    ModelDownloadFailed { url: String, reason: String },
}

pub type Result<T> = std::result::Result<T, ChapterlyError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChapterError {
    #[error("chapter list cannot be empty")]
    Empty,

    #[error("chapter timestamp must be a non-negative number, got {0}")]
    InvalidTimestamp(f64),

    #[error("chapter at {timestamp}s has an empty title")]
    EmptyTitle { timestamp: f64 },

    #[error("duplicate chapter timestamp {0}")]
    Duplicate(f64),

    #[error("chapter timestamps out of order: {next} follows {previous}")]
    OutOfOrder { previous: f64, next: f64 },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NormalizationError {
    #[error("backend returned an empty response")]
    EmptyResponse,

    #[error("could not find a JSON object in response: {preview}")]
    NoJsonObject { preview: String },

    #[error("failed to parse JSON from response: {reason}")]
    InvalidJson { reason: String },

    #[error("expected a JSON object, got {found}")]
    NotAnObject { found: &'static str },

    #[error("response has no 'chapters' field")]
    MissingChapters,

    #[error("expected 'chapters' to be an array, got {found}")]
    ChaptersNotArray { found: &'static str },

    #[error("response shape not recognized: {reason}")]
    UnexpectedShape { reason: String },

    #[error("no usable chapters in response")]
    NoChapters,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    Unavailable,
    Timeout,
    CallFailed,
    Normalization,
    AllBackendsExhausted,
}

#[derive(Error, Debug, Clone)]
pub enum BackendError {
    #[error("backend {backend} is unavailable: {reason}")]
    Unavailable { backend: String, reason: String },

    #[error("backend {backend} timed out after {timeout:?}")]
    Timeout { backend: String, timeout: Duration },

    #[error("backend {backend} call failed: {reason}")]
    CallFailed { backend: String, reason: String },

    #[error("backend {backend} returned output that could not be normalized: {source}")]
    Normalization {
        backend: String,
        #[source]
        source: NormalizationError,
    },

    #[error("all backends exhausted for pass {pass}: {}", summarize(.attempts))]
    AllBackendsExhausted {
        pass: u32,
        attempts: Vec<Attempt>,
        /// Skips, retries and fallback notices collected before the pass gave up.
        warnings: Vec<String>,
    },
}

fn summarize(attempts: &[Attempt]) -> String {
    if attempts.is_empty() {
        return "no backends configured".to_string();
    }

    attempts
        .iter()
        .map(|a| match &a.outcome {
            AttemptOutcome::Succeeded => format!("{} succeeded", a.backend),
            AttemptOutcome::Unavailable => format!("{} unavailable", a.backend),
            AttemptOutcome::Failed { reason, .. } => format!("{} failed ({})", a.backend, reason),
        })
        .collect::<Vec<_>>()
        .join("; ")
}

impl BackendError {
    pub fn kind(&self) -> BackendErrorKind {
        match self {
            BackendError::Unavailable { .. } => BackendErrorKind::Unavailable,
            BackendError::Timeout { .. } => BackendErrorKind::Timeout,
            BackendError::CallFailed { .. } => BackendErrorKind::CallFailed,
            BackendError::Normalization { .. } => BackendErrorKind::Normalization,
            BackendError::AllBackendsExhausted { .. } => BackendErrorKind::AllBackendsExhausted,
        }
    }

    pub fn call_failed(backend: impl Into<String>, reason: impl ToString) -> Self {
        BackendError::CallFailed {
            backend: backend.into(),
            reason: reason.to_string(),
        }
    }
}

impl BackendErrorKind {
    pub fn name(&self) -> &'static str {
        match self {
            BackendErrorKind::Unavailable => "unavailable",
            BackendErrorKind::Timeout => "timeout",
            BackendErrorKind::CallFailed => "call_failed",
            BackendErrorKind::Normalization => "normalization",
            BackendErrorKind::AllBackendsExhausted => "all_backends_exhausted",
        }
    }
}

#[derive(Error, Debug)]
pub enum StageError {
    #[error("Unsupported input {path}: {reason}")]
    UnsupportedInput { path: PathBuf, reason: String },

    #[error("Audio extraction failed for {video_path}: {reason}")]
    AudioExtractionFailed { video_path: PathBuf, reason: String },

    #[error("Transcription failed for {audio_path}: {reason}")]
    TranscriptFailed { audio_path: PathBuf, reason: String },

    #[error("Chapter merge failed for {video_path}: {reason}")]
    MergeFailed { video_path: PathBuf, reason: String },

    #[error("Invalid chapters: {0}")]
    InvalidChapters(#[from] ChapterError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("File system error at {path}: {source}")]
    FileSystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Chapterly(#[from] ChapterlyError),
}

impl StageError {
    pub fn fs(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StageError::FileSystem {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StageError::Backend(e) => match e.kind() {
                BackendErrorKind::Unavailable => ErrorKind::BackendUnavailable,
                BackendErrorKind::Timeout => ErrorKind::BackendTimeout,
                BackendErrorKind::CallFailed => ErrorKind::BackendCallFailed,
                BackendErrorKind::Normalization => ErrorKind::NormalizationError,
                BackendErrorKind::AllBackendsExhausted => ErrorKind::AllBackendsExhausted,
            },
            StageError::FileSystem { .. } | StageError::Chapterly(ChapterlyError::IoError(_)) => {
                ErrorKind::FileSystemError
            }
            _ => ErrorKind::PipelineStageError,
        }
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("stage {stage} failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: StageError,
    },

    #[error("run cancelled before {stage} completed")]
    Cancelled { stage: Stage },
}

impl PipelineError {
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::Stage { stage, .. } | PipelineError::Cancelled { stage } => *stage,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Stage { source, .. } => source.kind(),
            PipelineError::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Configuration validation failed:\n{}", bullet_list(.0))]
    Invalid(Vec<String>),
}

fn bullet_list(errors: &[String]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {e}"))
        .collect::<Vec<_>>()
        .join("\n")
}
