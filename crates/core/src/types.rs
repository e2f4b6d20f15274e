use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    cache::atomic_write,
    error::{ChapterError, Result},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
    pub segments: Vec<Segment>,
    pub duration: f64,
    #[serde(default = "unknown_language")]
    pub language: String,
}

fn unknown_language() -> String {
    "unknown".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

impl Transcript {
    /// Build a transcript from segments, deriving the full text and duration.
    pub fn from_segments(segments: Vec<Segment>, language: impl Into<String>) -> Self {
        let text = segments
            .iter()
            .map(|s| s.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        let duration = segments.iter().map(|s| s.end).fold(0.0, f64::max);

        Self {
            text,
            segments,
            duration,
            language: language.into(),
        }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if !(self.duration >= 0.0) {
            return Err(format!("duration must be non-negative, got {}", self.duration));
        }
        for (i, seg) in self.segments.iter().enumerate() {
            if !(seg.start >= 0.0) || !(seg.end >= 0.0) {
                return Err(format!("segment {i} has a negative timestamp"));
            }
            if seg.end < seg.start {
                return Err(format!(
                    "segment {i} ends ({}) before it starts ({})",
                    seg.end, seg.start
                ));
            }
        }
        Ok(())
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let json_content = tokio::fs::read_to_string(path).await?;
        let transcript: Transcript = serde_json::from_str(&json_content)?;
        Ok(transcript)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let pretty_json = serde_json::to_string_pretty(self)?;
        atomic_write(path, pretty_json.as_bytes()).await
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    pub timestamp: f64,
    pub title: String,
}

impl Chapter {
    pub fn new(timestamp: f64, title: impl Into<String>) -> std::result::Result<Self, ChapterError> {
        let chapter = Self {
            timestamp,
            title: title.into().trim().to_string(),
        };
        chapter.validate()?;
        Ok(chapter)
    }

    pub fn validate(&self) -> std::result::Result<(), ChapterError> {
        if !self.timestamp.is_finite() || self.timestamp < 0.0 {
            return Err(ChapterError::InvalidTimestamp(self.timestamp));
        }
        if self.title.trim().is_empty() {
            return Err(ChapterError::EmptyTitle {
                timestamp: self.timestamp,
            });
        }
        Ok(())
    }
}

/// Checks the chapter list invariant: non-empty, every chapter valid,
/// timestamps unique and strictly ascending.
pub fn validate_chapters(chapters: &[Chapter]) -> std::result::Result<(), ChapterError> {
    if chapters.is_empty() {
        return Err(ChapterError::Empty);
    }

    for chapter in chapters {
        chapter.validate()?;
    }

    for pair in chapters.windows(2) {
        if pair[1].timestamp == pair[0].timestamp {
            return Err(ChapterError::Duplicate(pair[1].timestamp));
        }
        if pair[1].timestamp < pair[0].timestamp {
            return Err(ChapterError::OutOfOrder {
                previous: pair[0].timestamp,
                next: pair[1].timestamp,
            });
        }
    }

    Ok(())
}

pub type Note = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    LocalServer,
    InProcess,
    RemoteApi,
}

impl BackendKind {
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::LocalServer => "local_server",
            BackendKind::InProcess => "in_process",
            BackendKind::RemoteApi => "remote_api",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Static configuration for one backend instance.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendDescriptor {
    pub kind: BackendKind,
    pub model: String,
    pub endpoint: Option<String>,
    pub timeout: Duration,
    pub max_retries: u32,
    pub sequence_position: Option<usize>,
}

impl BackendDescriptor {
    /// Identifier used in logs, warnings and `provider_used`.
    pub fn id(&self) -> String {
        format!("{}:{}", self.kind, self.model)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum AttemptOutcome {
    Succeeded,
    Unavailable,
    Failed { kind: String, reason: String },
}

/// One step of backend resolution, kept so callers can reconstruct which
/// backend produced a result and why others were passed over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub pass: u32,
    pub backend: String,
    /// Position in the rotation set, `None` for the fallback backend.
    pub position: Option<usize>,
    pub retries: u32,
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
}

/// Model text exactly as a backend returned it for one pass.
#[derive(Debug, Clone, PartialEq)]
pub struct RawOutput {
    pub pass: u32,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub chapters: Vec<Chapter>,
    pub notes: Vec<Note>,
    pub provider_used: String,
    pub processing_time: f64,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub attempts: Vec<Attempt>,
    /// Persisted as separate text files, never inside the analysis JSON.
    #[serde(skip)]
    pub raw: Vec<RawOutput>,
}

impl AnalysisResult {
    pub async fn load(path: &Path) -> Result<Self> {
        let json_content = tokio::fs::read_to_string(path).await?;
        let result: AnalysisResult = serde_json::from_str(&json_content)?;
        Ok(result)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let pretty_json = serde_json::to_string_pretty(self)?;
        atomic_write(path, pretty_json.as_bytes()).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    ExtractAudio,
    Transcribe,
    Analyze,
    Merge,
    Subtitles,
}

impl Stage {
    pub const ORDER: [Stage; 5] = [
        Stage::ExtractAudio,
        Stage::Transcribe,
        Stage::Analyze,
        Stage::Merge,
        Stage::Subtitles,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::ExtractAudio => "extract_audio",
            Stage::Transcribe => "transcribe",
            Stage::Analyze => "analyze",
            Stage::Merge => "merge",
            Stage::Subtitles => "subtitles",
        }
    }

    /// State reached once this stage has an artifact.
    pub fn ready_state(&self) -> RunState {
        match self {
            Stage::ExtractAudio => RunState::AudioReady,
            Stage::Transcribe => RunState::TranscriptReady,
            Stage::Analyze => RunState::ChaptersReady,
            Stage::Merge => RunState::MergedReady,
            Stage::Subtitles => RunState::SubtitlesReady,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    AudioReady,
    TranscriptReady,
    ChaptersReady,
    MergedReady,
    SubtitlesReady,
    Completed,
    Failed(Stage),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub path: PathBuf,
    /// True when an existing file was reused instead of regenerated.
    pub reused: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    BackendUnavailable,
    BackendTimeout,
    BackendCallFailed,
    NormalizationError,
    AllBackendsExhausted,
    PipelineStageError,
    FileSystemError,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageFailure {
    pub stage: Stage,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub run_id: Uuid,
    pub success: bool,
    pub state: RunState,
    pub artifacts: BTreeMap<Stage, Artifact>,
    pub chapters: Option<Vec<Chapter>>,
    pub notes_file: Option<PathBuf>,
    pub raw_responses: Vec<PathBuf>,
    pub provider_used: Option<String>,
    pub warnings: Vec<String>,
    pub error: Option<StageFailure>,
}

impl PipelineResult {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            success: false,
            state: RunState::Pending,
            artifacts: BTreeMap::new(),
            chapters: None,
            notes_file: None,
            raw_responses: Vec::new(),
            provider_used: None,
            warnings: Vec::new(),
            error: None,
        }
    }

    pub fn artifact(&self, stage: Stage) -> Option<&Artifact> {
        self.artifacts.get(&stage)
    }
}
