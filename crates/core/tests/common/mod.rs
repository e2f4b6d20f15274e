#![allow(dead_code)]

use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chapterly_core::{
    AnalysisBackend, AnalysisRequest, BackendManager, BackendRegistry, RetryPolicy,
    error::{BackendError, StageError},
    media::{AudioExtractor, ChapterMerger, Transcriber},
    types::{
        AnalysisResult, BackendDescriptor, BackendKind, Chapter, Note, RawOutput, Segment,
        Transcript,
    },
};
use serde_json::json;

#[derive(Debug, Clone)]
pub enum Reply {
    Chapters(Vec<(f64, &'static str)>),
    Fail(&'static str),
    Hang,
}

pub fn default_chapters() -> Vec<(f64, &'static str)> {
    vec![(0.0, "Intro"), (30.0, "Main topic"), (60.0, "Wrap up")]
}

/// Scripted backend: replies from the script first, then `fallback_reply`.
pub struct FakeBackend {
    descriptor: BackendDescriptor,
    available: AtomicBool,
    script: Mutex<VecDeque<Reply>>,
    fallback_reply: Reply,
    notes: Vec<Note>,
    calls: AtomicU32,
    requests: Mutex<Vec<&'static str>>,
}

impl FakeBackend {
    pub fn new(model: &str, reply: Reply) -> Self {
        Self {
            descriptor: descriptor(BackendKind::LocalServer, model),
            available: AtomicBool::new(true),
            script: Mutex::new(VecDeque::new()),
            fallback_reply: reply,
            notes: Vec::new(),
            calls: AtomicU32::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn ok(model: &str) -> Self {
        Self::new(model, Reply::Chapters(default_chapters()))
    }

    pub fn failing(model: &str) -> Self {
        Self::new(model, Reply::Fail("model crashed"))
    }

    pub fn unavailable(model: &str) -> Self {
        let backend = Self::ok(model);
        backend.available.store(false, Ordering::SeqCst);
        backend
    }

    pub fn kind(mut self, kind: BackendKind) -> Self {
        self.descriptor.kind = kind;
        self
    }

    pub fn retries(mut self, max_retries: u32) -> Self {
        self.descriptor.max_retries = max_retries;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.descriptor.timeout = timeout;
        self
    }

    pub fn position(mut self, position: usize) -> Self {
        self.descriptor.sequence_position = Some(position);
        self
    }

    pub fn script(self, replies: Vec<Reply>) -> Self {
        *self.script.lock().unwrap() = replies.into();
        self
    }

    pub fn with_note(mut self, details: &str) -> Self {
        let mut note = Note::new();
        note.insert("details".to_string(), json!(details));
        self.notes.push(note);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<&'static str> {
        self.requests.lock().unwrap().clone()
    }
}

pub fn descriptor(kind: BackendKind, model: &str) -> BackendDescriptor {
    BackendDescriptor {
        kind,
        model: model.to_string(),
        endpoint: None,
        timeout: Duration::from_secs(5),
        max_retries: 0,
        sequence_position: None,
    }
}

#[async_trait]
impl AnalysisBackend for FakeBackend {
    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn analyze(
        &self,
        _transcript: &Transcript,
        request: AnalysisRequest<'_>,
    ) -> Result<AnalysisResult, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(match request {
            AnalysisRequest::Initial => "initial",
            AnalysisRequest::Review { .. } => "review",
        });

        let reply = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback_reply.clone());

        match reply {
            Reply::Chapters(chapters) => {
                let text = json!({
                    "chapters": chapters
                        .iter()
                        .map(|(timestamp, title)| json!({"timestamp_original": timestamp, "title": title}))
                        .collect::<Vec<_>>(),
                    "notes": self.notes,
                })
                .to_string();
                Ok(AnalysisResult {
                    chapters: chapters
                        .into_iter()
                        .map(|(timestamp, title)| Chapter {
                            timestamp,
                            title: title.to_string(),
                        })
                        .collect(),
                    notes: self.notes.clone(),
                    provider_used: self.descriptor.id(),
                    processing_time: 0.01,
                    warnings: Vec::new(),
                    attempts: Vec::new(),
                    raw: vec![RawOutput { pass: 0, text }],
                })
            }
            Reply::Fail(reason) => Err(BackendError::call_failed(self.descriptor.id(), reason)),
            Reply::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(BackendError::call_failed(self.descriptor.id(), "woke up"))
            }
        }
    }

    fn describe(&self) -> &BackendDescriptor {
        &self.descriptor
    }
}

pub fn instant_retries() -> RetryPolicy {
    RetryPolicy::new(0, Duration::ZERO, Duration::ZERO)
}

pub fn manager(
    rotation: Vec<Arc<FakeBackend>>,
    fallback: Option<Arc<FakeBackend>>,
    passes: u32,
) -> BackendManager {
    let rotation = rotation
        .into_iter()
        .map(|b| b as Arc<dyn AnalysisBackend>)
        .collect();
    let fallback = fallback.map(|b| b as Arc<dyn AnalysisBackend>);
    let registry = BackendRegistry::new(rotation, fallback, passes, instant_retries());
    BackendManager::new(Arc::new(registry)).with_availability_timeout(Duration::from_millis(500))
}

pub fn transcript() -> Transcript {
    Transcript::from_segments(
        vec![
            Segment {
                start: 0.0,
                end: 29.5,
                text: "Welcome everyone, let's get started.".into(),
            },
            Segment {
                start: 30.0,
                end: 59.0,
                text: "First topic is the release plan.".into(),
            },
            Segment {
                start: 60.0,
                end: 75.0,
                text: "Thanks, see you next week.".into(),
            },
        ],
        "en",
    )
}

/// Writes a small file at the requested path, counting invocations.
#[derive(Default)]
pub struct FakeExtractor {
    pub calls: AtomicU32,
    pub fail: bool,
}

#[async_trait]
impl AudioExtractor for FakeExtractor {
    async fn extract(&self, video: &Path, audio: &Path) -> Result<PathBuf, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(StageError::AudioExtractionFailed {
                video_path: video.to_path_buf(),
                reason: "no audio track found".into(),
            });
        }
        tokio::fs::write(audio, b"RIFF fake wav").await.map_err(|e| StageError::fs(audio, e))?;
        Ok(audio.to_path_buf())
    }
}

#[derive(Default)]
pub struct FakeTranscriber {
    pub calls: AtomicU32,
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    async fn transcribe(&self, _audio: &Path) -> Result<Transcript, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(transcript())
    }
}

#[derive(Default)]
pub struct FakeMerger {
    pub calls: AtomicU32,
    pub hang: bool,
}

#[async_trait]
impl ChapterMerger for FakeMerger {
    async fn merge(
        &self,
        _video: &Path,
        chapters: &[Chapter],
        output: &Path,
    ) -> Result<PathBuf, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        let body = chapters
            .iter()
            .map(|c| format!("{} {}", c.timestamp, c.title))
            .collect::<Vec<_>>()
            .join("\n");
        tokio::fs::write(output, body).await.map_err(|e| StageError::fs(output, e))?;
        Ok(output.to_path_buf())
    }
}
