use std::{
    future::Future,
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::{
    cache::{ArtifactPaths, atomic_write},
    config::Config,
    error::{ChapterlyError, PipelineError, StageError},
    events::{Event, EventSink},
    manager::BackendManager,
    media::{AudioExtractor, ChapterMerger, MediaKind, Transcriber, detect_media_kind},
    normalize::{RawResponse, normalize},
    subtitles::write_srt,
    types::{
        AnalysisResult, Artifact, PipelineResult, RunState, Stage, StageFailure, Transcript,
        validate_chapters,
    },
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOptions {
    pub skip_existing: bool,
    pub output_dir: Option<PathBuf>,
    pub write_subtitles: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            skip_existing: false,
            output_dir: None,
            write_subtitles: true,
        }
    }
}

impl PipelineOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            skip_existing: config.skip_existing,
            output_dir: config.output_dir.clone(),
            write_subtitles: config.write_subtitles,
        }
    }
}

/// Runs the stages of one input file in fixed order, halting at the first
/// failure. Independent runs may share one orchestrator.
pub struct Orchestrator {
    extractor: Arc<dyn AudioExtractor>,
    transcriber: Arc<dyn Transcriber>,
    manager: Arc<BackendManager>,
    merger: Arc<dyn ChapterMerger>,
    options: PipelineOptions,
    events: EventSink,
}

impl Orchestrator {
    pub fn new(
        extractor: Arc<dyn AudioExtractor>,
        transcriber: Arc<dyn Transcriber>,
        manager: Arc<BackendManager>,
        merger: Arc<dyn ChapterMerger>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            extractor,
            transcriber,
            manager,
            merger,
            options,
            events: EventSink::default(),
        }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Process `input`. Never fails: a halted run comes back with
    /// `success == false` and the failing stage in `error`.
    pub async fn run(&self, input: &Path, cancel: &CancellationToken) -> PipelineResult {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("run", %run_id, input = %input.display());

        async {
            let mut result = PipelineResult::new(run_id);
            match self.execute(input, cancel, &mut result).await {
                Ok(()) => {
                    result.success = true;
                    result.state = RunState::Completed;
                    tracing::info!(warnings = result.warnings.len(), "Pipeline completed");
                }
                Err(e) => {
                    let stage = e.stage();
                    tracing::error!(%stage, error = %e, "Pipeline halted");
                    self.events.publish(Event::StageFailed {
                        run_id,
                        stage,
                        message: e.to_string(),
                    });
                    result.state = RunState::Failed(stage);
                    result.error = Some(StageFailure {
                        stage,
                        kind: e.kind(),
                        message: e.to_string(),
                    });
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn execute(
        &self,
        input: &Path,
        cancel: &CancellationToken,
        result: &mut PipelineResult,
    ) -> Result<(), PipelineError> {
        let paths = ArtifactPaths::new(input, self.options.output_dir.as_deref());

        self.begin(Stage::ExtractAudio, cancel, result)?;
        validate_input(input, &paths).await.map_err(|source| PipelineError::Stage {
            stage: Stage::ExtractAudio,
            source,
        })?;
        let audio = match self
            .reuse(Stage::ExtractAudio, &paths.audio, result, || non_empty(&paths.audio))
            .await
        {
            Some(()) => paths.audio.clone(),
            None => {
                let audio = self
                    .guarded(
                        Stage::ExtractAudio,
                        cancel,
                        self.extractor.extract(input, &paths.audio),
                    )
                    .await?;
                self.record(Stage::ExtractAudio, &audio, false, result);
                audio
            }
        };

        self.begin(Stage::Transcribe, cancel, result)?;
        let transcript = match self
            .reuse(Stage::Transcribe, &paths.transcript, result, || {
                load_transcript(&paths.transcript)
            })
            .await
        {
            Some(transcript) => transcript,
            None => {
                let transcript = self
                    .guarded(Stage::Transcribe, cancel, async {
                        let transcript = self.transcriber.transcribe(&audio).await?;
                        check_transcript(&transcript).map_err(|reason| {
                            StageError::TranscriptFailed {
                                audio_path: audio.clone(),
                                reason,
                            }
                        })?;
                        transcript.save(&paths.transcript).await?;
                        Ok::<_, StageError>(transcript)
                    })
                    .await?;
                self.record(Stage::Transcribe, &paths.transcript, false, result);
                transcript
            }
        };

        self.begin(Stage::Analyze, cancel, result)?;
        let mut analysis = self
            .reuse(Stage::Analyze, &paths.analysis, result, || {
                load_analysis(&paths.analysis)
            })
            .await;
        if analysis.is_none()
            && self.options.skip_existing
            && let Some(raw_path) = self.latest_raw_response(&paths)
        {
            analysis = self
                .reuse(Stage::Analyze, &raw_path, result, || load_raw_analysis(&raw_path))
                .await;
        }
        let analysis = match analysis {
            Some(analysis) => analysis,
            None => {
                // The analysis JSON is written last: its presence marks the
                // stage complete for skip-existing.
                let (analysis, raw_files) = self
                    .guarded(Stage::Analyze, cancel, async {
                        let analysis = self.manager.analyze(&transcript).await?;
                        validate_chapters(&analysis.chapters)?;
                        let mut raw_files = Vec::with_capacity(analysis.raw.len());
                        for raw in &analysis.raw {
                            let path = paths.raw_response_for(raw.pass);
                            atomic_write(&path, raw.text.as_bytes()).await?;
                            raw_files.push(path);
                        }
                        if !analysis.notes.is_empty() {
                            let notes = serde_json::to_vec_pretty(&analysis.notes)
                                .map_err(ChapterlyError::from)?;
                            atomic_write(&paths.notes, &notes).await?;
                        }
                        analysis.save(&paths.analysis).await?;
                        Ok::<_, StageError>((analysis, raw_files))
                    })
                    .await?;
                result.warnings.extend(analysis.warnings.iter().cloned());
                result.raw_responses = raw_files;
                self.record(Stage::Analyze, &paths.analysis, false, result);
                analysis
            }
        };
        result.provider_used = Some(analysis.provider_used.clone());
        result.chapters = Some(analysis.chapters.clone());
        if !analysis.notes.is_empty() && paths.notes.is_file() {
            result.notes_file = Some(paths.notes.clone());
        }

        self.begin(Stage::Merge, cancel, result)?;
        validate_chapters(&analysis.chapters).map_err(|e| PipelineError::Stage {
            stage: Stage::Merge,
            source: e.into(),
        })?;
        if self
            .reuse(Stage::Merge, &paths.merged, result, || non_empty(&paths.merged))
            .await
            .is_none()
        {
            let merged = self
                .guarded(
                    Stage::Merge,
                    cancel,
                    self.merger.merge(input, &analysis.chapters, &paths.merged),
                )
                .await?;
            self.record(Stage::Merge, &merged, false, result);
        }

        if self.options.write_subtitles {
            self.begin(Stage::Subtitles, cancel, result)?;
            if self
                .reuse(Stage::Subtitles, &paths.subtitles, result, || {
                    non_empty(&paths.subtitles)
                })
                .await
                .is_none()
            {
                self.guarded(Stage::Subtitles, cancel, async {
                    write_srt(&transcript, &paths.subtitles).await?;
                    Ok::<_, StageError>(())
                })
                .await?;
                self.record(Stage::Subtitles, &paths.subtitles, false, result);
            }
        }

        Ok(())
    }

    /// Stop before `stage` if the run was cancelled.
    fn begin(
        &self,
        stage: Stage,
        cancel: &CancellationToken,
        result: &PipelineResult,
    ) -> Result<(), PipelineError> {
        if cancel.is_cancelled() {
            tracing::warn!(%stage, "Run cancelled");
            return Err(PipelineError::Cancelled { stage });
        }
        tracing::info!(%stage, "Stage started");
        self.events.publish(Event::StageStarted {
            run_id: result.run_id,
            stage,
        });
        Ok(())
    }

    /// Race a stage against cancellation. Losing the race drops the stage
    /// future, which kills any child process it spawned.
    async fn guarded<T, F>(
        &self,
        stage: Stage,
        cancel: &CancellationToken,
        work: F,
    ) -> Result<T, PipelineError>
    where
        F: Future<Output = Result<T, StageError>>,
    {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::warn!(%stage, "Run cancelled mid-stage");
                Err(PipelineError::Cancelled { stage })
            }
            outcome = work => outcome.map_err(|source| PipelineError::Stage { stage, source }),
        }
    }

    /// With skip-existing on, load and validate the artifact already at
    /// `path`. An invalid one is reported and regenerated.
    async fn reuse<T, L, Fut>(
        &self,
        stage: Stage,
        path: &Path,
        result: &mut PipelineResult,
        load: L,
    ) -> Option<T>
    where
        L: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, String>>,
    {
        if !self.options.skip_existing || !path.exists() {
            return None;
        }

        match load().await {
            Ok(value) => {
                result
                    .warnings
                    .push(format!("Reusing existing {} artifact: {}", stage, path.display()));
                self.record(stage, path, true, result);
                Some(value)
            }
            Err(reason) => {
                tracing::warn!(%stage, path = %path.display(), reason = %reason, "Existing artifact invalid, regenerating");
                result.warnings.push(format!(
                    "Existing {} artifact at {} is invalid ({}); regenerating",
                    stage,
                    path.display(),
                    reason
                ));
                None
            }
        }
    }

    /// Raw model text of the latest pass a previous run left behind.
    fn latest_raw_response(&self, paths: &ArtifactPaths) -> Option<PathBuf> {
        (1..=self.manager.registry().passes())
            .rev()
            .map(|pass| paths.raw_response_for(pass))
            .find(|path| path.exists())
    }

    fn record(&self, stage: Stage, path: &Path, reused: bool, result: &mut PipelineResult) {
        result.artifacts.insert(
            stage,
            Artifact {
                path: path.to_path_buf(),
                reused,
            },
        );
        result.state = stage.ready_state();

        let path = path.to_path_buf();
        if reused {
            tracing::info!(%stage, path = %path.display(), "Reusing existing artifact");
            self.events.publish(Event::StageReused {
                run_id: result.run_id,
                stage,
                path,
            });
        } else {
            tracing::info!(%stage, path = %path.display(), "Stage completed");
            self.events.publish(Event::StageCompleted {
                run_id: result.run_id,
                stage,
                path,
            });
        }
    }
}

async fn validate_input(input: &Path, paths: &ArtifactPaths) -> Result<(), StageError> {
    let unsupported = |reason: String| StageError::UnsupportedInput {
        path: input.to_path_buf(),
        reason,
    };

    let metadata = fs::metadata(input)
        .await
        .map_err(|e| unsupported(format!("cannot read input: {e}")))?;
    if !metadata.is_file() {
        return Err(unsupported("not a regular file".to_string()));
    }

    match detect_media_kind(input) {
        Some(MediaKind::Video) => {}
        Some(MediaKind::Audio) => {
            return Err(unsupported(
                "audio-only files are not supported, expected a video container".to_string(),
            ));
        }
        None => return Err(unsupported("unsupported file format".to_string())),
    }

    let outputs = [
        &paths.audio,
        &paths.transcript,
        &paths.analysis,
        &paths.raw_response,
        &paths.notes,
        &paths.merged,
        &paths.subtitles,
    ];
    if let Some(clash) = outputs.iter().find(|p| p.as_path() == input) {
        return Err(unsupported(format!(
            "output {} would overwrite the input",
            clash.display()
        )));
    }

    Ok(())
}

async fn non_empty(path: &Path) -> Result<(), String> {
    match fs::metadata(path).await {
        Ok(m) if m.is_file() && m.len() > 0 => Ok(()),
        Ok(_) => Err("file is empty".to_string()),
        Err(e) => Err(e.to_string()),
    }
}

fn check_transcript(transcript: &Transcript) -> Result<(), String> {
    transcript.validate()?;
    if transcript.segments.is_empty() {
        return Err("transcript has no segments".to_string());
    }
    Ok(())
}

async fn load_transcript(path: &Path) -> Result<Transcript, String> {
    let transcript = Transcript::load(path).await.map_err(|e| e.to_string())?;
    check_transcript(&transcript)?;
    Ok(transcript)
}

async fn load_analysis(path: &Path) -> Result<AnalysisResult, String> {
    let analysis = AnalysisResult::load(path).await.map_err(|e| e.to_string())?;
    validate_chapters(&analysis.chapters).map_err(|e| e.to_string())?;
    Ok(analysis)
}

/// Rebuild an analysis from saved model text, as if the backend had just
/// answered.
async fn load_raw_analysis(path: &Path) -> Result<AnalysisResult, String> {
    let text = fs::read_to_string(path).await.map_err(|e| e.to_string())?;
    let normalized = normalize(RawResponse::Text(text)).map_err(|e| e.to_string())?;
    validate_chapters(&normalized.chapters).map_err(|e| e.to_string())?;
    Ok(AnalysisResult {
        chapters: normalized.chapters,
        notes: normalized.notes,
        provider_used: "raw_response".to_string(),
        processing_time: 0.0,
        warnings: normalized.warnings,
        attempts: Vec::new(),
        raw: Vec::new(),
    })
}
