mod common;

use std::{
    path::{Path, PathBuf},
    sync::{Arc, atomic::Ordering},
    time::Duration,
};

use chapterly_core::{
    EventSink, Orchestrator, PipelineOptions, RunState, Stage,
    cache::ArtifactPaths,
    events::Event,
    types::{AnalysisResult, Chapter, ErrorKind},
};
use common::{FakeBackend, FakeExtractor, FakeMerger, FakeTranscriber, manager, transcript};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const VIDEO_BYTES: &[u8] = b"not really a matroska container";

struct Harness {
    dir: TempDir,
    input: PathBuf,
    extractor: Arc<FakeExtractor>,
    transcriber: Arc<FakeTranscriber>,
    merger: Arc<FakeMerger>,
    backend: Arc<FakeBackend>,
}

impl Harness {
    fn new(file_name: &str) -> Self {
        Self::with(file_name, FakeBackend::ok("a"), FakeExtractor::default(), FakeMerger::default())
    }

    fn with(
        file_name: &str,
        backend: FakeBackend,
        extractor: FakeExtractor,
        merger: FakeMerger,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join(file_name);
        std::fs::write(&input, VIDEO_BYTES).unwrap();
        Self {
            dir,
            input,
            extractor: Arc::new(extractor),
            transcriber: Arc::new(FakeTranscriber::default()),
            merger: Arc::new(merger),
            backend: Arc::new(backend),
        }
    }

    fn paths(&self) -> ArtifactPaths {
        ArtifactPaths::new(&self.input, None)
    }

    fn orchestrator(&self, options: PipelineOptions) -> Orchestrator {
        self.orchestrator_with_passes(options, 1)
    }

    fn orchestrator_with_passes(&self, options: PipelineOptions, passes: u32) -> Orchestrator {
        Orchestrator::new(
            self.extractor.clone(),
            self.transcriber.clone(),
            Arc::new(manager(vec![self.backend.clone()], None, passes)),
            self.merger.clone(),
            options,
        )
    }

    fn calls(&self) -> (u32, u32, u32, u32) {
        (
            self.extractor.calls.load(Ordering::SeqCst),
            self.transcriber.calls.load(Ordering::SeqCst),
            self.backend.calls(),
            self.merger.calls.load(Ordering::SeqCst),
        )
    }

    fn input_untouched(&self) -> bool {
        std::fs::read(&self.input).unwrap() == VIDEO_BYTES
    }
}

fn skip_existing() -> PipelineOptions {
    PipelineOptions {
        skip_existing: true,
        ..Default::default()
    }
}

fn exists(path: &Path) -> bool {
    path.try_exists().unwrap()
}

#[tokio::test]
async fn full_run_produces_every_artifact() {
    let h = Harness::new("standup.mkv");
    let paths = h.paths();

    let result = h
        .orchestrator(PipelineOptions::default())
        .run(&h.input, &CancellationToken::new())
        .await;

    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(result.state, RunState::Completed);
    assert_eq!(result.provider_used.as_deref(), Some("local_server:a"));
    assert_eq!(result.chapters.as_ref().map(Vec::len), Some(3));
    assert!(result.warnings.is_empty(), "warnings: {:?}", result.warnings);
    assert!(result.error.is_none());

    for stage in Stage::ORDER {
        let artifact = result.artifact(stage).unwrap();
        assert!(!artifact.reused);
        assert!(exists(&artifact.path), "{stage} artifact missing");
    }
    assert_eq!(result.artifact(Stage::Merge).unwrap().path, paths.merged);
    assert!(std::fs::read_to_string(&paths.merged).unwrap().contains("Main topic"));
    assert_eq!(result.raw_responses, vec![paths.raw_response.clone()]);
    assert!(std::fs::read_to_string(&paths.raw_response).unwrap().contains("\"Wrap up\""));
    assert!(result.notes_file.is_none());
    assert!(
        std::fs::read_to_string(&paths.subtitles)
            .unwrap()
            .starts_with("1\n00:00:00,000 --> 00:00:29,500\n")
    );
    assert_eq!(h.calls(), (1, 1, 1, 1));
    assert!(h.input_untouched());
}

#[tokio::test]
async fn skip_existing_reuses_valid_artifacts() {
    let h = Harness::new("standup.mkv");
    let paths = h.paths();

    std::fs::write(&paths.audio, b"RIFF cached").unwrap();
    transcript().save(&paths.transcript).await.unwrap();
    AnalysisResult {
        chapters: vec![
            Chapter::new(0.0, "Cached intro").unwrap(),
            Chapter::new(42.0, "Cached outro").unwrap(),
        ],
        notes: Vec::new(),
        provider_used: "remote_api:cached".to_string(),
        processing_time: 1.0,
        warnings: vec!["Pass 1: old warning".to_string()],
        attempts: Vec::new(),
        raw: Vec::new(),
    }
    .save(&paths.analysis)
    .await
    .unwrap();
    std::fs::write(&paths.merged, b"merged earlier").unwrap();
    std::fs::write(&paths.subtitles, b"1\n00:00:00,000 --> 00:00:01,000\nhi\n").unwrap();

    let result = h
        .orchestrator(skip_existing())
        .run(&h.input, &CancellationToken::new())
        .await;

    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(h.calls(), (0, 0, 0, 0));
    for stage in Stage::ORDER {
        assert!(result.artifact(stage).unwrap().reused, "{stage} was regenerated");
    }
    assert_eq!(result.provider_used.as_deref(), Some("remote_api:cached"));
    assert_eq!(result.chapters.unwrap()[1].title, "Cached outro");
    assert_eq!(
        result.warnings.iter().filter(|w| w.starts_with("Reusing existing")).count(),
        5
    );
    assert!(!result.warnings.iter().any(|w| w.contains("old warning")));
    assert_eq!(std::fs::read(&paths.merged).unwrap(), b"merged earlier");
}

#[tokio::test]
async fn invalid_cached_analysis_is_regenerated() {
    let h = Harness::new("standup.mkv");
    let paths = h.paths();
    std::fs::write(&paths.analysis, b"{\"chapters\": [").unwrap();

    let result = h
        .orchestrator(skip_existing())
        .run(&h.input, &CancellationToken::new())
        .await;

    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(h.calls(), (1, 1, 1, 1));
    assert!(!result.artifact(Stage::Analyze).unwrap().reused);
    assert!(
        result
            .warnings
            .iter()
            .any(|w| w.starts_with("Existing analyze artifact") && w.ends_with("regenerating"))
    );
    let stored = AnalysisResult::load(&paths.analysis).await.unwrap();
    assert_eq!(stored.provider_used, "local_server:a");
}

#[tokio::test]
async fn exhausted_backends_halt_before_merge() {
    let h = Harness::with(
        "standup.mkv",
        FakeBackend::unavailable("a"),
        FakeExtractor::default(),
        FakeMerger::default(),
    );
    let paths = h.paths();

    let result = h
        .orchestrator(PipelineOptions::default())
        .run(&h.input, &CancellationToken::new())
        .await;

    assert!(!result.success);
    assert_eq!(result.state, RunState::Failed(Stage::Analyze));
    let error = result.error.as_ref().unwrap();
    assert_eq!(error.stage, Stage::Analyze);
    assert_eq!(error.kind, ErrorKind::AllBackendsExhausted);
    assert!(error.message.contains("local_server:a unavailable"));

    assert!(result.artifact(Stage::Transcribe).is_some());
    assert!(result.artifact(Stage::Analyze).is_none());
    assert!(!exists(&paths.analysis));
    assert!(!exists(&paths.merged));
    assert!(!exists(&paths.subtitles));
    assert_eq!(h.calls().3, 0);
    assert!(h.input_untouched());
}

#[tokio::test]
async fn extraction_failure_halts_at_first_stage() {
    let h = Harness::with(
        "silent.mp4",
        FakeBackend::ok("a"),
        FakeExtractor {
            fail: true,
            ..Default::default()
        },
        FakeMerger::default(),
    );

    let result = h
        .orchestrator(PipelineOptions::default())
        .run(&h.input, &CancellationToken::new())
        .await;

    assert_eq!(result.state, RunState::Failed(Stage::ExtractAudio));
    assert_eq!(result.error.unwrap().kind, ErrorKind::PipelineStageError);
    assert!(result.artifacts.is_empty());
    assert_eq!(h.calls(), (1, 0, 0, 0));
}

#[tokio::test]
async fn unsupported_inputs_are_rejected() {
    for name in ["talk.wav", "notes.txt"] {
        let h = Harness::new(name);
        let result = h
            .orchestrator(PipelineOptions::default())
            .run(&h.input, &CancellationToken::new())
            .await;

        assert_eq!(result.state, RunState::Failed(Stage::ExtractAudio), "{name}");
        assert!(result.error.unwrap().message.contains("Unsupported input"));
        assert_eq!(h.calls(), (0, 0, 0, 0));
    }

    let h = Harness::new("standup.mkv");
    let missing = h.dir.path().join("missing.mkv");
    let result = h
        .orchestrator(PipelineOptions::default())
        .run(&missing, &CancellationToken::new())
        .await;
    assert!(!result.success);
    assert!(result.error.unwrap().message.contains("cannot read input"));
}

#[tokio::test]
async fn cancelled_run_never_starts() {
    let h = Harness::new("standup.mkv");
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = h.orchestrator(PipelineOptions::default()).run(&h.input, &cancel).await;

    assert_eq!(result.state, RunState::Failed(Stage::ExtractAudio));
    assert_eq!(result.error.as_ref().unwrap().kind, ErrorKind::Cancelled);
    assert_eq!(h.calls(), (0, 0, 0, 0));
}

#[tokio::test]
async fn cancellation_interrupts_a_running_stage() {
    let h = Harness::with(
        "standup.mkv",
        FakeBackend::ok("a"),
        FakeExtractor::default(),
        FakeMerger {
            hang: true,
            ..Default::default()
        },
    );
    let paths = h.paths();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let result = tokio::time::timeout(
        Duration::from_secs(10),
        h.orchestrator(PipelineOptions::default()).run(&h.input, &cancel),
    )
    .await
    .unwrap();

    assert_eq!(result.state, RunState::Failed(Stage::Merge));
    assert_eq!(result.error.as_ref().unwrap().kind, ErrorKind::Cancelled);
    assert!(result.artifact(Stage::Analyze).is_some());
    assert!(!exists(&paths.merged));
    assert!(!exists(&paths.subtitles));
}

#[tokio::test]
async fn subtitles_can_be_disabled() {
    let h = Harness::new("standup.mkv");
    let options = PipelineOptions {
        write_subtitles: false,
        ..Default::default()
    };

    let result = h.orchestrator(options).run(&h.input, &CancellationToken::new()).await;

    assert!(result.success);
    assert!(result.artifact(Stage::Subtitles).is_none());
    assert!(!exists(&h.paths().subtitles));
}

#[tokio::test]
async fn artifacts_can_go_to_a_separate_directory() {
    let h = Harness::new("standup.mkv");
    let out = tempfile::tempdir().unwrap();
    let options = PipelineOptions {
        output_dir: Some(out.path().to_path_buf()),
        ..Default::default()
    };

    let result = h.orchestrator(options).run(&h.input, &CancellationToken::new()).await;

    assert!(result.success);
    let merged = &result.artifact(Stage::Merge).unwrap().path;
    assert_eq!(merged, &out.path().join("standup_chaptered.mkv"));
    assert!(!exists(&h.dir.path().join("standup_chaptered.mkv")));
}

#[tokio::test]
async fn stage_events_follow_pipeline_order() {
    let h = Harness::new("standup.mkv");
    let (sink, mut rx) = EventSink::channel();
    let orchestrator = h.orchestrator(PipelineOptions::default()).with_events(sink);

    let result = orchestrator.run(&h.input, &CancellationToken::new()).await;
    drop(orchestrator);
    assert!(result.success);

    let mut completed = Vec::new();
    while let Some(event) = rx.recv().await {
        if let Event::StageCompleted { run_id, stage, .. } = event {
            assert_eq!(run_id, result.run_id);
            completed.push(stage);
        }
    }
    assert_eq!(completed, Stage::ORDER.to_vec());
}

#[tokio::test]
async fn every_pass_keeps_its_raw_model_output() {
    let h = Harness::with(
        "standup.mkv",
        FakeBackend::ok("a").with_note("Ship the release on Friday"),
        FakeExtractor::default(),
        FakeMerger::default(),
    );
    let paths = h.paths();

    let result = h
        .orchestrator_with_passes(PipelineOptions::default(), 2)
        .run(&h.input, &CancellationToken::new())
        .await;

    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(
        result.raw_responses,
        vec![paths.raw_response_for(1), paths.raw_response_for(2)]
    );
    for path in &result.raw_responses {
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.contains("Ship the release on Friday"), "{}", path.display());
    }
    assert_eq!(result.notes_file.as_ref(), Some(&paths.notes));
    let stored = AnalysisResult::load(&paths.analysis).await.unwrap();
    assert!(stored.raw.is_empty());
    assert!(!std::fs::read_to_string(&paths.analysis).unwrap().contains("\"raw\""));
}

#[tokio::test]
async fn skip_existing_rebuilds_analysis_from_raw_output() {
    let h = Harness::new("standup.mkv");
    let paths = h.paths();

    std::fs::write(&paths.audio, b"RIFF cached").unwrap();
    transcript().save(&paths.transcript).await.unwrap();
    std::fs::write(
        &paths.raw_response,
        "```json\n{\"chapters\": [{\"timestamp_original\": 0, \"title\": \"Saved intro\"}, {\"timestamp_original\": 30, \"title\": \"Saved plan\"}]}\n```",
    )
    .unwrap();

    let result = h
        .orchestrator(skip_existing())
        .run(&h.input, &CancellationToken::new())
        .await;

    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(h.calls(), (0, 0, 0, 1));
    let analyzed = result.artifact(Stage::Analyze).unwrap();
    assert!(analyzed.reused);
    assert_eq!(analyzed.path, paths.raw_response);
    assert_eq!(result.provider_used.as_deref(), Some("raw_response"));
    let titles: Vec<_> = result
        .chapters
        .as_ref()
        .unwrap()
        .iter()
        .map(|c| c.title.as_str())
        .collect();
    assert_eq!(titles, vec!["Saved intro", "Saved plan"]);
    assert!(std::fs::read_to_string(&paths.merged).unwrap().contains("Saved plan"));
}

#[tokio::test]
async fn failed_notes_write_leaves_no_analysis_behind() {
    let h = Harness::with(
        "standup.mkv",
        FakeBackend::ok("a").with_note("Rotate the staging keys"),
        FakeExtractor::default(),
        FakeMerger::default(),
    );
    let paths = h.paths();
    // a directory at the notes path makes the final rename fail
    std::fs::create_dir(&paths.notes).unwrap();
    std::fs::write(paths.notes.join("keep"), b"x").unwrap();

    let result = h
        .orchestrator(PipelineOptions::default())
        .run(&h.input, &CancellationToken::new())
        .await;

    assert!(!result.success);
    assert_eq!(result.state, RunState::Failed(Stage::Analyze));
    assert!(!exists(&paths.analysis));
    assert!(result.artifact(Stage::Analyze).is_none());
    assert_eq!(h.calls().3, 0);

    let rerun = h
        .orchestrator(skip_existing())
        .run(&h.input, &CancellationToken::new())
        .await;
    assert!(rerun.success, "error: {:?}", rerun.error);
    assert_eq!(h.backend.calls(), 1);
    assert_eq!(rerun.artifact(Stage::Analyze).unwrap().path, paths.raw_response);
}
