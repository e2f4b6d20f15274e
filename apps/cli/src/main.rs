use std::{
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Result;
use chapterly_core::{
    BackendManager, BackendRegistry, Config, Event, EventSink, Orchestrator, PipelineOptions,
    Stage,
    format::format_result_readable,
    media::{FfmpegAudioExtractor, FfmpegChapterMerger, WhisperTranscriber},
};
use clap::Parser;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs_f64();
    if secs < 60.0 {
        format!("{:.1}s", secs)
    } else {
        format!("{:.0}m {:.0}s", (secs / 60.0).floor(), secs % 60.0)
    }
}

#[derive(Parser)]
#[command(name = "chapterly")]
#[command(about = "Add AI-generated chapter markers, notes and subtitles to recorded meetings")]
struct Cli {
    /// Video file to process
    input: PathBuf,

    /// Directory for generated files. Defaults to the input's directory.
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Reuse valid artifacts left by a previous run
    #[arg(short, long)]
    skip_existing: bool,

    /// Number of analysis passes (overrides REVIEW_PASSES)
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    passes: Option<u32>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(json: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,chapterly=debug"));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_target(true).with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init();
    }
}

fn create_spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(spinner_style) = ProgressStyle::default_spinner()
        .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ ")
        .template("{spinner:.cyan} {msg}")
    {
        pb.set_style(spinner_style);
    }
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

/// Spinner text while a stage runs, and the line left once it is done.
fn stage_labels(stage: Stage) -> (&'static str, &'static str) {
    match stage {
        Stage::ExtractAudio => ("Extracting audio...", "Audio extracted"),
        Stage::Transcribe => ("Transcribing with Whisper...", "Transcribed"),
        Stage::Analyze => ("Analyzing transcript...", "Chapters generated"),
        Stage::Merge => ("Writing chapters into video...", "Chapters merged"),
        Stage::Subtitles => ("Writing subtitles...", "Subtitles written"),
    }
}

async fn render_progress(mut rx: mpsc::UnboundedReceiver<Event>) {
    let mut current: Option<(ProgressBar, Instant)> = None;

    while let Some(event) = rx.recv().await {
        match event {
            Event::StageStarted { stage, .. } => {
                let (active, _) = stage_labels(stage);
                current = Some((create_spinner(active), Instant::now()));
            }
            Event::StageCompleted { stage, .. } => {
                if let Some((pb, started)) = current.take() {
                    pb.finish_with_message(format!(
                        "{} {} {}",
                        style("✓").green().bold(),
                        stage_labels(stage).1,
                        style(format!("[{}]", format_duration(started.elapsed()))).dim()
                    ));
                }
            }
            Event::StageReused { stage, .. } => {
                if let Some((pb, _)) = current.take() {
                    pb.finish_with_message(format!(
                        "{} {} {}",
                        style("✓").green().bold(),
                        stage_labels(stage).1,
                        style("(cached)").dim()
                    ));
                }
            }
            Event::StageFailed { stage, .. } => {
                let message = format!("{} {} failed", style("✗").red().bold(), stage);
                match current.take() {
                    Some((pb, _)) => pb.finish_with_message(message),
                    None => eprintln!("{message}"),
                }
            }
            Event::FallbackActivated { backend, .. } => {
                let line = format!("{} falling back to {}", style("!").yellow().bold(), backend);
                match &current {
                    Some((pb, _)) => pb.println(line),
                    None => eprintln!("{line}"),
                }
            }
            Event::PassCompleted { pass, backend } => {
                if let Some((pb, _)) = &current {
                    pb.set_message(format!("Analyzing transcript... pass {pass} done ({backend})"));
                }
            }
            _ => {}
        }
    }

    if let Some((pb, _)) = current {
        pb.finish_and_clear();
    }
}

extern "C" fn whisper_log_callback(
    _level: u32,
    _message: *const std::ffi::c_char,
    _user_data: *mut std::ffi::c_void,
) {
    // silent
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    unsafe {
        whisper_rs::set_log_callback(Some(whisper_log_callback), std::ptr::null_mut());
    }

    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            std::process::exit(1);
        }
    };
    if let Some(passes) = cli.passes {
        config.review_passes = passes;
    }
    if cli.skip_existing {
        config.skip_existing = true;
    }
    if cli.output_dir.is_some() {
        config.output_dir = cli.output_dir.clone();
    }
    if let Err(e) = config.validate() {
        eprintln!("{} {}", style("Error:").red().bold(), e);
        std::process::exit(1);
    }

    println!(
        "\n{}  {}\n",
        style("chapterly").cyan().bold(),
        style("Meeting Chapters").dim()
    );

    let spinner = create_spinner("Checking Whisper model...");
    let transcriber = WhisperTranscriber::from_cache(&config.whisper_model, config.use_gpu).await?;
    spinner.finish_with_message(format!(
        "{} Whisper model ready: {}",
        style("✓").green().bold(),
        style(&config.whisper_model).dim()
    ));

    let registry = Arc::new(BackendRegistry::from_config(&config));
    let backends = registry
        .all()
        .map(|b| b.describe().id())
        .collect::<Vec<_>>()
        .join(", ");
    println!(
        "{} Backends: {} {}",
        style("✓").green().bold(),
        style(backends).yellow(),
        style(format!("({} pass(es))", registry.passes())).dim()
    );
    println!("{}", style("─".repeat(60)).dim());

    let (events, rx) = EventSink::channel();
    let progress = tokio::spawn(render_progress(rx));

    let manager = BackendManager::new(registry).with_events(events.clone());
    let orchestrator = Orchestrator::new(
        Arc::new(FfmpegAudioExtractor::new()),
        Arc::new(transcriber),
        Arc::new(manager),
        Arc::new(FfmpegChapterMerger::new()),
        PipelineOptions::from_config(&config),
    )
    .with_events(events);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received, stopping after cleanup");
                cancel.cancel();
            }
        }
    });

    let total_start = Instant::now();
    let result = orchestrator.run(&cli.input, &cancel).await;

    // closing the sink ends the progress task
    drop(orchestrator);
    let _ = progress.await;

    println!(
        "\n{} {}\n",
        style("Total time:").dim(),
        style(format_duration(total_start.elapsed())).cyan().bold()
    );
    println!("{}", style("─".repeat(60)).dim());
    println!("{}", format_result_readable(&result));

    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}
