use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

use super::Transcriber;
use crate::{
    cache::{ensure_model, get_model_dir, get_root_cache_dir},
    error::{Result, StageError},
    stop::StopOnDrop,
    types::{Segment, Transcript},
};

const WHISPER_SAMPLE_RATE: u32 = 16_000;

pub fn whisper_model_url(name: &str) -> String {
    format!("https://huggingface.co/ggerganov/whisper.cpp/resolve/main/{name}")
}

pub struct WhisperTranscriber {
    model_path: PathBuf,
    use_gpu: bool,
}

impl WhisperTranscriber {
    pub fn new(model_path: PathBuf, use_gpu: bool) -> Self {
        Self {
            model_path,
            use_gpu,
        }
    }

    /// Resolve `model_name` in the shared model cache, downloading it on
    /// first use.
    pub async fn from_cache(model_name: &str, use_gpu: bool) -> Result<Self> {
        let model_dir = get_model_dir(&get_root_cache_dir());
        let model_path = ensure_model(&model_dir, model_name, &whisper_model_url(model_name)).await?;
        Ok(Self::new(model_path, use_gpu))
    }

    fn read_samples(audio_path: &Path) -> std::result::Result<Vec<f32>, String> {
        let mut reader = hound::WavReader::open(audio_path).map_err(|e| e.to_string())?;
        let spec = reader.spec();
        if spec.sample_rate != WHISPER_SAMPLE_RATE {
            return Err(format!(
                "expected {WHISPER_SAMPLE_RATE} Hz audio, got {} Hz",
                spec.sample_rate
            ));
        }

        let samples = reader
            .samples::<i16>()
            .map(|s| s.map(|v| v as f32 / i16::MAX as f32))
            .collect::<std::result::Result<Vec<f32>, _>>()
            .map_err(|e| e.to_string())?;

        let channels = spec.channels.max(1) as usize;
        if channels == 1 {
            return Ok(samples);
        }
        Ok(samples
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect())
    }

    /// Blocking decode. `stop` aborts whisper between decoder steps once the
    /// awaiting future is dropped.
    fn run(
        model_path: &Path,
        audio_path: &Path,
        use_gpu: bool,
        stop: Arc<AtomicBool>,
    ) -> std::result::Result<Transcript, String> {
        let samples = Self::read_samples(audio_path)?;
        if stop.load(Ordering::Relaxed) {
            return Err("transcription stopped".to_string());
        }

        let ctx_params = WhisperContextParameters {
            use_gpu,
            flash_attn: use_gpu,
            ..Default::default()
        };
        let model_path_str = model_path
            .to_str()
            .ok_or_else(|| format!("model path is not valid UTF-8: {}", model_path.display()))?;
        let ctx = WhisperContext::new_with_params(model_path_str, ctx_params)
            .map_err(|e| format!("failed to load model: {e}"))?;

        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 5 });
        params.set_language(Some("auto"));
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_special(false);
        params.set_print_timestamps(false);
        let abort = Arc::clone(&stop);
        params.set_abort_callback_safe(move || abort.load(Ordering::Relaxed));

        let mut state = ctx
            .create_state()
            .map_err(|e| format!("failed to create state: {e}"))?;
        let decoded = state.full(params, &samples);
        if stop.load(Ordering::Relaxed) {
            return Err("transcription stopped".to_string());
        }
        decoded.map_err(|e| format!("failed to run model: {e}"))?;

        let mut segments = Vec::new();
        for segment in state.as_iter() {
            let Ok(text) = segment.to_str() else {
                continue;
            };
            segments.push(Segment {
                start: segment.start_timestamp() as f64 / 100.0,
                end: segment.end_timestamp() as f64 / 100.0,
                text: text.trim().to_string(),
            });
        }

        let language = whisper_rs::get_lang_str(state.full_lang_id_from_state()).unwrap_or("unknown");

        Ok(Transcript::from_segments(segments, language))
    }
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    async fn transcribe(&self, audio: &Path) -> std::result::Result<Transcript, StageError> {
        let model_path = self.model_path.clone();
        let audio_path = audio.to_path_buf();
        let use_gpu = self.use_gpu;

        let failed = |reason: String| StageError::TranscriptFailed {
            audio_path: audio.to_path_buf(),
            reason,
        };

        let (_stop_guard, stop) = StopOnDrop::new();
        let transcript =
            tokio::task::spawn_blocking(move || Self::run(&model_path, &audio_path, use_gpu, stop))
                .await
                .map_err(|e| failed(e.to_string()))?
                .map_err(failed)?;

        tracing::debug!(
            segments = transcript.segments.len(),
            language = %transcript.language,
            duration = transcript.duration,
            "Transcription finished"
        );
        Ok(transcript)
    }
}
