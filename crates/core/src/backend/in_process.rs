use std::{
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};

use async_trait::async_trait;
use candle_core::{Device, Tensor, quantized::gguf_file};
use candle_transformers::{generation::LogitsProcessor, models::quantized_llama::ModelWeights};
use serde_json::{Map, Value};
use tokenizers::Tokenizer;

use super::{AnalysisBackend, AnalysisRequest, finish};
use crate::{
    error::BackendError,
    normalize::RawResponse,
    stop::StopOnDrop,
    types::{AnalysisResult, BackendDescriptor, Transcript},
};

const CONTEXT_LIMIT: usize = 4096;
const STOP_TOKENS: [&str; 5] = ["</s>", "<|endoftext|>", "<|im_end|>", "<|end|>", "<|eot_id|>"];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationSettings {
    pub max_tokens: usize,
    pub temperature: f64,
    pub seed: u64,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            max_tokens: 1024,
            temperature: 0.2,
            seed: 299_792_458,
        }
    }
}

impl GenerationSettings {
    /// Reads `max_tokens` (or `num_predict`), `temperature` and `seed` from
    /// the shared model parameters, keeping defaults for anything absent.
    pub fn from_parameters(parameters: &Map<String, Value>) -> Self {
        let defaults = Self::default();
        Self {
            max_tokens: parameters
                .get("max_tokens")
                .or_else(|| parameters.get("num_predict"))
                .and_then(Value::as_u64)
                .map_or(defaults.max_tokens, |n| n as usize),
            temperature: parameters
                .get("temperature")
                .and_then(Value::as_f64)
                .unwrap_or(defaults.temperature),
            seed: parameters
                .get("seed")
                .and_then(Value::as_u64)
                .unwrap_or(defaults.seed),
        }
    }
}

struct LoadedModel {
    weights: ModelWeights,
    tokenizer: Tokenizer,
    device: Device,
}

enum GenerateError {
    Stopped,
    TimedOut,
    Failed(String),
}

impl From<candle_core::Error> for GenerateError {
    fn from(e: candle_core::Error) -> Self {
        GenerateError::Failed(e.to_string())
    }
}

/// Quantized GGUF llama-family model run inside this process.
pub struct InProcessBackend {
    descriptor: BackendDescriptor,
    model_path: PathBuf,
    tokenizer_path: PathBuf,
    settings: GenerationSettings,
    loaded: Arc<Mutex<Option<LoadedModel>>>,
}

impl InProcessBackend {
    pub fn new(
        descriptor: BackendDescriptor,
        model_path: PathBuf,
        tokenizer_path: PathBuf,
        settings: GenerationSettings,
    ) -> Self {
        Self {
            descriptor,
            model_path,
            tokenizer_path,
            settings,
            loaded: Arc::new(Mutex::new(None)),
        }
    }

    fn select_device() -> Device {
        Device::cuda_if_available(0).unwrap_or(Device::Cpu)
    }

    fn load(model_path: &Path, tokenizer_path: &Path) -> Result<LoadedModel, GenerateError> {
        let device = Self::select_device();
        tracing::info!(
            model = %model_path.display(),
            device = ?device,
            "Loading in-process model"
        );

        let mut file = std::fs::File::open(model_path)
            .map_err(|e| GenerateError::Failed(format!("open {}: {e}", model_path.display())))?;
        let content = gguf_file::Content::read(&mut file)
            .map_err(|e| GenerateError::Failed(format!("read gguf: {e}")))?;
        let weights = ModelWeights::from_gguf(content, &mut file, &device)?;
        let tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| GenerateError::Failed(format!("tokenizer: {e}")))?;

        tracing::info!("In-process model loaded");
        Ok(LoadedModel {
            weights,
            tokenizer,
            device,
        })
    }

    fn generate(
        model: &mut LoadedModel,
        prompt: &str,
        settings: GenerationSettings,
        stop: &AtomicBool,
        deadline: Instant,
    ) -> Result<String, GenerateError> {
        let encoding = model
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| GenerateError::Failed(format!("tokenization: {e}")))?;
        let prompt_tokens = encoding.get_ids().to_vec();
        if prompt_tokens.len() + settings.max_tokens > CONTEXT_LIMIT {
            return Err(GenerateError::Failed(format!(
                "prompt of {} tokens plus {} generated exceeds the {CONTEXT_LIMIT}-token context",
                prompt_tokens.len(),
                settings.max_tokens
            )));
        }

        let stop_ids: Vec<u32> = STOP_TOKENS
            .iter()
            .filter_map(|t| model.tokenizer.token_to_id(t))
            .collect();
        let temperature = (settings.temperature > 0.0).then_some(settings.temperature);
        let mut processor = LogitsProcessor::new(settings.seed, temperature, None);

        let input = Tensor::new(prompt_tokens.as_slice(), &model.device)?.unsqueeze(0)?;
        let logits = model.weights.forward(&input, 0)?.squeeze(0)?;
        let mut next = processor.sample(&logits)?;

        let mut generated = Vec::with_capacity(settings.max_tokens);
        for index in 0..settings.max_tokens {
            if stop_ids.contains(&next) {
                break;
            }
            generated.push(next);

            if stop.load(Ordering::Relaxed) {
                return Err(GenerateError::Stopped);
            }
            if Instant::now() >= deadline {
                return Err(GenerateError::TimedOut);
            }

            let input = Tensor::new(&[next], &model.device)?.unsqueeze(0)?;
            let logits = model
                .weights
                .forward(&input, prompt_tokens.len() + index)?
                .squeeze(0)?;
            next = processor.sample(&logits)?;
        }

        model
            .tokenizer
            .decode(&generated, true)
            .map_err(|e| GenerateError::Failed(format!("decode: {e}")))
    }
}

#[async_trait]
impl AnalysisBackend for InProcessBackend {
    async fn is_available(&self) -> bool {
        let model = tokio::fs::metadata(&self.model_path).await;
        let tokenizer = tokio::fs::metadata(&self.tokenizer_path).await;
        matches!((model, tokenizer), (Ok(m), Ok(t)) if m.is_file() && t.is_file())
    }

    async fn analyze(
        &self,
        transcript: &Transcript,
        request: AnalysisRequest<'_>,
    ) -> Result<AnalysisResult, BackendError> {
        let started = Instant::now();
        let prompt = request.prompt(transcript);
        let settings = self.settings;
        let deadline = started + self.descriptor.timeout;
        let loaded = Arc::clone(&self.loaded);
        let model_path = self.model_path.clone();
        let tokenizer_path = self.tokenizer_path.clone();

        let (_stop_guard, stop) = StopOnDrop::new();

        let outcome = tokio::task::spawn_blocking(move || {
            let mut slot = loaded
                .lock()
                .map_err(|_| GenerateError::Failed("model lock poisoned".to_string()))?;
            let mut model = match slot.take() {
                Some(model) => model,
                None => Self::load(&model_path, &tokenizer_path)?,
            };
            let result = Self::generate(&mut model, &prompt, settings, &stop, deadline);
            *slot = Some(model);
            result
        })
        .await
        .map_err(|e| BackendError::call_failed(self.descriptor.id(), e))?;

        let text = outcome.map_err(|e| match e {
            GenerateError::TimedOut => BackendError::Timeout {
                backend: self.descriptor.id(),
                timeout: self.descriptor.timeout,
            },
            GenerateError::Stopped => {
                BackendError::call_failed(self.descriptor.id(), "generation stopped")
            }
            GenerateError::Failed(reason) => BackendError::call_failed(self.descriptor.id(), reason),
        })?;

        finish(&self.descriptor, RawResponse::Text(text), started)
    }

    fn describe(&self) -> &BackendDescriptor {
        &self.descriptor
    }
}
