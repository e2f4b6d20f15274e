use std::{fmt, path::PathBuf, str::FromStr, time::Duration};

use serde_json::{Map, Value};

use crate::{error::ConfigError, retry::RetryPolicy, types::BackendKind};

pub const DEFAULT_OLLAMA_BASE_URL: &str = "http://localhost:11434";
pub const DEFAULT_GEMINI_BASE_URL: &str =
    "https://generativelanguage.googleapis.com/v1beta/openai/chat/completions";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-flash-latest";
pub const DEFAULT_LOCAL_MODEL: &str = "phi4";
pub const DEFAULT_WHISPER_MODEL: &str = "ggml-base.bin";

const API_KEY_PLACEHOLDER: &str = "your_api_key_here";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProviderChoice {
    #[default]
    Local,
    Gemini,
}

/// Which local backend kinds may be constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LocalFramework {
    Ollama,
    InProcess,
    #[default]
    Auto,
}

impl LocalFramework {
    /// Kind used for local entries that don't name one. `auto` prefers the
    /// local model server.
    pub fn default_kind(&self) -> BackendKind {
        match self {
            LocalFramework::Ollama | LocalFramework::Auto => BackendKind::LocalServer,
            LocalFramework::InProcess => BackendKind::InProcess,
        }
    }

    pub fn allows(&self, kind: BackendKind) -> bool {
        match (self, kind) {
            (_, BackendKind::RemoteApi) => true,
            (LocalFramework::Auto, _) => true,
            (LocalFramework::Ollama, BackendKind::LocalServer) => true,
            (LocalFramework::InProcess, BackendKind::InProcess) => true,
            _ => false,
        }
    }
}

impl fmt::Display for LocalFramework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LocalFramework::Ollama => "ollama",
            LocalFramework::InProcess => "in_process",
            LocalFramework::Auto => "auto",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewEntry {
    pub kind: BackendKind,
    pub model: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendSettings {
    pub timeout: Duration,
    pub max_retries: u32,
}

/// Validated runtime configuration. Built once at startup; every backend is
/// constructed from this snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub provider: ProviderChoice,
    pub local_framework: LocalFramework,
    pub enable_fallback: bool,
    pub review_models: Vec<ReviewEntry>,
    pub review_passes: u32,

    pub local_model_name: String,
    pub ollama_base_url: String,
    pub local_model_path: Option<PathBuf>,
    pub local_tokenizer_path: Option<PathBuf>,

    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub gemini_base_url: String,

    pub ollama: BackendSettings,
    pub in_process: BackendSettings,
    pub gemini: BackendSettings,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub model_parameters: Map<String, Value>,

    pub whisper_model: String,
    pub use_gpu: bool,
    pub output_dir: Option<PathBuf>,
    pub skip_existing: bool,
    pub write_subtitles: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Every problem is collected and reported
    /// together.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut reader = Reader {
            lookup,
            errors: Vec::new(),
        };

        let provider = match reader.string("AI_PROVIDER").as_deref() {
            None | Some("local") => ProviderChoice::Local,
            Some("gemini") => ProviderChoice::Gemini,
            Some(other) => {
                reader.error(format!(
                    "Invalid AI_PROVIDER '{other}': must be one of [local, gemini]"
                ));
                ProviderChoice::Local
            }
        };

        let local_framework = match reader.string("LOCAL_MODEL_FRAMEWORK").as_deref() {
            None | Some("auto") => LocalFramework::Auto,
            Some("ollama") => LocalFramework::Ollama,
            Some("in_process") => LocalFramework::InProcess,
            Some(other) => {
                reader.error(format!(
                    "Invalid LOCAL_MODEL_FRAMEWORK '{other}': must be one of [ollama, in_process, auto]"
                ));
                LocalFramework::Auto
            }
        };

        let primary_kind = match provider {
            ProviderChoice::Gemini => BackendKind::RemoteApi,
            ProviderChoice::Local => local_framework.default_kind(),
        };

        let review_models = reader
            .string("REVIEW_MODELS")
            .map(|raw| parse_review_models(&raw, primary_kind))
            .unwrap_or_default();

        let analysis_timeout: u64 = reader.number("ANALYSIS_TIMEOUT", 300);
        let max_retries: u32 = reader.number("MAX_RETRIES", 2);
        let backend_settings = |reader: &mut Reader<F>, prefix: &str| BackendSettings {
            timeout: Duration::from_secs(reader.number(&format!("{prefix}_TIMEOUT"), analysis_timeout)),
            max_retries: reader.number(&format!("{prefix}_MAX_RETRIES"), max_retries),
        };
        let ollama = backend_settings(&mut reader, "OLLAMA");
        let gemini = backend_settings(&mut reader, "GEMINI");
        let in_process = backend_settings(&mut reader, "LOCAL_MODEL");

        let review_passes: u32 = reader.number(
            "REVIEW_PASSES",
            u32::try_from(review_models.len().max(1)).unwrap_or(u32::MAX),
        );

        let model_parameters = match reader.string("MODEL_PARAMETERS") {
            None => Map::new(),
            Some(raw) => match serde_json::from_str::<Value>(&raw) {
                Ok(Value::Object(map)) => map,
                Ok(_) => {
                    reader.error("Invalid MODEL_PARAMETERS: must be a JSON object".to_string());
                    Map::new()
                }
                Err(e) => {
                    reader.error(format!("Invalid MODEL_PARAMETERS: {e}"));
                    Map::new()
                }
            },
        };

        let config = Config {
            provider,
            local_framework,
            enable_fallback: reader.bool("ENABLE_FALLBACK", false),
            review_models,
            review_passes,
            local_model_name: reader
                .string("LOCAL_MODEL_NAME")
                .unwrap_or_else(|| DEFAULT_LOCAL_MODEL.to_string()),
            ollama_base_url: reader
                .string("OLLAMA_BASE_URL")
                .unwrap_or_else(|| DEFAULT_OLLAMA_BASE_URL.to_string()),
            local_model_path: reader.string("LOCAL_MODEL_PATH").map(PathBuf::from),
            local_tokenizer_path: reader.string("LOCAL_TOKENIZER_PATH").map(PathBuf::from),
            gemini_api_key: reader.string("GEMINI_API_KEY"),
            gemini_model: reader
                .string("GEMINI_MODEL")
                .unwrap_or_else(|| DEFAULT_GEMINI_MODEL.to_string()),
            gemini_base_url: reader
                .string("GEMINI_BASE_URL")
                .unwrap_or_else(|| DEFAULT_GEMINI_BASE_URL.to_string()),
            ollama,
            in_process,
            gemini,
            retry_base_delay: Duration::from_millis(reader.number("RETRY_BASE_DELAY_MS", 500)),
            retry_max_delay: Duration::from_millis(reader.number("RETRY_MAX_DELAY_MS", 8000)),
            model_parameters,
            whisper_model: reader
                .string("WHISPER_MODEL")
                .unwrap_or_else(|| DEFAULT_WHISPER_MODEL.to_string()),
            use_gpu: reader.bool("USE_GPU", true),
            output_dir: reader.string("OUTPUT_DIR").map(PathBuf::from),
            skip_existing: reader.bool("SKIP_EXISTING", false),
            write_subtitles: reader.bool("WRITE_SUBTITLES", true),
        };

        let mut errors = reader.errors;
        errors.extend(config.problems());
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    pub fn primary_kind(&self) -> BackendKind {
        match self.provider {
            ProviderChoice::Gemini => BackendKind::RemoteApi,
            ProviderChoice::Local => self.local_framework.default_kind(),
        }
    }

    /// Fallback only makes sense when the primary isn't already the remote API.
    pub fn fallback_active(&self) -> bool {
        self.enable_fallback && self.primary_kind() != BackendKind::RemoteApi
    }

    pub fn settings_for(&self, kind: BackendKind) -> BackendSettings {
        match kind {
            BackendKind::LocalServer => self.ollama,
            BackendKind::InProcess => self.in_process,
            BackendKind::RemoteApi => self.gemini,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(0, self.retry_base_delay, self.retry_max_delay)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let errors = self.problems();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    fn problems(&self) -> Vec<String> {
        let mut errors = Vec::new();

        let mut kinds = vec![self.primary_kind()];
        kinds.extend(self.review_models.iter().map(|e| e.kind));

        let gemini_needed = kinds.contains(&BackendKind::RemoteApi) || self.enable_fallback;
        let key_missing = self
            .gemini_api_key
            .as_deref()
            .is_none_or(|k| k.trim().is_empty() || k == API_KEY_PLACEHOLDER);
        if gemini_needed && key_missing {
            let reason = if self.provider == ProviderChoice::Gemini {
                "required for Gemini provider"
            } else if self.enable_fallback {
                "required for fallback"
            } else {
                "required for Gemini review passes"
            };
            errors.push(format!("Missing required API key: GEMINI_API_KEY ({reason})"));
        }

        if self.provider == ProviderChoice::Local && self.local_model_name.trim().is_empty() {
            errors.push(
                "Invalid LOCAL_MODEL_NAME: model name cannot be empty when using local provider"
                    .to_string(),
            );
        }
        if self.gemini_model.trim().is_empty() {
            errors.push("Invalid GEMINI_MODEL: model name cannot be empty".to_string());
        }
        if self.whisper_model.trim().is_empty() {
            errors.push("Invalid WHISPER_MODEL: model name cannot be empty".to_string());
        }

        for (key, url) in [
            ("OLLAMA_BASE_URL", &self.ollama_base_url),
            ("GEMINI_BASE_URL", &self.gemini_base_url),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                errors.push(format!("Invalid {key}: must start with http:// or https://"));
            }
        }

        for (key, settings) in [
            ("OLLAMA_TIMEOUT", self.ollama),
            ("GEMINI_TIMEOUT", self.gemini),
            ("LOCAL_MODEL_TIMEOUT", self.in_process),
        ] {
            if settings.timeout.is_zero() {
                errors.push(format!("Invalid {key}: must be positive"));
            }
        }
        if self.review_passes == 0 {
            errors.push("Invalid REVIEW_PASSES: must be positive".to_string());
        }
        if self.retry_base_delay > self.retry_max_delay {
            errors.push(
                "Invalid RETRY_BASE_DELAY_MS: must not exceed RETRY_MAX_DELAY_MS".to_string(),
            );
        }

        for entry in &self.review_models {
            if entry.model.is_empty() {
                errors.push("Invalid REVIEW_MODELS: entries cannot be empty".to_string());
            }
            if !self.local_framework.allows(entry.kind) {
                errors.push(format!(
                    "Invalid REVIEW_MODELS entry '{}': {} backends are not allowed with LOCAL_MODEL_FRAMEWORK={}",
                    entry.model, entry.kind, self.local_framework
                ));
            }
        }

        if kinds.contains(&BackendKind::InProcess) {
            if self.local_model_path.is_none() {
                errors.push(
                    "Missing LOCAL_MODEL_PATH: required for in_process backends".to_string(),
                );
            }
            if self.local_tokenizer_path.is_none() {
                errors.push(
                    "Missing LOCAL_TOKENIZER_PATH: required for in_process backends".to_string(),
                );
            }
        }

        errors
    }
}

/// Entries are `model` or `kind:model`. Model names may themselves contain
/// colons (`llama3:8b`), so only a known kind prefix is stripped.
fn parse_review_models(raw: &str, default_kind: BackendKind) -> Vec<ReviewEntry> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let prefixed = entry.split_once(':').and_then(|(prefix, model)| {
                let kind = match prefix {
                    "ollama" => BackendKind::LocalServer,
                    "in_process" => BackendKind::InProcess,
                    "gemini" => BackendKind::RemoteApi,
                    _ => return None,
                };
                Some((kind, model.trim()))
            });
            match prefixed {
                Some((kind, model)) => ReviewEntry {
                    kind,
                    model: model.to_string(),
                },
                None => ReviewEntry {
                    kind: default_kind,
                    model: entry.to_string(),
                },
            }
        })
        .collect()
}

struct Reader<F> {
    lookup: F,
    errors: Vec<String>,
}

impl<F> Reader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn error(&mut self, message: String) {
        self.errors.push(message);
    }

    /// Trimmed value; blank counts as unset.
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn bool(&mut self, key: &str, default: bool) -> bool {
        let Some(raw) = self.string(key) else {
            return default;
        };
        match raw.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => true,
            "false" | "0" | "no" | "off" => false,
            _ => {
                self.error(format!("Invalid {key} '{raw}': expected a boolean"));
                default
            }
        }
    }

    /// Unsigned integer of the target width; out-of-range values are errors,
    /// never truncated.
    fn number<T: FromStr>(&mut self, key: &str, default: T) -> T {
        let Some(raw) = self.string(key) else {
            return default;
        };
        match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                self.error(format!(
                    "Invalid {key} '{raw}': expected a non-negative integer that fits in {}",
                    std::any::type_name::<T>()
                ));
                default
            }
        }
    }
}
