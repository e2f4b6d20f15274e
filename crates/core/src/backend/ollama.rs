use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::{AnalysisBackend, AnalysisRequest, finish, http_error};
use crate::{
    error::BackendError,
    normalize::RawResponse,
    types::{AnalysisResult, BackendDescriptor, Transcript},
};

const TAGS_TIMEOUT: Duration = Duration::from_secs(5);

/// Model served by a locally running Ollama instance.
pub struct OllamaBackend {
    descriptor: BackendDescriptor,
    base_url: String,
    options: Map<String, Value>,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagModel>,
}

#[derive(Deserialize)]
struct TagModel {
    name: String,
}

impl OllamaBackend {
    pub fn new(descriptor: BackendDescriptor, options: Map<String, Value>) -> Self {
        let base_url = descriptor
            .endpoint
            .clone()
            .unwrap_or_else(|| crate::config::DEFAULT_OLLAMA_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        Self {
            descriptor,
            base_url,
            options,
            client: reqwest::Client::new(),
        }
    }

    /// Installed names carry a tag (`phi4:latest`), so a bare model name
    /// matches any tag of it.
    fn model_installed(&self, installed: &[TagModel]) -> bool {
        let wanted = self.descriptor.model.as_str();
        installed.iter().any(|m| {
            m.name == wanted
                || m
                    .name
                    .strip_prefix(wanted)
                    .is_some_and(|rest| rest.starts_with(':'))
        })
    }

    async fn installed_models(&self) -> Result<Vec<TagModel>, reqwest::Error> {
        let tags = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .timeout(TAGS_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json::<TagsResponse>()
            .await?;
        Ok(tags.models)
    }
}

#[async_trait]
impl AnalysisBackend for OllamaBackend {
    async fn is_available(&self) -> bool {
        match self.installed_models().await {
            Ok(models) if self.model_installed(&models) => true,
            Ok(_) => {
                tracing::debug!(
                    model = %self.descriptor.model,
                    base_url = %self.base_url,
                    "Model not installed on local server"
                );
                false
            }
            Err(e) => {
                tracing::debug!(base_url = %self.base_url, error = %e, "Local server unreachable");
                false
            }
        }
    }

    async fn analyze(
        &self,
        transcript: &Transcript,
        request: AnalysisRequest<'_>,
    ) -> Result<AnalysisResult, BackendError> {
        let started = Instant::now();
        let prompt = request.prompt(transcript);

        let mut options = Map::new();
        options.insert("temperature".to_string(), Value::from(0.2));
        options.extend(self.options.clone());

        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .timeout(self.descriptor.timeout)
            .json(&serde_json::json!({
                "model": self.descriptor.model,
                "prompt": prompt,
                "stream": false,
                "format": "json",
                "options": options,
            }))
            .send()
            .await
            .map_err(|e| http_error(&self.descriptor, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::call_failed(
                self.descriptor.id(),
                format!("HTTP {status}: {}", body.trim()),
            ));
        }

        let body = response
            .json::<Value>()
            .await
            .map_err(|e| http_error(&self.descriptor, e))?;

        finish(&self.descriptor, RawResponse::OllamaGenerate(body), started)
    }

    fn describe(&self) -> &BackendDescriptor {
        &self.descriptor
    }
}
