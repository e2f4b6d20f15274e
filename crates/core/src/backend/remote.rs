use std::time::Instant;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;

use super::{AnalysisBackend, AnalysisRequest, finish, http_error, prompts::SYSTEM_PROMPT};
use crate::{
    error::BackendError,
    normalize::RawResponse,
    types::{AnalysisResult, BackendDescriptor, Transcript},
};

/// Hosted model behind an OpenAI-compatible chat completions endpoint
/// (Gemini's compatibility layer by default).
pub struct RemoteApiBackend {
    descriptor: BackendDescriptor,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl RemoteApiBackend {
    pub fn new(descriptor: BackendDescriptor, api_key: Option<String>) -> Self {
        Self {
            descriptor,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(&self) -> &str {
        self.descriptor
            .endpoint
            .as_deref()
            .unwrap_or(crate::config::DEFAULT_GEMINI_BASE_URL)
    }
}

#[async_trait]
impl AnalysisBackend for RemoteApiBackend {
    /// No network round trip: a key and model are all the remote side needs,
    /// and quota errors surface from `analyze` where they can be retried.
    async fn is_available(&self) -> bool {
        self.api_key.is_some() && !self.descriptor.model.trim().is_empty()
    }

    async fn analyze(
        &self,
        transcript: &Transcript,
        request: AnalysisRequest<'_>,
    ) -> Result<AnalysisResult, BackendError> {
        let Some(api_key) = &self.api_key else {
            return Err(BackendError::Unavailable {
                backend: self.descriptor.id(),
                reason: "no API key configured".to_string(),
            });
        };
        let started = Instant::now();

        let body = serde_json::json!({
            "model": self.descriptor.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": request.prompt(transcript)},
            ],
            "temperature": 0.3,
            "response_format": {"type": "json_object"},
        });

        let response = self
            .client
            .post(self.endpoint())
            .timeout(self.descriptor.timeout)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| http_error(&self.descriptor, e))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(BackendError::call_failed(
                self.descriptor.id(),
                "rate limit exceeded, wait a few moments and try again",
            ));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(BackendError::call_failed(
                self.descriptor.id(),
                format!("HTTP {status}: {}", text.trim()),
            ));
        }

        let body = response
            .json::<Value>()
            .await
            .map_err(|e| http_error(&self.descriptor, e))?;

        finish(&self.descriptor, RawResponse::ChatCompletion(body), started)
    }

    fn describe(&self) -> &BackendDescriptor {
        &self.descriptor
    }
}
