use std::time::Instant;

use async_trait::async_trait;

use crate::{
    error::{BackendError, NormalizationError},
    normalize::{RawResponse, normalize, response_text},
    types::{AnalysisResult, BackendDescriptor, RawOutput, Transcript},
};

mod in_process;
mod ollama;
pub mod prompts;
mod registry;
mod remote;

pub use in_process::{GenerationSettings, InProcessBackend};
pub use ollama::OllamaBackend;
pub use registry::BackendRegistry;
pub use remote::RemoteApiBackend;

/// What a single analysis call is asked to do.
#[derive(Debug, Clone, Copy)]
pub enum AnalysisRequest<'a> {
    /// First pass over the raw transcript.
    Initial,
    /// Refinement pass that reviews an earlier result.
    Review { prior: &'a AnalysisResult },
}

impl AnalysisRequest<'_> {
    pub fn prompt(&self, transcript: &Transcript) -> String {
        match self {
            AnalysisRequest::Initial => prompts::analysis_prompt(transcript),
            AnalysisRequest::Review { prior } => prompts::review_prompt(prior, transcript),
        }
    }
}

/// One analysis engine. The manager only ever talks to this contract.
#[async_trait]
pub trait AnalysisBackend: Send + Sync {
    /// Cheap reachability or loadability check. Never errors; any failure
    /// reads as unavailable.
    async fn is_available(&self) -> bool;

    async fn analyze(
        &self,
        transcript: &Transcript,
        request: AnalysisRequest<'_>,
    ) -> Result<AnalysisResult, BackendError>;

    fn describe(&self) -> &BackendDescriptor;
}

/// Normalize a raw response into a result attributed to `descriptor`. The
/// generated text rides along so the caller can persist it; the manager
/// stamps the pass number.
pub(crate) fn finish(
    descriptor: &BackendDescriptor,
    raw: RawResponse,
    started: Instant,
) -> Result<AnalysisResult, BackendError> {
    let normalization = |source: NormalizationError| BackendError::Normalization {
        backend: descriptor.id(),
        source,
    };
    let text = response_text(raw).map_err(normalization)?;
    let normalized = normalize(RawResponse::Text(text.clone())).map_err(normalization)?;

    Ok(AnalysisResult {
        chapters: normalized.chapters,
        notes: normalized.notes,
        provider_used: descriptor.id(),
        processing_time: started.elapsed().as_secs_f64(),
        warnings: normalized.warnings,
        attempts: Vec::new(),
        raw: vec![RawOutput { pass: 0, text }],
    })
}

/// Map a transport error, keeping timeouts distinct from other failures.
pub(crate) fn http_error(descriptor: &BackendDescriptor, err: reqwest::Error) -> BackendError {
    if err.is_timeout() {
        BackendError::Timeout {
            backend: descriptor.id(),
            timeout: descriptor.timeout,
        }
    } else {
        BackendError::call_failed(descriptor.id(), err)
    }
}
