use std::{sync::Arc, time::Duration};

use tracing::Instrument;

use crate::{
    backend::{AnalysisBackend, AnalysisRequest, BackendRegistry},
    error::BackendError,
    events::{Event, EventSink},
    retry::Retried,
    types::{AnalysisResult, Attempt, AttemptOutcome, BackendDescriptor, Transcript},
};

const AVAILABILITY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendRole {
    Primary,
    Review(usize),
    Fallback,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderStatus {
    pub descriptor: BackendDescriptor,
    pub role: BackendRole,
    pub available: bool,
}

/// Resolves which backend answers each analysis pass: rotation, substitution
/// on unavailability or failure, bounded retries, and fallback.
pub struct BackendManager {
    registry: Arc<BackendRegistry>,
    events: EventSink,
    availability_timeout: Duration,
}

impl BackendManager {
    pub fn new(registry: Arc<BackendRegistry>) -> Self {
        Self {
            registry,
            events: EventSink::default(),
            availability_timeout: AVAILABILITY_TIMEOUT,
        }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn with_availability_timeout(mut self, timeout: Duration) -> Self {
        self.availability_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// Rotation index scheduled for `pass` (1-based) before availability is
    /// taken into account.
    pub fn scheduled_position(&self, pass: u32) -> Option<usize> {
        let len = self.registry.rotation().len();
        (len > 0).then(|| (pass.max(1) as usize - 1) % len)
    }

    /// Run every configured pass. Pass 1 analyzes the transcript; later
    /// passes review the previous result. A failed review pass keeps the
    /// last good result and ends the sequence with a warning.
    pub async fn analyze(&self, transcript: &Transcript) -> Result<AnalysisResult, BackendError> {
        let passes = self.registry.passes();

        let mut best = self
            .analyze_pass(transcript, 1, AnalysisRequest::Initial)
            .instrument(tracing::info_span!("pass", pass = 1, of = passes))
            .await
            .inspect_err(|e| {
                self.events.publish(Event::PassFailed {
                    pass: 1,
                    reason: e.to_string(),
                })
            })?;
        self.events.publish(Event::PassCompleted {
            pass: 1,
            backend: best.provider_used.clone(),
        });
        let mut attempts = std::mem::take(&mut best.attempts);
        let mut warnings = std::mem::take(&mut best.warnings);
        let mut raw = std::mem::take(&mut best.raw);
        let mut processing_time = best.processing_time;

        for pass in 2..=passes {
            let outcome = self
                .analyze_pass(transcript, pass, AnalysisRequest::Review { prior: &best })
                .instrument(tracing::info_span!("pass", pass, of = passes))
                .await;

            match outcome {
                Ok(mut result) => {
                    attempts.append(&mut result.attempts);
                    warnings.append(&mut result.warnings);
                    raw.append(&mut result.raw);
                    processing_time += result.processing_time;
                    self.events.publish(Event::PassCompleted {
                        pass,
                        backend: result.provider_used.clone(),
                    });
                    best = result;
                }
                Err(e) => {
                    self.events.publish(Event::PassFailed {
                        pass,
                        reason: e.to_string(),
                    });
                    if let BackendError::AllBackendsExhausted {
                        attempts: failed,
                        warnings: notices,
                        ..
                    } = &e
                    {
                        attempts.extend(failed.iter().cloned());
                        warnings.extend(notices.iter().cloned());
                    }
                    tracing::warn!(
                        pass,
                        kept = %best.provider_used,
                        error = %e,
                        "Review pass failed, keeping previous result"
                    );
                    warnings.push(format!(
                        "Review pass {pass} failed, keeping result from pass {} ({}): {e}",
                        pass - 1,
                        best.provider_used
                    ));
                    break;
                }
            }
        }

        best.attempts = attempts;
        best.warnings = warnings;
        best.raw = raw;
        best.processing_time = processing_time;
        Ok(best)
    }

    /// Resolve and run a single pass.
    pub async fn analyze_pass(
        &self,
        transcript: &Transcript,
        pass: u32,
        request: AnalysisRequest<'_>,
    ) -> Result<AnalysisResult, BackendError> {
        let rotation = self.registry.rotation();
        let mut attempts = Vec::new();
        let mut warnings = Vec::new();

        if let Some(start) = self.scheduled_position(pass) {
            for offset in 0..rotation.len() {
                let position = (start + offset) % rotation.len();
                let backend = &rotation[position];
                let id = backend.describe().id();

                if !self.check_available(backend.as_ref()).await {
                    tracing::warn!(pass, position, backend = %id, "Backend unavailable, advancing to next");
                    warnings.push(format!(
                        "Pass {pass}: skipped {id} at position {position}: unavailable"
                    ));
                    attempts.push(Attempt {
                        pass,
                        backend: id.clone(),
                        position: Some(position),
                        retries: 0,
                        outcome: AttemptOutcome::Unavailable,
                    });
                    self.events.publish(Event::BackendSkipped {
                        pass,
                        position,
                        backend: id,
                        reason: "unavailable".to_string(),
                    });
                    continue;
                }

                tracing::info!(pass, position, backend = %id, "Backend selected");
                let retried = self
                    .call_with_retry(backend.as_ref(), transcript, pass, request, &mut warnings)
                    .await;
                match retried.result {
                    Ok(result) => {
                        attempts.push(Attempt {
                            pass,
                            backend: id,
                            position: Some(position),
                            retries: retried.retries,
                            outcome: AttemptOutcome::Succeeded,
                        });
                        return Ok(finalize(result, pass, attempts, warnings));
                    }
                    Err(e) => {
                        tracing::warn!(
                            pass,
                            position,
                            backend = %id,
                            retries = retried.retries,
                            error = %e,
                            "Backend failed, advancing to next"
                        );
                        warnings.push(format!(
                            "Pass {pass}: {id} at position {position} failed after {} retries: {e}",
                            retried.retries
                        ));
                        attempts.push(failed_attempt(pass, id.clone(), Some(position), retried.retries, &e));
                        self.events.publish(Event::BackendFailed {
                            pass,
                            position: Some(position),
                            backend: id,
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }

        let Some(fallback) = self.registry.fallback() else {
            return Err(BackendError::AllBackendsExhausted {
                pass,
                attempts,
                warnings,
            });
        };

        let id = fallback.describe().id();
        let reason = if rotation.is_empty() {
            "no backends configured".to_string()
        } else {
            "every configured backend was unavailable or failed".to_string()
        };
        tracing::warn!(pass, backend = %id, reason = %reason, "Fallback activated");
        warnings.push(format!("Pass {pass}: fallback activated, using {id} because {reason}"));
        self.events.publish(Event::FallbackActivated {
            pass,
            backend: id.clone(),
            reason,
        });

        if !self.check_available(fallback.as_ref()).await {
            tracing::warn!(pass, backend = %id, "Fallback backend unavailable");
            attempts.push(Attempt {
                pass,
                backend: id,
                position: None,
                retries: 0,
                outcome: AttemptOutcome::Unavailable,
            });
            return Err(BackendError::AllBackendsExhausted {
                pass,
                attempts,
                warnings,
            });
        }

        let retried = self
            .call_with_retry(fallback.as_ref(), transcript, pass, request, &mut warnings)
            .await;
        match retried.result {
            Ok(result) => {
                attempts.push(Attempt {
                    pass,
                    backend: id,
                    position: None,
                    retries: retried.retries,
                    outcome: AttemptOutcome::Succeeded,
                });
                Ok(finalize(result, pass, attempts, warnings))
            }
            Err(e) => {
                tracing::warn!(pass, backend = %id, error = %e, "Fallback backend failed");
                attempts.push(failed_attempt(pass, id.clone(), None, retried.retries, &e));
                self.events.publish(Event::BackendFailed {
                    pass,
                    position: None,
                    backend: id,
                    reason: e.to_string(),
                });
                Err(BackendError::AllBackendsExhausted {
                    pass,
                    attempts,
                    warnings,
                })
            }
        }
    }

    /// Availability of every configured backend, rotation first.
    pub async fn provider_status(&self) -> Vec<ProviderStatus> {
        let sequenced = self.registry.rotation().len() > 1
            || self
                .registry
                .rotation()
                .iter()
                .any(|b| b.describe().sequence_position.is_some());

        let mut statuses = Vec::new();
        for (position, backend) in self.registry.rotation().iter().enumerate() {
            let role = if sequenced {
                BackendRole::Review(position)
            } else {
                BackendRole::Primary
            };
            statuses.push(ProviderStatus {
                descriptor: backend.describe().clone(),
                role,
                available: self.check_available(backend.as_ref()).await,
            });
        }
        if let Some(fallback) = self.registry.fallback() {
            statuses.push(ProviderStatus {
                descriptor: fallback.describe().clone(),
                role: BackendRole::Fallback,
                available: self.check_available(fallback.as_ref()).await,
            });
        }
        statuses
    }

    async fn check_available(&self, backend: &dyn AnalysisBackend) -> bool {
        match tokio::time::timeout(self.availability_timeout, backend.is_available()).await {
            Ok(available) => available,
            Err(_) => {
                tracing::debug!(
                    backend = %backend.describe().id(),
                    timeout = ?self.availability_timeout,
                    "Availability check timed out"
                );
                false
            }
        }
    }

    async fn call_with_retry(
        &self,
        backend: &dyn AnalysisBackend,
        transcript: &Transcript,
        pass: u32,
        request: AnalysisRequest<'_>,
        warnings: &mut Vec<String>,
    ) -> Retried<AnalysisResult, BackendError> {
        let descriptor = backend.describe();
        let id = descriptor.id();
        let policy = self.registry.retry_for(descriptor);

        policy
            .run_notify(
                &id,
                move || timed_analyze(backend, transcript, request),
                |attempt, delay, e| {
                    warnings.push(format!(
                        "Pass {pass}: retrying {id} (retry {attempt}) after error: {e}"
                    ));
                    self.events.publish(Event::BackendRetrying {
                        pass,
                        backend: id.clone(),
                        attempt,
                        delay,
                        reason: e.to_string(),
                    });
                },
            )
            .await
    }
}

async fn timed_analyze(
    backend: &dyn AnalysisBackend,
    transcript: &Transcript,
    request: AnalysisRequest<'_>,
) -> Result<AnalysisResult, BackendError> {
    let descriptor = backend.describe();
    match tokio::time::timeout(descriptor.timeout, backend.analyze(transcript, request)).await {
        Ok(result) => result,
        Err(_) => Err(BackendError::Timeout {
            backend: descriptor.id(),
            timeout: descriptor.timeout,
        }),
    }
}

fn failed_attempt(
    pass: u32,
    backend: String,
    position: Option<usize>,
    retries: u32,
    error: &BackendError,
) -> Attempt {
    Attempt {
        pass,
        backend,
        position,
        retries,
        outcome: AttemptOutcome::Failed {
            kind: error.kind().name().to_string(),
            reason: error.to_string(),
        },
    }
}

/// Attach the audit trail, stamp raw output with the pass, and prefix backend
/// warnings with the pass number.
fn finalize(
    mut result: AnalysisResult,
    pass: u32,
    attempts: Vec<Attempt>,
    mut warnings: Vec<String>,
) -> AnalysisResult {
    warnings.extend(
        result
            .warnings
            .drain(..)
            .map(|w| format!("Pass {pass}: {w}")),
    );
    result.warnings = warnings;
    result.attempts = attempts;
    for raw in &mut result.raw {
        raw.pass = pass;
    }
    result
}
