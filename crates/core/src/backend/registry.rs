use std::sync::Arc;

use super::{AnalysisBackend, GenerationSettings, InProcessBackend, OllamaBackend, RemoteApiBackend};
use crate::{
    config::{Config, ReviewEntry},
    retry::RetryPolicy,
    types::{BackendDescriptor, BackendKind},
};

/// Immutable set of constructed backends, built once at startup and handed
/// to the manager by reference.
pub struct BackendRegistry {
    rotation: Vec<Arc<dyn AnalysisBackend>>,
    fallback: Option<Arc<dyn AnalysisBackend>>,
    passes: u32,
    retry: RetryPolicy,
}

impl BackendRegistry {
    /// `rotation` is the review sequence, or just the primary when no
    /// sequence is configured. It must not be empty.
    pub fn new(
        rotation: Vec<Arc<dyn AnalysisBackend>>,
        fallback: Option<Arc<dyn AnalysisBackend>>,
        passes: u32,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            rotation,
            fallback,
            passes: passes.max(1),
            retry,
        }
    }

    /// Construct every backend the configuration names.
    pub fn from_config(config: &Config) -> Self {
        let entries: Vec<ReviewEntry> = if config.review_models.is_empty() {
            let kind = config.primary_kind();
            vec![ReviewEntry {
                kind,
                model: default_model(config, kind),
            }]
        } else {
            config.review_models.clone()
        };
        let sequenced = !config.review_models.is_empty();

        let rotation = entries
            .iter()
            .enumerate()
            .map(|(position, entry)| {
                build(
                    config,
                    entry.kind,
                    &entry.model,
                    sequenced.then_some(position),
                )
            })
            .collect();

        let fallback = config.fallback_active().then(|| {
            build(
                config,
                BackendKind::RemoteApi,
                &config.gemini_model,
                None,
            )
        });

        let registry = Self::new(rotation, fallback, config.review_passes, config.retry_policy());
        tracing::info!(
            backends = ?registry.rotation.iter().map(|b| b.describe().id()).collect::<Vec<_>>(),
            fallback = ?registry.fallback.as_ref().map(|b| b.describe().id()),
            passes = registry.passes,
            "Backend registry ready"
        );
        registry
    }

    pub fn rotation(&self) -> &[Arc<dyn AnalysisBackend>] {
        &self.rotation
    }

    pub fn fallback(&self) -> Option<&Arc<dyn AnalysisBackend>> {
        self.fallback.as_ref()
    }

    pub fn passes(&self) -> u32 {
        self.passes
    }

    /// Retry policy for `descriptor`, using its own retry budget.
    pub fn retry_for(&self, descriptor: &BackendDescriptor) -> RetryPolicy {
        self.retry.with_max_retries(descriptor.max_retries)
    }

    /// Every configured backend: the rotation in order, then the fallback.
    pub fn all(&self) -> impl Iterator<Item = &Arc<dyn AnalysisBackend>> {
        self.rotation.iter().chain(self.fallback.iter())
    }
}

fn default_model(config: &Config, kind: BackendKind) -> String {
    match kind {
        BackendKind::RemoteApi => config.gemini_model.clone(),
        BackendKind::LocalServer | BackendKind::InProcess => config.local_model_name.clone(),
    }
}

fn build(
    config: &Config,
    kind: BackendKind,
    model: &str,
    sequence_position: Option<usize>,
) -> Arc<dyn AnalysisBackend> {
    let settings = config.settings_for(kind);
    let endpoint = match kind {
        BackendKind::LocalServer => Some(config.ollama_base_url.clone()),
        BackendKind::RemoteApi => Some(config.gemini_base_url.clone()),
        BackendKind::InProcess => None,
    };
    let descriptor = BackendDescriptor {
        kind,
        model: model.to_string(),
        endpoint,
        timeout: settings.timeout,
        max_retries: settings.max_retries,
        sequence_position,
    };

    match kind {
        BackendKind::LocalServer => {
            Arc::new(OllamaBackend::new(descriptor, config.model_parameters.clone()))
        }
        BackendKind::InProcess => Arc::new(InProcessBackend::new(
            descriptor,
            config.local_model_path.clone().unwrap_or_default(),
            config.local_tokenizer_path.clone().unwrap_or_default(),
            GenerationSettings::from_parameters(&config.model_parameters),
        )),
        BackendKind::RemoteApi => {
            Arc::new(RemoteApiBackend::new(descriptor, config.gemini_api_key.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn registry(pairs: &[(&str, &str)]) -> BackendRegistry {
        let vars: HashMap<&str, &str> = pairs.iter().copied().collect();
        let config = Config::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        BackendRegistry::from_config(&config)
    }

    fn ids(registry: &BackendRegistry) -> Vec<String> {
        registry.rotation().iter().map(|b| b.describe().id()).collect()
    }

    #[test]
    fn default_registry_has_single_local_primary() {
        let registry = registry(&[]);
        assert_eq!(ids(&registry), vec!["local_server:phi4"]);
        assert!(registry.fallback().is_none());
        assert_eq!(registry.passes(), 1);
        assert_eq!(registry.rotation()[0].describe().sequence_position, None);
    }

    #[test]
    fn review_sequence_keeps_order_and_positions() {
        let registry = registry(&[
            ("REVIEW_MODELS", "phi4,gemini:gemini-pro,llama3"),
            ("ENABLE_FALLBACK", "true"),
            ("GEMINI_API_KEY", "k"),
            ("REVIEW_PASSES", "5"),
        ]);
        assert_eq!(
            ids(&registry),
            vec![
                "local_server:phi4",
                "remote_api:gemini-pro",
                "local_server:llama3"
            ]
        );
        let positions: Vec<_> = registry
            .rotation()
            .iter()
            .map(|b| b.describe().sequence_position)
            .collect();
        assert_eq!(positions, vec![Some(0), Some(1), Some(2)]);
        assert_eq!(
            registry.fallback().map(|b| b.describe().id()),
            Some("remote_api:gemini-flash-latest".to_string())
        );
        assert_eq!(registry.passes(), 5);
        assert_eq!(registry.all().count(), 4);
    }

    #[test]
    fn remote_primary_never_gets_a_fallback() {
        let registry = registry(&[
            ("AI_PROVIDER", "gemini"),
            ("ENABLE_FALLBACK", "true"),
            ("GEMINI_API_KEY", "k"),
        ]);
        assert_eq!(ids(&registry), vec!["remote_api:gemini-flash-latest"]);
        assert!(registry.fallback().is_none());
    }

    #[test]
    fn retry_budget_comes_from_descriptor() {
        let registry = registry(&[("OLLAMA_MAX_RETRIES", "5"), ("RETRY_BASE_DELAY_MS", "10")]);
        let descriptor = registry.rotation()[0].describe();
        let policy = registry.retry_for(descriptor);
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.base_delay, std::time::Duration::from_millis(10));
    }
}
