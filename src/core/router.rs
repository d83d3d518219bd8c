//! Health-aware provider routing.
//!
//! Candidates are tried in `[default] ++ fallbacks` order. Providers in
//! cooldown, unregistered providers and providers reporting themselves
//! unavailable are skipped; the first success wins.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::health::HealthTracker;
use super::registry::ModelRegistry;
use crate::domain::Capability;
use crate::providers::{Provider, ProviderError, ProviderOutput, ProviderRequest};

/// Time source for cooldown decisions
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Routing failures
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RouterError {
    #[error("Unknown model '{0}'")]
    UnknownModel(String),

    #[error("Model '{model}' does not support {capability}")]
    UnsupportedCapability { model: String, capability: Capability },

    #[error(
        "All providers failed for model '{model}' (attempted: [{}]){}",
        .attempted.join(", "),
        describe_last(.last_error)
    )]
    AllProvidersFailed {
        model: String,
        attempted: Vec<String>,
        last_error: Option<ProviderError>,
    },
}

fn describe_last(last_error: &Option<ProviderError>) -> String {
    last_error
        .as_ref()
        .map(|e| format!(": {}", e))
        .unwrap_or_default()
}

impl RouterError {
    /// Provider ids whose backend was actually called
    pub fn attempted(&self) -> &[String] {
        match self {
            Self::AllProvidersFailed { attempted, .. } => attempted,
            _ => &[],
        }
    }
}

/// Successful routed call
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedOutput {
    /// Provider that served the request
    pub provider_id: String,
    pub output: ProviderOutput,
    /// Credits charged by the serving provider
    pub cost: u64,
    /// Every provider called, in order, ending with `provider_id`
    pub attempted: Vec<String>,
}

/// Concrete backends keyed by provider id
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend under its own id, replacing any previous one
    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.id().to_string(), provider);
    }

    pub fn with(mut self, provider: Arc<dyn Provider>) -> Self {
        self.register(provider);
        self
    }

    pub fn get(&self, id: &str) -> Option<&Arc<dyn Provider>> {
        self.providers.get(id)
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

/// Routes model requests across providers
pub struct ProviderRouter {
    models: Arc<ModelRegistry>,
    providers: ProviderRegistry,
    health: Arc<HealthTracker>,
    clock: Clock,
}

impl ProviderRouter {
    pub fn new(
        models: Arc<ModelRegistry>,
        providers: ProviderRegistry,
        health: Arc<HealthTracker>,
    ) -> Self {
        Self {
            models,
            providers,
            health,
            clock: Arc::new(Utc::now),
        }
    }

    /// Replace the wall clock (tests drive cooldown expiry this way)
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn models(&self) -> &ModelRegistry {
        &self.models
    }

    pub fn health(&self) -> &HealthTracker {
        &self.health
    }

    /// Call the first eligible provider that succeeds
    #[instrument(skip(self, request), fields(model = %model_id, capability = %capability))]
    pub async fn route(
        &self,
        model_id: &str,
        capability: Capability,
        request: &ProviderRequest,
    ) -> Result<RoutedOutput, RouterError> {
        let model = self
            .models
            .get(model_id)
            .ok_or_else(|| RouterError::UnknownModel(model_id.to_string()))?;

        if !model.supports(capability) {
            return Err(RouterError::UnsupportedCapability {
                model: model_id.to_string(),
                capability,
            });
        }

        let mut attempted: Vec<String> = Vec::new();
        let mut last_error: Option<ProviderError> = None;

        for provider_id in model.candidate_order() {
            if !self.health.is_eligible(provider_id, (self.clock)()) {
                debug!(provider = provider_id, "Provider cooling down, skipping");
                continue;
            }

            let Some(provider) = self.providers.get(provider_id) else {
                debug!(provider = provider_id, "Provider not registered, skipping");
                last_error = Some(ProviderError::Unavailable(format!(
                    "{} is not registered",
                    provider_id
                )));
                continue;
            };

            if !provider.is_available().await {
                debug!(provider = provider_id, "Provider not available, skipping");
                last_error = Some(ProviderError::Unavailable(format!(
                    "{} is not configured",
                    provider_id
                )));
                continue;
            }

            attempted.push(provider_id.to_string());

            match provider.generate(model, capability, request).await {
                Ok(output) => {
                    self.health.record_success(provider_id);
                    info!(provider = provider_id, "Provider call succeeded");

                    return Ok(RoutedOutput {
                        provider_id: provider_id.to_string(),
                        output,
                        cost: model.cost_for(provider_id),
                        attempted,
                    });
                }
                Err(err) if !err.is_failure() => {
                    debug!(provider = provider_id, error = %err, "Provider unavailable, skipping");
                    last_error = Some(err);
                }
                Err(err) => {
                    let health = self.health.record_failure(provider_id, (self.clock)());
                    warn!(
                        provider = provider_id,
                        consecutive_failures = health.consecutive_failures,
                        status = ?health.status,
                        error = %err,
                        "Provider call failed"
                    );
                    last_error = Some(err);
                }
            }
        }

        Err(RouterError::AllProvidersFailed {
            model: model_id.to_string(),
            attempted,
            last_error,
        })
    }
}
