//! Generic JSON-over-HTTP provider backend.
//!
//! Endpoint: POST {base_url}/v1/{capability}
//! Auth: Bearer token read from the configured environment variable

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Provider, ProviderError, ProviderOutput, ProviderRequest};
use crate::domain::{Capability, Model};

fn default_timeout_seconds() -> u64 {
    120
}

/// Configuration for one HTTP backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpProviderConfig {
    /// Provider id referenced by model bindings
    pub id: String,

    pub base_url: String,

    /// Environment variable holding the API key
    #[serde(default)]
    pub api_key_env: Option<String>,

    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

/// Payload sent to the backend
#[derive(Debug, Serialize)]
struct GenerateBody<'a> {
    model: &'a str,
    /// Endpoint or checkpoint from the model binding
    #[serde(skip_serializing_if = "Option::is_none")]
    endpoint: Option<&'a str>,
    capability: Capability,
    prompt: &'a str,
    references: &'a [String],
    options: &'a serde_json::Value,
}

/// Response from the backend
#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    assets: Vec<String>,
    #[serde(default)]
    metadata: serde_json::Value,
}

/// HTTP provider client
pub struct HttpProvider {
    config: HttpProviderConfig,
    client: reqwest::Client,
}

impl HttpProvider {
    /// Create a new client
    pub fn new(config: HttpProviderConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self { config, client }
    }

    fn api_key(&self) -> Option<String> {
        self.config
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|key| !key.is_empty())
    }

    /// Build API URL
    fn api_url(&self, capability: Capability) -> String {
        format!(
            "{}/v1/{}",
            self.config.base_url.trim_end_matches('/'),
            capability.as_str()
        )
    }
}

#[async_trait]
impl Provider for HttpProvider {
    fn id(&self) -> &str {
        &self.config.id
    }

    async fn is_available(&self) -> bool {
        self.config.api_key_env.is_none() || self.api_key().is_some()
    }

    async fn generate(
        &self,
        model: &Model,
        capability: Capability,
        request: &ProviderRequest,
    ) -> Result<ProviderOutput, ProviderError> {
        let body = GenerateBody {
            model: &model.id,
            endpoint: model.binding(&self.config.id).map(|b| b.endpoint.as_str()),
            capability,
            prompt: &request.prompt,
            references: &request.references,
            options: &request.options,
        };

        let url = self.api_url(capability);
        debug!(provider = %self.config.id, %url, "Sending generation request");

        let mut builder = self.client.post(&url).json(&body);
        if let Some(key) = self.api_key() {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ProviderError::Request(format!("{}: {}", self.config.id, e)))?;

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(ProviderError::Unavailable(format!(
                "{} rejected credentials ({})",
                self.config.id, status
            )));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderError::Request(format!(
                "{} error ({}): {}",
                self.config.id,
                status,
                text.trim()
            )));
        }

        let parsed: GenerateResponse = response.json().await.map_err(|e| {
            ProviderError::Request(format!("{} returned an invalid body: {}", self.config.id, e))
        })?;

        Ok(ProviderOutput {
            assets: parsed.assets,
            metadata: parsed.metadata,
        })
    }
}
