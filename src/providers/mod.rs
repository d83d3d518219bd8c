//! Provider capability interface.
//!
//! Every generation backend implements [`Provider`]. The router depends
//! only on this trait, never on a concrete backend.

pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{Capability, Model};

pub use http::{HttpProvider, HttpProviderConfig};

/// Capability-specific request payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderRequest {
    /// Text prompt
    #[serde(default)]
    pub prompt: String,

    /// Reference asset URIs (source image for upscaling, etc.)
    #[serde(default)]
    pub references: Vec<String>,

    /// Backend-specific options passed through untouched
    #[serde(default)]
    pub options: serde_json::Value,
}

impl ProviderRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    /// Build a request from a resolved step input.
    ///
    /// A bare string becomes the prompt; an object is read field by field.
    pub fn from_input(input: &serde_json::Value) -> Result<Self, serde_json::Error> {
        match input {
            serde_json::Value::String(prompt) => Ok(Self::new(prompt.clone())),
            serde_json::Value::Null => Ok(Self::default()),
            other => serde_json::from_value(other.clone()),
        }
    }
}

/// Output from a provider call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderOutput {
    /// URIs of generated assets (or inline text for text models)
    #[serde(default)]
    pub assets: Vec<String>,

    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl ProviderOutput {
    pub fn new(assets: Vec<String>) -> Self {
        Self {
            assets,
            metadata: serde_json::Value::Null,
        }
    }
}

/// Errors a provider may return
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProviderError {
    /// Not configured or not credentialed; the router skips it without penalty
    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    /// The upstream call failed (network, 4xx, 5xx)
    #[error("Provider request failed: {0}")]
    Request(String),
}

impl ProviderError {
    /// Whether this error counts against the provider's health
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Request(_))
    }
}

/// Trait for generation backends
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider id as referenced by model bindings
    fn id(&self) -> &str;

    /// Cheap availability probe (credentials present, client configured)
    async fn is_available(&self) -> bool;

    /// Run `capability` for `model`
    async fn generate(
        &self,
        model: &Model,
        capability: Capability,
        request: &ProviderRequest,
    ) -> Result<ProviderOutput, ProviderError>;

    async fn generate_image(
        &self,
        model: &Model,
        request: &ProviderRequest,
    ) -> Result<ProviderOutput, ProviderError> {
        self.generate(model, Capability::Image, request).await
    }

    async fn generate_video(
        &self,
        model: &Model,
        request: &ProviderRequest,
    ) -> Result<ProviderOutput, ProviderError> {
        self.generate(model, Capability::Video, request).await
    }

    async fn upscale_image(
        &self,
        model: &Model,
        request: &ProviderRequest,
    ) -> Result<ProviderOutput, ProviderError> {
        self.generate(model, Capability::UpscaleImage, request).await
    }

    async fn upscale_video(
        &self,
        model: &Model,
        request: &ProviderRequest,
    ) -> Result<ProviderOutput, ProviderError> {
        self.generate(model, Capability::UpscaleVideo, request).await
    }
}
