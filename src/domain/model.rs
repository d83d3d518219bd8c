//! Model catalog entries.
//!
//! A model maps to a default provider, an ordered list of fallbacks and
//! per-provider endpoint/cost bindings. Models are immutable once loaded.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// What a provider call is asked to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Text,
    Image,
    Video,
    Speech,
    Embedding,
    UpscaleImage,
    UpscaleVideo,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Video => "video",
            Self::Speech => "speech",
            Self::Embedding => "embedding",
            Self::UpscaleImage => "upscale_image",
            Self::UpscaleVideo => "upscale_video",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Broad category of a model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    Text,
    Image,
    Video,
    Speech,
    Embedding,
}

impl ModelType {
    /// Capabilities implied by the model type when none are listed explicitly
    pub fn default_capabilities(&self) -> &'static [Capability] {
        match self {
            Self::Text => &[Capability::Text],
            Self::Image => &[Capability::Image, Capability::UpscaleImage],
            Self::Video => &[Capability::Video, Capability::UpscaleVideo],
            Self::Speech => &[Capability::Speech],
            Self::Embedding => &[Capability::Embedding],
        }
    }
}

/// Provider-specific metadata for a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderBinding {
    /// Endpoint path or checkpoint reference understood by the provider
    pub endpoint: String,

    /// Credits charged per successful call
    #[serde(default)]
    pub unit_cost: u64,
}

/// A model entry in the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub id: String,

    pub model_type: ModelType,

    /// Explicit capability list (derived from `model_type` when empty)
    #[serde(default)]
    pub capabilities: Vec<Capability>,

    /// Provider tried first
    pub default_provider: String,

    /// Providers tried after the default, in order
    #[serde(default)]
    pub fallback_providers: Vec<String>,

    /// Per-provider endpoint and cost
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderBinding>,
}

impl Model {
    /// `[default] ++ fallbacks` with duplicates removed, first occurrence wins
    pub fn candidate_order(&self) -> Vec<&str> {
        let mut order: Vec<&str> = Vec::with_capacity(1 + self.fallback_providers.len());

        for id in std::iter::once(&self.default_provider).chain(&self.fallback_providers) {
            if !order.contains(&id.as_str()) {
                order.push(id.as_str());
            }
        }

        order
    }

    pub fn supports(&self, capability: Capability) -> bool {
        if self.capabilities.is_empty() {
            self.model_type.default_capabilities().contains(&capability)
        } else {
            self.capabilities.contains(&capability)
        }
    }

    pub fn binding(&self, provider_id: &str) -> Option<&ProviderBinding> {
        self.providers.get(provider_id)
    }

    /// Credits charged when `provider_id` serves the request
    pub fn cost_for(&self, provider_id: &str) -> u64 {
        self.binding(provider_id).map(|b| b.unit_cost).unwrap_or(0)
    }

    /// Upper bound of what a single routed call may cost
    pub fn estimated_cost(&self) -> u64 {
        self.candidate_order()
            .into_iter()
            .map(|id| self.cost_for(id))
            .max()
            .unwrap_or(0)
    }
}
