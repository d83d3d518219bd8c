//! Model catalog.
//!
//! Loaded once from YAML and consumed read-only by the router and by
//! workflow validation.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::domain::Model;

/// On-disk catalog format
#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    models: Vec<Model>,
}

/// Catalog of models keyed by id
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: HashMap<String, Model>,
    /// Load order, for stable listing
    order: Vec<String>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from already-parsed models
    pub fn from_models(models: impl IntoIterator<Item = Model>) -> Result<Self> {
        let mut registry = Self::new();
        for model in models {
            registry.insert(model)?;
        }
        Ok(registry)
    }

    /// Load a catalog from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read model catalog: {}", path.display()))?;

        Self::from_yaml(&content)
            .with_context(|| format!("Invalid model catalog: {}", path.display()))
    }

    /// Parse a catalog from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        let file: CatalogFile =
            serde_yaml::from_str(content).context("Failed to parse model catalog YAML")?;

        Self::from_models(file.models)
    }

    fn insert(&mut self, model: Model) -> Result<()> {
        if model.default_provider.trim().is_empty() {
            bail!("Model '{}' has no default provider", model.id);
        }
        if self.models.contains_key(&model.id) {
            bail!("Duplicate model id '{}'", model.id);
        }

        self.order.push(model.id.clone());
        self.models.insert(model.id.clone(), model);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Model> {
        self.models.get(id)
    }

    /// Models in catalog order
    pub fn models(&self) -> impl Iterator<Item = &Model> {
        self.order.iter().filter_map(|id| self.models.get(id))
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
