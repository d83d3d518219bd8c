//! Catalog of workflow definitions by id.
//!
//! Definitions are stored as parsed; validation happens when a run starts.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::{Context, Result};
use tracing::debug;

use super::workflow::{WorkflowDefinition, WorkflowValidationError};

#[derive(Debug, Default)]
pub struct DefinitionRegistry {
    definitions: RwLock<HashMap<String, Arc<WorkflowDefinition>>>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register, replacing a definition with the same id
    pub fn register(&self, definition: WorkflowDefinition) {
        self.definitions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(definition.id.clone(), Arc::new(definition));
    }

    /// Register only if the definition passes structural validation
    pub fn register_validated(
        &self,
        definition: WorkflowDefinition,
    ) -> Result<(), WorkflowValidationError> {
        definition.validate()?;
        self.register(definition);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<WorkflowDefinition>> {
        self.definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Ids in sorted order
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Register every `*.yaml` / `*.yml` file in `dir`
    pub fn load_dir(&self, dir: &Path) -> Result<usize> {
        if !dir.exists() {
            return Ok(0);
        }

        let mut loaded = 0;
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read workflows directory: {}", dir.display()))?;

        for entry in entries {
            let path = entry?.path();
            let is_yaml = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            );
            if !is_yaml {
                continue;
            }

            let definition = WorkflowDefinition::from_file(&path)?;
            debug!(id = %definition.id, path = %path.display(), "Loaded workflow");
            self.register(definition);
            loaded += 1;
        }

        Ok(loaded)
    }
}
