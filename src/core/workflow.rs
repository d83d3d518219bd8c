//! Workflow definitions and validation.
//!
//! Workflows are defined in YAML and form a DAG of typed steps. Edges come
//! from `depends_on`; a step may additionally carry a condition over one of
//! its dependencies' output.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::registry::ModelRegistry;
use super::template::lookup_path;
use crate::domain::Capability;

/// Reasons a definition is rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkflowValidationError {
    #[error("Workflow '{0}' has no steps")]
    Empty(String),

    #[error("Duplicate step id '{0}'")]
    DuplicateStep(String),

    #[error("Step '{step}' depends on unknown step '{dependency}'")]
    DanglingDependency { step: String, dependency: String },

    #[error("Dependency cycle involving steps: {}", .0.join(", "))]
    Cycle(Vec<String>),

    #[error("Step '{step}' condition references '{referenced}', which is not in its depends_on")]
    ConditionOutsideDependencies { step: String, referenced: String },

    #[error("Step '{step}' of kind {kind} requires a model")]
    MissingModel { step: String, kind: StepKind },

    #[error("Step '{step}' references unknown model '{model}'")]
    UnknownModel { step: String, model: String },

    #[error("Step '{step}': model '{model}' does not support {capability}")]
    UnsupportedCapability {
        step: String,
        model: String,
        capability: Capability,
    },
}

/// A complete workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Definition id (used by `start_run` and the CLI)
    pub id: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Credit budget for each run of this workflow
    #[serde(default)]
    pub credit_limit: Option<u64>,

    /// Steps, in authoring order
    pub steps: Vec<StepDefinition>,
}

impl WorkflowDefinition {
    /// Load a definition from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read workflow file: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    /// Parse a definition from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse workflow YAML")
    }

    /// Structural validation: unique ids, closed dependencies, conditions
    /// within dependencies, models on generation steps, no cycles.
    pub fn validate(&self) -> Result<(), WorkflowValidationError> {
        if self.steps.is_empty() {
            return Err(WorkflowValidationError::Empty(self.id.clone()));
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                return Err(WorkflowValidationError::DuplicateStep(step.id.clone()));
            }
        }

        for step in &self.steps {
            for dependency in &step.depends_on {
                if !seen.contains(dependency.as_str()) {
                    return Err(WorkflowValidationError::DanglingDependency {
                        step: step.id.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }

            if let Some(condition) = &step.condition {
                if !step.depends_on.contains(&condition.step) {
                    return Err(WorkflowValidationError::ConditionOutsideDependencies {
                        step: step.id.clone(),
                        referenced: condition.step.clone(),
                    });
                }
            }

            if step.kind.is_generation() && step.model.is_none() {
                return Err(WorkflowValidationError::MissingModel {
                    step: step.id.clone(),
                    kind: step.kind,
                });
            }
        }

        self.topological_order().map(|_| ())
    }

    /// Check generation steps against the model catalog
    pub fn validate_models(&self, registry: &ModelRegistry) -> Result<(), WorkflowValidationError> {
        for step in &self.steps {
            let (Some(capability), Some(model_id)) = (step.capability(), step.model.as_ref()) else {
                continue;
            };

            let model = registry
                .get(model_id)
                .ok_or_else(|| WorkflowValidationError::UnknownModel {
                    step: step.id.clone(),
                    model: model_id.clone(),
                })?;

            if !model.supports(capability) {
                return Err(WorkflowValidationError::UnsupportedCapability {
                    step: step.id.clone(),
                    model: model_id.clone(),
                    capability,
                });
            }
        }

        Ok(())
    }

    /// Steps in dependency order; ties keep authoring order
    pub fn topological_order(&self) -> Result<Vec<&StepDefinition>, WorkflowValidationError> {
        let mut placed: HashSet<&str> = HashSet::with_capacity(self.steps.len());
        let mut order: Vec<&StepDefinition> = Vec::with_capacity(self.steps.len());

        while order.len() < self.steps.len() {
            let next = self.steps.iter().find(|step| {
                !placed.contains(step.id.as_str())
                    && step.depends_on.iter().all(|d| placed.contains(d.as_str()))
            });

            match next {
                Some(step) => {
                    placed.insert(step.id.as_str());
                    order.push(step);
                }
                None => {
                    let remaining = self
                        .steps
                        .iter()
                        .filter(|s| !placed.contains(s.id.as_str()))
                        .map(|s| s.id.clone())
                        .collect();
                    return Err(WorkflowValidationError::Cycle(remaining));
                }
            }
        }

        Ok(order)
    }

    /// Get a step by id
    pub fn get_step(&self, id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_ids(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|s| s.id.as_str())
    }
}

/// A single step in a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Step id (unique within the workflow)
    pub id: String,

    pub kind: StepKind,

    /// Model id, required for generation kinds
    #[serde(default)]
    pub model: Option<String>,

    /// Override of the capability implied by `kind` (e.g. upscale_image)
    #[serde(default)]
    pub capability: Option<Capability>,

    /// Input template
    #[serde(default)]
    pub input: Value,

    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Skip the step unless this holds
    #[serde(default)]
    pub condition: Option<Condition>,

    /// Retry policy (executor default if unset)
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
}

impl StepDefinition {
    /// Capability routed for generation kinds
    pub fn capability(&self) -> Option<Capability> {
        self.kind
            .default_capability()
            .map(|default| self.capability.unwrap_or(default))
    }
}

/// Closed set of step kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    #[serde(alias = "text-generation")]
    TextGeneration,
    #[serde(alias = "image-generation")]
    ImageGeneration,
    #[serde(alias = "video-generation")]
    VideoGeneration,
    #[serde(alias = "speech-synthesis")]
    SpeechSynthesis,
    Embedding,
    #[serde(alias = "data-transform")]
    DataTransform,
    #[serde(alias = "conditional-branch")]
    ConditionalBranch,
    #[serde(alias = "loop-over-collection")]
    LoopOverCollection,
    #[serde(alias = "human-approval")]
    HumanApproval,
}

impl StepKind {
    pub const ALL: [StepKind; 9] = [
        Self::TextGeneration,
        Self::ImageGeneration,
        Self::VideoGeneration,
        Self::SpeechSynthesis,
        Self::Embedding,
        Self::DataTransform,
        Self::ConditionalBranch,
        Self::LoopOverCollection,
        Self::HumanApproval,
    ];

    /// Capability routed by generation kinds
    pub fn default_capability(&self) -> Option<Capability> {
        match self {
            Self::TextGeneration => Some(Capability::Text),
            Self::ImageGeneration => Some(Capability::Image),
            Self::VideoGeneration => Some(Capability::Video),
            Self::SpeechSynthesis => Some(Capability::Speech),
            Self::Embedding => Some(Capability::Embedding),
            Self::DataTransform
            | Self::ConditionalBranch
            | Self::LoopOverCollection
            | Self::HumanApproval => None,
        }
    }

    /// Generation kinds call a provider and are billed
    pub fn is_generation(&self) -> bool {
        self.default_capability().is_some()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TextGeneration => "text_generation",
            Self::ImageGeneration => "image_generation",
            Self::VideoGeneration => "video_generation",
            Self::SpeechSynthesis => "speech_synthesis",
            Self::Embedding => "embedding",
            Self::DataTransform => "data_transform",
            Self::ConditionalBranch => "conditional_branch",
            Self::LoopOverCollection => "loop_over_collection",
            Self::HumanApproval => "human_approval",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gate on a dependency's output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Dependency whose output is inspected
    pub step: String,

    /// Dotted path into the output (`output.` prefix optional)
    #[serde(default)]
    pub path: String,

    pub op: Comparison,

    #[serde(default)]
    pub value: Value,
}

impl Condition {
    fn relative_path(&self) -> &str {
        match self.path.as_str() {
            "output" => "",
            other => other.strip_prefix("output.").unwrap_or(other),
        }
    }

    /// Evaluate against the dependency's output (`None` if it has none)
    pub fn evaluate(&self, output: Option<&Value>) -> bool {
        let actual = output.and_then(|o| lookup_path(o, self.relative_path()));
        self.op.compare(actual, &self.value)
    }
}

/// Comparison operators for conditions and branches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    #[serde(alias = "==")]
    Eq,
    #[serde(alias = "!=")]
    Ne,
    #[serde(alias = ">")]
    Gt,
    #[serde(alias = ">=")]
    Gte,
    #[serde(alias = "<")]
    Lt,
    #[serde(alias = "<=")]
    Lte,
    Contains,
    Exists,
}

impl Comparison {
    pub fn compare(&self, actual: Option<&Value>, expected: &Value) -> bool {
        match self {
            Self::Exists => actual.map_or(false, |v| !v.is_null()),
            Self::Eq => actual.map_or(false, |a| values_equal(a, expected)),
            Self::Ne => !actual.map_or(false, |a| values_equal(a, expected)),
            Self::Gt | Self::Gte | Self::Lt | Self::Lte => {
                let Some(ordering) = actual.and_then(|a| order_values(a, expected)) else {
                    return false;
                };
                match self {
                    Self::Gt => ordering.is_gt(),
                    Self::Gte => ordering.is_ge(),
                    Self::Lt => ordering.is_lt(),
                    _ => ordering.is_le(),
                }
            }
            Self::Contains => match actual {
                Some(Value::String(s)) => expected.as_str().map_or(false, |e| s.contains(e)),
                Some(Value::Array(items)) => items.iter().any(|i| values_equal(i, expected)),
                Some(Value::Object(map)) => expected.as_str().map_or(false, |k| map.contains_key(k)),
                _ => false,
            },
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) if a.is_number() && b.is_number() => x == y,
        _ => a == b,
    }
}

fn order_values(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Retry policy for failed steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// No retries at all
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Calculate delay for a specific attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms);
        }

        let delay = self.initial_delay_ms as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
