//! Step handlers, one per step kind.
//!
//! The executor looks handlers up in a [`HandlerTable`] keyed by
//! [`StepKind`]; adding a kind means adding a handler and a table entry.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use super::credits::CreditViolation;
use super::router::{ProviderRouter, RouterError};
use super::template::{resolve, TemplateScope};
use super::workflow::{Comparison, StepDefinition, StepKind};
use crate::domain::{ErrorKind, StepState};
use crate::providers::ProviderRequest;

/// What a handler sees when it runs
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    pub run_id: Uuid,
    pub step: &'a StepDefinition,
    /// Input template resolved against the run
    pub input: &'a Value,
    /// Accumulated step states of the run
    pub steps: &'a BTreeMap<String, StepState>,
    /// Caller-supplied run inputs
    pub inputs: &'a Value,
}

/// Result of a successful step
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    pub value: Value,
    /// Provider that served a generation step
    pub provider: Option<String>,
    /// Credits to commit
    pub cost: u64,
}

impl StepOutput {
    /// Output of a step with no external call
    pub fn local(value: Value) -> Self {
        Self {
            value,
            provider: None,
            cost: 0,
        }
    }
}

/// How a step finished
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Completed(StepOutput),
    /// Suspend the run until a human completes the task
    AwaitingApproval { prompt: Value },
}

/// Step execution failures
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StepError {
    #[error(transparent)]
    Router(#[from] RouterError),

    #[error(transparent)]
    Credits(#[from] CreditViolation),

    #[error("Invalid input for step '{step}': {message}")]
    InvalidInput { step: String, message: String },

    #[error("{0}")]
    Failed(String),
}

impl StepError {
    pub fn invalid_input(step: &StepDefinition, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            step: step.id.clone(),
            message: message.into(),
        }
    }

    /// Whether the step's retry policy applies
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Router(RouterError::AllProvidersFailed { .. }) | Self::Failed(_)
        )
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Router(RouterError::AllProvidersFailed { .. }) => ErrorKind::AllProvidersFailed,
            Self::Router(_) | Self::InvalidInput { .. } => ErrorKind::InvalidInput,
            Self::Credits(_) => ErrorKind::InsufficientCredits,
            Self::Failed(_) => ErrorKind::StepExecution,
        }
    }

    pub fn attempted_providers(&self) -> Vec<String> {
        match self {
            Self::Router(err) => err.attempted().to_vec(),
            _ => Vec::new(),
        }
    }
}

/// Executes one kind of step
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn execute(&self, ctx: StepContext<'_>) -> Result<StepOutcome, StepError>;
}

/// Handlers keyed by step kind
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: HashMap<StepKind, Arc<dyn StepHandler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in handler for every kind
    pub fn with_defaults(router: Arc<ProviderRouter>) -> Self {
        let mut table = Self::new();
        let generation: Arc<dyn StepHandler> = Arc::new(GenerationHandler::new(router));

        for kind in StepKind::ALL.into_iter().filter(StepKind::is_generation) {
            table.register(kind, generation.clone());
        }
        table.register(StepKind::DataTransform, Arc::new(TransformHandler));
        table.register(StepKind::ConditionalBranch, Arc::new(ConditionalBranchHandler));
        table.register(StepKind::LoopOverCollection, Arc::new(LoopHandler));
        table.register(StepKind::HumanApproval, Arc::new(HumanApprovalHandler));

        table
    }

    pub fn register(&mut self, kind: StepKind, handler: Arc<dyn StepHandler>) {
        self.handlers.insert(kind, handler);
    }

    pub fn get(&self, kind: StepKind) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(&kind).cloned()
    }
}

/// Generation kinds: route to a provider
pub struct GenerationHandler {
    router: Arc<ProviderRouter>,
}

impl GenerationHandler {
    pub fn new(router: Arc<ProviderRouter>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl StepHandler for GenerationHandler {
    async fn execute(&self, ctx: StepContext<'_>) -> Result<StepOutcome, StepError> {
        let step = ctx.step;
        let model_id = step
            .model
            .as_deref()
            .ok_or_else(|| StepError::invalid_input(step, "generation step has no model"))?;
        let capability = step
            .capability()
            .ok_or_else(|| StepError::invalid_input(step, "step kind has no capability"))?;
        let request = ProviderRequest::from_input(ctx.input)
            .map_err(|e| StepError::invalid_input(step, e.to_string()))?;

        let routed = self.router.route(model_id, capability, &request).await?;

        Ok(StepOutcome::Completed(StepOutput {
            value: json!({
                "assets": routed.output.assets,
                "metadata": routed.output.metadata,
                "provider": routed.provider_id,
            }),
            provider: Some(routed.provider_id),
            cost: routed.cost,
        }))
    }
}

/// `data_transform`: the resolved input is the output
pub struct TransformHandler;

#[async_trait]
impl StepHandler for TransformHandler {
    async fn execute(&self, ctx: StepContext<'_>) -> Result<StepOutcome, StepError> {
        Ok(StepOutcome::Completed(StepOutput::local(ctx.input.clone())))
    }
}

#[derive(Debug, Deserialize)]
struct BranchInput {
    #[serde(default)]
    value: Value,
    #[serde(default = "default_branch_op")]
    op: Comparison,
    #[serde(default)]
    expected: Value,
}

fn default_branch_op() -> Comparison {
    Comparison::Eq
}

/// `conditional_branch`: `{value, op, expected}` to `{result, value}`
pub struct ConditionalBranchHandler;

#[async_trait]
impl StepHandler for ConditionalBranchHandler {
    async fn execute(&self, ctx: StepContext<'_>) -> Result<StepOutcome, StepError> {
        let input: BranchInput = serde_json::from_value(ctx.input.clone())
            .map_err(|e| StepError::invalid_input(ctx.step, e.to_string()))?;

        let result = input.op.compare(Some(&input.value), &input.expected);

        Ok(StepOutcome::Completed(StepOutput::local(json!({
            "result": result,
            "value": input.value,
        }))))
    }
}

#[derive(Debug, Deserialize)]
struct LoopInput {
    items: Vec<Value>,
    #[serde(default)]
    template: Option<Value>,
}

/// `loop_over_collection`: render `template` once per item
pub struct LoopHandler;

#[async_trait]
impl StepHandler for LoopHandler {
    async fn execute(&self, ctx: StepContext<'_>) -> Result<StepOutcome, StepError> {
        let input: LoopInput = serde_json::from_value(ctx.input.clone())
            .map_err(|e| StepError::invalid_input(ctx.step, e.to_string()))?;

        let Some(template) = input.template else {
            return Ok(StepOutcome::Completed(StepOutput::local(Value::Array(input.items))));
        };

        let scope = TemplateScope::new(ctx.inputs, ctx.steps);
        let rendered = input
            .items
            .iter()
            .enumerate()
            .map(|(index, item)| resolve(&template, &scope.with_item(item, index)))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StepError::invalid_input(ctx.step, e.to_string()))?;

        Ok(StepOutcome::Completed(StepOutput::local(Value::Array(rendered))))
    }
}

/// `human_approval`: suspend with the resolved input as the prompt
pub struct HumanApprovalHandler;

#[async_trait]
impl StepHandler for HumanApprovalHandler {
    async fn execute(&self, ctx: StepContext<'_>) -> Result<StepOutcome, StepError> {
        Ok(StepOutcome::AwaitingApproval {
            prompt: ctx.input.clone(),
        })
    }
}
