//! Workflow run state.
//!
//! A run is the durable record of one instantiation of a workflow
//! definition. It is mutated only by the executor and persisted after
//! every transition.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::credits::CreditAccount;
use crate::core::workflow::WorkflowDefinition;

/// A workflow execution run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// Unique identifier for this run
    pub id: Uuid,

    /// Definition this run instantiates
    pub definition_id: String,

    /// Copy of the definition taken at start; later edits to the catalog
    /// do not affect the run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition: Option<WorkflowDefinition>,

    /// User that started the run
    pub owner_id: String,

    /// Current lifecycle status
    pub status: RunStatus,

    /// Caller-supplied inputs
    pub inputs: serde_json::Value,

    /// Per-step state keyed by step id
    pub steps: BTreeMap<String, StepState>,

    /// Steps whose dependencies are satisfied and that await execution
    #[serde(default)]
    pub current_frontier: Vec<String>,

    /// Credit budget and usage
    #[serde(default)]
    pub credits: CreditAccount,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    /// When the run reached a terminal state
    pub completed_at: Option<DateTime<Utc>>,

    /// Last failure, kept for display after the run fails
    #[serde(default)]
    pub last_error: Option<RunError>,
}

impl WorkflowRun {
    /// Create a pending run with every step pending
    pub fn new<'a>(
        definition_id: impl Into<String>,
        owner_id: impl Into<String>,
        inputs: serde_json::Value,
        step_ids: impl IntoIterator<Item = &'a str>,
        credit_limit: Option<u64>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            definition_id: definition_id.into(),
            definition: None,
            owner_id: owner_id.into(),
            status: RunStatus::Pending,
            inputs,
            steps: step_ids
                .into_iter()
                .map(|id| (id.to_string(), StepState::default()))
                .collect(),
            current_frontier: Vec::new(),
            credits: CreditAccount::new(credit_limit),
            created_at: now,
            updated_at: now,
            completed_at: None,
            last_error: None,
        }
    }

    pub fn credits_used(&self) -> u64 {
        self.credits.used
    }

    pub fn step(&self, step_id: &str) -> Option<&StepState> {
        self.steps.get(step_id)
    }

    /// Status of a step (`Pending` for unknown ids)
    pub fn step_status(&self, step_id: &str) -> StepStatus {
        self.steps
            .get(step_id)
            .map(|s| s.status)
            .unwrap_or_default()
    }

    /// Mutable step state, created on first access
    pub fn step_mut(&mut self, step_id: &str) -> &mut StepState {
        self.steps.entry(step_id.to_string()).or_default()
    }

    /// Output of a step that completed
    pub fn completed_output(&self, step_id: &str) -> Option<&serde_json::Value> {
        self.steps
            .get(step_id)
            .filter(|s| s.status == StepStatus::Completed)
            .and_then(|s| s.output.as_ref())
    }

    /// Steps suspended on a human task
    pub fn awaiting_steps(&self) -> impl Iterator<Item = (&String, &StepState)> {
        self.steps.iter().filter(|(_, s)| s.is_awaiting_task())
    }

    /// True once no step is left pending or failed
    pub fn all_steps_settled(&self) -> bool {
        self.steps
            .values()
            .all(|s| matches!(s.status, StepStatus::Completed | StepStatus::Skipped))
    }

    pub fn has_failed_step(&self) -> bool {
        self.steps.values().any(|s| s.status == StepStatus::Failed)
    }

    /// Move to `status`, stamping timestamps
    pub fn transition(&mut self, status: RunStatus) {
        let now = Utc::now();
        self.status = status;
        self.updated_at = now;
        if status.is_terminal() {
            self.completed_at = Some(now);
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Lifecycle status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    /// Suspended on a human task
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Terminal states are absorbing
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl Default for RunStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single step within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not yet executed, or awaiting a human task
    Pending,

    /// Condition not met, or every dependency was skipped
    Skipped,

    Completed,

    Failed,
}

impl Default for StepStatus {
    fn default() -> Self {
        Self::Pending
    }
}

/// Accumulated state of one step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    pub status: StepStatus,

    /// Output recorded on completion
    #[serde(default)]
    pub output: Option<serde_json::Value>,

    /// Human task this step waits on
    #[serde(default)]
    pub task_id: Option<Uuid>,

    /// Number of dispatch attempts
    #[serde(default)]
    pub attempts: u32,

    /// Provider that produced the output
    #[serde(default)]
    pub provider: Option<String>,

    /// Credits charged for this step
    #[serde(default)]
    pub cost: u64,

    #[serde(default)]
    pub error: Option<String>,
}

impl StepState {
    pub fn is_awaiting_task(&self) -> bool {
        self.status == StepStatus::Pending && self.task_id.is_some()
    }
}

/// Category of the failure that ended a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AllProvidersFailed,
    InsufficientCredits,
    InvalidInput,
    StepExecution,
    Persistence,
}

/// Failure details exposed on a failed run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunError {
    pub kind: ErrorKind,

    pub message: String,

    /// Step that failed
    #[serde(default)]
    pub step: Option<String>,

    /// Providers invoked by the last routing attempt
    #[serde(default)]
    pub attempted_providers: Vec<String>,
}
