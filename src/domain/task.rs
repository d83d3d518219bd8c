//! Human tasks created by approval steps.
//!
//! A task is the only thing that can move a paused run forward. It is
//! completed exactly once by an external actor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A human-in-the-loop task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTask {
    /// Derived from (run id, step id), see [`WorkflowTask::id_for`]
    pub id: Uuid,

    pub run_id: Uuid,

    pub step_id: String,

    /// Owner of the run, used to list pending work
    pub owner_id: String,

    pub status: TaskStatus,

    /// Payload shown to the approver
    pub prompt: serde_json::Value,

    /// Approver's answer once completed
    #[serde(default)]
    pub response: Option<serde_json::Value>,

    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowTask {
    /// Create a pending task for a step
    pub fn new(
        run_id: Uuid,
        step_id: impl Into<String>,
        owner_id: impl Into<String>,
        prompt: serde_json::Value,
    ) -> Self {
        let step_id = step_id.into();
        Self {
            id: Self::id_for(run_id, &step_id),
            run_id,
            step_id,
            owner_id: owner_id.into(),
            status: TaskStatus::Pending,
            prompt,
            response: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Deterministic id so re-dispatching a step never mints a second task
    pub fn id_for(run_id: Uuid, step_id: &str) -> Uuid {
        Uuid::new_v5(&run_id, step_id.as_bytes())
    }

    pub fn is_pending(&self) -> bool {
        self.status == TaskStatus::Pending
    }

    /// Record the response; callers check `is_pending` first
    pub fn complete(&mut self, response: serde_json::Value) {
        self.status = TaskStatus::Completed;
        self.response = Some(response);
        self.completed_at = Some(Utc::now());
    }

    pub fn summary(&self) -> TaskSummary {
        TaskSummary {
            id: self.id,
            run_id: self.run_id,
            step_id: self.step_id.clone(),
            prompt: self.prompt.clone(),
            created_at: self.created_at,
        }
    }
}

/// Task lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Completed,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

/// Listing view of a pending task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: Uuid,
    pub run_id: Uuid,
    pub step_id: String,
    pub prompt: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
