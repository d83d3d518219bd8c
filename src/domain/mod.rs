//! Domain types for genflow.
//!
//! This module contains the core data structures:
//! - Model: catalog entries consumed by the router
//! - Run: workflow execution state
//! - Task: human approval tasks
//! - Events: audit trail of run transitions

pub mod events;
pub mod model;
pub mod run;
pub mod task;

// Re-export commonly used types
pub use events::{Event, EventType};
pub use model::{Capability, Model, ModelType, ProviderBinding};
pub use run::{ErrorKind, RunError, RunStatus, StepState, StepStatus, WorkflowRun};
pub use task::{TaskStatus, TaskSummary, WorkflowTask};
