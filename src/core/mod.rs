//! Core orchestration logic.
//!
//! This module contains:
//! - Registry: model catalog
//! - Health/Router: health-aware provider failover
//! - Workflow/Definitions: workflow DAG definitions and validation
//! - Template/Credits/Lease: building blocks used while executing steps
//! - Handlers: one step handler per step kind
//! - Executor: the run state machine

pub mod credits;
pub mod definitions;
pub mod executor;
pub mod handlers;
pub mod health;
pub mod lease;
pub mod registry;
pub mod router;
pub mod template;
pub mod workflow;

// Re-export commonly used types
pub use credits::{CreditAccount, CreditViolation, Reservation};
pub use definitions::DefinitionRegistry;
pub use executor::{ExecutorConfig, ExecutorError, RunStatusView, WorkflowExecutor};
pub use handlers::{HandlerTable, StepContext, StepError, StepHandler, StepOutcome, StepOutput};
pub use health::{HealthPolicy, HealthStatus, HealthTracker, ProviderHealth};
pub use lease::{RunLease, RunLeases};
pub use registry::ModelRegistry;
pub use router::{Clock, ProviderRegistry, ProviderRouter, RoutedOutput, RouterError};
pub use template::{lookup_path, resolve, TemplateError, TemplateScope};
pub use workflow::{
    Comparison, Condition, RetryPolicy, StepDefinition, StepKind, WorkflowDefinition,
    WorkflowValidationError,
};
