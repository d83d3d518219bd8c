//! genflow - Generation provider router and workflow executor
//!
//! Routes generation requests across interchangeable providers with
//! health-aware failover, and executes workflow DAGs whose steps may call
//! providers, transform data, branch, loop, or wait on a human approval.
//!
//! # Architecture
//!
//! - Runs are durable: every transition is saved before the next step runs
//! - Paused runs hold no in-memory continuation and resume from storage
//! - Credits are reserved before a billed call and charged only on success
//!
//! # Modules
//!
//! - `providers`: Provider trait and the HTTP backend
//! - `core`: Router, health tracking, workflow definitions, executor
//! - `domain`: Data structures (Model, WorkflowRun, WorkflowTask, Event)
//! - `store`: Persistence (file-backed and in-memory)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Start a workflow
//! genflow run product-shot --input inputs.json
//!
//! # Answer a pending approval
//! genflow tasks
//! genflow complete <task-id> --response '{"approved": true}'
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod providers;
pub mod store;

// Re-export main types at crate root for convenience
pub use core::{
    DefinitionRegistry, ExecutorError, HealthTracker, ModelRegistry, ProviderRegistry,
    ProviderRouter, RouterError, WorkflowDefinition, WorkflowExecutor,
};
pub use domain::{Event, EventType, Model, RunStatus, WorkflowRun, WorkflowTask};
pub use providers::{Provider, ProviderError, ProviderOutput, ProviderRequest};
pub use store::{FileStore, MemoryStore, RunStore};
