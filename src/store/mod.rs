//! Durable storage for runs, tasks and the audit log.
//!
//! The executor never keeps authoritative run state only in memory: every
//! transition goes through [`RunStore::save_run`], which must be atomic.

pub mod file;
pub mod memory;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{Event, WorkflowRun, WorkflowTask};

pub use file::{generate_idempotency_key, hash_input, FileStore};
pub use memory::MemoryStore;

/// Errors that can occur in a store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Run not found: {0}")]
    RunNotFound(Uuid),

    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("Task already completed: {0}")]
    TaskAlreadyCompleted(Uuid),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Hold on one run taken through the store; released on drop
#[derive(Debug)]
pub struct StoreLease {
    _file: Option<std::fs::File>,
}

impl StoreLease {
    /// Hold for a store private to one process
    pub fn local() -> Self {
        Self { _file: None }
    }

    /// Hold backed by an exclusive lock on an open file
    pub(crate) fn file(file: std::fs::File) -> Self {
        Self { _file: Some(file) }
    }
}

/// Persistence collaborator consumed by the executor
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn load_run(&self, id: Uuid) -> Result<WorkflowRun, StoreError>;

    /// Replace the stored snapshot atomically
    async fn save_run(&self, run: &WorkflowRun) -> Result<(), StoreError>;

    /// Most recently updated first
    async fn list_runs(&self, limit: Option<usize>) -> Result<Vec<WorkflowRun>, StoreError>;

    /// Store a task; a task with the same id already stored is kept as is
    async fn create_task(&self, task: &WorkflowTask) -> Result<(), StoreError>;

    async fn load_task(&self, id: Uuid) -> Result<WorkflowTask, StoreError>;

    /// Mark a pending task completed, exactly once
    async fn complete_task(
        &self,
        id: Uuid,
        response: serde_json::Value,
    ) -> Result<WorkflowTask, StoreError>;

    /// Pending tasks, optionally restricted to one owner, oldest first
    async fn list_tasks(&self, owner_id: Option<&str>) -> Result<Vec<WorkflowTask>, StoreError>;

    async fn append_event(&self, event: &Event) -> Result<(), StoreError>;

    /// Events of a run in append order
    async fn load_events(&self, run_id: Uuid) -> Result<Vec<Event>, StoreError>;

    /// Exclusive hold on a run across every process sharing the store,
    /// or `None` if someone else has it
    async fn try_lease(&self, _run_id: Uuid) -> Result<Option<StoreLease>, StoreError> {
        Ok(Some(StoreLease::local()))
    }

    /// Like [`RunStore::try_lease`], waiting until the hold is free
    async fn lease(&self, _run_id: Uuid) -> Result<StoreLease, StoreError> {
        Ok(StoreLease::local())
    }

    /// Record that a run should stop before its next step
    async fn request_cancel(&self, run_id: Uuid) -> Result<(), StoreError>;

    async fn cancel_requested(&self, run_id: Uuid) -> Result<bool, StoreError>;

    /// Drop a cancel request; returns whether one was recorded
    async fn clear_cancel(&self, run_id: Uuid) -> Result<bool, StoreError>;
}
