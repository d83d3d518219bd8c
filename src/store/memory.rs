//! Process-local store, for tests and embedding.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use uuid::Uuid;

use super::{RunStore, StoreError};
use crate::domain::{Event, WorkflowRun, WorkflowTask};

#[derive(Debug, Default)]
struct State {
    runs: HashMap<Uuid, WorkflowRun>,
    tasks: HashMap<Uuid, WorkflowTask>,
    events: HashMap<Uuid, Vec<Event>>,
    cancel_requests: HashSet<Uuid>,
}

/// In-memory [`RunStore`]
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn load_run(&self, id: Uuid) -> Result<WorkflowRun, StoreError> {
        self.state()
            .runs
            .get(&id)
            .cloned()
            .ok_or(StoreError::RunNotFound(id))
    }

    async fn save_run(&self, run: &WorkflowRun) -> Result<(), StoreError> {
        self.state().runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn list_runs(&self, limit: Option<usize>) -> Result<Vec<WorkflowRun>, StoreError> {
        let mut runs: Vec<WorkflowRun> = self.state().runs.values().cloned().collect();
        runs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        if let Some(limit) = limit {
            runs.truncate(limit);
        }
        Ok(runs)
    }

    async fn create_task(&self, task: &WorkflowTask) -> Result<(), StoreError> {
        self.state()
            .tasks
            .entry(task.id)
            .or_insert_with(|| task.clone());
        Ok(())
    }

    async fn load_task(&self, id: Uuid) -> Result<WorkflowTask, StoreError> {
        self.state()
            .tasks
            .get(&id)
            .cloned()
            .ok_or(StoreError::TaskNotFound(id))
    }

    async fn complete_task(
        &self,
        id: Uuid,
        response: serde_json::Value,
    ) -> Result<WorkflowTask, StoreError> {
        let mut state = self.state();
        let task = state.tasks.get_mut(&id).ok_or(StoreError::TaskNotFound(id))?;

        if !task.is_pending() {
            return Err(StoreError::TaskAlreadyCompleted(id));
        }

        task.complete(response);
        Ok(task.clone())
    }

    async fn list_tasks(&self, owner_id: Option<&str>) -> Result<Vec<WorkflowTask>, StoreError> {
        let mut tasks: Vec<WorkflowTask> = self
            .state()
            .tasks
            .values()
            .filter(|t| t.is_pending())
            .filter(|t| owner_id.map_or(true, |owner| t.owner_id == owner))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }

    async fn append_event(&self, event: &Event) -> Result<(), StoreError> {
        self.state()
            .events
            .entry(event.run_id)
            .or_default()
            .push(event.clone());
        Ok(())
    }

    async fn load_events(&self, run_id: Uuid) -> Result<Vec<Event>, StoreError> {
        Ok(self
            .state()
            .events
            .get(&run_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn request_cancel(&self, run_id: Uuid) -> Result<(), StoreError> {
        self.state().cancel_requests.insert(run_id);
        Ok(())
    }

    async fn cancel_requested(&self, run_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.state().cancel_requests.contains(&run_id))
    }

    async fn clear_cancel(&self, run_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.state().cancel_requests.remove(&run_id))
    }
}
