//! Workflow executor.
//!
//! Drives runs through `pending -> running -> {paused <-> running} ->
//! {completed | failed | cancelled}`. The executor holds no continuation
//! between calls: every transition is saved through the [`RunStore`], and
//! `advance` can be called again at any time (including after a crash) to
//! pick up from the stored snapshot.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::definitions::DefinitionRegistry;
use super::handlers::{HandlerTable, StepContext, StepError, StepHandler, StepOutcome, StepOutput};
use super::lease::RunLeases;
use super::router::ProviderRouter;
use super::template::{resolve, TemplateScope};
use super::workflow::{RetryPolicy, StepDefinition, WorkflowDefinition, WorkflowValidationError};
use crate::domain::{
    ErrorKind, Event, EventType, RunError, RunStatus, StepState, StepStatus, TaskSummary,
    WorkflowRun, WorkflowTask,
};
use crate::store::{generate_idempotency_key, RunStore, StoreError};

/// Errors surfaced by executor operations
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Invalid workflow: {0}")]
    Validation(#[from] WorkflowValidationError),

    #[error("Workflow definition not found: {0}")]
    DefinitionNotFound(String),

    #[error("Run not found: {0}")]
    RunNotFound(Uuid),

    #[error("Run {0} is being advanced by another caller; retry later")]
    RunBusy(Uuid),

    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("Task already completed: {0}")]
    TaskAlreadyCompleted(Uuid),

    #[error("Run {run_id} is already {status}")]
    RunTerminal { run_id: Uuid, status: RunStatus },

    #[error("Cannot {action} run {run_id} while it is {status}")]
    InvalidState {
        run_id: Uuid,
        status: RunStatus,
        action: &'static str,
    },

    #[error("Persistence error: {0}")]
    Persistence(StoreError),
}

impl From<StoreError> for ExecutorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::RunNotFound(id) => Self::RunNotFound(id),
            StoreError::TaskNotFound(id) => Self::TaskNotFound(id),
            StoreError::TaskAlreadyCompleted(id) => Self::TaskAlreadyCompleted(id),
            other => Self::Persistence(other),
        }
    }
}

impl ExecutorError {
    /// Whether the same call may succeed later
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RunBusy(_) | Self::Persistence(_))
    }
}

/// Executor settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Retry policy for steps that do not set their own
    #[serde(default)]
    pub retry: RetryPolicy,
}

/// Externally visible state of a run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunStatusView {
    pub run_id: Uuid,
    pub definition_id: String,
    pub status: RunStatus,
    pub steps: BTreeMap<String, StepState>,
    pub credits_used: u64,
    pub last_error: Option<RunError>,
}

impl From<&WorkflowRun> for RunStatusView {
    fn from(run: &WorkflowRun) -> Self {
        Self {
            run_id: run.id,
            definition_id: run.definition_id.clone(),
            status: run.status,
            steps: run.steps.clone(),
            credits_used: run.credits_used(),
            last_error: run.last_error.clone(),
        }
    }
}

/// How a single dispatch ended
enum Dispatch {
    Completed,
    Suspended,
    Failed,
    Cancelled,
}

/// Advances workflow runs
#[derive(Clone)]
pub struct WorkflowExecutor {
    store: Arc<dyn RunStore>,
    definitions: Arc<DefinitionRegistry>,
    router: Arc<ProviderRouter>,
    handlers: Arc<HandlerTable>,
    leases: Arc<RunLeases>,
    config: ExecutorConfig,
}

impl WorkflowExecutor {
    /// Executor with the built-in handler for every step kind
    pub fn new(
        store: Arc<dyn RunStore>,
        definitions: Arc<DefinitionRegistry>,
        router: Arc<ProviderRouter>,
    ) -> Self {
        let handlers = HandlerTable::with_defaults(router.clone());
        Self {
            store,
            definitions,
            router,
            handlers: Arc::new(handlers),
            leases: Arc::new(RunLeases::new()),
            config: ExecutorConfig::default(),
        }
    }

    pub fn with_handlers(mut self, handlers: HandlerTable) -> Self {
        self.handlers = Arc::new(handlers);
        self
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    pub fn definitions(&self) -> &DefinitionRegistry {
        &self.definitions
    }

    pub fn router(&self) -> &ProviderRouter {
        &self.router
    }

    /// Lease table, shared with every clone of this executor
    pub fn leases(&self) -> &RunLeases {
        &self.leases
    }

    /// Validate, create and persist a run in `running`. Does not execute steps.
    #[instrument(skip(self, inputs), fields(definition = %definition_id))]
    pub async fn start_run(
        &self,
        definition_id: &str,
        owner_id: &str,
        inputs: Value,
    ) -> Result<Uuid, ExecutorError> {
        let definition = self
            .definitions
            .get(definition_id)
            .ok_or_else(|| ExecutorError::DefinitionNotFound(definition_id.to_string()))?;

        definition.validate()?;
        definition.validate_models(self.router.models())?;

        let mut run = WorkflowRun::new(
            &definition.id,
            owner_id,
            inputs,
            definition.step_ids(),
            definition.credit_limit,
        );
        run.definition = Some(definition.as_ref().clone());
        self.store.save_run(&run).await?;

        let event = Event::for_run(
            run.id,
            EventType::RunStarted,
            "start",
            format!("Workflow '{}' started by {}", definition.id, owner_id),
        );
        self.store.append_event(&event).await?;

        run.transition(RunStatus::Running);
        self.store.save_run(&run).await?;

        info!(run_id = %run.id, "Run started");
        Ok(run.id)
    }

    /// `start_run`, then advance in the background
    pub async fn submit(
        &self,
        definition_id: &str,
        owner_id: &str,
        inputs: Value,
    ) -> Result<Uuid, ExecutorError> {
        let run_id = self.start_run(definition_id, owner_id, inputs).await?;

        let executor = self.clone();
        tokio::spawn(async move {
            if let Err(e) = executor.advance(run_id).await {
                warn!(%run_id, error = %e, "Background advance failed");
            }
        });

        Ok(run_id)
    }

    /// Drive a run as far as it can go without outside input
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn advance(&self, run_id: Uuid) -> Result<WorkflowRun, ExecutorError> {
        let _lease = self
            .leases
            .try_acquire_in(self.store.as_ref(), run_id)
            .await?
            .ok_or(ExecutorError::RunBusy(run_id))?;

        let mut run = self.store.load_run(run_id).await?;
        self.drive(&mut run).await?;

        Ok(run)
    }

    /// Apply a human response and resume the owning run
    #[instrument(skip(self, response), fields(task_id = %task_id))]
    pub async fn complete_task(
        &self,
        task_id: Uuid,
        response: Value,
    ) -> Result<WorkflowRun, ExecutorError> {
        let task = self.store.load_task(task_id).await?;
        if !task.is_pending() {
            return Err(ExecutorError::TaskAlreadyCompleted(task_id));
        }

        let _lease = self
            .leases
            .try_acquire_in(self.store.as_ref(), task.run_id)
            .await?
            .ok_or(ExecutorError::RunBusy(task.run_id))?;

        let mut run = self.store.load_run(task.run_id).await?;
        if !run.is_terminal() && self.cancel_requested(run.id).await? {
            self.finish_cancel(&mut run).await?;
        }
        if run.is_terminal() {
            return Err(ExecutorError::RunTerminal {
                run_id: run.id,
                status: run.status,
            });
        }

        // Nothing is written until the run is known to be drivable
        let definition = self.definition_for(&run)?;
        definition.topological_order()?;

        let task = self.store.complete_task(task_id, response).await?;
        self.apply_task(&mut run, &task).await?;

        run.transition(RunStatus::Running);
        self.store.save_run(&run).await?;
        self.store
            .append_event(&Event::for_run(
                run.id,
                EventType::RunResumed,
                &format!("resume:{}", task.id),
                format!("Resumed after task for step '{}'", task.step_id),
            ))
            .await?;

        info!(run_id = %run.id, step = %task.step_id, "Task completed, resuming run");
        self.drive(&mut run).await?;

        Ok(run)
    }

    /// Cancel a running or paused run.
    ///
    /// If another caller is advancing the run, the request is recorded in the
    /// store and this waits for that caller to stop before answering.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn cancel(&self, run_id: Uuid) -> Result<RunStatus, ExecutorError> {
        let run = self.store.load_run(run_id).await?;
        check_cancellable(&run)?;

        self.store.request_cancel(run_id).await?;
        let _lease = self.leases.acquire_in(self.store.as_ref(), run_id).await?;

        let mut run = self.store.load_run(run_id).await?;
        match run.status {
            RunStatus::Running | RunStatus::Paused => {
                self.finish_cancel(&mut run).await?;
                Ok(RunStatus::Cancelled)
            }
            // Applied by the caller that held the run
            RunStatus::Cancelled => Ok(RunStatus::Cancelled),
            _ => {
                self.store.clear_cancel(run_id).await?;
                info!(status = %run.status, "Run settled before the cancel took effect");
                check_cancellable(&run).map(|_| run.status)
            }
        }
    }

    pub async fn get_status(&self, run_id: Uuid) -> Result<RunStatusView, ExecutorError> {
        let run = self.store.load_run(run_id).await?;
        Ok(RunStatusView::from(&run))
    }

    pub async fn get_run(&self, run_id: Uuid) -> Result<WorkflowRun, ExecutorError> {
        Ok(self.store.load_run(run_id).await?)
    }

    /// Pending tasks of live runs, optionally for one owner
    pub async fn list_pending_tasks(
        &self,
        owner_id: Option<&str>,
    ) -> Result<Vec<TaskSummary>, ExecutorError> {
        let mut summaries = Vec::new();

        for task in self.store.list_tasks(owner_id).await? {
            match self.store.load_run(task.run_id).await {
                Ok(run) if !run.is_terminal() => summaries.push(task.summary()),
                Ok(_) | Err(StoreError::RunNotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(summaries)
    }

    pub async fn list_runs(&self, limit: Option<usize>) -> Result<Vec<WorkflowRun>, ExecutorError> {
        Ok(self.store.list_runs(limit).await?)
    }

    /// Audit trail of a run in order
    pub async fn history(&self, run_id: Uuid) -> Result<Vec<Event>, ExecutorError> {
        self.store.load_run(run_id).await?;
        Ok(self.store.load_events(run_id).await?)
    }

    async fn cancel_requested(&self, run_id: Uuid) -> Result<bool, ExecutorError> {
        Ok(self.store.cancel_requested(run_id).await?)
    }

    /// The run's own copy of its definition, else the catalog entry
    fn definition_for(&self, run: &WorkflowRun) -> Result<Arc<WorkflowDefinition>, ExecutorError> {
        if let Some(definition) = &run.definition {
            return Ok(Arc::new(definition.clone()));
        }

        self.definitions
            .get(&run.definition_id)
            .ok_or_else(|| ExecutorError::DefinitionNotFound(run.definition_id.clone()))
    }

    /// Core loop; the caller holds the run's lease
    #[instrument(skip_all, fields(run_id = %run.id))]
    async fn drive(&self, run: &mut WorkflowRun) -> Result<(), ExecutorError> {
        if run.is_terminal() {
            self.store.clear_cancel(run.id).await?;
            return Ok(());
        }

        let definition = self.definition_for(run)?;

        match run.status {
            RunStatus::Paused => {
                if self.cancel_requested(run.id).await? {
                    return self.finish_cancel(run).await;
                }
                if !self.reconcile_tasks(run, &definition).await? {
                    debug!("Run still waiting on a task");
                    return Ok(());
                }
            }
            RunStatus::Pending => {
                run.transition(RunStatus::Running);
                self.store.save_run(run).await?;
            }
            _ => {}
        }

        let order = definition.topological_order()?;

        loop {
            if self.cancel_requested(run.id).await? {
                return self.finish_cancel(run).await;
            }

            let ready = ready_steps(run, &order);
            run.current_frontier = ready.iter().map(|s| s.id.clone()).collect();
            let Some(step) = ready.first().copied() else {
                break;
            };

            if let Some(reason) = skip_reason(run, step) {
                self.skip_step(run, step, reason).await?;
                continue;
            }

            match self.dispatch(run, step).await? {
                Dispatch::Completed => {}
                Dispatch::Suspended => {
                    if self.cancel_requested(run.id).await? {
                        return self.finish_cancel(run).await;
                    }
                    return Ok(());
                }
                Dispatch::Failed => return Ok(()),
                Dispatch::Cancelled => return self.finish_cancel(run).await,
            }
        }

        self.finalize(run).await
    }

    /// Bring a paused run in line with its tasks. Returns true when no task is pending.
    async fn reconcile_tasks(
        &self,
        run: &mut WorkflowRun,
        definition: &WorkflowDefinition,
    ) -> Result<bool, ExecutorError> {
        let awaiting: Vec<(String, Uuid)> = run
            .awaiting_steps()
            .filter_map(|(id, state)| state.task_id.map(|task_id| (id.clone(), task_id)))
            .collect();

        let mut pending = false;
        for (step_id, task_id) in awaiting {
            match self.store.load_task(task_id).await {
                Ok(task) if task.is_pending() => pending = true,
                Ok(task) => {
                    info!(step = %step_id, "Applying task completed before restart");
                    self.apply_task(run, &task).await?;
                }
                Err(StoreError::TaskNotFound(_)) => {
                    warn!(step = %step_id, "Task missing from store, recreating");
                    let prompt = definition
                        .get_step(&step_id)
                        .and_then(|step| {
                            resolve(&step.input, &TemplateScope::new(&run.inputs, &run.steps)).ok()
                        })
                        .unwrap_or(Value::Null);
                    let task = WorkflowTask::new(run.id, &step_id, &run.owner_id, prompt);
                    self.store.create_task(&task).await?;
                    run.step_mut(&step_id).task_id = Some(task.id);
                    pending = true;
                }
                Err(e) => return Err(e.into()),
            }
        }

        if pending {
            self.store.save_run(run).await?;
            return Ok(false);
        }

        run.transition(RunStatus::Running);
        self.store.save_run(run).await?;
        self.store
            .append_event(&Event::for_run(
                run.id,
                EventType::RunResumed,
                "reconcile",
                "Resumed from stored task state".to_string(),
            ))
            .await?;

        Ok(true)
    }

    /// Record a completed task's response as the step output
    async fn apply_task(&self, run: &mut WorkflowRun, task: &WorkflowTask) -> Result<(), ExecutorError> {
        let state = run.step_mut(&task.step_id);
        state.status = StepStatus::Completed;
        state.output = Some(task.response.clone().unwrap_or(Value::Null));
        state.task_id = Some(task.id);
        state.error = None;

        self.store
            .append_event(&Event::new(
                run.id,
                Some(task.step_id.clone()),
                EventType::TaskCompleted,
                format!("{}:{}:task", run.id, task.step_id),
                format!("Task {} completed", task.id),
            ))
            .await?;

        Ok(())
    }

    async fn skip_step(
        &self,
        run: &mut WorkflowRun,
        step: &StepDefinition,
        reason: String,
    ) -> Result<(), ExecutorError> {
        debug!(step = %step.id, %reason, "Skipping step");

        run.step_mut(&step.id).status = StepStatus::Skipped;
        run.updated_at = chrono::Utc::now();
        self.store.save_run(run).await?;

        self.store
            .append_event(&Event::new(
                run.id,
                Some(step.id.clone()),
                EventType::StepSkipped,
                format!("{}:{}:skip", run.id, step.id),
                format!("Step '{}' skipped: {}", step.id, reason),
            ))
            .await?;

        Ok(())
    }

    /// Run one step with its retry policy
    async fn dispatch(
        &self,
        run: &mut WorkflowRun,
        step: &StepDefinition,
    ) -> Result<Dispatch, ExecutorError> {
        let resolved = resolve(&step.input, &TemplateScope::new(&run.inputs, &run.steps));
        let input = match resolved {
            Ok(input) => input,
            Err(e) => {
                let err = StepError::invalid_input(step, e.to_string());
                let key = format!("{}:{}:input", run.id, step.id);
                self.fail_step(run, step, &err, key).await?;
                return Ok(Dispatch::Failed);
            }
        };
        let idem_key = generate_idempotency_key(run.id, &step.id, &input.to_string());

        let Some(handler) = self.handlers.get(step.kind) else {
            let err = StepError::Failed(format!("No handler registered for {}", step.kind));
            self.fail_step(run, step, &err, idem_key).await?;
            return Ok(Dispatch::Failed);
        };

        let policy = step
            .retry_policy
            .clone()
            .unwrap_or_else(|| self.config.retry.clone());
        let estimate = self.estimated_cost(step);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            run.step_mut(&step.id).attempts = attempt;

            self.store
                .append_event(&Event::new(
                    run.id,
                    Some(step.id.clone()),
                    EventType::StepStarted,
                    idem_key.clone(),
                    format!("Step '{}' attempt {}", step.id, attempt),
                ))
                .await?;

            let started = Instant::now();
            let result = attempt_step(run, step, &input, handler.as_ref(), estimate).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(StepOutcome::Completed(output)) => {
                    self.complete_step(run, step, output, idem_key, duration_ms)
                        .await?;
                    return Ok(Dispatch::Completed);
                }
                Ok(StepOutcome::AwaitingApproval { prompt }) => {
                    self.suspend(run, step, prompt).await?;
                    return Ok(Dispatch::Suspended);
                }
                Err(err) if err.is_retryable() && policy.should_retry(attempt) => {
                    let delay = policy.delay_for_attempt(attempt);
                    warn!(
                        step = %step.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Step failed, retrying"
                    );

                    self.store.save_run(run).await?;
                    self.store
                        .append_event(
                            &Event::new(
                                run.id,
                                Some(step.id.clone()),
                                EventType::StepRetrying,
                                format!("{}:retry:{}", idem_key, attempt),
                                format!("Step '{}' failed, retrying in {:?}", step.id, delay),
                            )
                            .with_error(err.to_string()),
                        )
                        .await?;

                    tokio::time::sleep(delay).await;
                    if self.cancel_requested(run.id).await? {
                        return Ok(Dispatch::Cancelled);
                    }
                }
                Err(err) => {
                    self.fail_step(run, step, &err, idem_key).await?;
                    return Ok(Dispatch::Failed);
                }
            }
        }
    }

    /// Upper bound reserved before a billed call
    fn estimated_cost(&self, step: &StepDefinition) -> u64 {
        if !step.kind.is_generation() {
            return 0;
        }
        step.model
            .as_deref()
            .and_then(|id| self.router.models().get(id))
            .map(|model| model.estimated_cost())
            .unwrap_or(0)
    }

    async fn complete_step(
        &self,
        run: &mut WorkflowRun,
        step: &StepDefinition,
        output: StepOutput,
        idem_key: String,
        duration_ms: u64,
    ) -> Result<(), ExecutorError> {
        let state = run.step_mut(&step.id);
        state.status = StepStatus::Completed;
        state.output = Some(output.value);
        state.provider = output.provider.clone();
        state.cost = output.cost;
        state.error = None;
        run.updated_at = chrono::Utc::now();
        self.store.save_run(run).await?;

        let mut event = Event::new(
            run.id,
            Some(step.id.clone()),
            EventType::StepCompleted,
            idem_key,
            format!(
                "Step '{}' completed in {}ms (cost {})",
                step.id, duration_ms, output.cost
            ),
        )
        .with_duration(duration_ms);
        if let Some(provider) = output.provider {
            event = event.with_provider(provider);
        }
        self.store.append_event(&event).await?;

        info!(step = %step.id, duration_ms, cost = output.cost, "Step completed");
        Ok(())
    }

    /// Create the approval task and pause the run
    async fn suspend(
        &self,
        run: &mut WorkflowRun,
        step: &StepDefinition,
        prompt: Value,
    ) -> Result<(), ExecutorError> {
        let task = WorkflowTask::new(run.id, &step.id, &run.owner_id, prompt);
        self.store.create_task(&task).await?;

        run.step_mut(&step.id).task_id = Some(task.id);
        run.transition(RunStatus::Paused);
        self.store.save_run(run).await?;

        self.store
            .append_event(&Event::for_run(
                run.id,
                EventType::RunPaused,
                &format!("pause:{}", step.id),
                format!("Waiting on task {} for step '{}'", task.id, step.id),
            ))
            .await?;

        info!(step = %step.id, task_id = %task.id, "Run paused for approval");
        Ok(())
    }

    async fn fail_step(
        &self,
        run: &mut WorkflowRun,
        step: &StepDefinition,
        err: &StepError,
        idem_key: String,
    ) -> Result<(), ExecutorError> {
        let attempts = run.step(&step.id).map(|s| s.attempts).unwrap_or(0);
        error!(step = %step.id, attempts, error = %err, "Step failed permanently");

        let state = run.step_mut(&step.id);
        state.status = StepStatus::Failed;
        state.error = Some(err.to_string());

        run.last_error = Some(RunError {
            kind: err.kind(),
            message: err.to_string(),
            step: Some(step.id.clone()),
            attempted_providers: err.attempted_providers(),
        });
        run.current_frontier.clear();

        // A cancellation accepted while the step was in flight still wins
        let cancelled = self.store.clear_cancel(run.id).await?;
        let (status, event_type) = if cancelled {
            (RunStatus::Cancelled, EventType::RunCancelled)
        } else {
            (RunStatus::Failed, EventType::RunFailed)
        };
        run.transition(status);
        self.store.save_run(run).await?;

        self.store
            .append_event(
                &Event::new(
                    run.id,
                    Some(step.id.clone()),
                    EventType::StepFailed,
                    idem_key,
                    format!("Step '{}' failed after {} attempts", step.id, attempts),
                )
                .with_error(err.to_string()),
            )
            .await?;
        self.store
            .append_event(
                &Event::for_run(
                    run.id,
                    event_type,
                    "complete",
                    format!("Run {}: step '{}' failed", status, step.id),
                )
                .with_error(err.to_string()),
            )
            .await?;

        Ok(())
    }

    async fn finish_cancel(&self, run: &mut WorkflowRun) -> Result<(), ExecutorError> {
        self.store.clear_cancel(run.id).await?;

        run.current_frontier.clear();
        run.transition(RunStatus::Cancelled);
        self.store.save_run(run).await?;

        self.store
            .append_event(&Event::for_run(
                run.id,
                EventType::RunCancelled,
                "cancel",
                "Run cancelled".to_string(),
            ))
            .await?;

        info!(run_id = %run.id, "Run cancelled");
        Ok(())
    }

    async fn finalize(&self, run: &mut WorkflowRun) -> Result<(), ExecutorError> {
        run.current_frontier.clear();

        if run.all_steps_settled() {
            run.transition(RunStatus::Completed);
            self.store.save_run(run).await?;
            self.store
                .append_event(&Event::for_run(
                    run.id,
                    EventType::RunCompleted,
                    "complete",
                    format!("Run completed, {} credits used", run.credits_used()),
                ))
                .await?;

            info!(run_id = %run.id, credits_used = run.credits_used(), "Run completed");
        } else if run.awaiting_steps().next().is_some() {
            run.transition(RunStatus::Paused);
            self.store.save_run(run).await?;
        } else {
            let message = "No runnable steps remain".to_string();
            error!(run_id = %run.id, "{}", message);

            run.last_error = Some(RunError {
                kind: ErrorKind::StepExecution,
                message: message.clone(),
                step: None,
                attempted_providers: Vec::new(),
            });
            run.transition(RunStatus::Failed);
            self.store.save_run(run).await?;
            self.store
                .append_event(
                    &Event::for_run(run.id, EventType::RunFailed, "complete", message.clone())
                        .with_error(message),
                )
                .await?;
        }

        Ok(())
    }
}

/// One handler call with its credit reservation.
///
/// The reservation is committed with the actual cost on completion and
/// released on every other path, including unwinding.
async fn attempt_step(
    run: &mut WorkflowRun,
    step: &StepDefinition,
    input: &Value,
    handler: &dyn StepHandler,
    estimate: u64,
) -> Result<StepOutcome, StepError> {
    let reservation = run.credits.reserve(estimate)?;

    let ctx = StepContext {
        run_id: run.id,
        step,
        input,
        steps: &run.steps,
        inputs: &run.inputs,
    };
    let outcome = handler.execute(ctx).await?;

    if let StepOutcome::Completed(output) = &outcome {
        reservation.commit(output.cost);
    }

    Ok(outcome)
}

/// Only running or paused runs can be cancelled
fn check_cancellable(run: &WorkflowRun) -> Result<(), ExecutorError> {
    match run.status {
        RunStatus::Running | RunStatus::Paused => Ok(()),
        RunStatus::Pending => Err(ExecutorError::InvalidState {
            run_id: run.id,
            status: run.status,
            action: "cancel",
        }),
        status => Err(ExecutorError::RunTerminal {
            run_id: run.id,
            status,
        }),
    }
}

/// Pending steps with every dependency completed or skipped, in execution order
fn ready_steps<'d>(run: &WorkflowRun, order: &[&'d StepDefinition]) -> Vec<&'d StepDefinition> {
    order
        .iter()
        .copied()
        .filter(|step| {
            run.step(&step.id)
                .map_or(true, |s| s.status == StepStatus::Pending && s.task_id.is_none())
        })
        .filter(|step| {
            step.depends_on.iter().all(|dep| {
                matches!(
                    run.step_status(dep),
                    StepStatus::Completed | StepStatus::Skipped
                )
            })
        })
        .collect()
}

/// Why a ready step should be skipped rather than dispatched
fn skip_reason(run: &WorkflowRun, step: &StepDefinition) -> Option<String> {
    if let Some(condition) = &step.condition {
        if condition.evaluate(run.completed_output(&condition.step)) {
            return None;
        }
        return Some(format!("condition on '{}' not met", condition.step));
    }

    let all_skipped = !step.depends_on.is_empty()
        && step
            .depends_on
            .iter()
            .all(|dep| run.step_status(dep) == StepStatus::Skipped);

    all_skipped.then(|| "all dependencies skipped".to_string())
}
