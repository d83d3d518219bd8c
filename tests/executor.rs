//! Workflow Executor Integration Tests
//!
//! Tests for dependency ordering, approval suspension, billing, retries,
//! cancellation and resuming from a file store.

mod common;

use std::sync::Arc;

use common::{executor, executor_with_store, image_model, router, ScriptedProvider};
use genflow::core::{ExecutorError, WorkflowValidationError};
use genflow::domain::{ErrorKind, EventType, RunStatus, StepStatus, WorkflowTask};
use genflow::store::{FileStore, MemoryStore, RunStore};
use serde_json::json;
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};

const REVIEW: &str = r#"
id: review
steps:
  - id: draft
    kind: image_generation
    model: flux
    input: "{{ inputs.prompt }}"
  - id: approve
    kind: human_approval
    depends_on: [draft]
    input:
      asset: "{{ steps.draft.output.assets.0 }}"
  - id: publish
    kind: data_transform
    depends_on: [approve]
    condition: { step: approve, path: output.approved, op: eq, value: true }
    input:
      url: "{{ steps.draft.output.assets.0 }}"
      note: "{{ steps.approve.output.note }}"
"#;

const SINGLE: &str = r#"
id: single
steps:
  - id: render
    kind: image_generation
    model: flux
    input: { prompt: "{{ inputs.prompt }}" }
    retry_policy: { max_attempts: 1 }
"#;

fn flux() -> genflow::domain::Model {
    image_model("flux", &[("alpha", 5), ("beta", 7)])
}

#[tokio::test]
async fn test_approval_pauses_then_completes() {
    let alpha = ScriptedProvider::new("alpha");
    let beta = ScriptedProvider::new("beta");
    let executor = executor(router(vec![flux()], &[&alpha, &beta]), &[REVIEW]);

    let run_id = executor
        .start_run("review", "alice", json!({"prompt": "red fox"}))
        .await
        .unwrap();
    let run = executor.advance(run_id).await.unwrap();

    assert_eq!(run.status, RunStatus::Paused);
    assert_eq!(run.step_status("draft"), StepStatus::Completed);
    assert_eq!(run.step("draft").unwrap().provider.as_deref(), Some("alpha"));
    assert!(run.step("approve").unwrap().is_awaiting_task());
    assert_eq!(run.step_status("publish"), StepStatus::Pending);
    assert_eq!(run.credits_used(), 5);

    let tasks = executor.list_pending_tasks(Some("alice")).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].run_id, run_id);
    assert_eq!(tasks[0].id, WorkflowTask::id_for(run_id, "approve"));
    assert_eq!(tasks[0].prompt, json!({"asset": alpha.asset()}));
    assert!(executor.list_pending_tasks(Some("bob")).await.unwrap().is_empty());

    let run = executor
        .complete_task(tasks[0].id, json!({"approved": true, "note": "ship it"}))
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.completed_at.is_some());
    assert_eq!(
        run.completed_output("publish"),
        Some(&json!({"url": alpha.asset(), "note": "ship it"}))
    );
    assert_eq!(run.credits_used(), 5);
    assert_eq!(alpha.calls(), 1);
    assert_eq!(beta.calls(), 0);
    assert!(executor.list_pending_tasks(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_rejection_skips_gated_step() {
    let alpha = ScriptedProvider::new("alpha");
    let executor = executor(router(vec![flux()], &[&alpha]), &[REVIEW]);

    let run_id = executor
        .start_run("review", "alice", json!({"prompt": "red fox"}))
        .await
        .unwrap();
    executor.advance(run_id).await.unwrap();

    let task_id = WorkflowTask::id_for(run_id, "approve");
    let run = executor
        .complete_task(task_id, json!({"approved": false}))
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.step_status("publish"), StepStatus::Skipped);
    assert!(run.completed_output("publish").is_none());

    let history = executor.history(run_id).await.unwrap();
    assert!(history
        .iter()
        .any(|e| e.event_type == EventType::StepSkipped
            && e.step_id.as_deref() == Some("publish")));
    assert_eq!(history.last().unwrap().event_type, EventType::RunCompleted);
}

#[tokio::test]
async fn test_task_completed_only_once() {
    let alpha = ScriptedProvider::new("alpha");
    let executor = executor(router(vec![flux()], &[&alpha]), &[REVIEW]);

    let run_id = executor
        .start_run("review", "alice", json!({"prompt": "owl"}))
        .await
        .unwrap();
    executor.advance(run_id).await.unwrap();

    let task_id = WorkflowTask::id_for(run_id, "approve");
    executor
        .complete_task(task_id, json!({"approved": true}))
        .await
        .unwrap();

    let second = executor
        .complete_task(task_id, json!({"approved": false}))
        .await;
    assert!(matches!(second, Err(ExecutorError::TaskAlreadyCompleted(id)) if id == task_id));

    let run = executor.get_run(run_id).await.unwrap();
    assert_eq!(run.step("approve").unwrap().output, Some(json!({"approved": true})));
}

#[tokio::test]
async fn test_unknown_task() {
    let alpha = ScriptedProvider::new("alpha");
    let executor = executor(router(vec![flux()], &[&alpha]), &[REVIEW]);

    let missing = uuid::Uuid::new_v4();
    let result = executor.complete_task(missing, json!(true)).await;
    assert!(matches!(result, Err(ExecutorError::TaskNotFound(id)) if id == missing));
}

#[tokio::test]
async fn test_steps_run_in_dependency_order() {
    // Authored out of order on purpose
    let workflow = r#"
id: chain
steps:
  - id: c
    kind: data_transform
    depends_on: [b]
    input: "{{ steps.b.output }}-c"
  - id: a
    kind: data_transform
    input: "{{ inputs.seed }}"
  - id: b
    kind: data_transform
    depends_on: [a]
    input: "{{ steps.a.output }}-b"
"#;
    let executor = executor(router(vec![], &[]), &[workflow]);

    let run_id = assert_ok!(executor.start_run("chain", "alice", json!({"seed": "x"})).await);
    let run = assert_ok!(executor.advance(run_id).await);

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.completed_output("c"), Some(&json!("x-b-c")));

    let started: Vec<String> = executor
        .history(run_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.event_type == EventType::StepStarted)
        .filter_map(|e| e.step_id)
        .collect();
    assert_eq!(started, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_skip_propagates_through_skipped_dependencies() {
    let workflow = r#"
id: gated
steps:
  - id: check
    kind: conditional_branch
    input: { value: "{{ inputs.score }}", op: ">=", expected: 5 }
  - id: enhance
    kind: data_transform
    depends_on: [check]
    condition: { step: check, path: result, op: eq, value: true }
    input: "enhanced"
  - id: deliver
    kind: data_transform
    depends_on: [enhance]
    input: "{{ steps.enhance.output }}"
"#;
    let executor = executor(router(vec![], &[]), &[workflow]);

    let run_id = executor
        .start_run("gated", "alice", json!({"score": 2}))
        .await
        .unwrap();
    let run = executor.advance(run_id).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(
        run.completed_output("check"),
        Some(&json!({"result": false, "value": 2}))
    );
    assert_eq!(run.step_status("enhance"), StepStatus::Skipped);
    assert_eq!(run.step_status("deliver"), StepStatus::Skipped);
}

#[tokio::test]
async fn test_loop_renders_template_per_item() {
    let workflow = r#"
id: fanout
steps:
  - id: variants
    kind: loop_over_collection
    input:
      items: "{{ inputs.styles }}"
      template: { prompt: "{{ inputs.subject }} in {{ item }}", n: "{{ index }}" }
"#;
    let executor = executor(router(vec![], &[]), &[workflow]);

    let run_id = executor
        .start_run(
            "fanout",
            "alice",
            json!({"subject": "cat", "styles": ["ink", "oil"]}),
        )
        .await
        .unwrap();
    let run = executor.advance(run_id).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(
        run.completed_output("variants"),
        Some(&json!([
            {"prompt": "cat in ink", "n": 0},
            {"prompt": "cat in oil", "n": 1}
        ]))
    );
}

#[tokio::test]
async fn test_success_charges_serving_provider_cost() {
    let alpha = ScriptedProvider::new("alpha");
    let beta = ScriptedProvider::new("beta");
    let executor = executor(router(vec![flux()], &[&alpha, &beta]), &[SINGLE]);

    alpha.fail_next(1);
    let run_id = executor
        .start_run("single", "alice", json!({"prompt": "moon"}))
        .await
        .unwrap();
    let run = executor.advance(run_id).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.step("render").unwrap().provider.as_deref(), Some("beta"));
    assert_eq!(run.step("render").unwrap().cost, 7);
    assert_eq!(run.credits_used(), 7);
    assert_eq!(run.credits.reserved(), 0);
}

#[tokio::test]
async fn test_failed_billed_step_charges_nothing() {
    let alpha = ScriptedProvider::new("alpha");
    let beta = ScriptedProvider::new("beta");
    let executor = executor(router(vec![flux()], &[&alpha, &beta]), &[SINGLE]);

    alpha.fail_next(1);
    beta.fail_next(1);
    let run_id = executor
        .start_run("single", "alice", json!({"prompt": "moon"}))
        .await
        .unwrap();
    let run = executor.advance(run_id).await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.step_status("render"), StepStatus::Failed);
    assert_eq!(run.credits_used(), 0);

    let error = run.last_error.unwrap();
    assert_eq!(error.kind, ErrorKind::AllProvidersFailed);
    assert_eq!(error.step.as_deref(), Some("render"));
    assert_eq!(
        error.attempted_providers,
        vec!["alpha".to_string(), "beta".to_string()]
    );

    let status = executor.get_status(run_id).await.unwrap();
    assert_eq!(status.status, RunStatus::Failed);
    assert_eq!(status.credits_used, 0);
}

#[tokio::test]
async fn test_insufficient_credits_fails_before_calling_out() {
    let workflow = r#"
id: budget
credit_limit: 6
steps:
  - id: render
    kind: image_generation
    model: flux
    input: "anything"
"#;
    let alpha = ScriptedProvider::new("alpha");
    let beta = ScriptedProvider::new("beta");
    let executor = executor(router(vec![flux()], &[&alpha, &beta]), &[workflow]);

    let run_id = executor.start_run("budget", "alice", json!({})).await.unwrap();
    let run = executor.advance(run_id).await.unwrap();

    // Reservation is the most expensive candidate (7)
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.last_error.as_ref().unwrap().kind, ErrorKind::InsufficientCredits);
    assert_eq!(run.credits_used(), 0);
    assert_eq!(alpha.calls(), 0);
    assert_eq!(beta.calls(), 0);
}

#[tokio::test]
async fn test_retry_then_succeed() {
    let workflow = r#"
id: flaky
steps:
  - id: render
    kind: image_generation
    model: solo
    input: "storm"
"#;
    let only = ScriptedProvider::new("only");
    let executor = executor(
        router(vec![image_model("solo", &[("only", 3)])], &[&only]),
        &[workflow],
    );

    only.fail_next(2);
    let run_id = executor.start_run("flaky", "alice", json!({})).await.unwrap();
    let run = executor.advance(run_id).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.step("render").unwrap().attempts, 3);
    assert_eq!(run.credits_used(), 3);
    assert_eq!(only.calls(), 3);
    assert_eq!(executor.router().health().get("only").consecutive_failures, 0);

    let retries = executor
        .history(run_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.event_type == EventType::StepRetrying)
        .count();
    assert_eq!(retries, 2);
}

#[tokio::test]
async fn test_cancel_paused_run_rejects_task() {
    let alpha = ScriptedProvider::new("alpha");
    let executor = executor(router(vec![flux()], &[&alpha]), &[REVIEW]);

    let run_id = executor
        .start_run("review", "alice", json!({"prompt": "owl"}))
        .await
        .unwrap();
    executor.advance(run_id).await.unwrap();

    assert_eq!(executor.cancel(run_id).await.unwrap(), RunStatus::Cancelled);
    assert_eq!(
        executor.get_status(run_id).await.unwrap().status,
        RunStatus::Cancelled
    );
    assert!(executor.list_pending_tasks(None).await.unwrap().is_empty());

    let task_id = WorkflowTask::id_for(run_id, "approve");
    let result = executor.complete_task(task_id, json!({"approved": true})).await;
    assert!(matches!(
        result,
        Err(ExecutorError::RunTerminal {
            status: RunStatus::Cancelled,
            ..
        })
    ));

    // Terminal states are absorbing
    assert!(matches!(
        executor.cancel(run_id).await,
        Err(ExecutorError::RunTerminal { .. })
    ));
    let run = executor.advance(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
}

#[tokio::test]
async fn test_cycle_rejected_without_creating_run() {
    let workflow = r#"
id: cyclic
steps:
  - { id: a, kind: data_transform, depends_on: [c] }
  - { id: b, kind: data_transform, depends_on: [a] }
  - { id: c, kind: data_transform, depends_on: [b] }
"#;
    let executor = executor(router(vec![], &[]), &[workflow]);

    let result = executor.start_run("cyclic", "alice", json!({})).await;
    match result {
        Err(ExecutorError::Validation(WorkflowValidationError::Cycle(ids))) => {
            assert_eq!(ids, vec!["a", "b", "c"]);
        }
        other => panic!("Expected cycle error, got {:?}", other),
    }
    assert!(executor.list_runs(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_definition_and_model() {
    let workflow = r#"
id: missing-model
steps:
  - { id: render, kind: video_generation, model: flux }
"#;
    let executor = executor(router(vec![flux()], &[]), &[workflow]);

    let err = assert_err!(executor.start_run("nope", "alice", json!({})).await);
    assert!(matches!(err, ExecutorError::DefinitionNotFound(id) if id == "nope"));

    let err = assert_err!(executor.start_run("missing-model", "alice", json!({})).await);
    assert!(matches!(
        err,
        ExecutorError::Validation(WorkflowValidationError::UnsupportedCapability { .. })
    ));
    assert!(executor.list_runs(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_advance_is_rejected() {
    let alpha = ScriptedProvider::new("alpha");
    let executor = executor(router(vec![flux()], &[&alpha]), &[REVIEW]);

    let run_id = executor
        .start_run("review", "alice", json!({"prompt": "owl"}))
        .await
        .unwrap();

    let lease = executor.leases().try_acquire(run_id).unwrap();
    let busy = executor.advance(run_id).await;
    assert!(matches!(busy, Err(ExecutorError::RunBusy(id)) if id == run_id));
    assert!(busy.unwrap_err().is_retryable());
    assert_eq!(alpha.calls(), 0);

    drop(lease);
    let run = executor.advance(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Paused);
}

#[tokio::test]
async fn test_resume_from_file_store_after_restart() {
    let temp = TempDir::new().unwrap();
    let alpha = ScriptedProvider::new("alpha");

    let run_id = {
        let store: Arc<dyn RunStore> = Arc::new(FileStore::new(temp.path()));
        let executor = executor_with_store(store, router(vec![flux()], &[&alpha]), &[REVIEW]);
        let run_id = executor
            .start_run("review", "alice", json!({"prompt": "heron"}))
            .await
            .unwrap();
        let run = executor.advance(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Paused);
        run_id
    };

    // Fresh process: new store handle, new executor, same directory
    let store: Arc<dyn RunStore> = Arc::new(FileStore::new(temp.path()));
    let executor = executor_with_store(store, router(vec![flux()], &[&alpha]), &[REVIEW]);

    let tasks = executor.list_pending_tasks(Some("alice")).await.unwrap();
    assert_eq!(tasks.len(), 1);

    let run = executor
        .complete_task(tasks[0].id, json!({"approved": true}))
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(
        run.completed_output("publish"),
        Some(&json!({"url": alpha.asset(), "note": null}))
    );
    // The generation step was not repeated
    assert_eq!(alpha.calls(), 1);
    assert_eq!(run.credits_used(), 5);
}

#[tokio::test]
async fn test_advance_applies_task_completed_before_crash() {
    let temp = TempDir::new().unwrap();
    let alpha = ScriptedProvider::new("alpha");
    let store: Arc<dyn RunStore> = Arc::new(FileStore::new(temp.path()));
    let executor = executor_with_store(
        store.clone(),
        router(vec![flux()], &[&alpha]),
        &[REVIEW],
    );

    let run_id = executor
        .start_run("review", "alice", json!({"prompt": "heron"}))
        .await
        .unwrap();
    executor.advance(run_id).await.unwrap();

    // Response recorded, but the process died before the run moved on
    let task_id = WorkflowTask::id_for(run_id, "approve");
    store
        .complete_task(task_id, json!({"approved": true, "note": "late"}))
        .await
        .unwrap();
    assert_eq!(
        store.load_run(run_id).await.unwrap().status,
        RunStatus::Paused
    );

    let run = executor.advance(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(
        run.completed_output("publish"),
        Some(&json!({"url": alpha.asset(), "note": "late"}))
    );
}

#[tokio::test]
async fn test_submit_runs_in_background() {
    let workflow = r#"
id: echo
steps:
  - { id: copy, kind: data_transform, input: "{{ inputs.text }}" }
"#;
    let executor = executor(router(vec![], &[]), &[workflow]);

    let run_id = executor
        .submit("echo", "alice", json!({"text": "hi"}))
        .await
        .unwrap();

    let mut status = executor.get_status(run_id).await.unwrap().status;
    for _ in 0..100 {
        if status == RunStatus::Completed {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        status = executor.get_status(run_id).await.unwrap().status;
    }
    assert_eq!(status, RunStatus::Completed);
}

const RENDER_THEN_PUBLISH: &str = r#"
id: render-publish
steps:
  - { id: render, kind: image_generation, model: flux, input: "{{ inputs.prompt }}" }
  - { id: publish, kind: data_transform, depends_on: [render], input: "{{ steps.render.output.assets.0 }}" }
"#;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_from_other_process_waits_for_running_step() {
    let temp = TempDir::new().unwrap();
    let alpha = ScriptedProvider::new("alpha");
    alpha.set_delay(std::time::Duration::from_millis(300));
    let router = router(vec![flux()], &[&alpha]);

    // Two executors with their own leases over one directory, as two processes
    let first = executor_with_store(
        Arc::new(FileStore::new(temp.path())),
        router.clone(),
        &[RENDER_THEN_PUBLISH],
    );
    let second = executor_with_store(
        Arc::new(FileStore::new(temp.path())),
        router,
        &[RENDER_THEN_PUBLISH],
    );

    let run_id = first
        .start_run("render-publish", "alice", json!({"prompt": "kite"}))
        .await
        .unwrap();
    let advancing = {
        let first = first.clone();
        tokio::spawn(async move { first.advance(run_id).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    // The second process cannot write while the first is mid-step
    let busy = second.advance(run_id).await;
    assert!(matches!(busy, Err(ExecutorError::RunBusy(id)) if id == run_id));

    assert_eq!(second.cancel(run_id).await.unwrap(), RunStatus::Cancelled);

    let run = advancing.await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    assert_eq!(run.step_status("render"), StepStatus::Completed);
    assert_eq!(run.step_status("publish"), StepStatus::Pending);

    let stored = second.get_run(run_id).await.unwrap();
    assert_eq!(stored.status, RunStatus::Cancelled);
    assert!(!second.store().cancel_requested(run_id).await.unwrap());
    assert_eq!(alpha.calls(), 1);

    // Terminal for every process
    assert!(matches!(
        first.advance(run_id).await,
        Ok(run) if run.status == RunStatus::Cancelled
    ));
}

#[tokio::test]
async fn test_cancel_reports_run_that_finished_first() {
    let alpha = ScriptedProvider::new("alpha");
    let executor = executor(router(vec![flux()], &[&alpha]), &[SINGLE]);

    let run_id = executor
        .start_run("single", "alice", json!({"prompt": "owl"}))
        .await
        .unwrap();

    let lease = executor.leases().try_acquire(run_id).unwrap();
    let cancelling = {
        let executor = executor.clone();
        tokio::spawn(async move { executor.cancel(run_id).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert!(!cancelling.is_finished());

    // The holder finishes the run without seeing the request
    let mut run = executor.get_run(run_id).await.unwrap();
    run.transition(RunStatus::Completed);
    executor.store().save_run(&run).await.unwrap();
    drop(lease);

    let result = cancelling.await.unwrap();
    assert!(matches!(
        result,
        Err(ExecutorError::RunTerminal {
            status: RunStatus::Completed,
            ..
        })
    ));
    assert_eq!(
        executor.get_status(run_id).await.unwrap().status,
        RunStatus::Completed
    );
    assert!(!executor.store().cancel_requested(run_id).await.unwrap());
}

#[tokio::test]
async fn test_complete_task_uses_definition_stored_with_run() {
    let alpha = ScriptedProvider::new("alpha");
    let router = router(vec![flux()], &[&alpha]);
    let store: Arc<dyn RunStore> = Arc::new(MemoryStore::new());

    let starter = executor_with_store(store.clone(), router.clone(), &[REVIEW]);
    let run_id = starter
        .start_run("review", "alice", json!({"prompt": "heron"}))
        .await
        .unwrap();
    starter.advance(run_id).await.unwrap();

    // Nothing registered, as when the workflow was started from a file path
    let resumer = executor_with_store(store, router, &[]);
    let run = resumer
        .complete_task(WorkflowTask::id_for(run_id, "approve"), json!({"approved": true}))
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.step_status("publish"), StepStatus::Completed);
}

#[tokio::test]
async fn test_complete_task_without_definition_changes_nothing() {
    let alpha = ScriptedProvider::new("alpha");
    let router = router(vec![flux()], &[&alpha]);
    let store: Arc<dyn RunStore> = Arc::new(MemoryStore::new());

    let starter = executor_with_store(store.clone(), router.clone(), &[REVIEW]);
    let run_id = starter
        .start_run("review", "alice", json!({"prompt": "heron"}))
        .await
        .unwrap();
    let mut run = starter.advance(run_id).await.unwrap();

    // Snapshot without its own copy of the definition
    run.definition = None;
    store.save_run(&run).await.unwrap();

    let resumer = executor_with_store(store.clone(), router, &[]);
    let task_id = WorkflowTask::id_for(run_id, "approve");
    let err = assert_err!(resumer.complete_task(task_id, json!({"approved": true})).await);
    assert!(matches!(err, ExecutorError::DefinitionNotFound(id) if id == "review"));

    assert!(store.load_task(task_id).await.unwrap().is_pending());
    let run = store.load_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Paused);
    assert!(run.step("approve").unwrap().is_awaiting_task());
    assert_eq!(resumer.list_pending_tasks(None).await.unwrap().len(), 1);
}
