//! Command-line interface for genflow.
//!
//! Provides commands for starting workflow runs, checking status, listing
//! runs, resuming and cancelling runs, and answering human tasks.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::config;
use crate::core::{
    DefinitionRegistry, HealthTracker, ModelRegistry, ProviderRegistry, ProviderRouter,
    WorkflowDefinition, WorkflowExecutor,
};
use crate::domain::{RunStatus, StepStatus, WorkflowRun};
use crate::providers::HttpProvider;
use crate::store::{FileStore, RunStore};

/// genflow - Generation provider router and workflow executor
#[derive(Parser, Debug)]
#[command(name = "genflow")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a workflow run and drive it until it finishes or pauses
    Run {
        /// Workflow id (from the workflows directory) or path to a YAML file
        workflow: String,

        /// JSON file with the run inputs
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Owner of the run
        #[arg(long, env = "GENFLOW_OWNER", default_value = "local")]
        owner: String,
    },

    /// Check the status of a run
    Status {
        /// Run ID (UUID)
        run_id: String,
    },

    /// List recent runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Advance a run again (after a crash or restart)
    Resume {
        /// Run ID to resume
        run_id: String,
    },

    /// Cancel a running or paused run
    Cancel {
        /// Run ID to cancel
        run_id: String,
    },

    /// List pending human tasks
    Tasks {
        /// Only tasks of this owner
        #[arg(long)]
        owner: Option<String>,
    },

    /// Complete a human task and resume its run
    Complete {
        /// Task ID (UUID)
        task_id: String,

        /// Response as JSON (plain text is sent as a string)
        #[arg(short, long)]
        response: String,
    },

    /// Show the event log of a run
    History {
        /// Run ID (UUID)
        run_id: String,
    },

    /// List configured models
    Models,

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run {
                workflow,
                input,
                owner,
            } => run_workflow(&workflow, input, &owner).await,
            Commands::Status { run_id } => show_status(&run_id).await,
            Commands::Runs { limit } => list_runs(limit).await,
            Commands::Resume { run_id } => resume_run(&run_id).await,
            Commands::Cancel { run_id } => cancel_run(&run_id).await,
            Commands::Tasks { owner } => list_tasks(owner.as_deref()).await,
            Commands::Complete { task_id, response } => complete_task(&task_id, &response).await,
            Commands::History { run_id } => show_history(&run_id).await,
            Commands::Models => list_models(),
            Commands::Config => show_config(),
        }
    }
}

/// Wire the executor from configuration
fn build_executor() -> Result<WorkflowExecutor> {
    let cfg = config::config()?;

    let models = if cfg.models.exists() {
        ModelRegistry::from_file(&cfg.models)?
    } else {
        ModelRegistry::new()
    };

    let mut providers = ProviderRegistry::new();
    for provider in &cfg.providers {
        providers.register(Arc::new(HttpProvider::new(provider.clone())));
    }

    let health = Arc::new(HealthTracker::new(cfg.router.clone()));
    let router = Arc::new(ProviderRouter::new(Arc::new(models), providers, health));

    let definitions = Arc::new(DefinitionRegistry::new());
    definitions.load_dir(&cfg.workflows)?;

    let store: Arc<dyn RunStore> = Arc::new(FileStore::open_default()?);

    Ok(WorkflowExecutor::new(store, definitions, router).with_config(cfg.executor.clone()))
}

fn parse_id(kind: &str, id: &str) -> Result<Uuid> {
    Uuid::parse_str(id).with_context(|| format!("Invalid {} ID: {}", kind, id))
}

/// Resolve a workflow argument to a registered definition id
fn resolve_workflow(executor: &WorkflowExecutor, workflow: &str) -> Result<String> {
    if executor.definitions().get(workflow).is_some() {
        return Ok(workflow.to_string());
    }

    let path = Path::new(workflow);
    if path.exists() {
        let definition = WorkflowDefinition::from_file(path)?;
        let id = definition.id.clone();
        executor.definitions().register(definition);
        return Ok(id);
    }

    anyhow::bail!(
        "Workflow '{}' not found. Known workflows: {}",
        workflow,
        executor.definitions().list().join(", ")
    )
}

/// Start a run and drive it
async fn run_workflow(workflow: &str, input_file: Option<PathBuf>, owner: &str) -> Result<()> {
    let executor = build_executor()?;
    let definition_id = resolve_workflow(&executor, workflow)?;

    let inputs = match input_file {
        Some(path) => {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read input file: {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Input file is not valid JSON: {}", path.display()))?
        }
        None => serde_json::json!({}),
    };

    let run_id = executor.start_run(&definition_id, owner, inputs).await?;
    let run = executor.advance(run_id).await?;

    report_run(&executor, &run).await
}

/// Print where a run ended up; exit non-zero on failure
async fn report_run(executor: &WorkflowExecutor, run: &WorkflowRun) -> Result<()> {
    match run.status {
        RunStatus::Completed => {
            println!("{}", serde_json::to_string_pretty(&step_outputs(run))?);
            eprintln!(
                "\n[Run {} completed, {} credits used]",
                run.id,
                run.credits_used()
            );
        }
        RunStatus::Paused => {
            eprintln!("\n[Run {} paused, waiting on:]", run.id);
            for task in executor.list_pending_tasks(Some(&run.owner_id)).await? {
                if task.run_id == run.id {
                    eprintln!("  task {} (step '{}')", task.id, task.step_id);
                }
            }
        }
        RunStatus::Failed => {
            let message = run
                .last_error
                .as_ref()
                .map(|e| e.message.clone())
                .unwrap_or_default();
            eprintln!("\n[Run {} failed: {}]", run.id, message);
            std::process::exit(1);
        }
        status => {
            eprintln!("\n[Run {} is {}]", run.id, status);
        }
    }

    Ok(())
}

/// Outputs of completed steps keyed by step id
fn step_outputs(run: &WorkflowRun) -> serde_json::Map<String, serde_json::Value> {
    run.steps
        .iter()
        .filter(|(_, s)| s.status == StepStatus::Completed)
        .map(|(id, s)| (id.clone(), s.output.clone().unwrap_or(serde_json::Value::Null)))
        .collect()
}

/// Show the status of a run
async fn show_status(run_id_str: &str) -> Result<()> {
    let run_id = parse_id("run", run_id_str)?;
    let executor = build_executor()?;
    let status = executor.get_status(run_id).await?;

    println!("Run ID: {}", status.run_id);
    println!("Workflow: {}", status.definition_id);
    println!("Status: {}", status.status);
    println!("Credits used: {}", status.credits_used);
    if let Some(error) = &status.last_error {
        println!("Last error: {:?}: {}", error.kind, error.message);
        if !error.attempted_providers.is_empty() {
            println!("Attempted providers: {}", error.attempted_providers.join(", "));
        }
    }
    println!("\nSteps:");
    for (step, state) in &status.steps {
        let provider = state.provider.as_deref().unwrap_or("-");
        let waiting = if state.is_awaiting_task() { " (awaiting task)" } else { "" };
        println!(
            "  {:<20} {:<10} provider={} cost={}{}",
            step,
            format!("{:?}", state.status),
            provider,
            state.cost,
            waiting
        );
    }

    Ok(())
}

/// List recent runs
async fn list_runs(limit: usize) -> Result<()> {
    let executor = build_executor()?;
    let runs = executor.list_runs(Some(limit)).await?;

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    println!("{:<38} {:<20} {:<10} {:>8}", "RUN ID", "WORKFLOW", "STATUS", "CREDITS");
    println!("{}", "-".repeat(79));

    for run in runs {
        println!(
            "{:<38} {:<20} {:<10} {:>8}",
            run.id,
            run.definition_id,
            run.status.as_str(),
            run.credits_used()
        );
    }

    Ok(())
}

/// Advance a run from its stored state
async fn resume_run(run_id_str: &str) -> Result<()> {
    let run_id = parse_id("run", run_id_str)?;
    let executor = build_executor()?;
    let run = executor.advance(run_id).await?;

    report_run(&executor, &run).await
}

async fn cancel_run(run_id_str: &str) -> Result<()> {
    let run_id = parse_id("run", run_id_str)?;
    let executor = build_executor()?;
    let status = executor.cancel(run_id).await?;

    println!("Run {} {}", run_id, status);
    Ok(())
}

async fn list_tasks(owner: Option<&str>) -> Result<()> {
    let executor = build_executor()?;
    let tasks = executor.list_pending_tasks(owner).await?;

    if tasks.is_empty() {
        println!("No pending tasks");
        return Ok(());
    }

    for task in tasks {
        println!("Task {} (run {}, step '{}')", task.id, task.run_id, task.step_id);
        println!("  {}", serde_json::to_string(&task.prompt)?);
    }

    Ok(())
}

async fn complete_task(task_id_str: &str, response: &str) -> Result<()> {
    let task_id = parse_id("task", task_id_str)?;
    let response = serde_json::from_str(response)
        .unwrap_or_else(|_| serde_json::Value::String(response.to_string()));

    let executor = build_executor()?;
    let run = executor.complete_task(task_id, response).await?;

    report_run(&executor, &run).await
}

async fn show_history(run_id_str: &str) -> Result<()> {
    let run_id = parse_id("run", run_id_str)?;
    let executor = build_executor()?;

    for event in executor.history(run_id).await? {
        let step = event.step_id.as_deref().unwrap_or("-");
        print!(
            "{} {:<16} {:<12} {}",
            event.timestamp.format("%Y-%m-%d %H:%M:%S"),
            format!("{:?}", event.event_type),
            step,
            event.payload_summary
        );
        if let Some(error) = &event.error {
            print!(" [error: {}]", error);
        }
        println!();
    }

    Ok(())
}

fn list_models() -> Result<()> {
    let cfg = config::config()?;
    if !cfg.models.exists() {
        println!("No model catalog at {}", cfg.models.display());
        return Ok(());
    }

    let registry = ModelRegistry::from_file(&cfg.models)?;
    println!("{:<24} {:<10} {:<30} {:>6}", "MODEL", "TYPE", "PROVIDERS", "MAX");
    println!("{}", "-".repeat(73));

    for model in registry.models() {
        println!(
            "{:<24} {:<10} {:<30} {:>6}",
            model.id,
            format!("{:?}", model.model_type).to_lowercase(),
            model.candidate_order().join(" > "),
            model.estimated_cost()
        );
    }

    Ok(())
}

fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("genflow configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home (engine state): {}", cfg.home.display());
    println!("  Store:               {}", config::store_dir()?.display());
    println!("  Workflows:           {}", cfg.workflows.display());
    println!("  Models:              {}", cfg.models.display());
    println!();
    println!("Router:");
    println!("  Failure threshold: {}", cfg.router.failure_threshold);
    println!(
        "  Cooldown:          {}ms x{} (max {}ms)",
        cfg.router.cooldown_base_ms, cfg.router.cooldown_multiplier, cfg.router.cooldown_max_ms
    );
    println!();
    println!("Default step retry:");
    println!("  Max attempts:  {}", cfg.executor.retry.max_attempts);
    println!("  Initial delay: {}ms", cfg.executor.retry.initial_delay_ms);
    println!();
    println!("Providers:");
    if cfg.providers.is_empty() {
        println!("  (none configured)");
    }
    for provider in &cfg.providers {
        println!("  {}: {}", provider.id, provider.base_url);
    }

    Ok(())
}
