//! File-backed store.
//!
//! Layout under the store root:
//!
//! ```text
//! runs/<run_id>/run.json       latest snapshot, replaced atomically
//! runs/<run_id>/events.jsonl   append-only audit log (JSONL)
//! runs/<run_id>/.lease         locked while a process mutates the run
//! runs/<run_id>/cancel         present while a cancel request is pending
//! tasks/<task_id>.json         human tasks
//! tasks/.lock                  serializes task completion
//! ```

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fs2::FileExt;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tokio::fs::{self, File};
use tokio::io::{AsyncBufReadExt, BufReader};
use uuid::Uuid;

use super::{RunStore, StoreError, StoreLease};
use crate::domain::{Event, WorkflowRun, WorkflowTask};

/// JSON files on local disk
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store under the configured home (`~/.genflow/store` or `$GENFLOW_HOME/store`)
    pub fn open_default() -> anyhow::Result<Self> {
        Ok(Self::new(crate::config::store_dir()?))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    fn run_dir(&self, id: Uuid) -> PathBuf {
        self.runs_dir().join(id.to_string())
    }

    fn run_path(&self, id: Uuid) -> PathBuf {
        self.run_dir(id).join("run.json")
    }

    fn events_path(&self, run_id: Uuid) -> PathBuf {
        self.run_dir(run_id).join("events.jsonl")
    }

    fn lease_path(&self, run_id: Uuid) -> PathBuf {
        self.run_dir(run_id).join(".lease")
    }

    fn cancel_path(&self, run_id: Uuid) -> PathBuf {
        self.run_dir(run_id).join("cancel")
    }

    fn tasks_dir(&self) -> PathBuf {
        self.root.join("tasks")
    }

    fn task_path(&self, id: Uuid) -> PathBuf {
        self.tasks_dir().join(format!("{}.json", id))
    }

    fn tasks_lock_path(&self) -> PathBuf {
        self.tasks_dir().join(".lock")
    }

    async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Run blocking file work off the async runtime
async fn blocking<T, F>(work: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| StoreError::Unavailable(format!("Store task failed: {}", e)))?
}

/// Write via a temp file in the same directory, then rename over `path`
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let dir = path
        .parent()
        .ok_or_else(|| StoreError::Unavailable(format!("No parent directory: {}", path.display())))?;
    std::fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| StoreError::Io(e.error))?;

    Ok(())
}

fn open_lock_file(path: &Path) -> Result<std::fs::File, StoreError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)?;
    Ok(file)
}

fn lock_file(path: &Path) -> Result<std::fs::File, StoreError> {
    let file = open_lock_file(path)?;
    file.lock_exclusive()?;
    Ok(file)
}

#[async_trait]
impl RunStore for FileStore {
    async fn load_run(&self, id: Uuid) -> Result<WorkflowRun, StoreError> {
        Self::read_json(&self.run_path(id))
            .await?
            .ok_or(StoreError::RunNotFound(id))
    }

    async fn save_run(&self, run: &WorkflowRun) -> Result<(), StoreError> {
        let path = self.run_path(run.id);
        let bytes = serde_json::to_vec_pretty(run)?;
        blocking(move || write_atomic(&path, &bytes)).await
    }

    async fn list_runs(&self, limit: Option<usize>) -> Result<Vec<WorkflowRun>, StoreError> {
        let runs_dir = self.runs_dir();
        if !runs_dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        let mut entries = fs::read_dir(&runs_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(id) = entry.file_name().to_str().and_then(|n| Uuid::parse_str(n).ok()) else {
                continue;
            };
            if let Some(run) = Self::read_json::<WorkflowRun>(&self.run_path(id)).await? {
                runs.push(run);
            }
        }

        runs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        if let Some(limit) = limit {
            runs.truncate(limit);
        }

        Ok(runs)
    }

    async fn create_task(&self, task: &WorkflowTask) -> Result<(), StoreError> {
        let path = self.task_path(task.id);
        let lock_path = self.tasks_lock_path();
        let bytes = serde_json::to_vec_pretty(task)?;

        blocking(move || {
            let _lock = lock_file(&lock_path)?;
            if path.exists() {
                return Ok(());
            }
            write_atomic(&path, &bytes)
        })
        .await
    }

    async fn load_task(&self, id: Uuid) -> Result<WorkflowTask, StoreError> {
        Self::read_json(&self.task_path(id))
            .await?
            .ok_or(StoreError::TaskNotFound(id))
    }

    async fn complete_task(
        &self,
        id: Uuid,
        response: serde_json::Value,
    ) -> Result<WorkflowTask, StoreError> {
        let path = self.task_path(id);
        let lock_path = self.tasks_lock_path();

        blocking(move || {
            // Check-and-set under the lock
            let _lock = lock_file(&lock_path)?;

            let bytes = match std::fs::read(&path) {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(StoreError::TaskNotFound(id))
                }
                Err(e) => return Err(e.into()),
            };
            let mut task: WorkflowTask = serde_json::from_slice(&bytes)?;

            if !task.is_pending() {
                return Err(StoreError::TaskAlreadyCompleted(id));
            }

            task.complete(response);
            write_atomic(&path, &serde_json::to_vec_pretty(&task)?)?;

            Ok(task)
        })
        .await
    }

    async fn list_tasks(&self, owner_id: Option<&str>) -> Result<Vec<WorkflowTask>, StoreError> {
        let tasks_dir = self.tasks_dir();
        if !tasks_dir.exists() {
            return Ok(Vec::new());
        }

        let mut tasks = Vec::new();
        let mut entries = fs::read_dir(&tasks_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(task) = Self::read_json::<WorkflowTask>(&path).await? {
                if task.is_pending() && owner_id.map_or(true, |owner| task.owner_id == owner) {
                    tasks.push(task);
                }
            }
        }

        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }

    async fn append_event(&self, event: &Event) -> Result<(), StoreError> {
        let path = self.events_path(event.run_id);
        let line = serde_json::to_string(event)?;

        blocking(move || {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;

            // Released when the file is dropped
            file.lock_exclusive()?;
            writeln!(file, "{}", line)?;
            file.flush()?;

            Ok(())
        })
        .await
    }

    async fn load_events(&self, run_id: Uuid) -> Result<Vec<Event>, StoreError> {
        let path = self.events_path(run_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&path).await?;
        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut events = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            events.push(serde_json::from_str(&line)?);
        }

        Ok(events)
    }

    async fn try_lease(&self, run_id: Uuid) -> Result<Option<StoreLease>, StoreError> {
        let path = self.lease_path(run_id);

        blocking(move || {
            let file = open_lock_file(&path)?;
            match file.try_lock_exclusive() {
                Ok(()) => Ok(Some(StoreLease::file(file))),
                Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                    Ok(None)
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn lease(&self, run_id: Uuid) -> Result<StoreLease, StoreError> {
        let path = self.lease_path(run_id);
        blocking(move || Ok(StoreLease::file(lock_file(&path)?))).await
    }

    async fn request_cancel(&self, run_id: Uuid) -> Result<(), StoreError> {
        let path = self.cancel_path(run_id);
        blocking(move || write_atomic(&path, b"")).await
    }

    async fn cancel_requested(&self, run_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.cancel_path(run_id).exists())
    }

    async fn clear_cancel(&self, run_id: Uuid) -> Result<bool, StoreError> {
        match fs::remove_file(self.cancel_path(run_id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Generate an idempotency key for a step
pub fn generate_idempotency_key(run_id: Uuid, step_id: &str, input: &str) -> String {
    let input_hash = hash_input(input);
    format!("{}:{}:{}", run_id, step_id, input_hash)
}

/// Hash input content (first 16 chars of SHA256)
pub fn hash_input(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..8]) // First 16 hex chars (8 bytes)
}
