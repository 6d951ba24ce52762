//! JSON file job store.
//!
//! Layout under the root directory:
//!
//! ```text
//! workflows/{workflow_id}.json
//! runs/{run_id}.json
//! outputs/{run_id}/{step_id}.json
//! logs/{run_id}.jsonl
//! batches/{batch_id}.json
//! items/{batch_id}/{item_id}.json
//! ```
//!
//! Records are written to a temporary file and renamed into place, so a
//! crash never leaves a half-written record. Ids are percent-encoded into
//! file names.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::JobStore;
use crate::batch::{BatchItem, BatchJob};
use crate::data::DataContainer;
use crate::error::{StoreError, StoreResult};
use crate::workflow::{StepLog, WorkflowDefinition, WorkflowRun};

/// [`JobStore`] keeping one JSON file per record.
#[derive(Debug)]
pub struct FileJobStore {
    root: PathBuf,
    // Serializes check-then-write sequences (create/update) and log appends.
    write_lock: Mutex<()>,
}

/// Encodes an id as a file name: `[A-Za-z0-9_-]` pass through, every other
/// byte becomes `%XX`.
pub fn encode_id(id: &str) -> String {
    let mut encoded = String::with_capacity(id.len());
    for byte in id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{:02X}", byte));
        }
    }
    encoded
}

impl FileJobStore {
    /// Opens (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        for dir in ["workflows", "runs", "outputs", "logs", "batches", "items"] {
            let path = root.join(dir);
            fs::create_dir_all(&path).map_err(|e| StoreError::io(&path, e))?;
        }
        debug!("Opened job store at {}", root.display());
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, dir: &str, id: &str) -> PathBuf {
        self.root.join(dir).join(format!("{}.json", encode_id(id)))
    }

    fn output_path(&self, run_id: &str, step_id: &str) -> PathBuf {
        self.root
            .join("outputs")
            .join(encode_id(run_id))
            .join(format!("{}.json", encode_id(step_id)))
    }

    fn log_path(&self, run_id: &str) -> PathBuf {
        self.root.join("logs").join(format!("{}.jsonl", encode_id(run_id)))
    }

    fn item_dir(&self, batch_id: &str) -> PathBuf {
        self.root.join("items").join(encode_id(batch_id))
    }

    fn item_path(&self, batch_id: &str, item_id: &str) -> PathBuf {
        self.item_dir(batch_id)
            .join(format!("{}.json", encode_id(item_id)))
    }
}

/// Writes `contents` to `path` through a temporary file and a rename.
fn write_atomic(path: &Path, contents: &str) -> StoreResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, contents).map_err(|e| StoreError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| StoreError::io(path, e))
}

fn write_record<T: Serialize>(path: &Path, record: &T) -> StoreResult<()> {
    write_atomic(path, &serde_json::to_string_pretty(record)?)
}

fn read_record<T: DeserializeOwned>(path: &Path) -> StoreResult<Option<T>> {
    match fs::read_to_string(path) {
        Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

/// Reads every `*.json` record in a directory. A missing directory is empty.
fn read_all<T: DeserializeOwned>(dir: &Path) -> StoreResult<Vec<T>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(dir, e)),
    };

    let mut records = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| StoreError::io(dir, e))?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if let Some(record) = read_record(&path)? {
            records.push(record);
        }
    }
    Ok(records)
}

impl JobStore for FileJobStore {
    fn save_workflow(&self, workflow: &WorkflowDefinition) -> StoreResult<()> {
        write_record(&self.record_path("workflows", &workflow.id), workflow)
    }

    fn get_workflow(&self, workflow_id: &str) -> StoreResult<Option<WorkflowDefinition>> {
        read_record(&self.record_path("workflows", workflow_id))
    }

    fn create_run(&self, run: &WorkflowRun) -> StoreResult<()> {
        let _guard = self.write_lock.lock();
        let path = self.record_path("runs", &run.run_id);
        if path.exists() {
            return Err(StoreError::already_exists("run", &run.run_id));
        }
        write_record(&path, run)
    }

    fn get_run(&self, run_id: &str) -> StoreResult<Option<WorkflowRun>> {
        read_record(&self.record_path("runs", run_id))
    }

    fn update_run(&self, run: &WorkflowRun) -> StoreResult<()> {
        let _guard = self.write_lock.lock();
        let path = self.record_path("runs", &run.run_id);
        if !path.exists() {
            return Err(StoreError::not_found("run", &run.run_id));
        }
        write_record(&path, run)
    }

    fn list_runs(&self, workflow_id: Option<&str>) -> StoreResult<Vec<WorkflowRun>> {
        let mut runs: Vec<WorkflowRun> = read_all(&self.root.join("runs"))?;
        runs.retain(|run| workflow_id.map_or(true, |id| run.workflow_id == id));
        runs.sort_by_key(|run| run.created_at);
        Ok(runs)
    }

    fn save_step_output(
        &self,
        run_id: &str,
        step_id: &str,
        container: &DataContainer,
    ) -> StoreResult<()> {
        write_atomic(&self.output_path(run_id, step_id), &container.to_json()?)
    }

    fn load_step_output(&self, run_id: &str, step_id: &str) -> StoreResult<Option<DataContainer>> {
        read_record(&self.output_path(run_id, step_id))
    }

    fn append_log(&self, log: &StepLog) -> StoreResult<()> {
        let _guard = self.write_lock.lock();
        let path = self.log_path(&log.run_id);
        let mut line = serde_json::to_string(log)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;
        file.write_all(line.as_bytes())
            .map_err(|e| StoreError::io(&path, e))
    }

    fn logs(&self, run_id: &str) -> StoreResult<Vec<StepLog>> {
        let path = self.log_path(run_id);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&path, e)),
        };

        let mut logs = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str(line) {
                Ok(log) => logs.push(log),
                // A torn final line from a crash mid-append.
                Err(e) => warn!("Skipping unreadable log line in {}: {}", path.display(), e),
            }
        }
        Ok(logs)
    }

    fn create_batch(&self, job: &BatchJob) -> StoreResult<()> {
        let _guard = self.write_lock.lock();
        let path = self.record_path("batches", &job.batch_id);
        if path.exists() {
            return Err(StoreError::already_exists("batch", &job.batch_id));
        }
        write_record(&path, job)
    }

    fn get_batch(&self, batch_id: &str) -> StoreResult<Option<BatchJob>> {
        read_record(&self.record_path("batches", batch_id))
    }

    fn update_batch(&self, job: &BatchJob) -> StoreResult<()> {
        let _guard = self.write_lock.lock();
        let path = self.record_path("batches", &job.batch_id);
        if !path.exists() {
            return Err(StoreError::not_found("batch", &job.batch_id));
        }
        write_record(&path, job)
    }

    fn list_batches(&self) -> StoreResult<Vec<BatchJob>> {
        let mut batches: Vec<BatchJob> = read_all(&self.root.join("batches"))?;
        batches.sort_by_key(|job| job.created_at);
        Ok(batches)
    }

    fn create_items(&self, items: &[BatchItem]) -> StoreResult<()> {
        let _guard = self.write_lock.lock();
        for item in items {
            let path = self.item_path(&item.batch_id, &item.id);
            if path.exists() {
                return Err(StoreError::already_exists("item", &item.id));
            }
            write_record(&path, item)?;
        }
        Ok(())
    }

    fn get_item(&self, batch_id: &str, item_id: &str) -> StoreResult<Option<BatchItem>> {
        read_record(&self.item_path(batch_id, item_id))
    }

    fn update_item(&self, item: &BatchItem) -> StoreResult<()> {
        let _guard = self.write_lock.lock();
        let path = self.item_path(&item.batch_id, &item.id);
        if !path.exists() {
            return Err(StoreError::not_found("item", &item.id));
        }
        write_record(&path, item)
    }

    fn list_items(&self, batch_id: &str) -> StoreResult<Vec<BatchItem>> {
        let mut items: Vec<BatchItem> = read_all(&self.item_dir(batch_id))?;
        items.sort_by_key(|item| item.sequence);
        Ok(items)
    }
}
