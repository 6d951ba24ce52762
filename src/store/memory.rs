//! In-memory job store.
//!
//! Nothing survives the process. Step outputs are still stored as JSON
//! text so that a round trip behaves exactly like the file store.

use std::collections::HashMap;

use indexmap::IndexMap;
use parking_lot::RwLock;

use super::JobStore;
use crate::batch::{BatchItem, BatchJob};
use crate::data::DataContainer;
use crate::error::{StoreError, StoreResult};
use crate::workflow::{StepLog, WorkflowDefinition, WorkflowRun};

/// Thread-safe in-memory [`JobStore`].
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    workflows: RwLock<HashMap<String, WorkflowDefinition>>,
    runs: RwLock<IndexMap<String, WorkflowRun>>,
    outputs: RwLock<HashMap<(String, String), String>>,
    logs: RwLock<HashMap<String, Vec<StepLog>>>,
    batches: RwLock<IndexMap<String, BatchJob>>,
    items: RwLock<HashMap<String, IndexMap<String, BatchItem>>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of runs currently stored.
    pub fn run_count(&self) -> usize {
        self.runs.read().len()
    }
}

impl JobStore for MemoryJobStore {
    fn save_workflow(&self, workflow: &WorkflowDefinition) -> StoreResult<()> {
        self.workflows
            .write()
            .insert(workflow.id.clone(), workflow.clone());
        Ok(())
    }

    fn get_workflow(&self, workflow_id: &str) -> StoreResult<Option<WorkflowDefinition>> {
        Ok(self.workflows.read().get(workflow_id).cloned())
    }

    fn create_run(&self, run: &WorkflowRun) -> StoreResult<()> {
        let mut runs = self.runs.write();
        if runs.contains_key(&run.run_id) {
            return Err(StoreError::already_exists("run", &run.run_id));
        }
        runs.insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    fn get_run(&self, run_id: &str) -> StoreResult<Option<WorkflowRun>> {
        Ok(self.runs.read().get(run_id).cloned())
    }

    fn update_run(&self, run: &WorkflowRun) -> StoreResult<()> {
        match self.runs.write().get_mut(&run.run_id) {
            Some(stored) => {
                *stored = run.clone();
                Ok(())
            }
            None => Err(StoreError::not_found("run", &run.run_id)),
        }
    }

    fn list_runs(&self, workflow_id: Option<&str>) -> StoreResult<Vec<WorkflowRun>> {
        Ok(self
            .runs
            .read()
            .values()
            .filter(|run| workflow_id.map_or(true, |id| run.workflow_id == id))
            .cloned()
            .collect())
    }

    fn save_step_output(
        &self,
        run_id: &str,
        step_id: &str,
        container: &DataContainer,
    ) -> StoreResult<()> {
        let json = container.to_json()?;
        self.outputs
            .write()
            .insert((run_id.to_string(), step_id.to_string()), json);
        Ok(())
    }

    fn load_step_output(&self, run_id: &str, step_id: &str) -> StoreResult<Option<DataContainer>> {
        let outputs = self.outputs.read();
        match outputs.get(&(run_id.to_string(), step_id.to_string())) {
            Some(json) => Ok(Some(DataContainer::from_json(json)?)),
            None => Ok(None),
        }
    }

    fn append_log(&self, log: &StepLog) -> StoreResult<()> {
        self.logs
            .write()
            .entry(log.run_id.clone())
            .or_default()
            .push(log.clone());
        Ok(())
    }

    fn logs(&self, run_id: &str) -> StoreResult<Vec<StepLog>> {
        Ok(self.logs.read().get(run_id).cloned().unwrap_or_default())
    }

    fn create_batch(&self, job: &BatchJob) -> StoreResult<()> {
        let mut batches = self.batches.write();
        if batches.contains_key(&job.batch_id) {
            return Err(StoreError::already_exists("batch", &job.batch_id));
        }
        batches.insert(job.batch_id.clone(), job.clone());
        Ok(())
    }

    fn get_batch(&self, batch_id: &str) -> StoreResult<Option<BatchJob>> {
        Ok(self.batches.read().get(batch_id).cloned())
    }

    fn update_batch(&self, job: &BatchJob) -> StoreResult<()> {
        match self.batches.write().get_mut(&job.batch_id) {
            Some(stored) => {
                *stored = job.clone();
                Ok(())
            }
            None => Err(StoreError::not_found("batch", &job.batch_id)),
        }
    }

    fn list_batches(&self) -> StoreResult<Vec<BatchJob>> {
        Ok(self.batches.read().values().cloned().collect())
    }

    fn create_items(&self, items: &[BatchItem]) -> StoreResult<()> {
        let mut all = self.items.write();
        for item in items {
            let batch = all.entry(item.batch_id.clone()).or_default();
            if batch.contains_key(&item.id) {
                return Err(StoreError::already_exists("item", &item.id));
            }
            batch.insert(item.id.clone(), item.clone());
        }
        Ok(())
    }

    fn get_item(&self, batch_id: &str, item_id: &str) -> StoreResult<Option<BatchItem>> {
        Ok(self
            .items
            .read()
            .get(batch_id)
            .and_then(|items| items.get(item_id))
            .cloned())
    }

    fn update_item(&self, item: &BatchItem) -> StoreResult<()> {
        match self
            .items
            .write()
            .get_mut(&item.batch_id)
            .and_then(|items| items.get_mut(&item.id))
        {
            Some(stored) => {
                *stored = item.clone();
                Ok(())
            }
            None => Err(StoreError::not_found("item", &item.id)),
        }
    }

    fn list_items(&self, batch_id: &str) -> StoreResult<Vec<BatchItem>> {
        let mut items: Vec<BatchItem> = self
            .items
            .read()
            .get(batch_id)
            .map(|items| items.values().cloned().collect())
            .unwrap_or_default();
        items.sort_by_key(|item| item.sequence);
        Ok(items)
    }
}
