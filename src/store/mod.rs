//! Job Store
//!
//! The [`JobStore`] trait is the persistence layer for workflow
//! definitions, runs, step outputs, step logs, batch jobs and batch items.
//! Persisted records are the only durable state of the crate.
//!
//! ## Guarantees
//!
//! - Single-record writes are atomic: a reader sees the old or the new
//!   record, never a partial one
//! - No multi-record transactions; callers order their writes so that a
//!   crash leaves the store at "last completed step/item"
//! - `create_*` fails if the record exists, `update_*` if it does not
//!
//! ## Implementations
//!
//! - [`MemoryJobStore`]: in-process maps, for tests and dry runs
//! - [`FileJobStore`]: one JSON file per record under a root directory

pub mod file;
pub mod memory;

use crate::batch::{BatchItem, BatchJob, ItemCounts, ItemStatus};
use crate::data::DataContainer;
use crate::error::StoreResult;
use crate::workflow::{StepLog, WorkflowDefinition, WorkflowRun};

pub use file::{encode_id, FileJobStore};
pub use memory::MemoryJobStore;

/// Storage abstraction for runs, jobs and their outputs.
///
/// All methods take `&self`; implementations synchronize internally so a
/// store can be shared between worker threads behind an `Arc`.
pub trait JobStore: Send + Sync {
    // --- Workflow definitions ---

    /// Saves a workflow definition (insert or replace).
    fn save_workflow(&self, workflow: &WorkflowDefinition) -> StoreResult<()>;

    fn get_workflow(&self, workflow_id: &str) -> StoreResult<Option<WorkflowDefinition>>;

    // --- Runs ---

    fn create_run(&self, run: &WorkflowRun) -> StoreResult<()>;

    fn get_run(&self, run_id: &str) -> StoreResult<Option<WorkflowRun>>;

    fn update_run(&self, run: &WorkflowRun) -> StoreResult<()>;

    /// Runs ordered by creation time, optionally for one workflow only.
    fn list_runs(&self, workflow_id: Option<&str>) -> StoreResult<Vec<WorkflowRun>>;

    // --- Step outputs ---

    /// Persists the output container of a step, replacing any previous one.
    fn save_step_output(
        &self,
        run_id: &str,
        step_id: &str,
        container: &DataContainer,
    ) -> StoreResult<()>;

    fn load_step_output(&self, run_id: &str, step_id: &str) -> StoreResult<Option<DataContainer>>;

    // --- Step logs ---

    fn append_log(&self, log: &StepLog) -> StoreResult<()>;

    /// Logs of a run in append order.
    fn logs(&self, run_id: &str) -> StoreResult<Vec<StepLog>>;

    // --- Batch jobs ---

    fn create_batch(&self, job: &BatchJob) -> StoreResult<()>;

    fn get_batch(&self, batch_id: &str) -> StoreResult<Option<BatchJob>>;

    fn update_batch(&self, job: &BatchJob) -> StoreResult<()>;

    /// Jobs ordered by creation time.
    fn list_batches(&self) -> StoreResult<Vec<BatchJob>>;

    // --- Batch items ---

    fn create_items(&self, items: &[BatchItem]) -> StoreResult<()>;

    fn get_item(&self, batch_id: &str, item_id: &str) -> StoreResult<Option<BatchItem>>;

    fn update_item(&self, item: &BatchItem) -> StoreResult<()>;

    /// Items of a batch ordered by `sequence`.
    fn list_items(&self, batch_id: &str) -> StoreResult<Vec<BatchItem>>;

    /// Oldest pending item of a batch.
    fn next_pending_item(&self, batch_id: &str) -> StoreResult<Option<BatchItem>> {
        Ok(self
            .list_items(batch_id)?
            .into_iter()
            .find(|item| item.status == ItemStatus::Pending))
    }

    fn item_counts(&self, batch_id: &str) -> StoreResult<ItemCounts> {
        Ok(ItemCounts::from_items(&self.list_items(batch_id)?))
    }
}
