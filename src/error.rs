//! Error Types
//!
//! Error taxonomy shared by the workflow engine, the batch queue and
//! the store implementations.
//!
//! - [`StepError`]: raised by step executors (validation, execution, cancellation)
//! - [`AnalysisError`]: raised by analysis runners, classified for retry decisions
//! - [`StoreError`]: raised by job stores
//! - [`EngineError`] / [`QueueError`]: raised by the two schedulers
//! - [`Cancelled`]: the signal produced by a cancellation check point

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::batch::BatchStatus;
use crate::workflow::validator::ValidationError;

/// Signal returned by a check point once the run's token has been raised.
///
/// Not a failure: callers convert it into a terminal `cancelled`/`stopped`
/// status instead of an error record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("run was cancelled")]
pub struct Cancelled;

/// Errors produced by a step executor.
#[derive(Debug, Error)]
pub enum StepError {
    /// Bad step configuration or unexpected input shape. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Step logic or analysis call failure. Aborts the rest of the run.
    #[error("execution failed: {0}")]
    Execution(String),

    /// The run's cancellation token was observed at a check point.
    #[error("step cancelled")]
    Cancelled,
}

impl StepError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution(message.into())
    }

    /// Short machine-readable label used in run error records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Execution(_) => "execution",
            Self::Cancelled => "cancelled",
        }
    }
}

impl From<Cancelled> for StepError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

/// Errors reported by an analysis runner.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnalysisError {
    /// Transient failure; the caller may try again.
    #[error("{0}")]
    Failed(String),

    /// Permanent failure; retrying will not help.
    #[error("{0}")]
    Fatal(String),

    /// The entity has nothing to analyze (e.g. no filings for the horizon).
    #[error("not applicable: {0}")]
    NotApplicable(String),
}

impl AnalysisError {
    /// Returns true if the batch queue may re-queue the item.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Errors produced by a [`JobStore`](crate::store::JobStore).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} '{id}' already exists")]
    AlreadyExists { kind: &'static str, id: String },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub(crate) fn already_exists(kind: &'static str, id: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind,
            id: id.into(),
        }
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors produced by the workflow engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("workflow '{0}' not found")]
    WorkflowNotFound(String),

    #[error("workflow '{0}' has no steps")]
    EmptyWorkflow(String),

    #[error("invalid workflow: {0}")]
    Invalid(#[from] ValidationError),

    #[error("run '{0}' not found")]
    RunNotFound(String),

    #[error("run '{0}' already exists; resume it explicitly to continue")]
    RunExists(String),

    #[error("resuming requires the id of a previous run")]
    MissingRunId,

    #[error("run '{0}' is already executing")]
    RunActive(String),

    #[error("run '{run_id}' belongs to workflow '{actual}', not '{expected}'")]
    WorkflowMismatch {
        run_id: String,
        expected: String,
        actual: String,
    },

    #[error("persisted output of step '{step_id}' for run '{run_id}' is missing")]
    MissingStepOutput { run_id: String, step_id: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),
}

/// Errors produced by the batch queue.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("batch '{0}' not found")]
    BatchNotFound(String),

    #[error("batch has no work items")]
    EmptyBatch,

    #[error("cannot {action} batch '{batch_id}' while it is {status}")]
    InvalidTransition {
        batch_id: String,
        action: &'static str,
        status: BatchStatus,
    },

    #[error("batch '{0}' still has a live worker; stop it before restarting")]
    WorkerBusy(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),
}
