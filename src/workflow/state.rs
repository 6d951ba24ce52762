//! Workflow Run State
//!
//! A [`WorkflowRun`] records how far a run of a workflow definition has
//! progressed. The engine persists it after every completed step, so a
//! resumed run continues exactly after `last_successful_step`.
//!
//! All transitions go through methods that keep `current_step_index`
//! monotonically non-decreasing and never above `total_steps`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error record attached to a failed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunError {
    pub step_id: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub context: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// A persisted log line of one step of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepLog {
    pub run_id: String,
    pub step_id: String,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl StepLog {
    pub fn new(
        run_id: impl Into<String>,
        step_id: impl Into<String>,
        level: LogLevel,
        message: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            step_id: step_id.into(),
            level,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Persistent state of one execution of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub run_id: String,
    pub workflow_id: String,
    pub status: RunStatus,

    /// Index of the next step to execute
    pub current_step_index: usize,
    pub total_steps: usize,

    /// Id of the last step whose output was persisted
    #[serde(default)]
    pub last_successful_step: Option<String>,

    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub errors: Vec<RunError>,
}

impl WorkflowRun {
    /// Creates a pending run with a fresh id.
    pub fn new(workflow_id: impl Into<String>, total_steps: usize) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), workflow_id, total_steps)
    }

    pub fn with_id(
        run_id: impl Into<String>,
        workflow_id: impl Into<String>,
        total_steps: usize,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            workflow_id: workflow_id.into(),
            status: RunStatus::Pending,
            current_step_index: 0,
            total_steps,
            last_successful_step: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            errors: Vec::new(),
        }
    }

    /// Moves the run to `running`.
    pub fn begin(&mut self) {
        self.status = RunStatus::Running;
        self.started_at.get_or_insert_with(Utc::now);
        self.completed_at = None;
    }

    /// Records that the step at `index` finished and its output is stored.
    pub fn mark_step_completed(&mut self, step_id: &str, index: usize) {
        self.last_successful_step = Some(step_id.to_string());
        let next = (index + 1).min(self.total_steps);
        self.current_step_index = self.current_step_index.max(next);
    }

    pub fn mark_failed(
        &mut self,
        step_id: impl Into<String>,
        message: impl Into<String>,
        context: Map<String, Value>,
    ) {
        self.errors.push(RunError {
            step_id: step_id.into(),
            message: message.into(),
            context,
            timestamp: Utc::now(),
        });
        self.status = RunStatus::Failed;
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_cancelled(&mut self) {
        self.status = RunStatus::Cancelled;
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_completed(&mut self) {
        self.status = RunStatus::Completed;
        self.current_step_index = self.total_steps;
        self.completed_at = Some(Utc::now());
    }

    /// Reopens a failed, cancelled or interrupted run and returns the index
    /// of the first step still to execute.
    pub fn prepare_resume(&mut self) -> usize {
        self.begin();
        self.current_step_index
    }

    /// Returns true if some step output of this run has been persisted.
    pub fn is_resume(&self) -> bool {
        self.current_step_index > 0 || self.last_successful_step.is_some()
    }

    /// Fraction of steps completed, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        if self.total_steps == 0 {
            return 1.0;
        }
        self.current_step_index as f64 / self.total_steps as f64
    }

    pub fn last_error(&self) -> Option<&RunError> {
        self.errors.last()
    }
}
