//! AnalysisRunner - Resumable Analysis Workflow and Batch Scheduler
//!
//! Runs long, externally rate-limited analysis jobs: ordered workflows of
//! typed steps whose progress survives failures and restarts, and batch
//! worklists drained against a shared, periodically resetting call quota.
//!
//! # Architecture
//!
//! - [`workflow`]: workflow definitions, YAML parsing, validation, run state
//! - [`steps`]: one executor per step kind
//! - [`data`]: the entity × period container passed between steps
//! - [`execution`]: workflow engine and cooperative cancellation
//! - [`batch`]: batch jobs and the queue worker
//! - [`capacity`]: the shared call budget
//! - [`analysis`]: the analysis runner contract
//! - [`store`]: persistence of runs, outputs, logs and batches
//! - [`monitoring`]: per-run step timings
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use analysisrunner::analysis::CommandRunner;
//! use analysisrunner::execution::{CancellationRegistry, WorkflowEngine};
//! use analysisrunner::store::FileJobStore;
//! use analysisrunner::load_workflow;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let workflow = load_workflow("screen.yaml")?;
//!
//!     let engine = WorkflowEngine::new(
//!         Arc::new(FileJobStore::open(".analysisrunner")?),
//!         Arc::new(CommandRunner::new("./analyze.sh")),
//!         Arc::new(CancellationRegistry::new()),
//!     );
//!     engine.register_workflow(&workflow)?;
//!
//!     let run = engine.execute_workflow(&workflow.id, None, false)?;
//!     println!("Run {} finished: {}", run.run_id, run.status);
//!     Ok(())
//! }
//! ```

pub mod analysis;
pub mod batch;
pub mod capacity;
pub mod data;
pub mod error;
pub mod execution;
pub mod monitoring;
pub mod steps;
pub mod store;
pub mod workflow;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use batch::{BatchQueue, BatchStatus};
pub use data::DataContainer;
pub use error::{EngineError, QueueError, StepError};
pub use execution::{CancellationRegistry, WorkflowEngine};
pub use workflow::model::{StepDefinition, WorkflowDefinition};
pub use workflow::parser::load_workflow;
pub use workflow::state::{RunStatus, WorkflowRun};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "AnalysisRunner";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "AnalysisRunner");
    }

    #[test]
    fn test_module_exports_workflow() {
        let workflow = WorkflowDefinition::new("screen");
        assert!(workflow.is_empty());
        assert_eq!(workflow.name, "screen");
    }

    #[test]
    fn test_version_format() {
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert!(parts.len() >= 2, "Version should have at least major.minor");
        for part in parts {
            assert!(part.parse::<u32>().is_ok(), "Version components should be numeric");
        }
    }
}
