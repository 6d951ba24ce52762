//! Workflow Execution Module
//!
//! Runs workflow definitions step by step with persisted, resumable
//! progress, and provides cooperative cancellation for every long-running
//! worker in the crate.
//!
//! # Architecture
//!
//! - [`engine`]: the workflow engine driving one run per worker
//! - [`cancellation`]: per-run cancellation tokens and their registry

pub mod cancellation;
pub mod engine;

pub use cancellation::{CancellationRegistry, CancellationToken};
pub use engine::{EngineConfig, WorkflowEngine, DEFAULT_EXPORT_DIR, DEFAULT_MAX_WORKERS};
