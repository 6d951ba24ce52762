//! Workflow Definition Module
//!
//! Provides data structures and utilities for defining, parsing, and
//! validating analysis workflows, plus the persisted state of a run.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (StepDefinition, WorkflowDefinition)
//! - [`parser`]: YAML parsing and loading
//! - [`validator`]: Structural validation and shape estimation
//! - [`state`]: Run records and step logs

pub mod model;
pub mod parser;
pub mod state;
pub mod validator;

pub use model::{StepDefinition, WorkflowDefinition};
pub use parser::{load_workflow, parse_workflow, save_workflow};
pub use state::{LogLevel, RunError, RunStatus, StepLog, WorkflowRun};
pub use validator::{estimate_shapes, validate_workflow, ValidationError};
