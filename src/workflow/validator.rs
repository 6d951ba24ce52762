//! Workflow Validation
//!
//! Structural checks run before a workflow is registered:
//! - Workflow has an id and at least one step
//! - Step ids are non-blank and unique
//! - The first step is an `input` step, and no other step is
//! - Each step's own configuration is valid

use std::collections::HashSet;

use log::{debug, info};
use thiserror::Error;

use super::model::{StepDefinition, WorkflowDefinition};
use crate::data::Shape;
use crate::steps::StepKind;

/// Validation error types for user-friendly error messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Workflow has no steps")]
    EmptyWorkflow,

    #[error("Workflow has an empty id")]
    EmptyWorkflowId,

    #[error("Duplicate step ID: '{0}'")]
    DuplicateStepId(String),

    #[error("Step at position {0} has empty or whitespace-only ID")]
    EmptyStepId(usize),

    #[error("Workflow must start with an input step, but '{0}' is {1}")]
    MissingInput(String, StepKind),

    #[error("Step '{0}' is an input step but is not the first step")]
    MisplacedInput(String),

    #[error("Step '{step}': {message}")]
    InvalidStepConfig { step: String, message: String },

    #[error("{}", join_errors(.0))]
    Multiple(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Validates a single step's fields and configuration.
fn validate_step(index: usize, step: &StepDefinition) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if step.id.trim().is_empty() {
        errors.push(ValidationError::EmptyStepId(index));
        return errors;
    }

    match (index, step.kind()) {
        (0, StepKind::Input) => {}
        (0, kind) => errors.push(ValidationError::MissingInput(step.id.clone(), kind)),
        (_, StepKind::Input) => errors.push(ValidationError::MisplacedInput(step.id.clone())),
        _ => {}
    }

    if let Err(e) = step.config.executor().validate_config() {
        errors.push(ValidationError::InvalidStepConfig {
            step: step.id.clone(),
            message: e.to_string(),
        });
    }

    errors
}

/// Validates the entire workflow structure.
///
/// All problems are collected; more than one is reported as
/// [`ValidationError::Multiple`].
pub fn validate_workflow(workflow: &WorkflowDefinition) -> Result<(), ValidationError> {
    info!(
        "Validating workflow '{}' with {} steps",
        workflow.id,
        workflow.steps.len()
    );

    if workflow.id.trim().is_empty() {
        return Err(ValidationError::EmptyWorkflowId);
    }
    if workflow.steps.is_empty() {
        return Err(ValidationError::EmptyWorkflow);
    }

    let mut all_errors = Vec::new();
    let mut seen_ids: HashSet<&str> = HashSet::new();
    for (index, step) in workflow.steps.iter().enumerate() {
        if !step.id.trim().is_empty() && !seen_ids.insert(step.id.as_str()) {
            all_errors.push(ValidationError::DuplicateStepId(step.id.clone()));
        }
        all_errors.extend(validate_step(index, step));
    }

    match all_errors.len() {
        0 => {
            debug!(
                "Step order: {:?}",
                workflow.steps.iter().map(|s| &s.id).collect::<Vec<_>>()
            );
            Ok(())
        }
        1 => Err(all_errors.remove(0)),
        _ => Err(ValidationError::Multiple(all_errors)),
    }
}

/// Quick validation that returns a list of error messages.
pub fn quick_validate(workflow: &WorkflowDefinition) -> Vec<String> {
    match validate_workflow(workflow) {
        Ok(()) => Vec::new(),
        Err(ValidationError::Multiple(errors)) => errors.iter().map(ToString::to_string).collect(),
        Err(e) => vec![e.to_string()],
    }
}

/// Chains each step's expected output shape, starting from an empty grid.
///
/// Returns `(step id, estimated shape)` in execution order. Estimates only:
/// filters, failed units and ranking may produce smaller grids.
pub fn estimate_shapes(workflow: &WorkflowDefinition) -> Vec<(String, Shape)> {
    let mut shape = Shape::default();
    workflow
        .steps
        .iter()
        .map(|step| {
            shape = step.config.executor().expected_output_shape(shape);
            (step.id.clone(), shape)
        })
        .collect()
}
