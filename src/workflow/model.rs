//! Workflow Data Model
//!
//! A workflow is an ordered list of typed steps. Each step's output is the
//! next step's input; there is no branching.
//!
//! # Example YAML Format
//!
//! ```yaml
//! id: value_screen
//! name: Value screen
//! steps:
//!   - id: load
//!     type: input
//!     tickers: [AAPL, MSFT, GOOG]
//!     num_periods: 3
//!
//!   - id: analyze
//!     type: fundamental_analysis
//!     run_parallel: true
//!
//!   - id: strong
//!     type: filter
//!     field: score
//!     operator: ">"
//!     value: 50
//!
//!   - id: save
//!     type: export
//!     formats: [json, csv]
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::validator::ValidationError;
use crate::steps::{StepConfig, StepKind};

/// One step of a workflow: an id plus its typed configuration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StepDefinition {
    /// Unique identifier within the workflow; also the key of the step's
    /// persisted output
    pub id: String,

    /// Optional human-readable label
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    /// Step kind and its parameters, tagged by `type`
    #[serde(flatten)]
    pub config: StepConfig,
}

impl StepDefinition {
    /// Creates a step with the given id and configuration.
    ///
    /// # Example
    ///
    /// ```
    /// use analysisrunner::steps::{InputConfig, StepConfig};
    /// use analysisrunner::workflow::StepDefinition;
    ///
    /// let step = StepDefinition::new("load", StepConfig::Input(InputConfig::for_tickers(["AAPL"])))
    ///     .with_name("Load tickers");
    /// assert_eq!(step.id, "load");
    /// ```
    pub fn new(id: impl Into<String>, config: StepConfig) -> Self {
        Self {
            id: id.into().trim().to_string(),
            name: String::new(),
            config,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn kind(&self) -> StepKind {
        self.config.kind()
    }

    /// Label for log lines: the name if set, else the id.
    pub fn label(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// A complete workflow definition.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkflowDefinition {
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Steps in execution order
    #[serde(default)]
    pub steps: Vec<StepDefinition>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    /// Creates an empty workflow.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into().trim().to_string();
        Self {
            name: id.clone(),
            id,
            description: None,
            steps: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Creates a workflow from a list of steps.
    pub fn from_steps(id: impl Into<String>, steps: Vec<StepDefinition>) -> Self {
        let mut workflow = Self::new(id);
        workflow.steps = steps;
        workflow
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Appends a step, rejecting duplicate ids.
    pub fn add_step(&mut self, step: StepDefinition) -> Result<(), ValidationError> {
        if self.steps.iter().any(|s| s.id == step.id) {
            return Err(ValidationError::DuplicateStepId(step.id));
        }
        self.steps.push(step);
        Ok(())
    }

    /// Gets a step by ID.
    pub fn get_step(&self, id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Position of a step in execution order.
    pub fn step_index(&self, id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == id)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
