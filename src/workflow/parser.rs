//! Workflow Parser
//!
//! Handles loading and saving workflow definitions as YAML files.

use std::error::Error;
use std::fs;
use std::path::Path;

use log::{debug, info};

use super::model::WorkflowDefinition;
use super::validator::validate_workflow;

/// Parses and validates a workflow from YAML text.
pub fn parse_workflow(yaml_content: &str) -> Result<WorkflowDefinition, Box<dyn Error>> {
    let workflow: WorkflowDefinition = serde_yaml::from_str(yaml_content)
        .map_err(|e| format!("Failed to parse workflow YAML: {}. Check the file format.", e))?;

    info!(
        "Parsed workflow '{}' with {} steps",
        workflow.id,
        workflow.steps.len()
    );

    validate_workflow(&workflow)?;
    Ok(workflow)
}

/// Loads a workflow from a YAML file.
///
/// # Example
///
/// ```rust,no_run
/// use analysisrunner::workflow::load_workflow;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let workflow = load_workflow("screen.yaml")?;
///     println!("Loaded {} steps", workflow.steps.len());
///     Ok(())
/// }
/// ```
pub fn load_workflow(path: impl AsRef<Path>) -> Result<WorkflowDefinition, Box<dyn Error>> {
    let path = path.as_ref();
    info!("Loading workflow from: {}", path.display());

    let yaml_content = fs::read_to_string(path).map_err(|e| {
        format!(
            "Failed to read workflow file '{}': {}. Check that the file exists and is readable.",
            path.display(),
            e
        )
    })?;

    debug!("YAML content loaded ({} bytes)", yaml_content.len());
    parse_workflow(&yaml_content)
}

/// Saves a workflow to a YAML file.
pub fn save_workflow(workflow: &WorkflowDefinition, path: impl AsRef<Path>) -> Result<(), Box<dyn Error>> {
    let yaml = serde_yaml::to_string(workflow)?;
    fs::write(path.as_ref(), yaml)?;
    info!("Workflow saved to: {}", path.as_ref().display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::{FilterOperator, StepConfig, StepKind};
    use tempfile::tempdir;

    const SCREEN: &str = r#"
id: value_screen
name: Value screen
steps:
  - id: load
    type: input
    tickers: [aapl, MSFT]
    periods: ["2023", "2024"]
  - id: analyze
    type: fundamental_analysis
    run_parallel: true
  - id: strong
    name: Strong scores
    type: filter
    field: metrics.score
    operator: ">="
    value: 50
  - id: save
    type: export
    formats: [json, csv]
"#;

    #[test]
    fn test_parse_workflow_valid_yaml() {
        let workflow = parse_workflow(SCREEN).unwrap();

        assert_eq!(workflow.id, "value_screen");
        assert_eq!(workflow.len(), 4);
        assert_eq!(workflow.steps[1].kind(), StepKind::FundamentalAnalysis);
        assert_eq!(workflow.steps[2].label(), "Strong scores");

        match &workflow.steps[2].config {
            StepConfig::Filter(filter) => {
                assert_eq!(filter.operator, FilterOperator::Ge);
                assert_eq!(filter.field, "metrics.score");
            }
            other => panic!("unexpected config: {:?}", other),
        }
    }

    #[test]
    fn test_parse_workflow_unknown_type() {
        let yaml = "id: wf\nsteps:\n  - id: a\n    type: teleport\n";
        assert!(parse_workflow(yaml).is_err());
    }

    #[test]
    fn test_parse_workflow_rejects_invalid_structure() {
        let yaml = "id: wf\nsteps:\n  - id: a\n    type: export\n";
        let err = parse_workflow(yaml).unwrap_err();
        assert!(err.to_string().contains("input step"));
    }

    #[test]
    fn test_load_workflow_file_not_found() {
        let result = load_workflow("/nonexistent/workflow.yaml");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Failed to read"));
    }

    #[test]
    fn test_save_and_load_workflow() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("screen.yaml");

        let workflow = parse_workflow(SCREEN).unwrap();
        save_workflow(&workflow, &path).unwrap();
        let loaded = load_workflow(&path).unwrap();

        assert_eq!(loaded, workflow);
    }
}
