//! Step Executors
//!
//! Each workflow step kind is implemented by one executor. Step
//! definitions carry a strongly typed [`StepConfig`]; the match in
//! [`StepConfig::executor`] is the registration table binding every kind
//! to its executor.
//!
//! # Step Kinds
//!
//! - [`input`]: builds the entity × period placeholder grid
//! - [`analysis`]: fundamental and perspective analysis, one call per cell
//! - [`success_factors`]: one synthesis per company or per year
//! - [`custom`]: free-form prompt over the whole container
//! - [`filter`]: keeps cells whose field satisfies a comparison
//! - [`aggregate`]: merge, group or rank cells
//! - [`export`]: writes copies of the container, passes it through

pub mod aggregate;
pub mod analysis;
pub mod custom;
pub mod export;
pub mod filter;
pub mod input;
pub mod success_factors;

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::analysis::AnalysisRunner;
use crate::data::{DataContainer, Shape};
use crate::error::{Cancelled, StepError};
use crate::execution::cancellation::CancellationToken;

pub use aggregate::{AggregateConfig, AggregateMethod, AggregateStep};
pub use analysis::{AnalysisStep, AnalysisStepConfig, PerspectiveConfig};
pub use custom::{CustomConfig, CustomStep, OutputFormat};
pub use export::{ExportConfig, ExportFormat, ExportStep};
pub use filter::{FilterConfig, FilterOperator, FilterStep};
pub use input::{InputConfig, InputStep, PeriodKind};
pub use success_factors::{AggregateBy, SuccessFactorsConfig, SuccessFactorsStep};

/// Entity key used when results are combined across companies.
pub const ALL_COMPANIES: &str = "all_companies";

/// Period key used when results are combined across periods.
pub const ALL_PERIODS: &str = "all_periods";

/// The kinds of step a workflow can contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Input,
    FundamentalAnalysis,
    SuccessFactors,
    PerspectiveAnalysis,
    CustomAnalysis,
    Filter,
    Aggregate,
    Export,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::FundamentalAnalysis => "fundamental_analysis",
            Self::SuccessFactors => "success_factors",
            Self::PerspectiveAnalysis => "perspective_analysis",
            Self::CustomAnalysis => "custom_analysis",
            Self::Filter => "filter",
            Self::Aggregate => "aggregate",
            Self::Export => "export",
        }
    }

    /// Every kind except `input` consumes the previous step's output.
    pub fn requires_input(&self) -> bool {
        !matches!(self, Self::Input)
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed configuration of a step, tagged by `type` when serialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepConfig {
    Input(InputConfig),
    FundamentalAnalysis(AnalysisStepConfig),
    SuccessFactors(SuccessFactorsConfig),
    PerspectiveAnalysis(PerspectiveConfig),
    CustomAnalysis(CustomConfig),
    Filter(FilterConfig),
    Aggregate(AggregateConfig),
    Export(ExportConfig),
}

impl StepConfig {
    pub fn kind(&self) -> StepKind {
        match self {
            Self::Input(_) => StepKind::Input,
            Self::FundamentalAnalysis(_) => StepKind::FundamentalAnalysis,
            Self::SuccessFactors(_) => StepKind::SuccessFactors,
            Self::PerspectiveAnalysis(_) => StepKind::PerspectiveAnalysis,
            Self::CustomAnalysis(_) => StepKind::CustomAnalysis,
            Self::Filter(_) => StepKind::Filter,
            Self::Aggregate(_) => StepKind::Aggregate,
            Self::Export(_) => StepKind::Export,
        }
    }

    /// Returns the executor bound to this step kind.
    pub fn executor(&self) -> Box<dyn StepExecutor + '_> {
        match self {
            Self::Input(config) => Box::new(InputStep::new(config)),
            Self::FundamentalAnalysis(config) => Box::new(AnalysisStep::fundamental(config)),
            Self::SuccessFactors(config) => Box::new(SuccessFactorsStep::new(config)),
            Self::PerspectiveAnalysis(config) => Box::new(AnalysisStep::perspective(config)),
            Self::CustomAnalysis(config) => Box::new(CustomStep::new(config)),
            Self::Filter(config) => Box::new(FilterStep::new(config)),
            Self::Aggregate(config) => Box::new(AggregateStep::new(config)),
            Self::Export(config) => Box::new(ExportStep::new(config)),
        }
    }
}

/// Everything an executor may use besides its config and input.
pub struct StepContext<'a> {
    pub run_id: &'a str,
    pub step_id: &'a str,
    pub runner: &'a dyn AnalysisRunner,
    pub token: &'a CancellationToken,
    /// Default directory for export steps
    pub export_dir: &'a Path,
    /// Upper bound on the worker pool of any parallel step
    pub max_parallel: usize,
}

impl StepContext<'_> {
    /// Cancellation check point.
    pub fn checkpoint(&self) -> Result<(), Cancelled> {
        self.token.check()
    }
}

/// One pipeline stage.
pub trait StepExecutor {
    fn kind(&self) -> StepKind;

    /// Checks the step's own configuration.
    fn validate_config(&self) -> Result<(), StepError> {
        Ok(())
    }

    /// Checks the carry-in container: `input` steps take none, every
    /// other kind requires one.
    fn validate_input(&self, input: Option<&DataContainer>) -> Result<(), StepError> {
        let kind = self.kind();
        match (kind.requires_input(), input) {
            (false, Some(_)) => Err(StepError::validation(format!(
                "{} step must start the workflow and does not accept input data",
                kind
            ))),
            (true, None) => Err(StepError::validation(format!(
                "{} step requires input data from a previous step",
                kind
            ))),
            _ => Ok(()),
        }
    }

    fn execute(
        &self,
        ctx: &StepContext<'_>,
        input: Option<DataContainer>,
    ) -> Result<DataContainer, StepError>;

    /// Estimated output shape for pre-flight planning. Not enforced.
    fn expected_output_shape(&self, input: Shape) -> Shape {
        input
    }
}

/// Unwraps the carry-in container of a step that requires one.
pub(crate) fn require_input(
    kind: StepKind,
    input: Option<DataContainer>,
) -> Result<DataContainer, StepError> {
    input.ok_or_else(|| {
        StepError::validation(format!("{} step requires input data from a previous step", kind))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_config_tagged_by_type() {
        let config: StepConfig = serde_json::from_value(json!({
            "type": "filter",
            "field": "score",
            "operator": ">",
            "value": 50
        }))
        .unwrap();

        assert_eq!(config.kind(), StepKind::Filter);
        assert_eq!(config.executor().kind(), StepKind::Filter);

        let back = serde_json::to_value(&config).unwrap();
        assert_eq!(back["type"], json!("filter"));
    }

    #[test]
    fn test_every_kind_binds_matching_executor() {
        let configs = vec![
            json!({"type": "input", "tickers": ["AAPL"]}),
            json!({"type": "fundamental_analysis"}),
            json!({"type": "success_factors"}),
            json!({"type": "perspective_analysis", "perspective": "value"}),
            json!({"type": "custom_analysis", "prompt_template": "Summarize {data}"}),
            json!({"type": "filter", "field": "x", "operator": "==", "value": 1}),
            json!({"type": "aggregate", "method": "merge_all"}),
            json!({"type": "export"}),
        ];

        for value in configs {
            let config: StepConfig = serde_json::from_value(value).unwrap();
            assert_eq!(config.executor().kind(), config.kind());
        }
    }

    #[test]
    fn test_default_input_validation() {
        let input = StepConfig::Input(InputConfig::for_tickers(["AAPL"]));
        let filter: StepConfig = serde_json::from_value(json!({
            "type": "filter", "field": "x", "operator": ">", "value": 1
        }))
        .unwrap();
        let container = DataContainer::new("s", StepKind::Input);

        assert!(input.executor().validate_input(None).is_ok());
        assert!(matches!(
            input.executor().validate_input(Some(&container)),
            Err(StepError::Validation(_))
        ));
        assert!(filter.executor().validate_input(Some(&container)).is_ok());
        assert!(matches!(
            filter.executor().validate_input(None),
            Err(StepError::Validation(_))
        ));
    }

    #[test]
    fn test_step_kind_labels() {
        assert_eq!(StepKind::PerspectiveAnalysis.to_string(), "perspective_analysis");
        assert!(!StepKind::Input.requires_input());
        assert!(StepKind::Export.requires_input());
    }
}
