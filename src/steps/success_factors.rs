//! Success-factor synthesis: reduces per-period analyses to one result per
//! company or one per year.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::{require_input, StepContext, StepExecutor, StepKind, ALL_COMPANIES, ALL_PERIODS};
use crate::analysis::{AnalysisConfig, AnalysisKind, AnalysisRequest, DEFAULT_FILING_TYPE};
use crate::data::container::context;
use crate::data::{DataContainer, Shape};
use crate::error::StepError;

/// Axis along which results are combined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateBy {
    /// One synthesis per entity across its periods
    #[default]
    Company,
    /// One synthesis per period across entities
    Year,
}

fn default_filing_type() -> String {
    DEFAULT_FILING_TYPE.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessFactorsConfig {
    #[serde(default)]
    pub aggregate_by: AggregateBy,

    #[serde(default = "default_filing_type")]
    pub filing_type: String,
}

impl Default for SuccessFactorsConfig {
    fn default() -> Self {
        Self {
            aggregate_by: AggregateBy::Company,
            filing_type: default_filing_type(),
        }
    }
}

pub struct SuccessFactorsStep<'a> {
    config: &'a SuccessFactorsConfig,
}

impl<'a> SuccessFactorsStep<'a> {
    pub fn new(config: &'a SuccessFactorsConfig) -> Self {
        Self { config }
    }

    fn analysis_config(&self) -> AnalysisConfig {
        AnalysisConfig::new(AnalysisKind::SuccessFactors).with_filing_type(&self.config.filing_type)
    }

    /// `(entity key, period key, context cells)` for every synthesis.
    fn groups(&self, input: &DataContainer) -> Vec<(String, String, Map<String, Value>)> {
        match self.config.aggregate_by {
            AggregateBy::Company => input
                .entities()
                .into_iter()
                .map(|entity| {
                    let context = input
                        .entity(entity)
                        .into_iter()
                        .flatten()
                        .filter_map(|(period, cell)| {
                            cell.as_ref().map(|p| (period.clone(), p.to_value()))
                        })
                        .collect();
                    (entity.to_string(), ALL_PERIODS.to_string(), context)
                })
                .collect(),
            AggregateBy::Year => input
                .all_periods()
                .into_iter()
                .map(|period| {
                    let context = input
                        .cells()
                        .filter(|(_, p, _)| *p == period)
                        .map(|(entity, _, payload)| (entity.to_string(), payload.to_value()))
                        .collect();
                    (ALL_COMPANIES.to_string(), period, context)
                })
                .collect(),
        }
    }
}

impl StepExecutor for SuccessFactorsStep<'_> {
    fn kind(&self) -> StepKind {
        StepKind::SuccessFactors
    }

    fn execute(
        &self,
        ctx: &StepContext<'_>,
        input: Option<DataContainer>,
    ) -> Result<DataContainer, StepError> {
        let input = require_input(StepKind::SuccessFactors, input)?;
        let groups = self.groups(&input);
        info!(
            "{}: synthesizing {} success-factor reports by {:?}",
            ctx.step_id,
            groups.len(),
            self.config.aggregate_by
        );

        let mut output = input.derive(ctx.step_id, StepKind::SuccessFactors);
        for (entity, period, cells) in groups {
            ctx.checkpoint()?;

            let (subject, scope) = match self.config.aggregate_by {
                AggregateBy::Company => (entity.clone(), None),
                AggregateBy::Year => (ALL_COMPANIES.to_string(), Some(period.clone())),
            };
            let mut request = AnalysisRequest::new(subject, self.analysis_config())
                .with_context(Value::Object(cells));
            if let Some(scope) = scope {
                request = request.for_period(scope);
            }

            match ctx.runner.run(&request) {
                Ok(outcome) => {
                    if let Some(run_id) = outcome.run_id {
                        output.add_source_run(run_id);
                    }
                    output.insert(entity, period, Some(outcome.payload));
                }
                Err(e) => {
                    warn!("{}: synthesis failed for {}/{}: {}", ctx.step_id, entity, period, e);
                    output.add_warning(
                        format!("success factors failed for {}/{}: {}", entity, period, e),
                        context([("entity", json!(entity)), ("period", json!(period))]),
                    );
                    output.insert(entity, period, None);
                }
            }
        }

        output
            .metadata
            .insert("aggregate_by".to_string(), json!(self.config.aggregate_by));
        Ok(output)
    }

    fn expected_output_shape(&self, input: Shape) -> Shape {
        match self.config.aggregate_by {
            AggregateBy::Company => Shape::new(input.entities, 1),
            AggregateBy::Year => Shape::new(1, input.periods),
        }
    }
}
