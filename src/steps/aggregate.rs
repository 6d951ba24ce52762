//! Aggregate step: merges, groups or ranks cells.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::{require_input, StepContext, StepExecutor, StepKind, ALL_COMPANIES, ALL_PERIODS};
use crate::data::container::context;
use crate::data::{field, DataContainer, Payload, Shape};
use crate::error::StepError;

/// Entity key of the `merge_all` result.
pub const MERGED_ENTITY: &str = "merged";

/// Period key of the `merge_all` result.
pub const MERGED_PERIOD: &str = "all";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateMethod {
    MergeAll,
    GroupByCompany,
    GroupByYear,
    TopN,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateConfig {
    pub method: AggregateMethod,

    /// Number of cells kept by `top_n`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<usize>,

    /// Dot path of the numeric ranking field for `top_n`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score_field: Option<String>,
}

impl AggregateConfig {
    pub fn new(method: AggregateMethod) -> Self {
        Self {
            method,
            n: None,
            score_field: None,
        }
    }

    pub fn top_n(n: usize, score_field: impl Into<String>) -> Self {
        Self {
            method: AggregateMethod::TopN,
            n: Some(n),
            score_field: Some(score_field.into()),
        }
    }
}

pub struct AggregateStep<'a> {
    config: &'a AggregateConfig,
}

impl<'a> AggregateStep<'a> {
    pub fn new(config: &'a AggregateConfig) -> Self {
        Self { config }
    }

    fn merge_all(&self, input: &DataContainer, output: &mut DataContainer) {
        let items: Vec<Value> = input
            .cells()
            .map(|(entity, period, payload)| {
                json!({"entity": entity, "period": period, "payload": payload.to_value()})
            })
            .collect();
        let merged = json!({
            "items": items,
            "summary": {
                "entity_count": input.num_entities(),
                "period_count": input.all_periods().len(),
                "total_items": input.total_items(),
            },
        });
        output.insert(MERGED_ENTITY, MERGED_PERIOD, Some(Payload::plain(merged)));
    }

    fn group_by_company(&self, input: &DataContainer, output: &mut DataContainer) {
        for entity in input.entities() {
            let periods: Map<String, Value> = input
                .cells()
                .filter(|(e, _, _)| *e == entity)
                .map(|(_, period, payload)| (period.to_string(), payload.to_value()))
                .collect();
            output.insert(entity, ALL_PERIODS, Some(Payload::plain(Value::Object(periods))));
        }
    }

    fn group_by_year(&self, input: &DataContainer, output: &mut DataContainer) {
        for period in input.all_periods() {
            let entities: Map<String, Value> = input
                .cells()
                .filter(|(_, p, _)| *p == period)
                .map(|(entity, _, payload)| (entity.to_string(), payload.to_value()))
                .collect();
            output.insert(ALL_COMPANIES, period, Some(Payload::plain(Value::Object(entities))));
        }
    }

    fn top_n(
        &self,
        input: &DataContainer,
        output: &mut DataContainer,
        n: usize,
        score_field: &str,
    ) {
        let mut ranked = Vec::new();
        let mut unscored = 0;
        for (entity, period, payload) in input.cells() {
            match payload.field(score_field).and_then(field::as_number) {
                Some(score) => ranked.push((entity, period, payload, score)),
                None => unscored += 1,
            }
        }

        // sort_by is stable, so equal scores keep their input order.
        ranked.sort_by(|a, b| b.3.total_cmp(&a.3));
        ranked.truncate(n);

        let mut ranking = Vec::with_capacity(ranked.len());
        for (rank, (entity, period, payload, score)) in ranked.into_iter().enumerate() {
            output.insert(entity, period, Some(payload.clone()));
            ranking.push(json!({
                "rank": rank + 1,
                "entity": entity,
                "period": period,
                "score": score,
            }));
        }

        if unscored > 0 {
            warn!("top_n dropped {} cells without a numeric {}", unscored, score_field);
            output.add_warning(
                format!("{} cells had no numeric '{}' and were not ranked", unscored, score_field),
                context([("dropped", json!(unscored))]),
            );
        }
        output
            .metadata
            .insert("ranking".to_string(), Value::Array(ranking));
    }
}

impl StepExecutor for AggregateStep<'_> {
    fn kind(&self) -> StepKind {
        StepKind::Aggregate
    }

    fn validate_config(&self) -> Result<(), StepError> {
        if self.config.method != AggregateMethod::TopN {
            return Ok(());
        }
        match (self.config.n, self.config.score_field.as_deref()) {
            (Some(0), _) | (None, _) => Err(StepError::validation("top_n needs n of at least 1")),
            (_, None) => Err(StepError::validation("top_n needs a score_field")),
            (_, Some(field)) if field.trim().is_empty() => {
                Err(StepError::validation("top_n needs a score_field"))
            }
            _ => Ok(()),
        }
    }

    fn execute(
        &self,
        ctx: &StepContext<'_>,
        input: Option<DataContainer>,
    ) -> Result<DataContainer, StepError> {
        self.validate_config()?;
        let input = require_input(StepKind::Aggregate, input)?;
        let mut output = input.derive(ctx.step_id, StepKind::Aggregate);
        output.warnings = input.warnings.clone();

        match self.config.method {
            AggregateMethod::MergeAll => self.merge_all(&input, &mut output),
            AggregateMethod::GroupByCompany => self.group_by_company(&input, &mut output),
            AggregateMethod::GroupByYear => self.group_by_year(&input, &mut output),
            AggregateMethod::TopN => {
                let n = self.config.n.unwrap_or_default();
                let score_field = self.config.score_field.as_deref().unwrap_or_default();
                self.top_n(&input, &mut output, n, score_field);
            }
        }

        output
            .metadata
            .insert("aggregate_method".to_string(), json!(self.config.method));
        debug!(
            "{}: {:?} {} -> {}",
            ctx.step_id,
            self.config.method,
            input.shape(),
            output.shape()
        );
        Ok(output)
    }

    fn expected_output_shape(&self, input: Shape) -> Shape {
        match self.config.method {
            AggregateMethod::MergeAll => Shape::new(1, 1),
            AggregateMethod::GroupByCompany => Shape::new(input.entities, 1),
            AggregateMethod::GroupByYear => Shape::new(1, input.periods),
            AggregateMethod::TopN => {
                let n = self.config.n.unwrap_or_default();
                Shape::new(n.min(input.entities), n.min(input.periods))
            }
        }
    }
}
