//! Filter step: keeps the cells whose field satisfies a comparison.
//!
//! Comparison order:
//!
//! 1. `contains` is always a case-insensitive substring test.
//! 2. Every other operator first compares numerically, with both operands
//!    cast to `f64`.
//! 3. If a cast fails, `==` and `!=` fall back to string equality; the
//!    ordering operators do not match.
//!
//! Cells whose field is missing (or that are still placeholders) are
//! dropped, and entities left without cells are removed.

use std::fmt;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::{require_input, StepContext, StepExecutor, StepKind};
use crate::data::field;
use crate::data::{DataContainer, Payload};
use crate::error::StepError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOperator {
    #[serde(rename = ">", alias = "gt")]
    Gt,
    #[serde(rename = ">=", alias = "ge")]
    Ge,
    #[serde(rename = "<", alias = "lt")]
    Lt,
    #[serde(rename = "<=", alias = "le")]
    Le,
    #[serde(rename = "==", alias = "eq")]
    Eq,
    #[serde(rename = "!=", alias = "ne")]
    Ne,
    #[serde(rename = "contains")]
    Contains,
}

impl FilterOperator {
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Contains => "contains",
        }
    }

    /// Applies the operator to `actual` (from the cell) and `expected`
    /// (from the config).
    pub fn matches(&self, actual: &Value, expected: &Value) -> bool {
        if *self == Self::Contains {
            return field::as_text(actual)
                .to_lowercase()
                .contains(&field::as_text(expected).to_lowercase());
        }

        match (field::as_number(actual), field::as_number(expected)) {
            (Some(a), Some(b)) => match self {
                Self::Gt => a > b,
                Self::Ge => a >= b,
                Self::Lt => a < b,
                Self::Le => a <= b,
                Self::Eq => a == b,
                Self::Ne => a != b,
                Self::Contains => false,
            },
            _ => match self {
                Self::Eq => field::as_text(actual) == field::as_text(expected),
                Self::Ne => field::as_text(actual) != field::as_text(expected),
                _ => false,
            },
        }
    }
}

impl fmt::Display for FilterOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Dot path into the payload, e.g. `metrics.score`
    pub field: String,
    pub operator: FilterOperator,
    pub value: Value,
}

pub struct FilterStep<'a> {
    config: &'a FilterConfig,
}

impl<'a> FilterStep<'a> {
    pub fn new(config: &'a FilterConfig) -> Self {
        Self { config }
    }

    fn keep(&self, payload: Option<&Payload>) -> bool {
        payload
            .and_then(|p| p.field(&self.config.field))
            .filter(|value| !value.is_null())
            .is_some_and(|value| self.config.operator.matches(value, &self.config.value))
    }
}

impl StepExecutor for FilterStep<'_> {
    fn kind(&self) -> StepKind {
        StepKind::Filter
    }

    fn validate_config(&self) -> Result<(), StepError> {
        if self.config.field.trim().is_empty() {
            return Err(StepError::validation("filter step needs a field path"));
        }
        if self.config.value.is_null() {
            return Err(StepError::validation("filter step needs a comparison value"));
        }
        Ok(())
    }

    fn execute(
        &self,
        ctx: &StepContext<'_>,
        input: Option<DataContainer>,
    ) -> Result<DataContainer, StepError> {
        self.validate_config()?;
        let mut output = require_input(StepKind::Filter, input)?;
        output.step_id = ctx.step_id.to_string();
        output.step_type = StepKind::Filter;

        let before = output.total_slots();
        let removed = output.retain_cells(|_, _, payload| self.keep(payload));
        debug!(
            "{}: {} {} {} kept {} of {} cells",
            ctx.step_id,
            self.config.field,
            self.config.operator,
            self.config.value,
            before - removed,
            before
        );

        if output.is_empty() {
            warn!("{}: filter removed all data", ctx.step_id);
            output.add_warning(
                format!(
                    "filter {} {} {} removed all data",
                    self.config.field, self.config.operator, self.config.value
                ),
                Map::new(),
            );
        }

        output.metadata.insert(
            "filter".to_string(),
            json!({
                "field": self.config.field,
                "operator": self.config.operator,
                "value": self.config.value,
            }),
        );
        output
            .metadata
            .insert("removed_items".to_string(), json!(removed));
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::DryRunRunner;
    use crate::testing::{scored, StepHarness};

    fn config(field: &str, operator: FilterOperator, value: Value) -> FilterConfig {
        FilterConfig {
            field: field.to_string(),
            operator,
            value,
        }
    }

    fn apply(config: &FilterConfig, input: DataContainer) -> DataContainer {
        let harness = StepHarness::new();
        FilterStep::new(config)
            .execute(&harness.ctx(&DryRunRunner::new()), Some(input))
            .unwrap()
    }

    #[test]
    fn test_score_threshold_keeps_matching_entities() {
        let input = scored("score", &[("A", 80.0), ("B", 40.0), ("C", 60.0)]);
        let output = apply(&config("score", FilterOperator::Gt, json!(50)), input);

        assert_eq!(output.total_items(), 2);
        assert_eq!(output.entities(), vec!["A", "C"]);
        assert!(!output.contains_entity("B"));
        assert_eq!(output.metadata["removed_items"], json!(1));
        assert!(output.warnings.is_empty());
    }

    #[test]
    fn test_numeric_strings_compare_numerically() {
        let op = FilterOperator::Ge;
        assert!(op.matches(&json!("10"), &json!(9)));
        assert!(!FilterOperator::Lt.matches(&json!("10"), &json!("9")));
    }

    #[test]
    fn test_string_fallbacks() {
        assert!(FilterOperator::Eq.matches(&json!("Tech"), &json!("Tech")));
        assert!(!FilterOperator::Eq.matches(&json!("Tech"), &json!("tech")));
        assert!(FilterOperator::Ne.matches(&json!("Tech"), &json!("Energy")));
        assert!(FilterOperator::Contains.matches(&json!("Information Technology"), &json!("TECH")));
        assert!(!FilterOperator::Gt.matches(&json!("high"), &json!(1)));
    }

    #[test]
    fn test_missing_field_and_placeholder_dropped() {
        let mut input = scored("score", &[("A", 80.0)]);
        input.insert("B", "2024", Some(Payload::plain(json!({"other": 1}))));
        input.insert("C", "2024", None);

        let output = apply(&config("score", FilterOperator::Gt, json!(0)), input);
        assert_eq!(output.entities(), vec!["A"]);
    }

    #[test]
    fn test_nested_field_path() {
        let mut input = DataContainer::new("s", StepKind::FundamentalAnalysis);
        input.insert(
            "A",
            "2024",
            Some(Payload::structured("Report", json!({"metrics": {"margin": 0.3}}))),
        );
        input.insert(
            "B",
            "2024",
            Some(Payload::structured("Report", json!({"metrics": {"margin": 0.1}}))),
        );

        let output = apply(&config("metrics.margin", FilterOperator::Gt, json!(0.2)), input);
        assert_eq!(output.entities(), vec!["A"]);
    }

    #[test]
    fn test_everything_filtered_warns() {
        let input = scored("score", &[("A", 10.0), ("B", 20.0)]);
        let output = apply(&config("score", FilterOperator::Gt, json!(100)), input);

        assert!(output.is_empty());
        assert_eq!(output.warnings.len(), 1);
    }

    #[test]
    fn test_operator_aliases_deserialize() {
        let op: FilterOperator = serde_json::from_value(json!("ge")).unwrap();
        assert_eq!(op, FilterOperator::Ge);
        let op: FilterOperator = serde_json::from_value(json!("!=")).unwrap();
        assert_eq!(op, FilterOperator::Ne);
    }

    #[test]
    fn test_blank_field_rejected() {
        let config = config(" ", FilterOperator::Eq, json!(1));
        assert!(matches!(
            FilterStep::new(&config).validate_config(),
            Err(StepError::Validation(_))
        ));
    }
}
