//! Input step: builds the entity × period placeholder grid.

use chrono::{DateTime, Datelike, Utc};
use indexmap::IndexSet;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{StepContext, StepExecutor, StepKind};
use crate::analysis::DEFAULT_HORIZON;
use crate::data::{DataContainer, Shape};
use crate::error::StepError;

/// Largest generated window: a century of quarters.
pub const MAX_NUM_PERIODS: u32 = 400;

/// Granularity of generated periods.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodKind {
    #[default]
    Annual,
    Quarterly,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputConfig {
    pub tickers: Vec<String>,

    /// Explicit period keys; takes precedence over `num_periods`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub periods: Option<Vec<String>>,

    /// Size of the window ending at the current period
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_periods: Option<u32>,

    #[serde(default)]
    pub period_kind: PeriodKind,
}

impl InputConfig {
    pub fn for_tickers<I, S>(tickers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tickers: tickers.into_iter().map(Into::into).collect(),
            periods: None,
            num_periods: None,
            period_kind: PeriodKind::Annual,
        }
    }

    pub fn with_periods<I, S>(mut self, periods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.periods = Some(periods.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_num_periods(mut self, count: u32, kind: PeriodKind) -> Self {
        self.num_periods = Some(count);
        self.period_kind = kind;
        self
    }
}

pub struct InputStep<'a> {
    config: &'a InputConfig,
}

impl<'a> InputStep<'a> {
    pub fn new(config: &'a InputConfig) -> Self {
        Self { config }
    }

    /// Trimmed, upper-cased tickers with duplicates removed, in order.
    fn tickers(&self) -> IndexSet<String> {
        self.config
            .tickers
            .iter()
            .map(|t| t.trim().to_uppercase())
            .filter(|t| !t.is_empty())
            .collect()
    }

    fn periods(&self, now: DateTime<Utc>) -> Vec<String> {
        match &self.config.periods {
            Some(periods) => periods
                .iter()
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect::<IndexSet<_>>()
                .into_iter()
                .collect(),
            None => period_window(
                self.config.period_kind,
                self.config.num_periods.unwrap_or(DEFAULT_HORIZON),
                now,
            ),
        }
    }
}

/// Generates `count` consecutive period keys ending at the period that
/// contains `now`, oldest first: `"2024"` for annual periods, `"2024-Q3"`
/// for quarterly ones. `count` is capped at [`MAX_NUM_PERIODS`].
pub fn period_window(kind: PeriodKind, count: u32, now: DateTime<Utc>) -> Vec<String> {
    let count = count.min(MAX_NUM_PERIODS) as i32;
    let year = now.year();
    match kind {
        PeriodKind::Annual => (0..count)
            .rev()
            .map(|back| (year - back).to_string())
            .collect(),
        PeriodKind::Quarterly => {
            let current = year * 4 + (now.month0() / 3) as i32;
            (0..count)
                .rev()
                .map(|back| {
                    let index = current - back;
                    format!("{}-Q{}", index.div_euclid(4), index.rem_euclid(4) + 1)
                })
                .collect()
        }
    }
}

impl StepExecutor for InputStep<'_> {
    fn kind(&self) -> StepKind {
        StepKind::Input
    }

    fn validate_config(&self) -> Result<(), StepError> {
        if self.tickers().is_empty() {
            return Err(StepError::validation("input step needs at least one ticker"));
        }
        match (&self.config.periods, self.config.num_periods) {
            (Some(periods), _) if periods.iter().all(|p| p.trim().is_empty()) => Err(
                StepError::validation("input step was given an empty period list"),
            ),
            (None, Some(0)) => Err(StepError::validation("num_periods must be at least 1")),
            (None, Some(count)) if count > MAX_NUM_PERIODS => Err(StepError::validation(format!(
                "num_periods must be at most {}, got {}",
                MAX_NUM_PERIODS, count
            ))),
            _ => Ok(()),
        }
    }

    fn execute(
        &self,
        ctx: &StepContext<'_>,
        _input: Option<DataContainer>,
    ) -> Result<DataContainer, StepError> {
        self.validate_config()?;

        let tickers = self.tickers();
        let periods = self.periods(Utc::now());

        let mut output = DataContainer::new(ctx.step_id, StepKind::Input);
        for ticker in &tickers {
            for period in &periods {
                output.insert(ticker.as_str(), period.as_str(), None);
            }
        }

        output
            .metadata
            .insert("tickers".to_string(), json!(tickers.iter().collect::<Vec<_>>()));
        output.metadata.insert("periods".to_string(), json!(periods));
        output
            .metadata
            .insert("period_kind".to_string(), json!(self.config.period_kind));

        debug!(
            "Input grid: {} tickers x {} periods",
            tickers.len(),
            periods.len()
        );
        Ok(output)
    }

    fn expected_output_shape(&self, _input: Shape) -> Shape {
        let periods = match &self.config.periods {
            Some(periods) => periods.len(),
            None => self.config.num_periods.unwrap_or(DEFAULT_HORIZON) as usize,
        };
        Shape::new(self.tickers().len(), periods)
    }
}
