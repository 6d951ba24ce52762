//! Fundamental and Perspective Analysis Steps
//!
//! Both steps call the analysis runner once per (entity, period) cell.
//! With `run_parallel` the calls are spread over a bounded pool of
//! scoped worker threads; results are buffered and written back in the
//! input's cell order, so only completeness (not completion order) is
//! observable.
//!
//! A failed unit leaves a null cell and a warning. It never aborts the
//! step. Cancellation is checked before every unit.

use std::collections::VecDeque;
use std::sync::mpsc::channel;
use std::thread;

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{require_input, StepContext, StepExecutor, StepKind};
use crate::analysis::{
    AnalysisConfig, AnalysisError, AnalysisKind, AnalysisOutcome, AnalysisRequest,
    DEFAULT_FILING_TYPE,
};
use crate::data::container::context;
use crate::data::{DataContainer, Payload};
use crate::error::{Cancelled, StepError};

/// Concurrent analysis calls per step unless configured otherwise.
pub const DEFAULT_MAX_WORKERS: usize = 3;

fn default_max_workers() -> usize {
    DEFAULT_MAX_WORKERS
}

fn default_filing_type() -> String {
    DEFAULT_FILING_TYPE.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisStepConfig {
    #[serde(default)]
    pub run_parallel: bool,

    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    #[serde(default = "default_filing_type")]
    pub filing_type: String,
}

impl Default for AnalysisStepConfig {
    fn default() -> Self {
        Self {
            run_parallel: false,
            max_workers: DEFAULT_MAX_WORKERS,
            filing_type: default_filing_type(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerspectiveConfig {
    /// Analyst perspective, e.g. "value investor"
    pub perspective: String,

    #[serde(default)]
    pub run_parallel: bool,

    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    #[serde(default = "default_filing_type")]
    pub filing_type: String,
}

/// Executor shared by the fundamental and perspective analysis kinds.
pub struct AnalysisStep {
    kind: StepKind,
    analysis: AnalysisConfig,
    run_parallel: bool,
    max_workers: usize,
}

/// One (entity, period) cell to analyze, with any prior payload.
struct Unit {
    index: usize,
    entity: String,
    period: String,
    prior: Option<Payload>,
}

impl AnalysisStep {
    pub fn fundamental(config: &AnalysisStepConfig) -> Self {
        Self {
            kind: StepKind::FundamentalAnalysis,
            analysis: AnalysisConfig::new(AnalysisKind::Fundamental)
                .with_filing_type(config.filing_type.clone()),
            run_parallel: config.run_parallel,
            max_workers: config.max_workers,
        }
    }

    pub fn perspective(config: &PerspectiveConfig) -> Self {
        Self {
            kind: StepKind::PerspectiveAnalysis,
            analysis: AnalysisConfig::new(AnalysisKind::Perspective)
                .with_filing_type(config.filing_type.clone())
                .with_perspective(config.perspective.trim()),
            run_parallel: config.run_parallel,
            max_workers: config.max_workers,
        }
    }

    fn request(&self, unit: &Unit) -> AnalysisRequest {
        let request = AnalysisRequest::new(&unit.entity, self.analysis.clone()).for_period(&unit.period);
        match &unit.prior {
            Some(prior) => request.with_context(prior.to_value()),
            None => request,
        }
    }

    fn run_sequential(
        &self,
        ctx: &StepContext<'_>,
        units: &[Unit],
    ) -> Result<Vec<(usize, Result<AnalysisOutcome, AnalysisError>)>, Cancelled> {
        let mut results = Vec::with_capacity(units.len());
        for unit in units {
            ctx.checkpoint()?;
            results.push((unit.index, ctx.runner.run(&self.request(unit))));
        }
        Ok(results)
    }

    fn run_pool(
        &self,
        ctx: &StepContext<'_>,
        units: Vec<Unit>,
        workers: usize,
    ) -> Result<Vec<(usize, Result<AnalysisOutcome, AnalysisError>)>, Cancelled> {
        let queue = Mutex::new(units.into_iter().collect::<VecDeque<_>>());
        let (tx, rx) = channel();

        thread::scope(|scope| {
            for _ in 0..workers {
                let tx = tx.clone();
                let queue = &queue;
                scope.spawn(move || loop {
                    if ctx.checkpoint().is_err() {
                        break;
                    }
                    let Some(unit) = queue.lock().pop_front() else {
                        break;
                    };
                    let result = ctx.runner.run(&self.request(&unit));
                    if tx.send((unit.index, result)).is_err() {
                        break;
                    }
                });
            }
        });
        drop(tx);

        let results: Vec<_> = rx.into_iter().collect();
        ctx.checkpoint()?;
        Ok(results)
    }
}

impl StepExecutor for AnalysisStep {
    fn kind(&self) -> StepKind {
        self.kind
    }

    fn validate_config(&self) -> Result<(), StepError> {
        if self.max_workers == 0 {
            return Err(StepError::validation("max_workers must be at least 1"));
        }
        if self.kind == StepKind::PerspectiveAnalysis
            && self.analysis.perspective.as_deref().map_or(true, str::is_empty)
        {
            return Err(StepError::validation("perspective analysis needs a perspective"));
        }
        Ok(())
    }

    fn execute(
        &self,
        ctx: &StepContext<'_>,
        input: Option<DataContainer>,
    ) -> Result<DataContainer, StepError> {
        let input = require_input(self.kind, input)?;

        let units: Vec<Unit> = input
            .slots()
            .enumerate()
            .map(|(index, (entity, period, prior))| Unit {
                index,
                entity: entity.to_string(),
                period: period.to_string(),
                prior: prior.cloned(),
            })
            .collect();
        let cells: Vec<(String, String)> = units
            .iter()
            .map(|u| (u.entity.clone(), u.period.clone()))
            .collect();

        let workers = self.max_workers.min(ctx.max_parallel.max(1)).min(units.len());
        info!(
            "{}: analyzing {} cells ({})",
            ctx.step_id,
            units.len(),
            if self.run_parallel && workers > 1 {
                format!("{} workers", workers)
            } else {
                "sequential".to_string()
            }
        );

        let results = if self.run_parallel && workers > 1 {
            self.run_pool(ctx, units, workers)?
        } else {
            self.run_sequential(ctx, &units)?
        };

        // Seed the grid in input order so pool completion order is invisible.
        let mut output = input.derive(ctx.step_id, self.kind);
        for (entity, period) in &cells {
            output.insert(entity.as_str(), period.as_str(), None);
        }

        let mut failures = 0;
        let mut results = results;
        results.sort_by_key(|(index, _)| *index);
        for (index, result) in results {
            let (entity, period) = &cells[index];
            match result {
                Ok(outcome) => {
                    if let Some(run_id) = outcome.run_id {
                        output.add_source_run(run_id);
                    }
                    output.insert(entity.as_str(), period.as_str(), Some(outcome.payload));
                }
                Err(e) => {
                    failures += 1;
                    warn!("{}: analysis failed for {} {}: {}", ctx.step_id, entity, period, e);
                    output.add_warning(
                        format!("analysis failed for {} {}: {}", entity, period, e),
                        context([
                            ("entity", json!(entity)),
                            ("period", json!(period)),
                            ("retryable", json!(e.is_retryable())),
                        ]),
                    );
                }
            }
        }

        output
            .metadata
            .insert("analysis_kind".to_string(), json!(self.analysis.kind));
        if let Some(perspective) = &self.analysis.perspective {
            output
                .metadata
                .insert("perspective".to_string(), json!(perspective));
        }
        output
            .metadata
            .insert("failed_units".to_string(), json!(failures));

        debug!(
            "{}: {} of {} cells analyzed",
            ctx.step_id,
            output.total_items(),
            cells.len()
        );
        Ok(output)
    }
}
