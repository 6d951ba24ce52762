//! Shared test fakes.

use parking_lot::Mutex;
use serde_json::json;
use tempfile::TempDir;

use crate::analysis::{AnalysisOutcome, AnalysisRequest, AnalysisRunner};
use crate::data::{DataContainer, Payload};
use crate::error::AnalysisError;
use crate::execution::cancellation::CancellationToken;
use crate::steps::{StepContext, StepKind};

/// Runner backed by a closure, recording every request it receives.
pub struct FnRunner<F> {
    respond: F,
    calls: Mutex<Vec<AnalysisRequest>>,
}

pub fn runner<F>(respond: F) -> FnRunner<F>
where
    F: Fn(&AnalysisRequest) -> Result<AnalysisOutcome, AnalysisError> + Send + Sync,
{
    FnRunner {
        respond,
        calls: Mutex::new(Vec::new()),
    }
}

impl<F> FnRunner<F> {
    pub fn calls(&self) -> Vec<AnalysisRequest> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

impl<F> AnalysisRunner for FnRunner<F>
where
    F: Fn(&AnalysisRequest) -> Result<AnalysisOutcome, AnalysisError> + Send + Sync,
{
    fn run(&self, request: &AnalysisRequest) -> Result<AnalysisOutcome, AnalysisError> {
        self.calls.lock().push(request.clone());
        (self.respond)(request)
    }
}

/// Context pieces for running a single step executor.
pub struct StepHarness {
    pub token: CancellationToken,
    pub export_dir: TempDir,
}

impl StepHarness {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new("test-run"),
            export_dir: TempDir::new().expect("create temp dir"),
        }
    }

    pub fn ctx<'a>(&'a self, runner: &'a dyn AnalysisRunner) -> StepContext<'a> {
        StepContext {
            run_id: "test-run",
            step_id: "test-step",
            runner,
            token: &self.token,
            export_dir: self.export_dir.path(),
            max_parallel: 8,
        }
    }
}

/// One-period container with a numeric `field` per entity, in order.
pub fn scored(field: &str, scores: &[(&str, f64)]) -> DataContainer {
    let mut container = DataContainer::new("analyze", StepKind::FundamentalAnalysis);
    for (entity, score) in scores {
        container.insert(*entity, "2024", Some(Payload::plain(json!({ field: score }))));
    }
    container
}
