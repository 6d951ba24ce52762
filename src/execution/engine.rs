//! Workflow Execution Engine
//!
//! Runs the steps of a workflow definition strictly in order, one
//! dedicated worker per run:
//! - Validates and executes each step against the previous step's output
//! - Persists the step output and then the run record before moving on
//! - Resumes failed, cancelled or interrupted runs after the last
//!   persisted step
//! - Stops cooperatively when the run's cancellation token is raised

use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};
use serde_json::json;
use uuid::Uuid;

use crate::analysis::AnalysisRunner;
use crate::data::container::context;
use crate::data::{DataContainer, Shape};
use crate::error::{EngineError, StepError};
use crate::execution::cancellation::{CancellationRegistry, CancellationToken};
use crate::monitoring::{EventType, ExecutionTimeline};
use crate::steps::StepContext;
use crate::store::JobStore;
use crate::workflow::{
    estimate_shapes, validate_workflow, LogLevel, RunStatus, StepDefinition, StepLog,
    WorkflowDefinition, WorkflowRun,
};

pub use crate::steps::analysis::DEFAULT_MAX_WORKERS;

/// Default directory for export steps without an explicit `output_dir`.
pub const DEFAULT_EXPORT_DIR: &str = "exports";

/// Engine-wide settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Upper bound on concurrent analysis calls within one step
    pub max_workers: usize,
    pub export_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            export_dir: PathBuf::from(DEFAULT_EXPORT_DIR),
        }
    }
}

/// A run ready to execute: its definition, record and carry-in container.
struct PreparedRun {
    workflow: WorkflowDefinition,
    run: WorkflowRun,
    carry: Option<DataContainer>,
}

/// Workflow execution engine.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use analysisrunner::analysis::DryRunRunner;
/// use analysisrunner::execution::{CancellationRegistry, WorkflowEngine};
/// use analysisrunner::store::MemoryJobStore;
/// use analysisrunner::load_workflow;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut engine = WorkflowEngine::new(
///         Arc::new(MemoryJobStore::new()),
///         Arc::new(DryRunRunner::new()),
///         Arc::new(CancellationRegistry::new()),
///     );
///     engine.set_export_dir("/data/exports");
///
///     let workflow = load_workflow("screen.yaml")?;
///     engine.register_workflow(&workflow)?;
///     let run = engine.execute_workflow(&workflow.id, None, false)?;
///     println!("{} -> {}", run.run_id, run.status);
///     Ok(())
/// }
/// ```
pub struct WorkflowEngine {
    store: Arc<dyn JobStore>,
    runner: Arc<dyn AnalysisRunner>,
    registry: Arc<CancellationRegistry>,
    config: EngineConfig,
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<dyn JobStore>,
        runner: Arc<dyn AnalysisRunner>,
        registry: Arc<CancellationRegistry>,
    ) -> Self {
        Self {
            store,
            runner,
            registry,
            config: EngineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the default directory of export steps.
    pub fn set_export_dir(&mut self, dir: impl Into<PathBuf>) {
        self.config.export_dir = dir.into();
    }

    /// Sets the bound on concurrent analysis calls within a step.
    pub fn set_max_workers(&mut self, max: usize) {
        self.config.max_workers = max.max(1);
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<CancellationRegistry> {
        &self.registry
    }

    /// Validates a definition and saves it to the store.
    pub fn register_workflow(&self, workflow: &WorkflowDefinition) -> Result<(), EngineError> {
        validate_workflow(workflow)?;
        self.store.save_workflow(workflow)?;
        info!(
            "Registered workflow '{}' ({} steps)",
            workflow.id,
            workflow.len()
        );
        Ok(())
    }

    /// Loads a stored definition. An empty definition is an error.
    pub fn load_workflow(&self, workflow_id: &str) -> Result<WorkflowDefinition, EngineError> {
        let workflow = self
            .store
            .get_workflow(workflow_id)?
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.to_string()))?;
        if workflow.is_empty() {
            return Err(EngineError::EmptyWorkflow(workflow_id.to_string()));
        }
        Ok(workflow)
    }

    /// Pre-flight estimate of every step's output shape.
    pub fn estimate_shapes(&self, workflow_id: &str) -> Result<Vec<(String, Shape)>, EngineError> {
        Ok(estimate_shapes(&self.load_workflow(workflow_id)?))
    }

    pub fn get_run(&self, run_id: &str) -> Result<WorkflowRun, EngineError> {
        self.store
            .get_run(run_id)?
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))
    }

    pub fn list_runs(&self, workflow_id: Option<&str>) -> Result<Vec<WorkflowRun>, EngineError> {
        Ok(self.store.list_runs(workflow_id)?)
    }

    /// Persisted output of one step of a run.
    pub fn step_output(
        &self,
        run_id: &str,
        step_id: &str,
    ) -> Result<Option<DataContainer>, EngineError> {
        Ok(self.store.load_step_output(run_id, step_id)?)
    }

    pub fn logs(&self, run_id: &str) -> Result<Vec<StepLog>, EngineError> {
        Ok(self.store.logs(run_id)?)
    }

    /// Executes a workflow on the calling thread.
    ///
    /// Without `resume` a fresh run is created (with `run_id` if given,
    /// which must not exist yet). With `resume` the run `run_id` continues
    /// after its last persisted step; a completed run is returned as is.
    ///
    /// Step failures and cancellation are reported through the returned
    /// run's status, not as an `Err`.
    pub fn execute_workflow(
        &self,
        workflow_id: &str,
        run_id: Option<&str>,
        resume: bool,
    ) -> Result<WorkflowRun, EngineError> {
        let (prepared, token) = self.claim(workflow_id, run_id, resume)?;
        if prepared.run.status == RunStatus::Completed {
            self.registry.release(&token);
            info!("Run {} already completed", prepared.run.run_id);
            return Ok(prepared.run);
        }

        let run_id = prepared.run.run_id.clone();
        let result = match self.execute_contained(prepared, &token) {
            Some(result) => result,
            None => self.get_run(&run_id),
        };
        self.registry.release(&token);
        result
    }

    /// Starts a workflow on a dedicated worker thread and returns the run id.
    ///
    /// The worker is bound to the run's cancellation token, so
    /// [`cancel_run`](Self::cancel_run) can wait for it.
    pub fn start_workflow(
        self: &Arc<Self>,
        workflow_id: &str,
        run_id: Option<&str>,
        resume: bool,
    ) -> Result<String, EngineError> {
        let (prepared, token) = self.claim(workflow_id, run_id, resume)?;
        let run_id = prepared.run.run_id.clone();
        if prepared.run.status == RunStatus::Completed {
            self.registry.release(&token);
            info!("Run {} already completed", run_id);
            return Ok(run_id);
        }

        let engine = Arc::clone(self);
        let worker_token = Arc::clone(&token);

        let spawned = thread::Builder::new()
            .name(format!("run-{}", run_id))
            .spawn(move || {
                let run_id = worker_token.run_id().to_string();
                match engine.execute_contained(prepared, &worker_token) {
                    Some(Ok(run)) => debug!("Worker for run {} finished: {}", run_id, run.status),
                    Some(Err(e)) => error!("Run {} aborted: {}", run_id, e),
                    None => {}
                }
                engine.registry.release(&worker_token);
            });

        match spawned {
            Ok(handle) => {
                token.bind_worker(handle);
                info!("Started run {} of workflow '{}'", run_id, workflow_id);
                Ok(run_id)
            }
            Err(e) => {
                self.registry.release(&token);
                self.record_crash(&run_id, &format!("failed to spawn worker: {}", e));
                Err(EngineError::Spawn(e))
            }
        }
    }

    /// Resumes a run on a dedicated worker thread.
    pub fn resume_workflow(
        self: &Arc<Self>,
        workflow_id: &str,
        run_id: &str,
    ) -> Result<String, EngineError> {
        self.start_workflow(workflow_id, Some(run_id), true)
    }

    /// Signals a run to stop and waits up to `timeout` for its worker.
    pub fn cancel_run(&self, run_id: &str, timeout: Duration) -> bool {
        self.registry.cancel_run(run_id, timeout)
    }

    /// Takes the run's cancellation token, then prepares the run.
    ///
    /// A run already held by a live worker is refused, so no run is ever
    /// driven by two workers at once.
    fn claim(
        &self,
        workflow_id: &str,
        run_id: Option<&str>,
        resume: bool,
    ) -> Result<(PreparedRun, Arc<CancellationToken>), EngineError> {
        let run_id = match (run_id, resume) {
            (Some(id), _) => id.to_string(),
            (None, true) => return Err(EngineError::MissingRunId),
            (None, false) => Uuid::new_v4().to_string(),
        };
        let token = self
            .registry
            .try_create_token(&run_id)
            .ok_or_else(|| EngineError::RunActive(run_id.clone()))?;

        match self.prepare(workflow_id, &run_id, resume) {
            Ok(prepared) => Ok((prepared, token)),
            Err(e) => {
                self.registry.release(&token);
                Err(e)
            }
        }
    }

    /// Runs a prepared run with panics contained. A panic is recorded as
    /// a crash of the run and yields `None`.
    fn execute_contained(
        &self,
        prepared: PreparedRun,
        token: &CancellationToken,
    ) -> Option<Result<WorkflowRun, EngineError>> {
        let run_id = prepared.run.run_id.clone();
        match panic::catch_unwind(AssertUnwindSafe(|| self.execute_prepared(prepared, token))) {
            Ok(result) => Some(result),
            Err(_) => {
                self.record_crash(&run_id, "worker panicked");
                None
            }
        }
    }

    /// Loads the definition and creates or reopens the run record.
    fn prepare(
        &self,
        workflow_id: &str,
        run_id: &str,
        resume: bool,
    ) -> Result<PreparedRun, EngineError> {
        let workflow = self.load_workflow(workflow_id)?;

        if !resume {
            if self.store.get_run(run_id)?.is_some() {
                return Err(EngineError::RunExists(run_id.to_string()));
            }
            let mut run = WorkflowRun::with_id(run_id, &workflow.id, workflow.len());
            run.begin();
            self.store.create_run(&run)?;
            info!(
                "Created run {} for workflow '{}' ({} steps)",
                run.run_id,
                workflow.id,
                workflow.len()
            );
            return Ok(PreparedRun {
                workflow,
                run,
                carry: None,
            });
        }

        let mut run = self.get_run(run_id)?;
        if run.workflow_id != workflow.id {
            return Err(EngineError::WorkflowMismatch {
                run_id: run_id.to_string(),
                expected: workflow.id.clone(),
                actual: run.workflow_id,
            });
        }
        if run.status == RunStatus::Completed {
            return Ok(PreparedRun {
                workflow,
                run,
                carry: None,
            });
        }
        if run.total_steps != workflow.len() {
            warn!(
                "Run {} recorded {} steps but workflow '{}' now has {}",
                run_id,
                run.total_steps,
                workflow.id,
                workflow.len()
            );
            run.total_steps = workflow.len();
            run.current_step_index = run.current_step_index.min(run.total_steps);
        }

        let start = run.prepare_resume();
        let carry = if start == 0 {
            None
        } else {
            let step_id = run
                .last_successful_step
                .clone()
                .unwrap_or_else(|| workflow.steps[start - 1].id.clone());
            let output = self.store.load_step_output(run_id, &step_id)?.ok_or_else(|| {
                EngineError::MissingStepOutput {
                    run_id: run_id.to_string(),
                    step_id: step_id.clone(),
                }
            })?;
            Some(output)
        };

        self.store.update_run(&run)?;
        info!(
            "Resuming run {} at step {}/{}",
            run_id,
            start + 1,
            run.total_steps
        );
        Ok(PreparedRun {
            workflow,
            run,
            carry,
        })
    }

    /// Runs the remaining steps. A store failure mid-run is recorded on
    /// the run (best effort) before it is returned.
    fn execute_prepared(
        &self,
        prepared: PreparedRun,
        token: &CancellationToken,
    ) -> Result<WorkflowRun, EngineError> {
        let PreparedRun {
            workflow,
            mut run,
            carry,
        } = prepared;
        let mut timeline = ExecutionTimeline::new(&run.run_id);

        let result = self.drive(&workflow, &mut run, carry, token, &mut timeline);
        info!("{}", timeline.summary());

        match result {
            Ok(()) => Ok(run),
            Err(e) => {
                let step_id = workflow
                    .steps
                    .get(run.current_step_index)
                    .map(|s| s.id.clone())
                    .unwrap_or_default();
                error!("Run {} aborted at '{}': {}", run.run_id, step_id, e);
                run.mark_failed(step_id, e.to_string(), context([("kind", json!("engine"))]));
                if let Err(store_err) = self.store.update_run(&run) {
                    warn!("Could not record failure of run {}: {}", run.run_id, store_err);
                }
                Err(e)
            }
        }
    }

    fn drive(
        &self,
        workflow: &WorkflowDefinition,
        run: &mut WorkflowRun,
        mut carry: Option<DataContainer>,
        token: &CancellationToken,
        timeline: &mut ExecutionTimeline,
    ) -> Result<(), EngineError> {
        let start = run.current_step_index;

        for (index, step) in workflow.steps.iter().enumerate().skip(start) {
            if token.check().is_err() {
                return self.finish_cancelled(run, step);
            }

            info!(
                "[{}/{}] Starting step '{}' ({})",
                index + 1,
                run.total_steps,
                step.label(),
                step.kind()
            );
            timeline.add_event(&step.id, EventType::Started);
            self.log_step(run, &step.id, LogLevel::Info, format!("Starting {} step", step.kind()));

            match self.run_step(run, step, carry.take(), token) {
                Ok(output) => {
                    // Output first: a crash between the two writes re-runs the
                    // step instead of resuming from a missing output.
                    self.store.save_step_output(&run.run_id, &step.id, &output)?;
                    run.mark_step_completed(&step.id, index);
                    self.store.update_run(run)?;

                    timeline.add_event(&step.id, EventType::Completed);
                    let message = format!(
                        "Completed: shape {}, {} items, {} warnings",
                        output.shape(),
                        output.total_items(),
                        output.warnings.len()
                    );
                    info!("Step '{}' {}", step.id, message.to_lowercase());
                    self.log_step(run, &step.id, LogLevel::Info, message);
                    carry = Some(output);
                }
                Err(StepError::Cancelled) => {
                    timeline.add_event(&step.id, EventType::Cancelled);
                    return self.finish_cancelled(run, step);
                }
                Err(e) => {
                    timeline.add_event(&step.id, EventType::Failed);
                    error!("Step '{}' failed: {}", step.id, e);
                    self.log_step(run, &step.id, LogLevel::Error, e.to_string());
                    run.mark_failed(
                        &step.id,
                        e.to_string(),
                        context([
                            ("kind", json!(e.kind())),
                            ("step_type", json!(step.kind().as_str())),
                            ("step_index", json!(index)),
                        ]),
                    );
                    self.store.update_run(run)?;
                    return Ok(());
                }
            }
        }

        run.mark_completed();
        self.store.update_run(run)?;
        info!(
            "Run {} of workflow '{}' completed",
            run.run_id, workflow.id
        );
        Ok(())
    }

    fn run_step(
        &self,
        run: &WorkflowRun,
        step: &StepDefinition,
        input: Option<DataContainer>,
        token: &CancellationToken,
    ) -> Result<DataContainer, StepError> {
        let executor = step.config.executor();
        executor.validate_config()?;
        executor.validate_input(input.as_ref())?;

        let ctx = StepContext {
            run_id: &run.run_id,
            step_id: &step.id,
            runner: self.runner.as_ref(),
            token,
            export_dir: self.export_dir(),
            max_parallel: self.config.max_workers,
        };
        executor.execute(&ctx, input)
    }

    fn export_dir(&self) -> &Path {
        &self.config.export_dir
    }

    fn finish_cancelled(
        &self,
        run: &mut WorkflowRun,
        step: &StepDefinition,
    ) -> Result<(), EngineError> {
        info!("Run {} cancelled before finishing '{}'", run.run_id, step.id);
        self.log_step(run, &step.id, LogLevel::Warning, "Run cancelled".to_string());
        run.mark_cancelled();
        self.store.update_run(run)?;
        Ok(())
    }

    /// Appends a step log. Failing to log never fails the run.
    fn log_step(&self, run: &WorkflowRun, step_id: &str, level: LogLevel, message: String) {
        let entry = StepLog::new(&run.run_id, step_id, level, message);
        if let Err(e) = self.store.append_log(&entry) {
            warn!("Could not persist log for run {}: {}", run.run_id, e);
        }
    }

    /// Marks a run failed after its worker died outside normal control flow.
    fn record_crash(&self, run_id: &str, message: &str) {
        error!("Run {}: {}", run_id, message);
        match self.store.get_run(run_id) {
            Ok(Some(mut run)) if !run.status.is_terminal() => {
                let step_id = run.last_successful_step.clone().unwrap_or_default();
                run.mark_failed(step_id, message, context([("kind", json!("crash"))]));
                if let Err(e) = self.store.update_run(&run) {
                    warn!("Could not record failure of run {}: {}", run_id, e);
                }
            }
            Ok(_) => {}
            Err(e) => warn!("Could not load run {}: {}", run_id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{AnalysisKind, AnalysisOutcome, AnalysisRequest};
    use crate::data::Payload;
    use crate::error::AnalysisError;
    use crate::steps::{
        AggregateConfig, AggregateMethod, AnalysisStepConfig, CustomConfig, ExportConfig,
        InputConfig, OutputFormat, StepConfig,
    };
    use crate::store::MemoryJobStore;
    use crate::testing::runner;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn input_step(tickers: &[&str]) -> StepDefinition {
        StepDefinition::new(
            "load",
            StepConfig::Input(
                InputConfig::for_tickers(tickers.iter().copied()).with_periods(["2023", "2024"]),
            ),
        )
    }

    fn analyze_step() -> StepDefinition {
        StepDefinition::new(
            "analyze",
            StepConfig::FundamentalAnalysis(AnalysisStepConfig::default()),
        )
    }

    fn summarize_step() -> StepDefinition {
        StepDefinition::new(
            "summarize",
            StepConfig::CustomAnalysis(CustomConfig {
                prompt_template: "Summarize:\n{data}".to_string(),
                output_format: OutputFormat::Json,
            }),
        )
    }

    fn screen(tickers: &[&str]) -> WorkflowDefinition {
        WorkflowDefinition::from_steps(
            "screen",
            vec![
                input_step(tickers),
                analyze_step(),
                summarize_step(),
                StepDefinition::new("export", StepConfig::Export(ExportConfig::default())),
            ],
        )
    }

    fn scored(request: &AnalysisRequest) -> Result<AnalysisOutcome, AnalysisError> {
        match request.config.kind {
            AnalysisKind::Custom => Ok(AnalysisOutcome::new(Payload::plain(json!(
                r#"{"verdict": "buy"}"#
            )))),
            _ => Ok(AnalysisOutcome::new(Payload::plain(json!({"score": 70})))),
        }
    }

    fn engine_with(
        runner: Arc<dyn AnalysisRunner>,
        export_dir: &Path,
    ) -> (WorkflowEngine, Arc<MemoryJobStore>) {
        let store = Arc::new(MemoryJobStore::new());
        let mut engine = WorkflowEngine::new(
            store.clone(),
            runner,
            Arc::new(CancellationRegistry::new()),
        );
        engine.set_export_dir(export_dir);
        (engine, store)
    }

    fn kind_calls(requests: &[AnalysisRequest], kind: AnalysisKind) -> usize {
        requests.iter().filter(|r| r.config.kind == kind).count()
    }

    #[test]
    fn test_full_run_completes() {
        let dir = tempdir().unwrap();
        let fake = Arc::new(runner(scored));
        let (engine, _store) = engine_with(fake.clone(), dir.path());
        engine.register_workflow(&screen(&["AAPL", "MSFT"])).unwrap();

        let run = engine.execute_workflow("screen", None, false).unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.current_step_index, 4);
        assert_eq!(run.last_successful_step.as_deref(), Some("export"));
        assert!(run.completed_at.is_some());
        assert_eq!(kind_calls(&fake.calls(), AnalysisKind::Fundamental), 4);

        let analyzed = engine.step_output(&run.run_id, "analyze").unwrap().unwrap();
        assert_eq!(analyzed.total_items(), 4);
        let summary = engine.step_output(&run.run_id, "summarize").unwrap().unwrap();
        assert_eq!(summary.get("custom", "result").unwrap().field("verdict"), Some(&json!("buy")));

        let logs = engine.logs(&run.run_id).unwrap();
        assert_eq!(logs.len(), 8);
        assert!(engine.registry().is_empty());
    }

    #[test]
    fn test_failed_step_then_resume_skips_completed_steps() {
        let dir = tempdir().unwrap();
        let failing = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&failing);
        let fake = Arc::new(runner(move |request: &AnalysisRequest| {
            if request.config.kind == AnalysisKind::Custom && flag.load(Ordering::SeqCst) {
                return Err(AnalysisError::Failed("model unavailable".into()));
            }
            scored(request)
        }));
        let (engine, _store) = engine_with(fake.clone(), dir.path());
        engine.register_workflow(&screen(&["AAPL", "MSFT"])).unwrap();

        let failed = engine.execute_workflow("screen", Some("r1"), false).unwrap();
        assert_eq!(failed.status, RunStatus::Failed);
        assert_eq!(failed.current_step_index, 2);
        assert_eq!(failed.last_successful_step.as_deref(), Some("analyze"));
        let error = failed.last_error().unwrap();
        assert_eq!(error.step_id, "summarize");
        assert_eq!(error.context["kind"], json!("execution"));
        assert!(engine.step_output("r1", "summarize").unwrap().is_none());

        let analyzed_before = engine.step_output("r1", "analyze").unwrap().unwrap();
        failing.store(false, Ordering::SeqCst);

        let resumed = engine.execute_workflow("screen", Some("r1"), true).unwrap();
        assert_eq!(resumed.status, RunStatus::Completed);
        assert_eq!(resumed.current_step_index, resumed.total_steps);

        // Analysis ran once per cell, during the first attempt only.
        assert_eq!(kind_calls(&fake.calls(), AnalysisKind::Fundamental), 4);
        let analyzed_after = engine.step_output("r1", "analyze").unwrap().unwrap();
        assert_eq!(analyzed_before, analyzed_after);
        assert!(engine.step_output("r1", "export").unwrap().is_some());
    }

    #[test]
    fn test_step_index_monotonic_and_bounded() {
        let dir = tempdir().unwrap();
        let fake = Arc::new(runner(scored));
        let (engine, _store) = engine_with(fake, dir.path());
        engine.register_workflow(&screen(&["AAPL"])).unwrap();

        let run = engine.execute_workflow("screen", Some("r1"), false).unwrap();
        let again = engine.execute_workflow("screen", Some("r1"), true).unwrap();

        assert_eq!(run.current_step_index, run.total_steps);
        assert_eq!(again.current_step_index, run.current_step_index);
        assert_eq!(again.completed_at, run.completed_at);
    }

    #[test]
    fn test_cancellation_stops_run() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(CancellationRegistry::new());
        let handle = Arc::clone(&registry);
        let fake = Arc::new(runner(move |request: &AnalysisRequest| {
            if let Some(token) = handle.get_token("r-cancel") {
                token.cancel();
            }
            scored(request)
        }));
        let store = Arc::new(MemoryJobStore::new());
        let mut engine = WorkflowEngine::new(store.clone(), fake.clone(), registry.clone());
        engine.set_export_dir(dir.path());
        engine.register_workflow(&screen(&["AAPL", "MSFT"])).unwrap();

        let run = engine.execute_workflow("screen", Some("r-cancel"), false).unwrap();

        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(run.current_step_index, 1);
        assert_eq!(fake.call_count(), 1);
        assert!(engine.step_output("r-cancel", "analyze").unwrap().is_none());
        assert_eq!(store.get_run("r-cancel").unwrap().unwrap().status, RunStatus::Cancelled);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_existing_run_id_requires_resume() {
        let dir = tempdir().unwrap();
        let (engine, _store) = engine_with(Arc::new(runner(scored)), dir.path());
        engine.register_workflow(&screen(&["AAPL"])).unwrap();

        engine.execute_workflow("screen", Some("r1"), false).unwrap();
        let err = engine.execute_workflow("screen", Some("r1"), false).unwrap_err();
        assert!(matches!(err, EngineError::RunExists(id) if id == "r1"));

        let err = engine.execute_workflow("screen", None, true).unwrap_err();
        assert!(matches!(err, EngineError::MissingRunId));

        let err = engine.execute_workflow("screen", Some("nope"), true).unwrap_err();
        assert!(matches!(err, EngineError::RunNotFound(_)));
    }

    #[test]
    fn test_empty_and_unknown_workflows_fail_immediately() {
        let dir = tempdir().unwrap();
        let fake = Arc::new(runner(scored));
        let (engine, store) = engine_with(fake.clone(), dir.path());
        store.save_workflow(&WorkflowDefinition::new("empty")).unwrap();

        assert!(matches!(
            engine.execute_workflow("empty", None, false),
            Err(EngineError::EmptyWorkflow(_))
        ));
        assert!(matches!(
            engine.execute_workflow("missing", None, false),
            Err(EngineError::WorkflowNotFound(_))
        ));
        assert!(matches!(
            engine.register_workflow(&WorkflowDefinition::new("empty")),
            Err(EngineError::Invalid(_))
        ));
        assert_eq!(store.run_count(), 0);
        assert_eq!(fake.call_count(), 0);
    }

    #[test]
    fn test_estimate_shapes() {
        let dir = tempdir().unwrap();
        let (engine, _store) = engine_with(Arc::new(runner(scored)), dir.path());
        let mut workflow = screen(&["AAPL", "MSFT", "NVDA"]);
        workflow.steps.insert(
            2,
            StepDefinition::new(
                "merge",
                StepConfig::Aggregate(AggregateConfig::new(AggregateMethod::MergeAll)),
            ),
        );
        engine.register_workflow(&workflow).unwrap();

        let shapes = engine.estimate_shapes("screen").unwrap();
        assert_eq!(shapes[0], ("load".to_string(), Shape::new(3, 2)));
        assert_eq!(shapes[2], ("merge".to_string(), Shape::new(1, 1)));
    }

    #[test]
    fn test_start_workflow_and_cancel_run() {
        let dir = tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let slow = Arc::new(runner(move |request: &AnalysisRequest| {
            counter.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));
            scored(request)
        }));
        let (engine, _store) = engine_with(slow, dir.path());
        let engine = Arc::new(engine);
        let tickers: Vec<String> = (0..50).map(|i| format!("T{}", i)).collect();
        let tickers: Vec<&str> = tickers.iter().map(String::as_str).collect();
        engine.register_workflow(&screen(&tickers)).unwrap();

        let run_id = engine.start_workflow("screen", None, false).unwrap();
        while calls.load(Ordering::SeqCst) == 0 {
            thread::sleep(Duration::from_millis(5));
        }

        assert!(engine.cancel_run(&run_id, Duration::from_secs(5)));
        let run = engine.get_run(&run_id).unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert!(calls.load(Ordering::SeqCst) < 100);
        assert!(engine.registry().get_token(&run_id).is_none());
    }

    fn slow_engine(dir: &Path, delay: Duration) -> (Arc<WorkflowEngine>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let slow = Arc::new(runner(move |request: &AnalysisRequest| {
            counter.fetch_add(1, Ordering::SeqCst);
            thread::sleep(delay);
            scored(request)
        }));
        let (engine, _store) = engine_with(slow, dir);
        let tickers: Vec<String> = (0..50).map(|i| format!("T{}", i)).collect();
        let tickers: Vec<&str> = tickers.iter().map(String::as_str).collect();
        engine.register_workflow(&screen(&tickers)).unwrap();
        (Arc::new(engine), calls)
    }

    fn wait_for_first_call(calls: &AtomicUsize) {
        while calls.load(Ordering::SeqCst) == 0 {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_resume_refused_while_run_is_executing() {
        let dir = tempdir().unwrap();
        let (engine, calls) = slow_engine(dir.path(), Duration::from_millis(20));

        let run_id = engine.start_workflow("screen", Some("r1"), false).unwrap();
        wait_for_first_call(&calls);

        assert!(matches!(
            engine.resume_workflow("screen", &run_id),
            Err(EngineError::RunActive(id)) if id == "r1"
        ));
        assert!(matches!(
            engine.execute_workflow("screen", Some("r1"), true),
            Err(EngineError::RunActive(_))
        ));

        assert!(engine.cancel_run(&run_id, Duration::from_secs(5)));
        let seen = calls.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(calls.load(Ordering::SeqCst), seen);
        assert_eq!(engine.get_run(&run_id).unwrap().status, RunStatus::Cancelled);
    }

    #[test]
    fn test_cancel_run_waits_for_run_on_calling_thread() {
        let dir = tempdir().unwrap();
        let (engine, calls) = slow_engine(dir.path(), Duration::from_millis(200));

        let caller = {
            let engine = Arc::clone(&engine);
            thread::spawn(move || engine.execute_workflow("screen", Some("r2"), false))
        };
        wait_for_first_call(&calls);

        assert!(!engine.cancel_run("r2", Duration::from_millis(10)));
        assert!(!caller.is_finished());

        assert!(engine.cancel_run("r2", Duration::from_secs(5)));
        let run = caller.join().unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert!(engine.registry().is_empty());
    }

    #[test]
    fn test_runner_panic_fails_run_and_releases_token() {
        let dir = tempdir().unwrap();
        let panicking = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&panicking);
        let fake = Arc::new(runner(move |request: &AnalysisRequest| {
            if flag.load(Ordering::SeqCst) {
                panic!("runner crashed");
            }
            scored(request)
        }));
        let (engine, store) = engine_with(fake, dir.path());
        engine.register_workflow(&screen(&["AAPL", "MSFT"])).unwrap();

        let run = engine.execute_workflow("screen", Some("r3"), false).unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.current_step_index, 1);
        assert_eq!(run.last_error().unwrap().context["kind"], json!("crash"));
        assert_eq!(store.get_run("r3").unwrap().unwrap().status, RunStatus::Failed);
        assert!(engine.registry().is_empty());

        panicking.store(false, Ordering::SeqCst);
        let resumed = engine.execute_workflow("screen", Some("r3"), true).unwrap();
        assert_eq!(resumed.status, RunStatus::Completed);
    }
}
