//! Batch Queue
//!
//! Drains the persisted worklist of a batch job on one dedicated worker
//! thread, one item at a time, against a shared capacity pool.
//!
//! ```text
//! pending --start--> running --(no capacity)--> waiting_reset --(reset)--> running
//! running --(no pending items)--> completed
//! running/waiting_reset --pause--> paused --resume--> running
//! running/waiting_reset/paused --stop--> stopped --start--> running
//! failed --start--> running
//! ```
//!
//! Item state is the resume point: starting a stopped or failed job simply
//! continues with its oldest pending item. Every item and job mutation is
//! written to the store before the worker moves on.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use indexmap::IndexSet;
use log::{debug, error, info, warn};
use parking_lot::Mutex;

use super::model::{BatchConfig, BatchItem, BatchJob, BatchStatus, WorkKey};
use crate::analysis::{AnalysisOutcome, AnalysisRequest, AnalysisRunner};
use crate::capacity::CapacityProvider;
use crate::error::{AnalysisError, QueueError};
use crate::execution::cancellation::{CancellationRegistry, CancellationToken};
use crate::store::JobStore;

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Interval between checks while waiting for a paused worker to exit.
const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Timing knobs of the batch worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// Longest single sleep while waiting for a capacity reset
    pub wait_chunk: Duration,
    /// Extra delay after the reported reset instant
    pub reset_margin: Duration,
    /// How long `resume` waits for a paused worker to exit
    pub stop_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            wait_chunk: Duration::from_secs(60),
            reset_margin: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(30),
        }
    }
}

/// How a wait for the capacity reset ended.
enum Wait {
    Ready,
    Paused,
    Cancelled,
}

/// Why the item loop returned.
enum Exit {
    Completed,
    Paused,
    Stopped,
}

pub struct BatchQueue {
    store: Arc<dyn JobStore>,
    runner: Arc<dyn AnalysisRunner>,
    capacity: Arc<dyn CapacityProvider>,
    registry: Arc<CancellationRegistry>,
    config: QueueConfig,
    /// Serializes read-modify-write cycles on job records
    job_lock: Mutex<()>,
}

impl BatchQueue {
    pub fn new(
        store: Arc<dyn JobStore>,
        runner: Arc<dyn AnalysisRunner>,
        capacity: Arc<dyn CapacityProvider>,
        registry: Arc<CancellationRegistry>,
    ) -> Self {
        Self {
            store,
            runner,
            capacity,
            registry,
            config: QueueConfig::default(),
            job_lock: Mutex::new(()),
        }
    }

    pub fn with_config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    pub fn set_wait_chunk(&mut self, chunk: Duration) {
        self.config.wait_chunk = chunk.max(Duration::from_millis(1));
    }

    pub fn set_reset_margin(&mut self, margin: Duration) {
        self.config.reset_margin = margin;
    }

    pub fn set_stop_timeout(&mut self, timeout: Duration) {
        self.config.stop_timeout = timeout;
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Creates a pending job with one item per distinct work key.
    pub fn create_batch<I, K>(
        &self,
        name: &str,
        keys: I,
        config: BatchConfig,
    ) -> Result<BatchJob, QueueError>
    where
        I: IntoIterator<Item = K>,
        K: Into<WorkKey>,
    {
        let mut seen = IndexSet::new();
        let keys: Vec<WorkKey> = keys
            .into_iter()
            .map(Into::into)
            .filter(|key: &WorkKey| !key.key.is_empty() && seen.insert(key.key.clone()))
            .collect();
        if keys.is_empty() {
            return Err(QueueError::EmptyBatch);
        }

        let job = BatchJob::new(name, keys.len(), config);
        let items: Vec<BatchItem> = keys
            .iter()
            .enumerate()
            .map(|(sequence, key)| BatchItem::new(&job.batch_id, key, sequence))
            .collect();

        self.store.create_batch(&job)?;
        self.store.create_items(&items)?;
        info!(
            "Created batch {} '{}' with {} items",
            job.batch_id,
            job.name,
            items.len()
        );
        Ok(job)
    }

    pub fn job(&self, batch_id: &str) -> Result<BatchJob, QueueError> {
        self.store
            .get_batch(batch_id)?
            .ok_or_else(|| QueueError::BatchNotFound(batch_id.to_string()))
    }

    pub fn items(&self, batch_id: &str) -> Result<Vec<BatchItem>, QueueError> {
        self.job(batch_id)?;
        Ok(self.store.list_items(batch_id)?)
    }

    pub fn list_jobs(&self) -> Result<Vec<BatchJob>, QueueError> {
        Ok(self.store.list_batches()?)
    }

    /// Returns true while a worker thread holds the job's token.
    pub fn is_worker_alive(&self, batch_id: &str) -> bool {
        self.registry.get_token(batch_id).is_some()
    }

    /// Launches the worker of a pending, stopped or failed job.
    ///
    /// A job recorded as running with no live worker (the process died)
    /// is recovered the same way.
    pub fn start(self: &Arc<Self>, batch_id: &str) -> Result<(), QueueError> {
        let token = self.begin(batch_id, "start")?;
        self.spawn_worker(batch_id, token)
    }

    /// Relaunches the worker of a paused job.
    pub fn resume(self: &Arc<Self>, batch_id: &str) -> Result<(), QueueError> {
        let job = self.job(batch_id)?;
        if job.status != BatchStatus::Paused {
            return Err(QueueError::InvalidTransition {
                batch_id: batch_id.to_string(),
                action: "resume",
                status: job.status,
            });
        }

        // The paused worker exits at its next check point.
        let deadline = Instant::now() + self.config.stop_timeout;
        while self.is_worker_alive(batch_id) {
            if Instant::now() >= deadline {
                return Err(QueueError::WorkerBusy(batch_id.to_string()));
            }
            thread::sleep(WORKER_POLL_INTERVAL);
        }

        let token = self.begin(batch_id, "resume")?;
        self.spawn_worker(batch_id, token)
    }

    /// Asks the worker to stop after its current item.
    pub fn pause(&self, batch_id: &str) -> Result<(), QueueError> {
        self.transition(batch_id, "pause", BatchStatus::is_active, |job| {
            job.status = BatchStatus::Paused;
        })?;
        info!("Pause requested for batch {}", batch_id);
        Ok(())
    }

    /// Signals the worker to stop and waits up to `timeout` for it.
    ///
    /// Returns false if the worker was still busy when the timeout
    /// elapsed; it then stops at its next check point.
    pub fn stop(&self, batch_id: &str, timeout: Duration) -> Result<bool, QueueError> {
        let job = self.job(batch_id)?;
        if !(job.status.is_active() || job.status == BatchStatus::Paused) {
            return Err(QueueError::InvalidTransition {
                batch_id: batch_id.to_string(),
                action: "stop",
                status: job.status,
            });
        }

        let joined = if self.is_worker_alive(batch_id) {
            self.registry.cancel_run(batch_id, timeout)
        } else {
            true
        };

        self.update_job(batch_id, |job| {
            if !matches!(job.status, BatchStatus::Completed | BatchStatus::Failed) {
                job.status = BatchStatus::Stopped;
                job.touch();
            }
        })?;
        info!("Batch {} stopped (worker joined: {})", batch_id, joined);
        Ok(joined)
    }

    /// Starts a job and processes it on the calling thread until it
    /// completes, is paused or is stopped.
    pub fn run_blocking(&self, batch_id: &str) -> Result<BatchStatus, QueueError> {
        let token = self.begin(batch_id, "start")?;
        let status = self.run_worker(batch_id, &token);
        self.registry.release(&token);
        Ok(status)
    }

    /// Validates the transition to `running`, takes the job's token,
    /// settles stale items and records the new status.
    fn begin(
        &self,
        batch_id: &str,
        action: &'static str,
    ) -> Result<Arc<CancellationToken>, QueueError> {
        let _guard = self.job_lock.lock();
        let mut job = self.job(batch_id)?;

        let worker_alive = self.is_worker_alive(batch_id);
        let allowed = match action {
            "resume" => job.status == BatchStatus::Paused,
            _ => job.status.can_start() || (job.status.is_active() && !worker_alive),
        };
        if !allowed {
            return Err(QueueError::InvalidTransition {
                batch_id: batch_id.to_string(),
                action,
                status: job.status,
            });
        }
        let token = self
            .registry
            .try_create_token(batch_id)
            .ok_or_else(|| QueueError::WorkerBusy(batch_id.to_string()))?;
        if job.status.is_active() {
            warn!("Batch {} was {} without a worker; recovering", batch_id, job.status);
        }

        match self.reopen(batch_id, &mut job) {
            Ok(()) => Ok(token),
            Err(e) => {
                self.registry.release(&token);
                Err(e)
            }
        }
    }

    fn reopen(&self, batch_id: &str, job: &mut BatchJob) -> Result<(), QueueError> {
        for mut item in self.store.list_items(batch_id)? {
            if item.reset_stale(job.config.max_retries) {
                info!(
                    "Interrupted item {} ({}) is now {}",
                    item.id, item.work_key, item.status
                );
                self.store.update_item(&item)?;
            }
        }

        job.apply_counts(&self.store.item_counts(batch_id)?);
        job.status = BatchStatus::Running;
        job.started_at.get_or_insert_with(Utc::now);
        job.completed_at = None;
        job.error_message = None;
        job.touch();
        self.store.update_batch(job)?;
        Ok(())
    }

    fn spawn_worker(
        self: &Arc<Self>,
        batch_id: &str,
        token: Arc<CancellationToken>,
    ) -> Result<(), QueueError> {
        let queue = Arc::clone(self);
        let worker_token = Arc::clone(&token);
        let id = batch_id.to_string();

        let spawned = thread::Builder::new()
            .name(format!("batch-{}", batch_id))
            .spawn(move || {
                queue.run_worker(&id, &worker_token);
                queue.registry.release(&worker_token);
            });

        match spawned {
            Ok(handle) => {
                token.bind_worker(handle);
                info!("Started worker for batch {}", batch_id);
                Ok(())
            }
            Err(e) => {
                self.registry.release(&token);
                self.record_failure(batch_id, &format!("failed to spawn worker: {}", e));
                Err(QueueError::Spawn(e))
            }
        }
    }

    /// Worker loop boundary: nothing escapes it. Unexpected errors and
    /// panics fail the job with their message.
    fn run_worker(&self, batch_id: &str, token: &CancellationToken) -> BatchStatus {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.process(batch_id, token)));
        let message = match outcome {
            Ok(Ok(Exit::Completed)) => return BatchStatus::Completed,
            Ok(Ok(Exit::Paused)) => return BatchStatus::Paused,
            Ok(Ok(Exit::Stopped)) => return BatchStatus::Stopped,
            Ok(Err(e)) => e.to_string(),
            Err(_) => "batch worker panicked".to_string(),
        };
        self.record_failure(batch_id, &message);
        BatchStatus::Failed
    }

    fn process(&self, batch_id: &str, token: &CancellationToken) -> Result<Exit, QueueError> {
        loop {
            if token.check().is_err() {
                return self.finish_stopped(batch_id);
            }

            let job = self.job(batch_id)?;
            if job.status == BatchStatus::Paused {
                info!("Batch {} paused", batch_id);
                return Ok(Exit::Paused);
            }

            let Some(mut item) = self.store.next_pending_item(batch_id)? else {
                return self.finish_completed(batch_id);
            };

            let Some(key) = self.capacity.try_reserve() else {
                match self.wait_for_reset(batch_id, token)? {
                    Wait::Ready => continue,
                    Wait::Paused => return Ok(Exit::Paused),
                    Wait::Cancelled => return self.finish_stopped(batch_id),
                }
            };

            // Cancellation may have arrived while reserving.
            if token.check().is_err() {
                self.capacity.release(&key);
                return self.finish_stopped(batch_id);
            }

            item.mark_running();
            self.store.update_item(&item)?;
            debug!(
                "Batch {}: item {} '{}' attempt {} on key {}",
                batch_id, item.sequence, item.display_name, item.attempts, key
            );

            let request = AnalysisRequest::new(&item.work_key, job.config.analysis.clone());
            let result = self.call_runner(&request);
            self.settle(&mut item, result, job.config.max_retries);
            self.store.update_item(&item)?;

            self.refresh(batch_id)?;
        }
    }

    fn call_runner(&self, request: &AnalysisRequest) -> Result<AnalysisOutcome, AnalysisError> {
        panic::catch_unwind(AssertUnwindSafe(|| self.runner.run(request)))
            .unwrap_or_else(|_| Err(AnalysisError::Failed("analysis runner panicked".to_string())))
    }

    /// Applies the outcome of one attempt to the item.
    fn settle(
        &self,
        item: &mut BatchItem,
        result: Result<AnalysisOutcome, AnalysisError>,
        max_retries: u32,
    ) {
        match result {
            Ok(outcome) => {
                info!("Item '{}' completed", item.display_name);
                item.mark_completed(outcome.run_id);
            }
            Err(AnalysisError::NotApplicable(reason)) => {
                info!("Item '{}' skipped: {}", item.display_name, reason);
                item.mark_skipped(reason);
            }
            Err(e) if e.is_retryable() && item.attempts < max_retries => {
                warn!(
                    "Item '{}' failed (attempt {}/{}), re-queued: {}",
                    item.display_name, item.attempts, max_retries, e
                );
                item.requeue(e.to_string());
            }
            Err(e) => {
                error!(
                    "Item '{}' failed after {} attempts: {}",
                    item.display_name, item.attempts, e
                );
                item.mark_failed(e.to_string());
            }
        }
    }

    /// Sleeps in bounded chunks until the capacity pool resets.
    fn wait_for_reset(&self, batch_id: &str, token: &CancellationToken) -> Result<Wait, QueueError> {
        self.update_job(batch_id, |job| {
            if job.status == BatchStatus::Running {
                job.status = BatchStatus::WaitingReset;
                job.touch();
            }
        })?;

        let margin = chrono::Duration::from_std(self.config.reset_margin)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let reset_at = self.capacity.next_reset_at() + margin;
        info!("Batch {}: capacity exhausted, waiting until {}", batch_id, reset_at);

        loop {
            if token.check().is_err() {
                return Ok(Wait::Cancelled);
            }
            if self.job(batch_id)?.status == BatchStatus::Paused {
                info!("Batch {} paused while waiting for capacity", batch_id);
                return Ok(Wait::Paused);
            }

            let remaining = (reset_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            if remaining.is_zero() {
                break;
            }
            thread::sleep(remaining.min(self.config.wait_chunk));
        }

        self.update_job(batch_id, |job| {
            if job.status == BatchStatus::WaitingReset {
                job.status = BatchStatus::Running;
                job.touch();
            }
        })?;
        info!("Batch {}: capacity reset, resuming", batch_id);
        Ok(Wait::Ready)
    }

    /// Recomputes counts and the completion estimate.
    fn refresh(&self, batch_id: &str) -> Result<(), QueueError> {
        let counts = self.store.item_counts(batch_id)?;
        let per_day = self.capacity.total_capacity_per_day();
        self.update_job(batch_id, |job| {
            job.apply_counts(&counts);
            job.touch();
            job.estimated_completion = match (counts.remaining(), per_day) {
                (0, _) | (_, 0) => None,
                (remaining, per_day) => {
                    let seconds = remaining as f64 / f64::from(per_day) * SECONDS_PER_DAY;
                    Some(Utc::now() + chrono::Duration::seconds(seconds.ceil() as i64))
                }
            };
        })?;
        debug!(
            "Batch {}: {} done, {} failed, {} skipped, {} remaining",
            batch_id,
            counts.completed,
            counts.failed,
            counts.skipped,
            counts.remaining()
        );
        Ok(())
    }

    fn finish_completed(&self, batch_id: &str) -> Result<Exit, QueueError> {
        let counts = self.store.item_counts(batch_id)?;
        let job = self.update_job(batch_id, |job| {
            job.apply_counts(&counts);
            job.status = BatchStatus::Completed;
            job.completed_at = Some(Utc::now());
            job.estimated_completion = None;
            job.touch();
        })?;
        info!(
            "Batch {} completed: {} done, {} failed, {} skipped",
            batch_id, job.completed_items, job.failed_items, job.skipped_items
        );
        Ok(Exit::Completed)
    }

    fn finish_stopped(&self, batch_id: &str) -> Result<Exit, QueueError> {
        self.update_job(batch_id, |job| {
            if !matches!(job.status, BatchStatus::Completed | BatchStatus::Failed) {
                job.status = BatchStatus::Stopped;
                job.touch();
            }
        })?;
        info!("Batch {} worker stopped", batch_id);
        Ok(Exit::Stopped)
    }

    /// Fails a job after an unexpected error. Best effort.
    fn record_failure(&self, batch_id: &str, message: &str) {
        error!("Batch {} failed: {}", batch_id, message);
        let result = self.update_job(batch_id, |job| {
            job.status = BatchStatus::Failed;
            job.error_message = Some(message.to_string());
            job.touch();
        });
        if let Err(e) = result {
            warn!("Could not record failure of batch {}: {}", batch_id, e);
        }
    }

    /// Applies a status change if `allowed` accepts the current status.
    fn transition(
        &self,
        batch_id: &str,
        action: &'static str,
        allowed: fn(&BatchStatus) -> bool,
        change: impl FnOnce(&mut BatchJob),
    ) -> Result<BatchJob, QueueError> {
        let _guard = self.job_lock.lock();
        let mut job = self.job(batch_id)?;
        if !allowed(&job.status) {
            return Err(QueueError::InvalidTransition {
                batch_id: batch_id.to_string(),
                action,
                status: job.status,
            });
        }
        change(&mut job);
        job.touch();
        self.store.update_batch(&job)?;
        Ok(job)
    }

    /// Reloads, mutates and saves a job record under the job lock.
    fn update_job(
        &self,
        batch_id: &str,
        change: impl FnOnce(&mut BatchJob),
    ) -> Result<BatchJob, QueueError> {
        let _guard = self.job_lock.lock();
        let mut job = self.job(batch_id)?;
        change(&mut job);
        self.store.update_batch(&job)?;
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::AnalysisConfig;
    use crate::batch::ItemStatus;
    use crate::capacity::DailyKeyPool;
    use crate::data::Payload;
    use crate::store::MemoryJobStore;
    use crate::testing::runner;
    use serde_json::json;

    fn ok(request: &AnalysisRequest) -> Result<AnalysisOutcome, AnalysisError> {
        Ok(AnalysisOutcome::new(Payload::plain(json!({"entity": request.entity})))
            .with_run_id(format!("run-{}", request.entity)))
    }

    fn fast_config() -> QueueConfig {
        QueueConfig {
            wait_chunk: Duration::from_millis(10),
            reset_margin: Duration::ZERO,
            stop_timeout: Duration::from_secs(5),
        }
    }

    fn queue_with(
        runner: Arc<dyn AnalysisRunner>,
        capacity: Arc<dyn CapacityProvider>,
    ) -> (Arc<BatchQueue>, Arc<MemoryJobStore>) {
        let store = Arc::new(MemoryJobStore::new());
        let queue = BatchQueue::new(
            store.clone(),
            runner,
            capacity,
            Arc::new(CancellationRegistry::new()),
        )
        .with_config(fast_config());
        (Arc::new(queue), store)
    }

    fn plenty() -> Arc<dyn CapacityProvider> {
        Arc::new(DailyKeyPool::new(["k1", "k2"], 1_000))
    }

    fn config(max_retries: u32) -> BatchConfig {
        BatchConfig::new(AnalysisConfig::default()).with_max_retries(max_retries)
    }

    fn wait_until(queue: &BatchQueue, batch_id: &str, status: BatchStatus) -> Vec<BatchStatus> {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut seen = Vec::new();
        loop {
            let current = queue.job(batch_id).unwrap().status;
            if seen.last() != Some(&current) {
                seen.push(current);
            }
            if current == status || Instant::now() > deadline {
                return seen;
            }
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_create_batch_collapses_duplicates() {
        let (queue, _store) = queue_with(Arc::new(runner(ok)), plenty());
        let job = queue
            .create_batch("screen", ["AAPL", "MSFT", " AAPL ", ""], config(3))
            .unwrap();

        assert_eq!(job.total_items, 2);
        assert_eq!(job.status, BatchStatus::Pending);
        let items = queue.items(&job.batch_id).unwrap();
        let keys: Vec<&str> = items.iter().map(|i| i.work_key.as_str()).collect();
        assert_eq!(keys, vec!["AAPL", "MSFT"]);

        let empty: [&str; 0] = [];
        assert!(matches!(
            queue.create_batch("none", empty, config(3)),
            Err(QueueError::EmptyBatch)
        ));
    }

    #[test]
    fn test_run_blocking_completes_all_items() {
        let fake = Arc::new(runner(ok));
        let (queue, _store) = queue_with(fake.clone(), plenty());
        let job = queue.create_batch("screen", ["AAPL", "MSFT", "NVDA"], config(3)).unwrap();

        let status = queue.run_blocking(&job.batch_id).unwrap();

        assert_eq!(status, BatchStatus::Completed);
        let job = queue.job(&job.batch_id).unwrap();
        assert_eq!(job.completed_items, 3);
        assert_eq!(job.pending_items(), 0);
        assert!(job.completed_at.is_some());
        assert!(job.estimated_completion.is_none());

        let items = queue.items(&job.batch_id).unwrap();
        assert!(items.iter().all(|i| i.status == ItemStatus::Completed && i.attempts == 1));
        assert_eq!(items[0].run_id.as_deref(), Some("run-AAPL"));
        let order: Vec<String> = fake.calls().into_iter().map(|r| r.entity).collect();
        assert_eq!(order, vec!["AAPL", "MSFT", "NVDA"]);
    }

    #[test]
    fn test_retryable_failure_exhausts_retries() {
        let fake = Arc::new(runner(|_: &AnalysisRequest| {
            Err(AnalysisError::Failed("timeout".into()))
        }));
        let (queue, _store) = queue_with(fake.clone(), plenty());
        let job = queue.create_batch("flaky", ["AAPL"], config(2)).unwrap();

        assert_eq!(queue.run_blocking(&job.batch_id).unwrap(), BatchStatus::Completed);

        let item = &queue.items(&job.batch_id).unwrap()[0];
        assert_eq!(item.status, ItemStatus::Failed);
        assert_eq!(item.attempts, 2);
        assert_eq!(item.error_message.as_deref(), Some("timeout"));
        assert_eq!(fake.call_count(), 2);
        assert_eq!(queue.job(&job.batch_id).unwrap().failed_items, 1);

        assert!(matches!(
            queue.start(&job.batch_id),
            Err(QueueError::InvalidTransition { action: "start", .. })
        ));
        assert_eq!(fake.call_count(), 2);
    }

    #[test]
    fn test_fatal_and_not_applicable_are_not_retried() {
        let fake = Arc::new(runner(|request: &AnalysisRequest| match request.entity.as_str() {
            "BAD" => Err(AnalysisError::Fatal("unknown ticker".into())),
            "NEW" => Err(AnalysisError::NotApplicable("no filings".into())),
            _ => ok(request),
        }));
        let (queue, _store) = queue_with(fake.clone(), plenty());
        let job = queue.create_batch("mixed", ["BAD", "NEW", "AAPL"], config(3)).unwrap();

        queue.run_blocking(&job.batch_id).unwrap();

        let items = queue.items(&job.batch_id).unwrap();
        assert_eq!(items[0].status, ItemStatus::Failed);
        assert_eq!(items[0].attempts, 1);
        assert_eq!(items[1].status, ItemStatus::Skipped);
        assert_eq!(items[2].status, ItemStatus::Completed);
        assert_eq!(fake.call_count(), 3);

        let job = queue.job(&job.batch_id).unwrap();
        assert_eq!(
            job.completed_items + job.failed_items + job.skipped_items + job.pending_items(),
            job.total_items
        );
    }

    #[test]
    fn test_runner_panic_is_contained() {
        let fake = Arc::new(runner(|request: &AnalysisRequest| {
            if request.entity == "BOOM" {
                panic!("runner bug");
            }
            ok(request)
        }));
        let (queue, _store) = queue_with(fake, plenty());
        let job = queue.create_batch("panics", ["BOOM", "AAPL"], config(1)).unwrap();

        assert_eq!(queue.run_blocking(&job.batch_id).unwrap(), BatchStatus::Completed);
        let items = queue.items(&job.batch_id).unwrap();
        assert_eq!(items[0].status, ItemStatus::Failed);
        assert_eq!(items[1].status, ItemStatus::Completed);
    }

    #[test]
    fn test_waits_for_capacity_reset_then_resumes() {
        let fake = Arc::new(runner(ok));
        let pool = Arc::new(DailyKeyPool::with_window(["k"], 2, Duration::from_millis(300)));
        let (queue, _store) = queue_with(fake.clone(), pool);
        let job = queue
            .create_batch("quota", ["A", "B", "C", "D", "E"], config(3))
            .unwrap();

        queue.start(&job.batch_id).unwrap();
        let seen = wait_until(&queue, &job.batch_id, BatchStatus::Completed);

        assert!(seen.contains(&BatchStatus::WaitingReset), "statuses: {:?}", seen);
        assert_eq!(seen.last(), Some(&BatchStatus::Completed));
        assert_eq!(fake.call_count(), 5);
        assert_eq!(queue.job(&job.batch_id).unwrap().completed_items, 5);
    }

    #[test]
    fn test_stop_prevents_further_items() {
        let slow = Arc::new(runner(|request: &AnalysisRequest| {
            thread::sleep(Duration::from_millis(30));
            ok(request)
        }));
        let (queue, _store) = queue_with(slow.clone(), plenty());
        let keys: Vec<String> = (0..20).map(|i| format!("T{}", i)).collect();
        let job = queue.create_batch("long", keys, config(3)).unwrap();

        queue.start(&job.batch_id).unwrap();
        while slow.call_count() == 0 {
            thread::sleep(Duration::from_millis(2));
        }
        assert!(queue.stop(&job.batch_id, Duration::from_secs(5)).unwrap());

        let started = slow.call_count();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(slow.call_count(), started);

        let items = queue.items(&job.batch_id).unwrap();
        assert!(items.iter().all(|i| i.status != ItemStatus::Running));
        assert!(items.iter().any(|i| i.status == ItemStatus::Pending));
        assert_eq!(queue.job(&job.batch_id).unwrap().status, BatchStatus::Stopped);
        assert!(!queue.is_worker_alive(&job.batch_id));

        // Stopped jobs restart from their item state.
        queue.start(&job.batch_id).unwrap();
        wait_until(&queue, &job.batch_id, BatchStatus::Completed);
        assert_eq!(queue.job(&job.batch_id).unwrap().completed_items, 20);
        assert_eq!(slow.call_count(), 20);
    }

    #[test]
    fn test_pause_and_resume() {
        let slow = Arc::new(runner(|request: &AnalysisRequest| {
            thread::sleep(Duration::from_millis(20));
            ok(request)
        }));
        let (queue, _store) = queue_with(slow.clone(), plenty());
        let keys: Vec<String> = (0..8).map(|i| format!("T{}", i)).collect();
        let job = queue.create_batch("pausable", keys, config(3)).unwrap();

        queue.start(&job.batch_id).unwrap();
        while slow.call_count() == 0 {
            thread::sleep(Duration::from_millis(2));
        }
        queue.pause(&job.batch_id).unwrap();
        while queue.is_worker_alive(&job.batch_id) {
            thread::sleep(Duration::from_millis(2));
        }

        let paused = queue.job(&job.batch_id).unwrap();
        assert_eq!(paused.status, BatchStatus::Paused);
        assert!(paused.pending_items() > 0);
        assert!(matches!(
            queue.start(&job.batch_id),
            Err(QueueError::InvalidTransition { action: "start", .. })
        ));

        queue.resume(&job.batch_id).unwrap();
        wait_until(&queue, &job.batch_id, BatchStatus::Completed);
        assert_eq!(queue.job(&job.batch_id).unwrap().completed_items, 8);
    }

    #[test]
    fn test_stale_running_item_is_recovered() {
        let fake = Arc::new(runner(ok));
        let (queue, store) = queue_with(fake.clone(), plenty());
        let job = queue.create_batch("crashed", ["AAPL", "MSFT"], config(3)).unwrap();

        // Simulate a worker that died mid-item.
        let mut item = store.next_pending_item(&job.batch_id).unwrap().unwrap();
        item.mark_running();
        store.update_item(&item).unwrap();
        let mut record = store.get_batch(&job.batch_id).unwrap().unwrap();
        record.status = BatchStatus::Running;
        store.update_batch(&record).unwrap();

        assert_eq!(queue.run_blocking(&job.batch_id).unwrap(), BatchStatus::Completed);
        let recovered = store.get_item(&job.batch_id, &item.id).unwrap().unwrap();
        assert_eq!(recovered.status, ItemStatus::Completed);
        assert_eq!(recovered.attempts, 2);
        assert_eq!(fake.call_count(), 2);
    }

    #[test]
    fn test_stale_item_on_final_attempt_is_failed() {
        let fake = Arc::new(runner(ok));
        let (queue, store) = queue_with(fake.clone(), plenty());
        let job = queue.create_batch("crashed", ["AAPL"], config(2)).unwrap();

        let mut item = store.next_pending_item(&job.batch_id).unwrap().unwrap();
        item.mark_running();
        item.requeue("timeout");
        item.mark_running();
        store.update_item(&item).unwrap();

        assert_eq!(queue.run_blocking(&job.batch_id).unwrap(), BatchStatus::Completed);
        let settled = store.get_item(&job.batch_id, &item.id).unwrap().unwrap();
        assert_eq!(settled.status, ItemStatus::Failed);
        assert_eq!(settled.attempts, 2);
        assert_eq!(fake.call_count(), 0);
        assert_eq!(queue.job(&job.batch_id).unwrap().failed_items, 1);
    }

    #[test]
    fn test_invalid_transitions() {
        let (queue, _store) = queue_with(Arc::new(runner(ok)), plenty());
        let job = queue.create_batch("b", ["AAPL"], config(3)).unwrap();

        assert!(matches!(
            queue.pause(&job.batch_id),
            Err(QueueError::InvalidTransition { action: "pause", .. })
        ));
        assert!(matches!(
            queue.resume(&job.batch_id),
            Err(QueueError::InvalidTransition { action: "resume", .. })
        ));

        queue.run_blocking(&job.batch_id).unwrap();
        assert!(matches!(
            queue.start(&job.batch_id),
            Err(QueueError::InvalidTransition { status: BatchStatus::Completed, .. })
        ));
        assert!(matches!(
            queue.job("missing"),
            Err(QueueError::BatchNotFound(_))
        ));
    }
}
