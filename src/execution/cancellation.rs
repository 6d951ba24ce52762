//! Cooperative Cancellation
//!
//! Every workflow run and batch job owns a [`CancellationToken`] held by a
//! process-scoped [`CancellationRegistry`]. Workers poll the token at check
//! points (before each step, each analysis unit, each batch item, each
//! wait chunk); nothing is ever interrupted preemptively.
//!
//! `cancel_run` raises the flag and then waits at most the given timeout
//! for the run to finish, whether it executes on a bound worker thread or
//! on the caller's thread. A run counts as finished once its token is
//! released. When the wait times out the flag stays set, so the worker
//! still stops at its next check point.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::error::Cancelled;

/// Cancellation flag for one run, optionally bound to its worker thread.
#[derive(Debug)]
pub struct CancellationToken {
    run_id: String,
    cancelled: AtomicBool,
    finished: Mutex<bool>,
    finished_signal: Condvar,
    worker: Mutex<Option<JoinHandle<()>>>,
    created_at: DateTime<Utc>,
}

impl CancellationToken {
    /// Creates a standalone token. Most callers go through
    /// [`CancellationRegistry::try_create_token`] instead.
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            cancelled: AtomicBool::new(false),
            finished: Mutex::new(false),
            finished_signal: Condvar::new(),
            worker: Mutex::new(None),
            created_at: Utc::now(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Raises the flag. Once set it is never cleared.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            debug!("Cancellation requested for run {}", self.run_id);
        }
    }

    /// Check point: converts a raised flag into the [`Cancelled`] signal.
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Binds the worker thread executing this run.
    pub fn bind_worker(&self, handle: JoinHandle<()>) {
        *self.worker.lock() = Some(handle);
    }

    pub fn has_worker(&self) -> bool {
        self.worker.lock().is_some()
    }

    pub fn is_finished(&self) -> bool {
        *self.finished.lock()
    }

    /// Marks the run as no longer executing and wakes every waiter.
    pub fn mark_finished(&self) {
        let mut finished = self.finished.lock();
        if !*finished {
            *finished = true;
            self.finished_signal.notify_all();
        }
    }

    /// Waits up to `timeout` for the run to finish, then reaps the bound
    /// worker thread if there is one.
    ///
    /// Returns true if the run has finished.
    fn wait_finished(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        {
            let mut finished = self.finished.lock();
            while !*finished {
                if self
                    .finished_signal
                    .wait_until(&mut finished, deadline)
                    .timed_out()
                {
                    break;
                }
            }
            if !*finished {
                return false;
            }
        }

        // The worker marks the run finished as its last action.
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("Worker for run {} panicked", self.run_id);
            }
        }
        true
    }
}

/// Process-scoped table of cancellation tokens keyed by run id.
///
/// Shared by reference (`Arc`) with everything that starts a cancellable
/// run; there is no global instance.
#[derive(Debug, Default)]
pub struct CancellationRegistry {
    tokens: RwLock<HashMap<String, Arc<CancellationToken>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a fresh token for a run, replacing any previous one.
    pub fn create_token(&self, run_id: &str) -> Arc<CancellationToken> {
        let token = Arc::new(CancellationToken::new(run_id));
        if self
            .tokens
            .write()
            .insert(run_id.to_string(), Arc::clone(&token))
            .is_some()
        {
            warn!("Replaced existing cancellation token for run {}", run_id);
        }
        debug!("Created cancellation token for run {}", run_id);
        token
    }

    /// Creates a token for a run unless one is already registered.
    ///
    /// Returns `None` while another worker holds the run.
    pub fn try_create_token(&self, run_id: &str) -> Option<Arc<CancellationToken>> {
        let mut tokens = self.tokens.write();
        if tokens.contains_key(run_id) {
            return None;
        }
        let token = Arc::new(CancellationToken::new(run_id));
        tokens.insert(run_id.to_string(), Arc::clone(&token));
        debug!("Created cancellation token for run {}", run_id);
        Some(token)
    }

    pub fn get_token(&self, run_id: &str) -> Option<Arc<CancellationToken>> {
        self.tokens.read().get(run_id).cloned()
    }

    /// Signals a run to stop and waits up to `timeout` for it to finish.
    ///
    /// Returns false if the run is unknown or is still executing when the
    /// timeout elapses; in the latter case the signal remains set and is
    /// honored at the worker's next check point.
    pub fn cancel_run(&self, run_id: &str, timeout: Duration) -> bool {
        let Some(token) = self.get_token(run_id) else {
            warn!("No active run {} to cancel", run_id);
            return false;
        };

        info!("Cancelling run {}", run_id);
        token.cancel();

        if token.wait_finished(timeout) {
            info!("Run {} stopped", run_id);
            true
        } else {
            warn!(
                "Run {} did not stop within {:?}; it will stop at its next check point",
                run_id, timeout
            );
            false
        }
    }

    /// Removes a run's token. Returns true if one was registered.
    pub fn cleanup_token(&self, run_id: &str) -> bool {
        self.tokens.write().remove(run_id).is_some()
    }

    /// Marks `token`'s run finished and unregisters it. The entry is only
    /// removed if it is still `token`, so a finishing worker never drops
    /// the token of a newer run.
    pub fn release(&self, token: &Arc<CancellationToken>) {
        {
            let mut tokens = self.tokens.write();
            if tokens
                .get(token.run_id())
                .is_some_and(|current| Arc::ptr_eq(current, token))
            {
                tokens.remove(token.run_id());
                debug!("Released cancellation token for run {}", token.run_id());
            }
        }
        token.mark_finished();
    }

    /// Ids of runs that currently hold a token.
    pub fn active_runs(&self) -> Vec<String> {
        let mut runs: Vec<String> = self.tokens.read().keys().cloned().collect();
        runs.sort();
        runs
    }

    pub fn len(&self) -> usize {
        self.tokens.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.read().is_empty()
    }
}
