//! Batch Job Model
//!
//! A batch job is a persisted worklist: one [`BatchItem`] per work key,
//! processed one at a time. Item status is itself the resume point, so a
//! stopped or crashed job picks up exactly where its items left off.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::analysis::AnalysisConfig;

/// Default number of attempts per item.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Lifecycle of a batch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Running,
    Paused,
    WaitingReset,
    Completed,
    Failed,
    Stopped,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::WaitingReset => "waiting_reset",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    /// States in which a worker is (or should be) processing the job.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::WaitingReset)
    }

    /// States from which `start` may launch a worker.
    pub fn can_start(&self) -> bool {
        matches!(self, Self::Pending | Self::Stopped | Self::Failed)
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Analysis performed for every item
    #[serde(default)]
    pub analysis: AnalysisConfig,

    /// Attempts per item before it is marked failed
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Informational ordering hint for callers listing jobs
    #[serde(default)]
    pub priority: i32,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            analysis: AnalysisConfig::default(),
            max_retries: DEFAULT_MAX_RETRIES,
            priority: 0,
        }
    }
}

impl BatchConfig {
    pub fn new(analysis: AnalysisConfig) -> Self {
        Self {
            analysis,
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Persistent record of a batch job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJob {
    pub batch_id: String,
    pub name: String,
    pub status: BatchStatus,
    pub total_items: usize,
    pub completed_items: usize,
    pub failed_items: usize,
    #[serde(default)]
    pub skipped_items: usize,
    pub config: BatchConfig,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_activity_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub estimated_completion: Option<DateTime<Utc>>,
}

impl BatchJob {
    pub fn new(name: impl Into<String>, total_items: usize, config: BatchConfig) -> Self {
        Self {
            batch_id: Uuid::new_v4().to_string(),
            name: name.into(),
            status: BatchStatus::Pending,
            total_items,
            completed_items: 0,
            failed_items: 0,
            skipped_items: 0,
            config,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            last_activity_at: None,
            error_message: None,
            estimated_completion: None,
        }
    }

    /// Items not yet in a terminal state.
    pub fn pending_items(&self) -> usize {
        self.total_items
            .saturating_sub(self.completed_items + self.failed_items + self.skipped_items)
    }

    /// Copies aggregate counts from a fresh item tally.
    pub fn apply_counts(&mut self, counts: &ItemCounts) {
        self.total_items = counts.total;
        self.completed_items = counts.completed;
        self.failed_items = counts.failed;
        self.skipped_items = counts.skipped;
    }

    pub fn touch(&mut self) {
        self.last_activity_at = Some(Utc::now());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of batch work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItem {
    pub id: String,
    pub batch_id: String,
    pub work_key: String,
    pub display_name: String,
    pub status: ItemStatus,
    pub attempts: u32,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Creation order within the batch
    pub sequence: usize,
}

impl BatchItem {
    pub fn new(batch_id: impl Into<String>, key: &WorkKey, sequence: usize) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            batch_id: batch_id.into(),
            work_key: key.key.clone(),
            display_name: key.display_name.clone(),
            status: ItemStatus::Pending,
            attempts: 0,
            run_id: None,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            sequence,
        }
    }

    /// Starts an attempt.
    pub fn mark_running(&mut self) {
        self.status = ItemStatus::Running;
        self.attempts += 1;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_completed(&mut self, run_id: Option<String>) {
        self.status = ItemStatus::Completed;
        self.run_id = run_id;
        self.error_message = None;
        self.completed_at = Some(Utc::now());
    }

    /// Returns the item to the queue after a retryable failure.
    pub fn requeue(&mut self, message: impl Into<String>) {
        self.status = ItemStatus::Pending;
        self.error_message = Some(message.into());
    }

    pub fn mark_failed(&mut self, message: impl Into<String>) {
        self.status = ItemStatus::Failed;
        self.error_message = Some(message.into());
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_skipped(&mut self, reason: impl Into<String>) {
        self.status = ItemStatus::Skipped;
        self.error_message = Some(reason.into());
        self.completed_at = Some(Utc::now());
    }

    /// Settles an item left `running` by a worker that died mid-attempt.
    /// The interrupted attempt still counts, so an item out of attempts
    /// is failed instead of requeued.
    pub fn reset_stale(&mut self, max_retries: u32) -> bool {
        if self.status != ItemStatus::Running {
            return false;
        }
        if self.attempts >= max_retries {
            self.mark_failed("interrupted during final attempt");
        } else {
            self.requeue("interrupted before completion");
        }
        true
    }
}

/// Tally of a batch's items by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemCounts {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl ItemCounts {
    pub fn from_items<'a>(items: impl IntoIterator<Item = &'a BatchItem>) -> Self {
        let mut counts = Self::default();
        for item in items {
            counts.total += 1;
            match item.status {
                ItemStatus::Pending => counts.pending += 1,
                ItemStatus::Running => counts.running += 1,
                ItemStatus::Completed => counts.completed += 1,
                ItemStatus::Failed => counts.failed += 1,
                ItemStatus::Skipped => counts.skipped += 1,
            }
        }
        counts
    }

    /// Items not yet in a terminal state.
    pub fn remaining(&self) -> usize {
        self.pending + self.running
    }
}

/// A work key plus the label shown for it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkKey {
    pub key: String,
    pub display_name: String,
}

impl WorkKey {
    pub fn new(key: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            display_name: display_name.into(),
        }
    }
}

impl From<&str> for WorkKey {
    fn from(key: &str) -> Self {
        let key = key.trim();
        Self::new(key, key)
    }
}

impl From<String> for WorkKey {
    fn from(key: String) -> Self {
        Self::from(key.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item() -> BatchItem {
        BatchItem::new("b1", &WorkKey::from("AAPL"), 0)
    }

    #[test]
    fn test_item_attempt_lifecycle() {
        let mut item = item();
        item.mark_running();
        assert_eq!(item.attempts, 1);
        item.requeue("timeout");
        assert_eq!(item.status, ItemStatus::Pending);

        item.mark_running();
        item.mark_completed(Some("run-9".into()));
        assert_eq!(item.attempts, 2);
        assert_eq!(item.status, ItemStatus::Completed);
        assert!(item.error_message.is_none());
        assert!(item.status.is_terminal());
    }

    #[test]
    fn test_reset_stale_only_touches_running() {
        let mut item = item();
        assert!(!item.reset_stale(3));

        item.mark_running();
        assert!(item.reset_stale(3));
        assert_eq!(item.status, ItemStatus::Pending);
        assert_eq!(item.attempts, 1);
    }

    #[test]
    fn test_reset_stale_fails_item_out_of_attempts() {
        let mut item = item();
        item.mark_running();
        item.requeue("timeout");
        item.mark_running();

        assert!(item.reset_stale(2));
        assert_eq!(item.status, ItemStatus::Failed);
        assert_eq!(item.attempts, 2);
        assert!(item.completed_at.is_some());
    }

    #[test]
    fn test_counts_invariant() {
        let mut items: Vec<BatchItem> = (0..5)
            .map(|i| BatchItem::new("b1", &WorkKey::from(format!("K{}", i)), i))
            .collect();
        items[0].mark_completed(None);
        items[1].mark_failed("bad");
        items[2].mark_skipped("no filings");
        items[3].mark_running();

        let counts = ItemCounts::from_items(&items);
        assert_eq!(counts.remaining(), 2);
        assert_eq!(
            counts.completed + counts.failed + counts.skipped + counts.remaining(),
            counts.total
        );

        let mut job = BatchJob::new("job", 5, BatchConfig::default());
        job.apply_counts(&counts);
        assert_eq!(job.pending_items(), 2);
    }

    #[test]
    fn test_status_labels() {
        assert_eq!(BatchStatus::WaitingReset.to_string(), "waiting_reset");
        assert_eq!(ItemStatus::Skipped.to_string(), "skipped");
        assert_eq!(serde_json::to_value(ItemStatus::Skipped).unwrap(), ItemStatus::Skipped.as_str());
        assert_eq!(
            serde_json::to_value(BatchStatus::WaitingReset).unwrap(),
            "waiting_reset"
        );
        assert!(BatchStatus::WaitingReset.is_active());
        assert!(BatchStatus::Stopped.can_start());
        assert!(!BatchStatus::Paused.can_start());
    }

    #[test]
    fn test_config_defaults() {
        let config: BatchConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(config, BatchConfig::default());
    }
}
