//! Batch Processing Module
//!
//! A batch job is a persisted worklist of work keys (e.g. tickers), each
//! analyzed once by the shared analysis runner while drawing on a shared
//! capacity pool.
//!
//! - [`model`]: job and item records, their states and counts
//! - [`queue`]: the worker that drains a job's items

pub mod model;
pub mod queue;

pub use model::{
    BatchConfig, BatchItem, BatchJob, BatchStatus, ItemCounts, ItemStatus, WorkKey,
    DEFAULT_MAX_RETRIES,
};
pub use queue::{BatchQueue, QueueConfig};
