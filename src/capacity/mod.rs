//! Capacity Management
//!
//! External analysis calls draw on a shared, periodically resetting budget
//! (for example a daily request quota spread over several API keys). The
//! batch queue consults a [`CapacityProvider`] before every item and waits
//! for the next reset when the whole pool is exhausted.
//!
//! - [`CapacityProvider`]: the reserve/release contract
//! - [`DailyKeyPool`]: N keys with a per-key limit per window

pub mod daily;

use chrono::{DateTime, Utc};

pub use daily::DailyKeyPool;

/// Shared budget of external calls.
///
/// `try_reserve` must be atomic: two callers racing for the last unit
/// cannot both succeed. A reserved unit is consumed unless handed back
/// with `release`.
pub trait CapacityProvider: Send + Sync {
    /// Reserves one unit, returning the key it was drawn from.
    fn try_reserve(&self) -> Option<String>;

    /// Returns an unused reservation to the pool.
    fn release(&self, key: &str);

    /// Instant at which exhausted capacity is replenished.
    fn next_reset_at(&self) -> DateTime<Utc>;

    /// Units available per day across the whole pool.
    fn total_capacity_per_day(&self) -> u32;

    /// Units left in the current window.
    fn available(&self) -> u32;
}
