//! Per-key daily quota pool.

use std::time::Duration;

use chrono::{DateTime, Days, TimeZone, Utc};
use indexmap::IndexMap;
use log::{debug, info};
use parking_lot::Mutex;

use super::CapacityProvider;

const SECONDS_PER_DAY: i64 = 86_400;

/// When counters reset.
#[derive(Debug, Clone, Copy)]
enum Window {
    /// Every day at 00:00 UTC
    UtcDay,
    /// Every `period`, starting from pool creation
    Rolling(chrono::Duration),
}

#[derive(Debug)]
struct PoolState {
    used: IndexMap<String, u32>,
    next_reset: DateTime<Utc>,
}

/// A pool of API keys, each allowed `per_key_limit` calls per window.
///
/// Counters are reset lazily: the first access at or after the reset
/// instant zeroes them and computes the next one. Reservations draw from
/// the least-used key so load spreads evenly.
#[derive(Debug)]
pub struct DailyKeyPool {
    per_key_limit: u32,
    window: Window,
    state: Mutex<PoolState>,
}

fn next_utc_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = now
        .date_naive()
        .checked_add_days(Days::new(1))
        .and_then(|day| day.and_hms_opt(0, 0, 0));
    match tomorrow {
        Some(midnight) => Utc.from_utc_datetime(&midnight),
        None => now + chrono::Duration::days(1),
    }
}

impl DailyKeyPool {
    /// Pool resetting every day at midnight UTC. Duplicate and blank keys
    /// are dropped.
    pub fn new<I, S>(keys: I, per_key_limit: u32) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::build(keys, per_key_limit, Window::UtcDay, Utc::now())
    }

    /// Pool resetting every `period` from now.
    pub fn with_window<I, S>(keys: I, per_key_limit: u32, period: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let period = chrono::Duration::from_std(period)
            .unwrap_or_else(|_| chrono::Duration::days(1))
            .max(chrono::Duration::milliseconds(1));
        Self::build(keys, per_key_limit, Window::Rolling(period), Utc::now())
    }

    fn build<I, S>(keys: I, per_key_limit: u32, window: Window, now: DateTime<Utc>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let used: IndexMap<String, u32> = keys
            .into_iter()
            .map(|k| k.into().trim().to_string())
            .filter(|k| !k.is_empty())
            .map(|k| (k, 0))
            .collect();
        let next_reset = match window {
            Window::UtcDay => next_utc_midnight(now),
            Window::Rolling(period) => now + period,
        };
        info!(
            "Capacity pool: {} keys x {} calls, next reset {}",
            used.len(),
            per_key_limit,
            next_reset
        );
        Self {
            per_key_limit,
            window,
            state: Mutex::new(PoolState { used, next_reset }),
        }
    }

    pub fn key_count(&self) -> usize {
        self.state.lock().used.len()
    }

    /// Calls drawn from `key` in the current window.
    pub fn used(&self, key: &str) -> u32 {
        let mut state = self.state.lock();
        self.roll(&mut state, Utc::now());
        state.used.get(key).copied().unwrap_or(0)
    }

    /// Zeroes the counters if the reset instant has passed.
    fn roll(&self, state: &mut PoolState, now: DateTime<Utc>) {
        if now < state.next_reset {
            return;
        }
        state.next_reset = match self.window {
            Window::UtcDay => next_utc_midnight(now),
            Window::Rolling(period) => {
                let mut next = state.next_reset;
                while next <= now {
                    next += period;
                }
                next
            }
        };
        state.used.values_mut().for_each(|count| *count = 0);
        debug!("Capacity window reset; next reset {}", state.next_reset);
    }

    fn windows_per_day(&self) -> u32 {
        match self.window {
            Window::UtcDay => 1,
            Window::Rolling(period) => {
                let seconds = period.num_seconds().max(1);
                u32::try_from(SECONDS_PER_DAY / seconds).unwrap_or(u32::MAX).max(1)
            }
        }
    }
}

impl CapacityProvider for DailyKeyPool {
    fn try_reserve(&self) -> Option<String> {
        let mut state = self.state.lock();
        self.roll(&mut state, Utc::now());

        let limit = self.per_key_limit;
        let (key, count) = state
            .used
            .iter_mut()
            .filter(|(_, count)| **count < limit)
            .min_by_key(|(_, count)| **count)?;
        *count += 1;
        Some(key.clone())
    }

    fn release(&self, key: &str) {
        let mut state = self.state.lock();
        if let Some(count) = state.used.get_mut(key) {
            *count = count.saturating_sub(1);
        }
    }

    fn next_reset_at(&self) -> DateTime<Utc> {
        let mut state = self.state.lock();
        self.roll(&mut state, Utc::now());
        state.next_reset
    }

    fn total_capacity_per_day(&self) -> u32 {
        let keys = u32::try_from(self.key_count()).unwrap_or(u32::MAX);
        keys.saturating_mul(self.per_key_limit)
            .saturating_mul(self.windows_per_day())
    }

    fn available(&self) -> u32 {
        let mut state = self.state.lock();
        self.roll(&mut state, Utc::now());
        state
            .used
            .values()
            .map(|used| self.per_key_limit.saturating_sub(*used))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_reserve_until_exhausted() {
        let pool = DailyKeyPool::new(["k1", "k2"], 2);
        assert_eq!(pool.total_capacity_per_day(), 4);

        let keys: Vec<String> = (0..4).filter_map(|_| pool.try_reserve()).collect();
        assert_eq!(keys.len(), 4);
        assert_eq!(keys.iter().filter(|k| *k == "k1").count(), 2);
        assert!(pool.try_reserve().is_none());
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_least_used_key_first() {
        let pool = DailyKeyPool::new(["a", "b", "c"], 5);
        let order: Vec<String> = (0..3).filter_map(|_| pool.try_reserve()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_release_returns_unit() {
        let pool = DailyKeyPool::new(["k"], 1);
        let key = pool.try_reserve().unwrap();
        assert!(pool.try_reserve().is_none());

        pool.release(&key);
        assert_eq!(pool.try_reserve().as_deref(), Some("k"));
    }

    #[test]
    fn test_duplicate_and_blank_keys_dropped() {
        let pool = DailyKeyPool::new(["k", " k ", ""], 3);
        assert_eq!(pool.key_count(), 1);
        assert_eq!(pool.total_capacity_per_day(), 3);
    }

    #[test]
    fn test_daily_window_aligned_to_midnight() {
        let now = Utc.with_ymd_and_hms(2026, 10, 17, 15, 30, 0).unwrap();
        assert_eq!(
            next_utc_midnight(now),
            Utc.with_ymd_and_hms(2026, 10, 18, 0, 0, 0).unwrap()
        );

        let pool = DailyKeyPool::new(["k"], 1);
        let reset = pool.next_reset_at();
        assert!(reset > Utc::now());
        assert!(reset <= Utc::now() + chrono::Duration::days(1));
    }

    #[test]
    fn test_rolling_window_resets_lazily() {
        let pool = DailyKeyPool::with_window(["k"], 1, Duration::from_millis(50));
        assert!(pool.try_reserve().is_some());
        assert!(pool.try_reserve().is_none());
        assert_eq!(pool.used("k"), 1);

        thread::sleep(Duration::from_millis(80));
        assert_eq!(pool.available(), 1);
        assert!(pool.try_reserve().is_some());
        assert!(pool.next_reset_at() > Utc::now() - chrono::Duration::milliseconds(1));
    }

    #[test]
    fn test_concurrent_reserve_never_oversubscribes() {
        let pool = Arc::new(DailyKeyPool::new(["a", "b"], 25));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || (0..20).filter(|_| pool.try_reserve().is_some()).count())
            })
            .collect();

        let granted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(granted, 50);
    }
}
