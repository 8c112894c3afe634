//! Prepared-statement usage tracking (§4.5 "Prepared-statement cache").
//!
//! `sqlx` already caches prepared statements per connection; what this adds
//! is the execution-count/total-time bookkeeping that
//! `getStatementStats()` to expose. Statements are identified by a short
//! logical key (`"get_by_path"`, `"create_entry"`, …), not by SQL text.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;

#[derive(Debug, Clone, Copy, Default)]
pub struct StatementStats {
    pub executions: u64,
    pub total_time_us: u64,
}

#[derive(Default)]
struct Counter {
    executions: AtomicU64,
    total_time_us: AtomicU64,
}

/// Tracks execution count and cumulative latency per logical statement key.
#[derive(Default)]
pub struct PreparedStatementCache {
    counters: DashMap<&'static str, Counter>,
}

impl PreparedStatementCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a statement key ahead of use so `get_statement_stats`
    /// reports zero-execution entries too, matching "registered at
    /// construction" in §4.5.
    pub fn register(&self, key: &'static str) {
        self.counters.entry(key).or_default();
    }

    /// Times `f` and records the execution under `key`.
    pub async fn timed<F, Fut, T>(&self, key: &'static str, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let start = Instant::now();
        let result = f().await;
        let elapsed = start.elapsed().as_micros() as u64;
        let counter = self.counters.entry(key).or_default();
        counter.executions.fetch_add(1, Ordering::Relaxed);
        counter.total_time_us.fetch_add(elapsed, Ordering::Relaxed);
        result
    }

    pub fn get_statement_stats(&self) -> Vec<(&'static str, StatementStats)> {
        self.counters
            .iter()
            .map(|entry| {
                let (key, counter) = (*entry.key(), entry.value());
                (
                    key,
                    StatementStats {
                        executions: counter.executions.load(Ordering::Relaxed),
                        total_time_us: counter.total_time_us.load(Ordering::Relaxed),
                    },
                )
            })
            .collect()
    }
}
