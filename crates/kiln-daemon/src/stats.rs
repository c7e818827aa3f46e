//! Dispatch counters.
//!
//! Plain atomic counters bumped on the dispatcher's paths and snapshotted
//! for logging at shutdown or on demand. Passed around inside the
//! dispatcher's context; nothing here is global.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Internal counters for dispatch outcomes.
#[derive(Debug, Default)]
pub struct DispatchStats {
    hits: AtomicU64,
    misses: AtomicU64,
    dedup_joins: AtomicU64,
    direct: AtomicU64,
    local_builds: AtomicU64,
    remote_builds: AtomicU64,
    fallbacks: AtomicU64,
    build_failures: AtomicU64,
    budget_skips: AtomicU64,
    corruption_retries: AtomicU64,
    cancelled: AtomicU64,
}

macro_rules! counter {
    ($record:ident, $field:ident) => {
        pub fn $record(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl DispatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    counter!(record_hit, hits);
    counter!(record_miss, misses);
    counter!(record_dedup_join, dedup_joins);
    counter!(record_direct, direct);
    counter!(record_local_build, local_builds);
    counter!(record_remote_build, remote_builds);
    counter!(record_fallback, fallbacks);
    counter!(record_build_failure, build_failures);
    counter!(record_budget_skip, budget_skips);
    counter!(record_corruption_retry, corruption_retries);
    counter!(record_cancelled, cancelled);

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            dedup_joins: self.dedup_joins.load(Ordering::Relaxed),
            direct: self.direct.load(Ordering::Relaxed),
            local_builds: self.local_builds.load(Ordering::Relaxed),
            remote_builds: self.remote_builds.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            build_failures: self.build_failures.load(Ordering::Relaxed),
            budget_skips: self.budget_skips.load(Ordering::Relaxed),
            corruption_retries: self.corruption_retries.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the dispatch counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub dedup_joins: u64,
    pub direct: u64,
    pub local_builds: u64,
    pub remote_builds: u64,
    pub fallbacks: u64,
    pub build_failures: u64,
    pub budget_skips: u64,
    pub corruption_retries: u64,
    pub cancelled: u64,
}
