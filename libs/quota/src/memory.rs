use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::{window_remaining, window_start, Decision, QuotaError, QuotaStore};

#[derive(Debug, Clone, Copy)]
struct Counter {
    window_start: u64,
    count: u64,
}

/// In-process fixed-window counters.
///
/// Same semantics as the Redis backend, without the shared state: suitable
/// for single-instance deployments and for tests. Each map shard is locked
/// for the duration of one check-and-increment, which keeps the operation
/// atomic per key.
#[derive(Default)]
pub struct MemoryQuotaStore {
    counters: DashMap<String, Counter>,
}

impl MemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_at(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
        now: SystemTime,
    ) -> Decision {
        let start = window_start(now, window);
        let mut entry = self.counters.entry(key.to_string()).or_insert(Counter {
            window_start: start,
            count: 0,
        });

        // A counter from an earlier window reads as absent.
        if entry.window_start != start {
            entry.window_start = start;
            entry.count = 0;
        }

        if entry.count >= limit {
            Decision::Denied {
                retry_after: window_remaining(now, window),
            }
        } else {
            entry.count += 1;
            Decision::Allowed {
                remaining: limit - entry.count,
            }
        }
    }
}

#[async_trait]
impl QuotaStore for MemoryQuotaStore {
    async fn check_and_increment(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<Decision, QuotaError> {
        Ok(self.check_at(key, limit, window, SystemTime::now()))
    }
}
