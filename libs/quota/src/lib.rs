//! Fixed-window request quotas over a shared key-value store.
//!
//! A quota is a counter keyed by `(identity, window start)`. The first
//! request in a window creates the counter with an expiry at the window
//! boundary; later requests increment it. The check-and-increment is a
//! single atomic operation against the backing store, so concurrent
//! requests for the same identity can never push the counter past the
//! configured ceiling, and a denied request does not consume quota.
//!
//! Two backends are provided: [`RedisQuotaStore`] for shared state across
//! gateway instances, and [`MemoryQuotaStore`] for single-instance
//! deployments and tests. Expired windows are never deleted eagerly; they
//! read as absent and age out of the store on their own.

mod memory;
mod redis_store;

pub use memory::MemoryQuotaStore;
pub use redis_store::RedisQuotaStore;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use thiserror::Error;

/// Outcome of a quota check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request fits within the window; `remaining` is the number of
    /// further requests the identity may make before the boundary.
    Allowed { remaining: u64 },
    /// The ceiling is reached; `retry_after` is the time until the window
    /// rolls over.
    Denied { retry_after: Duration },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }
}

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("quota store unavailable: {0}")]
    Unavailable(String),

    #[error("quota store protocol error: {0}")]
    Protocol(String),
}

/// Storage backend for fixed-window counters.
///
/// Implementations must make `check_and_increment` atomic per key: the
/// compare against the limit and the increment happen as one operation.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn check_and_increment(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<Decision, QuotaError>;
}

/// Start of the fixed window containing `now`, in seconds since the epoch.
fn window_start(now: SystemTime, window: Duration) -> u64 {
    let now_secs = now
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs();
    let win = window.as_secs().max(1);
    now_secs - now_secs % win
}

/// Time left until the window containing `now` rolls over. Never zero, so
/// a `Retry-After` derived from it is always positive.
fn window_remaining(now: SystemTime, window: Duration) -> Duration {
    let now_secs = now
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs();
    let win = window.as_secs().max(1);
    Duration::from_secs(win - now_secs % win)
}
