use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::debug;

use crate::{window_remaining, window_start, Decision, QuotaError, QuotaStore};

/// Compare-and-increment in one round trip. The counter moves only while
/// it is below the limit; the expiry is set with the first increment of
/// each window.
const CHECK_AND_INCREMENT: &str = r"
local count = tonumber(redis.call('GET', KEYS[1]) or '0')
local limit = tonumber(ARGV[1])
if count >= limit then
    return {0, 0, redis.call('TTL', KEYS[1])}
end
count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[2])
end
return {1, limit - count, redis.call('TTL', KEYS[1])}
";

/// Fixed-window counters in Redis, shared across gateway instances.
pub struct RedisQuotaStore {
    conn: ConnectionManager,
    script: Script,
    key_prefix: String,
}

impl RedisQuotaStore {
    /// Connect to the store. Supports both `redis://` and `rediss://` URLs;
    /// auth, database and TLS parameters ride along in the URL.
    pub async fn connect(url: &str) -> Result<Self, QuotaError> {
        let client =
            redis::Client::open(url).map_err(|e| QuotaError::Protocol(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| QuotaError::Unavailable(e.to_string()))?;

        Ok(Self {
            conn,
            script: Script::new(CHECK_AND_INCREMENT),
            key_prefix: "quota".to_string(),
        })
    }
}

#[async_trait]
impl QuotaStore for RedisQuotaStore {
    async fn check_and_increment(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<Decision, QuotaError> {
        let now = SystemTime::now();
        // Window start in the key: a stale counter from the previous window
        // reads as absent without any cleanup pass. The expiry lands on the
        // window boundary, not first-request-plus-window, so TTL doubles as
        // the Retry-After for denials.
        let store_key = format!("{}:{}:{}", self.key_prefix, key, window_start(now, window));
        let expire_secs = window_remaining(now, window).as_secs().max(1);

        let mut conn = self.conn.clone();
        let (allowed, remaining, ttl): (i64, i64, i64) = self
            .script
            .key(&store_key)
            .arg(limit)
            .arg(expire_secs)
            .invoke_async(&mut conn)
            .await
            .map_err(classify)?;

        if allowed == 1 {
            debug!(key = %store_key, remaining, "quota increment applied");
            Ok(Decision::Allowed {
                remaining: remaining.max(0) as u64,
            })
        } else {
            let retry_after = if ttl > 0 {
                Duration::from_secs(ttl as u64)
            } else {
                // TTL can report -1/-2 around the boundary; fall back to the
                // wall-clock remainder of the window.
                window_remaining(now, window)
            };
            Ok(Decision::Denied { retry_after })
        }
    }
}

fn classify(err: redis::RedisError) -> QuotaError {
    if err.is_timeout() || err.is_io_error() || err.is_connection_refusal() {
        QuotaError::Unavailable(err.to_string())
    } else {
        QuotaError::Protocol(err.to_string())
    }
}
