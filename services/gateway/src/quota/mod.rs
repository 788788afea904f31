use std::sync::Arc;
use std::time::Duration;

use gatehouse_quota::{Decision, QuotaStore};
use tracing::{debug, error, warn};

use crate::proxy::GatewayError;

/// Quota enforcement in front of the shared store.
///
/// Wraps every store round trip in its own deadline and applies the
/// configured availability policy: a store timeout rejects the request as
/// a gateway timeout, any other store failure either denies (fail closed,
/// the default) or allows (fail open). Both failure paths log at a level
/// distinct from an ordinary denial, which is debug-only.
pub struct RateLimiter {
    store: Arc<dyn QuotaStore>,
    fail_open: bool,
    call_timeout: Duration,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn QuotaStore>, fail_open: bool, call_timeout: Duration) -> Self {
        Self {
            store,
            fail_open,
            call_timeout,
        }
    }

    pub async fn check(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<Decision, GatewayError> {
        let call = self.store.check_and_increment(key, limit, window);

        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(Ok(decision)) => {
                if let Decision::Denied { retry_after } = decision {
                    debug!(key, limit, retry_after_secs = retry_after.as_secs(), "quota denied");
                }
                Ok(decision)
            }
            Ok(Err(err)) => {
                if self.fail_open {
                    warn!(key, error = %err, "quota store failed, failing open");
                    Ok(Decision::Allowed {
                        remaining: limit.saturating_sub(1),
                    })
                } else {
                    error!(key, error = %err, "quota store failed, failing closed");
                    Ok(Decision::Denied {
                        retry_after: window,
                    })
                }
            }
            Err(_) => {
                error!(key, timeout_ms = self.call_timeout.as_millis() as u64, "quota store deadline exceeded");
                Err(GatewayError::Timeout {
                    stage: "quota store",
                })
            }
        }
    }
}
