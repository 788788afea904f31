mod error;
pub(crate) mod handler;
mod upstream;

pub use error::GatewayError;
pub use handler::ProxyHandler;
pub use upstream::{UpstreamClient, UpstreamError, REQUEST_ID_HEADER};

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use bytes::Bytes;
use http::{HeaderMap, Method};
use tracing::{info, warn};

use crate::auth::TokenValidator;
use crate::config::GatewayConfig;
use crate::quota::RateLimiter;
use crate::route::{load_routes, RouteTableHandle};
use gatehouse_quota::{MemoryQuotaStore, QuotaStore, RedisQuotaStore};

/// One request in flight through the pipeline. Built after the body is
/// collected, destroyed when the response has been relayed.
pub struct ProxiedRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub received_at: Instant,
    pub request_id: String,
    pub client_ip: IpAddr,
}

/// Explicitly-constructed wiring for the request pipeline: every
/// collaborator is built here at startup and passed by handle, none is
/// discovered at runtime.
#[derive(Clone)]
pub struct ProxyState {
    pub config: Arc<GatewayConfig>,
    pub token_validator: Arc<TokenValidator>,
    pub routes: Arc<RouteTableHandle>,
    pub rate_limiter: Arc<RateLimiter>,
    pub upstream: Arc<UpstreamClient>,
}

impl ProxyState {
    pub async fn new(config: GatewayConfig) -> anyhow::Result<Self> {
        let token_validator =
            Arc::new(TokenValidator::new(&config).context("Failed to build token validator")?);

        let routes = Arc::new(RouteTableHandle::new(
            load_routes(&config.routes_file).context("Failed to load route table")?,
        ));

        let store: Arc<dyn QuotaStore> = match config.quota_redis_url {
            Some(ref url) => {
                info!("quota store: redis");
                Arc::new(
                    RedisQuotaStore::connect(url)
                        .await
                        .context("Failed to connect to quota store")?,
                )
            }
            None => {
                warn!("QUOTA_REDIS_URL not set, using in-process quota counters");
                Arc::new(MemoryQuotaStore::new())
            }
        };

        let rate_limiter = Arc::new(RateLimiter::new(
            store,
            config.quota_fail_open,
            config.quota_timeout(),
        ));

        let upstream = Arc::new(
            UpstreamClient::new(config.upstream_timeout(), config.forward_auth_header)
                .context("Failed to build upstream client")?,
        );

        Ok(Self {
            config: Arc::new(config),
            token_validator,
            routes,
            rate_limiter,
            upstream,
        })
    }
}
