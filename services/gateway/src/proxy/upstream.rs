use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, Response};
use http_body_util::Full;
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::ProxiedRequest;
use crate::route::RouteRule;

pub const REQUEST_ID_HEADER: &str = "X-Request-Id";

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream call timed out")]
    Timeout,

    #[error("upstream connection failed: {0}")]
    Connect(String),

    #[error("upstream protocol error: {0}")]
    Protocol(String),
}

/// Forwards proxied requests to their route's upstream target.
///
/// Each call gets its own deadline (the route's, falling back to the
/// gateway default). Idempotent methods are retried once against the same
/// target on connection-reset-class failures; nothing is ever retried once
/// response bytes have arrived, and there is no failover to a different
/// upstream.
pub struct UpstreamClient {
    http_client: Client,
    default_timeout: Duration,
    forward_auth_header: bool,
}

impl UpstreamClient {
    pub fn new(default_timeout: Duration, forward_auth_header: bool) -> anyhow::Result<Self> {
        // Per-request timeouts only; a client-wide timeout would override
        // the per-route configuration.
        let http_client = Client::builder().pool_max_idle_per_host(20).build()?;

        Ok(Self {
            http_client,
            default_timeout,
            forward_auth_header,
        })
    }

    #[instrument(skip(self, req, rule), fields(route = %rule.id, method = %req.method, path = %req.path))]
    pub async fn forward(
        &self,
        req: &ProxiedRequest,
        rule: &RouteRule,
    ) -> Result<Response<Full<Bytes>>, UpstreamError> {
        let timeout = rule
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        let mut path = rule.rewrite_path(&req.path);
        if let Some(ref query) = req.query {
            path.push('?');
            path.push_str(query);
        }
        let url = format!("{}{}", rule.upstream.trim_end_matches('/'), path);

        debug!(url = %url, timeout_secs = timeout.as_secs(), "forwarding to upstream");

        let headers = self.sanitize_headers(&req.headers);

        let attempts = if is_idempotent(&req.method) { 2 } else { 1 };
        let mut last_connect_error = String::new();

        for attempt in 1..=attempts {
            let mut builder = self
                .http_client
                .request(req.method.clone(), &url)
                .timeout(timeout);

            for (name, value) in headers.iter() {
                builder = builder.header(name.as_str(), value.as_bytes());
            }

            for (name, value) in rule.added_headers() {
                builder = builder.header(name, value);
            }

            builder = builder
                .header(REQUEST_ID_HEADER, &req.request_id)
                .header("X-Forwarded-For", req.client_ip.to_string())
                .header("X-Forwarded-Proto", "http");

            if !req.body.is_empty() {
                builder = builder.body(req.body.clone());
            }

            let start = std::time::Instant::now();

            match builder.send().await {
                Ok(upstream_response) => {
                    let status = upstream_response.status();
                    info!(
                        status = status.as_u16(),
                        latency_ms = start.elapsed().as_millis() as u64,
                        attempt,
                        "upstream response received"
                    );
                    return relay(upstream_response).await;
                }
                Err(err) if err.is_timeout() => return Err(UpstreamError::Timeout),
                Err(err) if err.is_connect() => {
                    last_connect_error = err.to_string();
                    if attempt < attempts {
                        warn!(error = %err, "upstream connect failed, retrying once");
                        continue;
                    }
                }
                Err(err) => return Err(UpstreamError::Protocol(err.to_string())),
            }
        }

        Err(UpstreamError::Connect(last_connect_error))
    }

    /// Strips hop-by-hop headers; the remainder is forwarded verbatim.
    /// Host is omitted so the client derives it from the upstream URL.
    fn sanitize_headers(&self, headers: &HeaderMap) -> HeaderMap {
        const HOP_BY_HOP: &[&str] = &[
            "connection",
            "host",
            "keep-alive",
            "proxy-authenticate",
            "proxy-authorization",
            "te",
            "trailers",
            "transfer-encoding",
            "upgrade",
        ];

        let mut sanitized = HeaderMap::new();

        for (name, value) in headers.iter() {
            let name_lower = name.as_str().to_lowercase();

            if HOP_BY_HOP.contains(&name_lower.as_str()) {
                continue;
            }

            if name_lower == "authorization" && !self.forward_auth_header {
                continue;
            }

            // The gateway assigns its own request id downstream.
            if name_lower == "x-request-id" {
                continue;
            }

            sanitized.insert(name.clone(), value.clone());
        }

        sanitized
    }
}

async fn relay(upstream_response: reqwest::Response) -> Result<Response<Full<Bytes>>, UpstreamError> {
    let status = upstream_response.status();

    let mut builder = Response::builder().status(status);
    for (name, value) in upstream_response.headers().iter() {
        if !is_hop_by_hop(name.as_str()) {
            builder = builder.header(name, value);
        }
    }

    let body = upstream_response
        .bytes()
        .await
        .map_err(|err| UpstreamError::Protocol(format!("failed to read upstream body: {}", err)))?;

    builder
        .body(Full::new(body))
        .map_err(|err| UpstreamError::Protocol(format!("failed to rebuild response: {}", err)))
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "connection" | "keep-alive" | "te" | "trailers" | "transfer-encoding" | "upgrade"
    )
}

fn is_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::PUT | Method::DELETE
    )
}
