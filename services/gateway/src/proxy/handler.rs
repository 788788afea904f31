use std::net::IpAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use tracing::{debug, error, info, instrument, warn};

use super::{GatewayError, ProxiedRequest, ProxyState, UpstreamError, REQUEST_ID_HEADER};
use crate::auth::{bearer_token, AuthError, Principal};
use crate::route::RateLimitBy;
use gatehouse_quota::Decision;

const RATE_LIMIT_REMAINING_HEADER: &str = "X-RateLimit-Remaining";

/// The per-request state machine:
///
/// `Received → Authenticating → RateLimiting → Routing → Forwarding →
/// Completed`, with any stage able to short-circuit to `Rejected`.
///
/// The route table is consulted once, up front, because the matched rule
/// carries the public flag and the per-route limit that the earlier stages
/// need; the NoRoute rejection itself still fires at the Routing stage, so
/// stage ordering decides which error a caller sees. Quota charged during
/// RateLimiting is never refunded by a later failure.
pub struct ProxyHandler {
    state: ProxyState,
}

impl ProxyHandler {
    pub fn new(state: ProxyState) -> Self {
        Self { state }
    }

    #[instrument(skip(self, req), fields(request_id))]
    pub async fn handle(
        &self,
        req: Request<Incoming>,
        client_ip: IpAddr,
    ) -> Response<Full<Bytes>> {
        let started = Instant::now();
        let request_id = request_id_for(&req);
        tracing::Span::current().record("request_id", request_id.as_str());

        let method = req.method().clone();
        let path = req.uri().path().to_string();

        // Liveness probe, answered by the gateway itself: no auth, no
        // quota, no upstream.
        if method == Method::GET && path == "/ping" {
            return pong(&request_id);
        }

        let deadline = self.state.config.request_timeout();
        let outcome = match tokio::time::timeout(
            deadline,
            self.run_pipeline(req, client_ip, &request_id),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(GatewayError::Timeout { stage: "pipeline" }),
        };

        let latency_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(response) => {
                info!(
                    method = %method,
                    path = %path,
                    status = response.status().as_u16(),
                    latency_ms,
                    "request completed"
                );
                response
            }
            Err(err) => {
                match &err {
                    GatewayError::Internal(detail) => {
                        error!(detail = %detail, "pipeline fault")
                    }
                    GatewayError::UpstreamUnavailable(detail) => {
                        warn!(detail = %detail, "upstream unavailable")
                    }
                    GatewayError::Timeout { stage } => warn!(stage, "deadline exceeded"),
                    other => debug!(code = other.code(), "request rejected"),
                }

                let response = err.to_response(&request_id);
                info!(
                    method = %method,
                    path = %path,
                    status = response.status().as_u16(),
                    code = err.code(),
                    latency_ms,
                    "request rejected"
                );
                response
            }
        }
    }

    async fn run_pipeline(
        &self,
        req: Request<Incoming>,
        client_ip: IpAddr,
        request_id: &str,
    ) -> Result<Response<Full<Bytes>>, GatewayError> {
        let received_at = Instant::now();
        let (parts, body) = req.into_parts();
        let path = parts.uri.path().to_string();
        let query = parts.uri.query().map(str::to_string);
        let host = parts
            .headers
            .get(http::header::HOST)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.split(':').next().unwrap_or(value).to_string());

        // Received: one table snapshot serves the whole traversal, so a
        // concurrent reload cannot show this request a mixed rule set.
        let table = self.state.routes.current();
        let candidate = table.match_route(&parts.method, &path, host.as_deref());

        // Authenticating. Only a rule explicitly marked public skips this;
        // a request with no candidate rule is treated as protected, so an
        // unauthenticated caller probing unknown paths sees 401, not 404.
        let principal: Option<Principal> = match candidate {
            Some(rule) if rule.public => {
                debug!(route = %rule.id, "public route, skipping authentication");
                None
            }
            _ => {
                let token =
                    bearer_token(&parts.headers).ok_or(AuthError::MissingCredentials)?;
                let principal = self.state.token_validator.validate(token)?;
                debug!(subject = %principal.subject, "request authenticated");
                Some(principal)
            }
        };

        // RateLimiting. The increment is charged now and stays charged
        // even if routing or forwarding fails afterwards.
        let (limit, window) = candidate
            .and_then(|rule| rule.rate_limit)
            .map(|spec| (spec.requests, Duration::from_secs(spec.window_secs)))
            .unwrap_or((
                self.state.config.default_rate_limit,
                self.state.config.default_rate_window(),
            ));

        let key_by = candidate
            .map(|rule| rule.rate_limit_by())
            .unwrap_or(RateLimitBy::Principal);
        let quota_key = match (key_by, &principal) {
            (RateLimitBy::Principal, Some(principal)) => {
                format!("principal:{}", principal.subject)
            }
            _ => format!("ip:{}", client_ip),
        };

        let remaining = match self
            .state
            .rate_limiter
            .check(&quota_key, limit, window)
            .await?
        {
            Decision::Allowed { remaining } => remaining,
            Decision::Denied { retry_after } => {
                return Err(GatewayError::RateLimited { retry_after })
            }
        };

        // Routing
        let rule = candidate.ok_or(GatewayError::NoRoute)?;

        // Forwarding
        let body_bytes = body
            .collect()
            .await
            .map_err(|err| GatewayError::Internal(format!("failed to read request body: {}", err)))?
            .to_bytes();

        if body_bytes.len() > self.state.config.max_body_size_bytes {
            return Err(GatewayError::PayloadTooLarge {
                size: body_bytes.len(),
                limit: self.state.config.max_body_size_bytes,
            });
        }

        let proxied = ProxiedRequest {
            method: parts.method,
            path,
            query,
            headers: parts.headers,
            body: body_bytes,
            received_at,
            request_id: request_id.to_string(),
            client_ip,
        };

        let mut response =
            self.state
                .upstream
                .forward(&proxied, rule)
                .await
                .map_err(|err| match err {
                    UpstreamError::Timeout => GatewayError::Timeout { stage: "upstream" },
                    UpstreamError::Connect(detail) => GatewayError::UpstreamUnavailable(detail),
                    UpstreamError::Protocol(detail) => GatewayError::UpstreamUnavailable(detail),
                })?;

        // Completed: upstream status and body relay verbatim, the gateway
        // only stamps its own bookkeeping headers on top.
        let headers = response.headers_mut();
        if let Ok(value) = HeaderValue::from_str(request_id) {
            headers.insert(REQUEST_ID_HEADER, value);
        }
        headers.insert(RATE_LIMIT_REMAINING_HEADER, HeaderValue::from(remaining));

        Ok(response)
    }
}

fn request_id_for(req: &Request<Incoming>) -> String {
    req.headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

fn pong(request_id: &str) -> Response<Full<Bytes>> {
    let mut builder = Response::builder().status(StatusCode::OK);
    if let Ok(value) = HeaderValue::from_str(request_id) {
        builder = builder.header(REQUEST_ID_HEADER, value);
    }
    builder
        .body(Full::new(Bytes::from_static(b"pong")))
        .expect("static response parts are valid")
}
