use std::time::Duration;

use bytes::Bytes;
use http::{Response, StatusCode};
use http_body_util::Full;
use serde_json::json;
use thiserror::Error;

use crate::auth::AuthError;

/// The gateway's rejection taxonomy. Each variant renders a stable
/// machine-readable code and a fixed status; detail stays in the logs,
/// never in the body.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("authentication failed: {0}")]
    Unauthenticated(#[from] AuthError),

    #[error("rate limit exceeded")]
    RateLimited { retry_after: Duration },

    #[error("no route matches the request")]
    NoRoute,

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("request body of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("deadline exceeded at {stage}")]
    Timeout { stage: &'static str },

    #[error("internal gateway fault: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::NoRoute => StatusCode::NOT_FOUND,
            GatewayError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            GatewayError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Unauthenticated(AuthError::TokenExpired) => "TOKEN_EXPIRED",
            GatewayError::Unauthenticated(_) => "UNAUTHENTICATED",
            GatewayError::RateLimited { .. } => "RATE_LIMITED",
            GatewayError::NoRoute => "NO_ROUTE",
            GatewayError::UpstreamUnavailable(_) => "UPSTREAM_UNAVAILABLE",
            GatewayError::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            GatewayError::Timeout { .. } => "TIMEOUT",
            GatewayError::Internal(_) => "INTERNAL",
        }
    }

    /// Caller-facing message. Deliberately generic for upstream and
    /// internal faults so connection strings and backtraces never leak.
    fn public_message(&self) -> String {
        match self {
            GatewayError::Unauthenticated(err) => err.public_message(),
            GatewayError::RateLimited { retry_after } => format!(
                "rate limit exceeded, retry in {}s",
                retry_after_secs(*retry_after)
            ),
            GatewayError::NoRoute => "no route matches the request".to_string(),
            GatewayError::UpstreamUnavailable(_) => "upstream unavailable".to_string(),
            GatewayError::PayloadTooLarge { size, limit } => {
                format!("request body of {} bytes exceeds the {} byte limit", size, limit)
            }
            GatewayError::Timeout { .. } => "deadline exceeded".to_string(),
            GatewayError::Internal(_) => "unexpected gateway fault".to_string(),
        }
    }

    pub fn to_response(&self, request_id: &str) -> Response<Full<Bytes>> {
        let body = json!({
            "error": self.code(),
            "message": self.public_message(),
            "request_id": request_id,
        });

        let mut builder = Response::builder()
            .status(self.status())
            .header("Content-Type", "application/json")
            .header("X-Request-Id", request_id);

        if let GatewayError::RateLimited { retry_after } = self {
            builder = builder.header("Retry-After", retry_after_secs(*retry_after));
        }

        builder
            .body(Full::new(Bytes::from(body.to_string())))
            .expect("static response parts are valid")
    }
}

impl AuthError {
    fn public_message(&self) -> String {
        match self {
            AuthError::MissingCredentials => "missing bearer credentials".to_string(),
            AuthError::TokenExpired => "token expired".to_string(),
            // Signature and structure failures share one message; the
            // distinction lives in the logs.
            AuthError::InvalidToken(_) => "invalid token".to_string(),
        }
    }
}

fn retry_after_secs(retry_after: Duration) -> u64 {
    retry_after.as_secs().max(1)
}
