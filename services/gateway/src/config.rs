use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Listen host address
    pub host: String,

    /// Listen port
    pub port: u16,

    /// Path to the JSON route table
    pub routes_file: PathBuf,

    /// JWT shared secret for HMAC algorithms
    pub jwt_secret: Option<String>,

    /// JWT public key path for RSA algorithms
    pub jwt_public_key_path: Option<PathBuf>,

    /// JWT algorithm (HS256, HS384, HS512, RS256, RS384, RS512)
    pub jwt_algorithm: JwtAlgorithm,

    /// Accepted clock skew on token expiry, in seconds
    pub jwt_leeway_secs: u64,

    /// Redis endpoint for the quota store; in-process counters when unset
    pub quota_redis_url: Option<String>,

    /// Allow requests through when the quota store is unreachable
    pub quota_fail_open: bool,

    /// Deadline for one quota-store round trip, in milliseconds
    pub quota_timeout_ms: u64,

    /// Requests per window for routes without their own limit
    pub default_rate_limit: u64,

    /// Window length for the default limit, in seconds
    pub default_rate_window_secs: u64,

    /// Per-call upstream deadline for routes without their own, in seconds
    pub upstream_timeout_secs: u64,

    /// End-to-end deadline for one pipeline traversal, in seconds
    pub request_timeout_secs: u64,

    /// Maximum request body size in bytes
    pub max_body_size_bytes: usize,

    /// Forward the caller's Authorization header to the upstream
    pub forward_auth_header: bool,

    /// TLS certificate path (terminates TLS when set together with the key)
    pub tls_cert_path: Option<PathBuf>,

    /// TLS private key path
    pub tls_key_path: Option<PathBuf>,

    /// Log level
    pub log_level: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum JwtAlgorithm {
    HS256,
    HS384,
    HS512,
    RS256,
    RS384,
    RS512,
}

impl Default for JwtAlgorithm {
    fn default() -> Self {
        JwtAlgorithm::HS256
    }
}

impl JwtAlgorithm {
    pub fn is_hmac(self) -> bool {
        matches!(
            self,
            JwtAlgorithm::HS256 | JwtAlgorithm::HS384 | JwtAlgorithm::HS512
        )
    }
}

impl std::str::FromStr for JwtAlgorithm {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "HS256" => Ok(JwtAlgorithm::HS256),
            "HS384" => Ok(JwtAlgorithm::HS384),
            "HS512" => Ok(JwtAlgorithm::HS512),
            "RS256" => Ok(JwtAlgorithm::RS256),
            "RS384" => Ok(JwtAlgorithm::RS384),
            "RS512" => Ok(JwtAlgorithm::RS512),
            _ => anyhow::bail!("Unsupported JWT algorithm: {}", s),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let host = std::env::var("GATEWAY_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = std::env::var("GATEWAY_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .context("Invalid GATEWAY_PORT")?;

        let routes_file = std::env::var("ROUTES_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("routes.json"));

        let jwt_secret = std::env::var("JWT_SECRET").ok();

        let jwt_public_key_path = std::env::var("JWT_PUBLIC_KEY_PATH").ok().map(PathBuf::from);

        let jwt_algorithm = std::env::var("JWT_ALGORITHM")
            .unwrap_or_else(|_| "HS256".to_string())
            .parse()?;

        let jwt_leeway_secs = std::env::var("JWT_LEEWAY_SECS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .context("Invalid JWT_LEEWAY_SECS")?;

        let quota_redis_url = std::env::var("QUOTA_REDIS_URL").ok();

        let quota_fail_open = std::env::var("QUOTA_FAIL_OPEN")
            .unwrap_or_else(|_| "false".to_string())
            .parse()
            .context("Invalid QUOTA_FAIL_OPEN")?;

        let quota_timeout_ms = std::env::var("QUOTA_TIMEOUT_MS")
            .unwrap_or_else(|_| "500".to_string())
            .parse()
            .context("Invalid QUOTA_TIMEOUT_MS")?;

        let default_rate_limit = std::env::var("DEFAULT_RATE_LIMIT")
            .unwrap_or_else(|_| "100".to_string())
            .parse()
            .context("Invalid DEFAULT_RATE_LIMIT")?;

        let default_rate_window_secs = std::env::var("DEFAULT_RATE_WINDOW_SECS")
            .unwrap_or_else(|_| "60".to_string())
            .parse()
            .context("Invalid DEFAULT_RATE_WINDOW_SECS")?;

        let upstream_timeout_secs = std::env::var("UPSTREAM_TIMEOUT_SECS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .context("Invalid UPSTREAM_TIMEOUT_SECS")?;

        let request_timeout_secs = std::env::var("REQUEST_TIMEOUT_SECS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .context("Invalid REQUEST_TIMEOUT_SECS")?;

        let max_body_size_bytes = std::env::var("MAX_BODY_SIZE_BYTES")
            .unwrap_or_else(|_| "10485760".to_string()) // 10MB
            .parse()
            .context("Invalid MAX_BODY_SIZE_BYTES")?;

        let forward_auth_header = std::env::var("FORWARD_AUTH_HEADER")
            .unwrap_or_else(|_| "true".to_string())
            .parse()
            .context("Invalid FORWARD_AUTH_HEADER")?;

        let tls_cert_path = std::env::var("TLS_CERT_PATH").ok().map(PathBuf::from);

        let tls_key_path = std::env::var("TLS_KEY_PATH").ok().map(PathBuf::from);

        let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            host,
            port,
            routes_file,
            jwt_secret,
            jwt_public_key_path,
            jwt_algorithm,
            jwt_leeway_secs,
            quota_redis_url,
            quota_fail_open,
            quota_timeout_ms,
            default_rate_limit,
            default_rate_window_secs,
            upstream_timeout_secs,
            request_timeout_secs,
            max_body_size_bytes,
            forward_auth_header,
            tls_cert_path,
            tls_key_path,
            log_level,
        })
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !self.routes_file.exists() {
            anyhow::bail!("Routes file not found: {:?}", self.routes_file);
        }

        if self.jwt_algorithm.is_hmac() {
            if self.jwt_secret.is_none() {
                anyhow::bail!("JWT_SECRET is required for HMAC algorithms (HS256/HS384/HS512)");
            }
        } else {
            match self.jwt_public_key_path {
                None => anyhow::bail!("JWT_PUBLIC_KEY_PATH is required for RSA algorithms"),
                Some(ref path) if !path.exists() => {
                    anyhow::bail!("JWT public key file not found: {:?}", path)
                }
                Some(_) => {}
            }
        }

        if self.default_rate_limit == 0 {
            anyhow::bail!("DEFAULT_RATE_LIMIT must be greater than 0");
        }

        if self.default_rate_window_secs == 0 {
            anyhow::bail!("DEFAULT_RATE_WINDOW_SECS must be greater than 0");
        }

        if self.quota_timeout_ms == 0 {
            anyhow::bail!("QUOTA_TIMEOUT_MS must be greater than 0");
        }

        if self.upstream_timeout_secs == 0 {
            anyhow::bail!("UPSTREAM_TIMEOUT_SECS must be greater than 0");
        }

        if self.request_timeout_secs == 0 {
            anyhow::bail!("REQUEST_TIMEOUT_SECS must be greater than 0");
        }

        if self.max_body_size_bytes == 0 {
            anyhow::bail!("MAX_BODY_SIZE_BYTES must be greater than 0");
        }

        match (self.tls_cert_path.as_ref(), self.tls_key_path.as_ref()) {
            (Some(cert), Some(key)) => {
                if !cert.exists() {
                    anyhow::bail!("TLS certificate file not found: {:?}", cert);
                }
                if !key.exists() {
                    anyhow::bail!("TLS key file not found: {:?}", key);
                }
            }
            (Some(_), None) => {
                anyhow::bail!("TLS_KEY_PATH is required when TLS_CERT_PATH is set")
            }
            (None, Some(_)) => {
                anyhow::bail!("TLS_CERT_PATH is required when TLS_KEY_PATH is set")
            }
            (None, None) => {}
        }

        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn quota_timeout(&self) -> Duration {
        Duration::from_millis(self.quota_timeout_ms)
    }

    pub fn default_rate_window(&self) -> Duration {
        Duration::from_secs(self.default_rate_window_secs)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_cert_path.is_some()
    }
}
