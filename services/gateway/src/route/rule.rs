use http::Method;
use serde::{Deserialize, Serialize};

/// One entry of the route table: a predicate over (path, method, host),
/// an upstream target, and the filters applied before forwarding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRule {
    /// Stable identifier used in logs
    pub id: String,

    /// Path prefix predicate; matches on segment boundaries
    pub path_prefix: String,

    /// Optional method predicate (any method when empty)
    #[serde(default)]
    pub methods: Vec<String>,

    /// Optional Host predicate
    #[serde(default)]
    pub host: Option<String>,

    /// Upstream base URL
    pub upstream: String,

    /// Skip authentication for this route
    #[serde(default)]
    pub public: bool,

    /// Per-route quota; the gateway default applies when absent
    #[serde(default)]
    pub rate_limit: Option<RateLimitSpec>,

    /// Per-route upstream deadline; the gateway default applies when absent
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Filters applied in declaration order
    #[serde(default)]
    pub filters: Vec<RouteFilter>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitSpec {
    pub requests: u64,
    pub window_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RouteFilter {
    /// Drop the first `segments` path segments before forwarding
    StripPrefix { segments: usize },

    /// Add a header to the upstream request
    AddRequestHeader { name: String, value: String },

    /// Select the quota key dimension for this route
    RateLimitBy { key: RateLimitBy },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RateLimitBy {
    Principal,
    ClientIp,
}

impl RouteRule {
    pub fn matches(&self, method: &Method, path: &str, host: Option<&str>) -> bool {
        if !self.methods.is_empty()
            && !self
                .methods
                .iter()
                .any(|m| m.eq_ignore_ascii_case(method.as_str()))
        {
            return false;
        }

        if let Some(ref expected) = self.host {
            match host {
                Some(actual) if actual.eq_ignore_ascii_case(expected) => {}
                _ => return false,
            }
        }

        prefix_matches(&self.path_prefix, path)
    }

    /// Quota key dimension: the last rate-limit-by filter wins; routes
    /// without one are keyed by principal, or by client IP when public
    /// (no principal exists to key on).
    pub fn rate_limit_by(&self) -> RateLimitBy {
        self.filters
            .iter()
            .rev()
            .find_map(|filter| match filter {
                RouteFilter::RateLimitBy { key } => Some(*key),
                _ => None,
            })
            .unwrap_or(if self.public {
                RateLimitBy::ClientIp
            } else {
                RateLimitBy::Principal
            })
    }

    /// Path rewritten by this route's strip-prefix filters.
    pub fn rewrite_path(&self, path: &str) -> String {
        let mut rewritten = path.to_string();
        for filter in &self.filters {
            if let RouteFilter::StripPrefix { segments } = filter {
                rewritten = strip_segments(&rewritten, *segments);
            }
        }
        rewritten
    }

    pub fn added_headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.filters.iter().filter_map(|filter| match filter {
            RouteFilter::AddRequestHeader { name, value } => {
                Some((name.as_str(), value.as_str()))
            }
            _ => None,
        })
    }
}

/// Prefix match on whole path segments: `/a` covers `/a` and `/a/b` but
/// not `/ab`. A trailing slash on the prefix is ignored; `/` covers all.
pub(crate) fn prefix_matches(prefix: &str, path: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }

    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

fn strip_segments(path: &str, segments: usize) -> String {
    if segments == 0 {
        return path.to_string();
    }

    let stripped: Vec<&str> = path
        .split('/')
        .filter(|s| !s.is_empty())
        .skip(segments)
        .collect();

    if stripped.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", stripped.join("/"))
    }
}
