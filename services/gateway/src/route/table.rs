use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::{Context, Result};
use http::Method;
use tracing::info;
use url::Url;

use super::rule::RouteRule;

/// An immutable set of route rules in declaration order.
///
/// Matching is longest-prefix-wins; between rules with equally long
/// prefixes the first-registered rule wins. Both orderings are
/// deterministic, so a given table always routes a given request the
/// same way.
#[derive(Debug)]
pub struct RouteTable {
    rules: Vec<RouteRule>,
}

impl RouteTable {
    pub fn new(rules: Vec<RouteRule>) -> Result<Self> {
        for rule in &rules {
            if !rule.path_prefix.starts_with('/') {
                anyhow::bail!(
                    "route '{}': path prefix '{}' must start with '/'",
                    rule.id,
                    rule.path_prefix
                );
            }

            let upstream = Url::parse(&rule.upstream)
                .with_context(|| format!("route '{}': invalid upstream URL", rule.id))?;
            if upstream.scheme() != "http" && upstream.scheme() != "https" {
                anyhow::bail!(
                    "route '{}': upstream scheme '{}' is not http(s)",
                    rule.id,
                    upstream.scheme()
                );
            }

            if let Some(spec) = rule.rate_limit {
                if spec.requests == 0 || spec.window_secs == 0 {
                    anyhow::bail!("route '{}': rate limit must be greater than 0", rule.id);
                }
            }
        }

        Ok(Self { rules })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }

    pub fn match_route(
        &self,
        method: &Method,
        path: &str,
        host: Option<&str>,
    ) -> Option<&RouteRule> {
        let mut best: Option<(usize, &RouteRule)> = None;

        for rule in &self.rules {
            if !rule.matches(method, path, host) {
                continue;
            }

            let prefix_len = rule.path_prefix.trim_end_matches('/').len();
            // Strictly-greater keeps the first-registered rule on ties.
            if best.map_or(true, |(len, _)| prefix_len > len) {
                best = Some((prefix_len, rule));
            }
        }

        best.map(|(_, rule)| rule)
    }
}

/// Shared handle to the current route table.
///
/// Readers clone the inner `Arc` out; the lock is held only for that
/// pointer copy, never across a match. A reload builds the new table off
/// to the side and swaps the pointer in one step, so an in-flight request
/// sees either the old table or the new one, never a mix.
pub struct RouteTableHandle {
    inner: RwLock<Arc<RouteTable>>,
}

impl RouteTableHandle {
    pub fn new(table: RouteTable) -> Self {
        Self {
            inner: RwLock::new(Arc::new(table)),
        }
    }

    pub fn current(&self) -> Arc<RouteTable> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn swap(&self, table: RouteTable) {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Arc::new(table);
    }

    /// Reload from disk. On failure the old table stays in place.
    pub fn reload_from(&self, path: &Path) -> Result<usize> {
        let table = load_routes(path)?;
        let count = table.len();
        self.swap(table);
        info!(routes = count, file = %path.display(), "route table swapped");
        Ok(count)
    }
}

pub fn load_routes(path: &Path) -> Result<RouteTable> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read routes file {:?}", path))?;
    let rules: Vec<RouteRule> = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse routes file {:?}", path))?;
    RouteTable::new(rules)
}
