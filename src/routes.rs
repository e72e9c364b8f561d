//! Route table: ordered host + path-prefix rules mapped to backend targets.
//!
//! Matching is deterministic: filter by host pattern, keep the route with
//! the longest path prefix that prefixes the request path, break ties by
//! declaration order. The table is immutable; reload builds a whole new
//! table and swaps it atomically, so concurrent requests see either the
//! old or the new rules in full.

use crate::config::RouteConfig;
use crate::error::{ProxyError, Result};
use arc_swap::ArcSwap;
use std::sync::Arc;
use tracing::info;

/// Host match condition: exact name or single-level wildcard.
#[derive(Debug, Clone, PartialEq)]
pub enum HostPattern {
    Exact(String),
    /// Stored as ".example.com" for "*.example.com".
    Wildcard(String),
}

impl HostPattern {
    pub fn parse(pattern: &str) -> Self {
        let pattern = pattern.to_lowercase();
        match pattern.strip_prefix("*.") {
            Some(suffix) => Self::Wildcard(format!(".{}", suffix)),
            None => Self::Exact(pattern),
        }
    }

    /// Case-insensitive host match; wildcards cover exactly one label.
    pub fn matches(&self, host: &str) -> bool {
        let host = host.to_lowercase();
        match self {
            Self::Exact(name) => host == *name,
            Self::Wildcard(suffix) => host
                .strip_suffix(suffix.as_str())
                .map(|label| !label.is_empty() && !label.contains('.'))
                .unwrap_or(false),
        }
    }
}

/// One compiled routing rule.
#[derive(Debug, Clone)]
pub struct Route {
    pub host: HostPattern,
    pub path_prefix: String,
    pub middlewares: Vec<String>,
    pub target: String,
}

/// Immutable, atomically-swapped route table.
#[derive(Debug)]
pub struct RouteTable {
    routes: ArcSwap<Vec<Route>>,
}

impl RouteTable {
    pub fn build(configs: &[RouteConfig]) -> Result<Self> {
        let routes = compile(configs)?;
        Ok(Self {
            routes: ArcSwap::from_pointee(routes),
        })
    }

    /// Rebuild the table wholesale and swap it in. Failure keeps the
    /// current table serving.
    pub fn reload(&self, configs: &[RouteConfig]) -> Result<()> {
        let routes = compile(configs)?;
        let count = routes.len();
        self.routes.store(Arc::new(routes));
        info!(routes = count, "Route table reloaded");
        Ok(())
    }

    /// Find the most specific route for a request. Longest matching path
    /// prefix wins; equal lengths fall back to declaration order.
    pub fn matches(&self, host: &str, path: &str) -> Option<Route> {
        let routes = self.routes.load();
        let mut best: Option<&Route> = None;

        for route in routes.iter() {
            if !route.host.matches(host) || !path.starts_with(&route.path_prefix) {
                continue;
            }
            match best {
                Some(b) if route.path_prefix.len() <= b.path_prefix.len() => {}
                _ => best = Some(route),
            }
        }

        best.cloned()
    }

    /// Number of routes in the current snapshot.
    pub fn len(&self) -> usize {
        self.routes.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn compile(configs: &[RouteConfig]) -> Result<Vec<Route>> {
    configs
        .iter()
        .map(|c| {
            if !c.path_prefix.starts_with('/') {
                return Err(ProxyError::config_validation(format!(
                    "path prefix must start with '/': {}",
                    c.path_prefix
                )));
            }
            Ok(Route {
                host: HostPattern::parse(&c.host),
                path_prefix: c.path_prefix.clone(),
                middlewares: c.middlewares.clone(),
                target: c.target.clone(),
            })
        })
        .collect()
}
