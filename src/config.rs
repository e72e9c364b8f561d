//! Configuration loading and validation.
//!
//! The whole proxy is driven by one JSON file: certificate bindings, an
//! ordered list of routes, and the timeout/cooldown knobs. `Config::load`
//! parses and validates in one step so a reload can be all-or-nothing: a
//! file that fails validation never replaces the serving snapshots.

use crate::error::{ProxyError, Result};
use crate::middleware::is_known_middleware;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// One (hostname set, certificate file, key file) binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertBindingConfig {
    /// Hostnames this certificate covers. Exact names or single-level
    /// wildcards ("*.example.com"). Must be non-empty.
    pub hostnames: Vec<String>,
    /// PEM certificate chain file.
    pub cert: PathBuf,
    /// PEM private key file.
    pub key: PathBuf,
}

/// One routing rule. Order in the file is declaration order and breaks
/// ties between equally specific routes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Host to match: exact name or single-level wildcard.
    pub host: String,
    /// Path prefix to match; longest matching prefix wins.
    #[serde(default = "default_path_prefix")]
    pub path_prefix: String,
    /// Middleware names applied in order on the request path.
    #[serde(default)]
    pub middlewares: Vec<String>,
    /// Backend address, "host:port".
    pub target: String,
}

fn default_path_prefix() -> String {
    "/".to_string()
}

/// Top-level configuration file schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the TLS listener binds to.
    pub listen: String,
    /// Certificate bindings; at least one required.
    pub certificates: Vec<CertBindingConfig>,
    /// Ordered routing rules.
    pub routes: Vec<RouteConfig>,
    /// Seconds a target stays unhealthy after hitting the failure threshold.
    pub health_cooldown_secs: u64,
    /// Consecutive connect failures before a target is marked unhealthy.
    pub failure_threshold: u32,
    /// Seconds a streaming session may stay silent before the proxy closes
    /// it. Must be generous: legitimate event streams idle for minutes.
    pub idle_stream_timeout_secs: u64,
    /// Seconds allowed for a backend TCP connect.
    pub connect_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8443".to_string(),
            certificates: Vec::new(),
            routes: Vec::new(),
            health_cooldown_secs: 30,
            failure_threshold: 3,
            idle_stream_timeout_secs: 1800,
            connect_timeout_secs: 10,
        }
    }
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ProxyError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        let raw = std::fs::read_to_string(path)?;
        let config: Config =
            serde_json::from_str(&raw).map_err(|e| ProxyError::config_parse(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate invariants the schema alone cannot express.
    pub fn validate(&self) -> Result<()> {
        self.listen
            .parse::<SocketAddr>()
            .map_err(|e| ProxyError::config_validation(format!("listen address: {}", e)))?;

        if self.certificates.is_empty() {
            return Err(ProxyError::config_validation(
                "at least one certificate binding is required",
            ));
        }

        for binding in &self.certificates {
            if binding.hostnames.is_empty() {
                return Err(ProxyError::config_validation(format!(
                    "certificate {} has an empty hostname set",
                    binding.cert.display()
                )));
            }
        }

        for route in &self.routes {
            if route.host.is_empty() {
                return Err(ProxyError::config_validation("route with empty host"));
            }
            if !route.path_prefix.starts_with('/') {
                return Err(ProxyError::config_validation(format!(
                    "path prefix must start with '/': {}",
                    route.path_prefix
                )));
            }
            if route.target.parse::<SocketAddr>().is_err() {
                // Allow "host:port" with a DNS name too.
                let mut parts = route.target.rsplitn(2, ':');
                let port_ok = parts
                    .next()
                    .map(|p| p.parse::<u16>().is_ok())
                    .unwrap_or(false);
                let host_ok = parts.next().map(|h| !h.is_empty()).unwrap_or(false);
                if !port_ok || !host_ok {
                    return Err(ProxyError::config_validation(format!(
                        "route target must be host:port, got {}",
                        route.target
                    )));
                }
            }
            for name in &route.middlewares {
                if !is_known_middleware(name) {
                    return Err(ProxyError::config_validation(format!(
                        "unknown middleware: {}",
                        name
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn health_cooldown(&self) -> Duration {
        Duration::from_secs(self.health_cooldown_secs)
    }

    pub fn idle_stream_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_stream_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
