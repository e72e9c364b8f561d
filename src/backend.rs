//! Backend connector: outbound connections, request forwarding, and
//! per-target health tracking.
//!
//! A target that fails to connect repeatedly is put in a cooldown window
//! so subsequent requests fail fast instead of each paying a full connect
//! timeout. The first request after the window acts as the probe: success
//! restores the target, failure re-arms the cooldown. Connect failures are
//! never retried for the triggering request; silently replaying a
//! non-idempotent request is unsafe.

use crate::error::{ProxyError, Result};
use crate::stream::ProxyBody;
use dashmap::DashMap;
use hyper::body::Incoming;
use hyper::header::HOST;
use hyper::{Request, Response, Uri, Version};
use hyper_util::rt::TokioIo;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Mutable health state for one backend target. The only shared mutable
/// state on the request path; entries are updated under dashmap's
/// per-shard locking.
#[derive(Debug, Default)]
struct TargetHealth {
    consecutive_failures: u32,
    unhealthy_until: Option<Instant>,
}

/// Tracks connect failures per target address.
#[derive(Debug)]
pub struct HealthRegistry {
    targets: DashMap<String, TargetHealth>,
    cooldown: Duration,
    failure_threshold: u32,
}

impl HealthRegistry {
    pub fn new(cooldown: Duration, failure_threshold: u32) -> Self {
        Self {
            targets: DashMap::new(),
            cooldown,
            failure_threshold: failure_threshold.max(1),
        }
    }

    /// False while the target sits in its cooldown window. Once the
    /// window has elapsed the target is available again and the next
    /// request probes it.
    pub fn is_available(&self, target: &str) -> bool {
        match self.targets.get(target) {
            Some(state) => match state.unhealthy_until {
                Some(until) => Instant::now() >= until,
                None => true,
            },
            None => true,
        }
    }

    pub fn record_success(&self, target: &str) {
        if let Some(mut state) = self.targets.get_mut(target) {
            if state.consecutive_failures > 0 {
                debug!(target, "Backend target healthy again");
            }
            state.consecutive_failures = 0;
            state.unhealthy_until = None;
        }
    }

    pub fn record_failure(&self, target: &str) {
        let mut state = self.targets.entry(target.to_string()).or_default();
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.failure_threshold {
            state.unhealthy_until = Some(Instant::now() + self.cooldown);
            warn!(
                target,
                failures = state.consecutive_failures,
                cooldown_secs = self.cooldown.as_secs(),
                "Backend target marked unhealthy"
            );
        }
    }
}

/// Manages outbound connections to backend targets.
#[derive(Debug)]
pub struct BackendConnector {
    health: HealthRegistry,
    connect_timeout: Duration,
}

impl BackendConnector {
    pub fn new(connect_timeout: Duration, cooldown: Duration, failure_threshold: u32) -> Self {
        Self {
            health: HealthRegistry::new(cooldown, failure_threshold),
            connect_timeout,
        }
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    /// Open a TCP connection to the target, honoring the health cooldown.
    pub async fn connect(&self, target: &str) -> Result<TcpStream> {
        if !self.health.is_available(target) {
            return Err(ProxyError::UnhealthyTarget {
                target: target.to_string(),
            });
        }

        let attempt = tokio::time::timeout(self.connect_timeout, TcpStream::connect(target)).await;
        match attempt {
            Ok(Ok(stream)) => {
                self.health.record_success(target);
                Ok(stream)
            }
            Ok(Err(e)) => {
                self.health.record_failure(target);
                Err(ProxyError::BackendConnectFailure {
                    target: target.to_string(),
                    message: e.to_string(),
                })
            }
            Err(_) => {
                self.health.record_failure(target);
                Err(ProxyError::BackendConnectFailure {
                    target: target.to_string(),
                    message: format!("connect timed out after {:?}", self.connect_timeout),
                })
            }
        }
    }

    /// Send the request over an established connection and return the
    /// response head with its still-streaming body. The connection driver
    /// runs in its own task and winds down when the body is dropped,
    /// which propagates client-side cancellation to the backend.
    pub async fn forward(
        &self,
        stream: TcpStream,
        req: Request<ProxyBody>,
        client_ip: IpAddr,
        original_host: &str,
    ) -> Result<Response<Incoming>> {
        let (parts, body) = req.into_parts();

        let uri: Uri = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .parse()
            .map_err(|e| ProxyError::BackendConnectFailure {
                target: original_host.to_string(),
                message: format!("invalid request URI: {}", e),
            })?;

        let mut builder = Request::builder()
            .method(parts.method)
            .uri(uri)
            .version(Version::HTTP_11);

        for (key, value) in parts.headers.iter() {
            if key != HOST {
                builder = builder.header(key, value);
            }
        }

        builder = builder.header(HOST, original_host);
        builder = builder.header("X-Forwarded-For", client_ip.to_string());
        builder = builder.header("X-Forwarded-Host", original_host);
        builder = builder.header("X-Forwarded-Proto", "https");

        let proxy_req = builder
            .body(body)
            .map_err(|e| ProxyError::BackendConnectFailure {
                target: original_host.to_string(),
                message: format!("failed to build proxied request: {}", e),
            })?;

        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Backend connection closed: {}", e);
            }
        });

        let response = sender.send_request(proxy_req).await?;
        Ok(response)
    }
}
