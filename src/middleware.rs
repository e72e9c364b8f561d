//! Middleware chain: ordered request/response transformers per route.
//!
//! Classic onion composition over one capability trait. A middleware runs
//! its request-path logic, hands the request to `Next`, and sees the
//! response on the way back out, so the response path is the exact reverse
//! of the declared order. A middleware that returns without calling `next`
//! short-circuits the chain (auth-style rejections hook in here).
//!
//! The one built-in is `NoCompression`: routes carrying streaming
//! responses must not negotiate a compressed body, because a compressor
//! buffers output until a block boundary and that buffering defeats
//! real-time frame delivery.

use crate::error::{ProxyError, Result};
use crate::stream::ProxyBody;
use async_trait::async_trait;
use hyper::header::{HeaderValue, ACCEPT_ENCODING, CONTENT_ENCODING};
use hyper::{Request, Response};
use std::sync::Arc;
use tracing::warn;

/// Name of the built-in compression-stripping middleware.
pub const NO_COMPRESSION: &str = "no-compression";

/// Request/response transformer capability.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Stable name used in route configuration.
    fn name(&self) -> &'static str;

    /// Inspect/modify the request, call `next.run(req)` to continue, and
    /// optionally transform the returned response. Not calling `next`
    /// short-circuits with this middleware's own response.
    async fn apply(&self, req: Request<ProxyBody>, next: Next<'_>) -> Result<Response<ProxyBody>>;
}

/// Terminal handler at the end of a chain (the forwarding endpoint).
#[async_trait]
pub trait Endpoint: Send + Sync {
    async fn call(&self, req: Request<ProxyBody>) -> Result<Response<ProxyBody>>;
}

/// Remainder of the chain, ending at the endpoint.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    endpoint: &'a dyn Endpoint,
}

impl<'a> Next<'a> {
    pub async fn run(self, req: Request<ProxyBody>) -> Result<Response<ProxyBody>> {
        match self.chain.split_first() {
            Some((first, rest)) => {
                first
                    .apply(
                        req,
                        Next {
                            chain: rest,
                            endpoint: self.endpoint,
                        },
                    )
                    .await
            }
            None => self.endpoint.call(req).await,
        }
    }
}

/// Run a request through `chain` and into `endpoint`.
pub async fn run_chain(
    chain: &[Arc<dyn Middleware>],
    endpoint: &dyn Endpoint,
    req: Request<ProxyBody>,
) -> Result<Response<ProxyBody>> {
    Next { chain, endpoint }.run(req).await
}

/// True if `name` refers to a middleware this build knows.
pub fn is_known_middleware(name: &str) -> bool {
    name == NO_COMPRESSION
}

/// Instantiate the middlewares a route names, in declared order.
pub fn build_chain(names: &[String]) -> Result<Vec<Arc<dyn Middleware>>> {
    names
        .iter()
        .map(|name| match name.as_str() {
            NO_COMPRESSION => Ok(Arc::new(NoCompression) as Arc<dyn Middleware>),
            other => Err(ProxyError::config_validation(format!(
                "unknown middleware: {}",
                other
            ))),
        })
        .collect()
}

/// Forbids `Content-Encoding` negotiation so the backend sends an
/// uncompressed body, whatever the client advertised.
pub struct NoCompression;

#[async_trait]
impl Middleware for NoCompression {
    fn name(&self) -> &'static str {
        NO_COMPRESSION
    }

    async fn apply(
        &self,
        mut req: Request<ProxyBody>,
        next: Next<'_>,
    ) -> Result<Response<ProxyBody>> {
        req.headers_mut()
            .insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));

        let resp = next.run(req).await?;

        // A compliant backend honors identity; anything else would reach
        // the client as-is, so make the violation visible.
        if let Some(encoding) = resp.headers().get(CONTENT_ENCODING) {
            if encoding != "identity" {
                warn!(?encoding, "Backend compressed a no-compression route");
            }
        }

        Ok(resp)
    }
}
