//! Proxy engine: TLS termination, route dispatch, and response relay.
//!
//! Each accepted connection runs in its own task and moves through
//! handshake, route match, middleware chain, and forwarding. Failures are
//! isolated per connection: a handshake failure drops the socket (no TLS
//! context exists to carry an HTTP response), a routing or backend
//! failure answers 502. Streaming and bounded responses share one code
//! path up to a single branch point after the backend's response headers
//! arrive, so header decisions like compression suppression are already
//! settled before the first body byte moves.

use crate::backend::BackendConnector;
use crate::certificate::CertStore;
use crate::config::Config;
use crate::error::{ProxyError, Result};
use crate::middleware::{build_chain, run_chain, Endpoint};
use crate::routes::{Route, RouteTable};
use crate::stream::{
    boxed_incoming, full_body, is_streaming_response, IdleTimeoutBody, ProxyBody, SessionRegistry,
};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, HOST};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::ServerConfig;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Response header carrying the streaming session token.
pub const STREAM_SESSION_HEADER: &str = "x-stream-session";

/// The proxy server. Shared snapshots (certificates, routes) are swapped
/// by the reload task while connections keep reading lock-free.
pub struct ProxyServer {
    listen: String,
    cert_store: Arc<CertStore>,
    routes: Arc<RouteTable>,
    connector: Arc<BackendConnector>,
    sessions: Arc<SessionRegistry>,
    idle_timeout: Duration,
}

impl ProxyServer {
    pub fn new(config: &Config, cert_store: Arc<CertStore>, routes: Arc<RouteTable>) -> Self {
        Self {
            listen: config.listen.clone(),
            cert_store,
            routes,
            connector: Arc::new(BackendConnector::new(
                config.connect_timeout(),
                config.health_cooldown(),
                config.failure_threshold,
            )),
            sessions: SessionRegistry::new(),
            idle_timeout: config.idle_stream_timeout(),
        }
    }

    /// Number of currently-open streaming sessions.
    pub fn active_sessions(&self) -> usize {
        self.sessions.active()
    }

    /// Bind the TLS listener and serve until the process ends.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut tls_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(self.cert_store.clone());
        tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];
        let acceptor = TlsAcceptor::from(Arc::new(tls_config));

        let listener = TcpListener::bind(&self.listen).await?;
        info!(listen = %self.listen, "TLS listener ready");

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let server = self.clone();
            let acceptor = acceptor.clone();

            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, remote_addr, acceptor).await {
                    debug!(%remote_addr, "Connection error: {}", e);
                }
            });
        }
    }

    /// One connection: TLS handshake, then HTTP/1.1 request service.
    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        remote_addr: SocketAddr,
        acceptor: TlsAcceptor,
    ) -> Result<()> {
        let tls_stream = match acceptor.accept(stream).await {
            Ok(s) => s,
            Err(e) => {
                // Includes an unmatched server name. The client sees a
                // reset; there is no TLS context to carry an HTTP error,
                // and handshake failures are never retried here.
                debug!(%remote_addr, "TLS handshake failed: {}", e);
                return Ok(());
            }
        };

        let io = TokioIo::new(tls_stream);
        let server = self.clone();

        http1::Builder::new()
            .preserve_header_case(true)
            .serve_connection(
                io,
                service_fn(move |req| {
                    let server = server.clone();
                    async move {
                        Ok::<_, Infallible>(server.handle_request(req, remote_addr).await)
                    }
                }),
            )
            .await
            .map_err(ProxyError::BackendExchange)
    }

    /// One request: route match, middleware chain, forward, relay.
    async fn handle_request(
        self: Arc<Self>,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
    ) -> Response<ProxyBody> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        if path == "/health" {
            return text_response(StatusCode::OK, "OK");
        }

        let host = match req
            .headers()
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .map(host_without_port)
        {
            Some(h) => h.to_string(),
            None => return text_response(StatusCode::BAD_REQUEST, "Missing Host header"),
        };

        let route = match self.routes.matches(&host, &path) {
            Some(r) => r,
            None => {
                warn!(%host, %path, "No route matched");
                return bad_gateway();
            }
        };

        // Validated at config load; a failure here means the snapshot and
        // this build disagree on middleware names.
        let chain = match build_chain(&route.middlewares) {
            Ok(c) => c,
            Err(e) => {
                error!(%host, %path, "Middleware chain unavailable: {}", e);
                return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
            }
        };

        let forwarder = Forwarder {
            server: self.clone(),
            route: route.clone(),
            remote_addr,
            host: host.clone(),
        };

        let req = req.map(boxed_incoming);
        match run_chain(&chain, &forwarder, req).await {
            Ok(resp) => {
                info!(%method, %host, %path, status = resp.status().as_u16(), target = %route.target, "Request completed");
                resp
            }
            Err(e) if e.is_bad_gateway() => {
                error!(%method, %host, %path, "Request failed: {}", e);
                bad_gateway()
            }
            Err(e) => {
                error!(%method, %host, %path, "Request error: {}", e);
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
            }
        }
    }
}

/// Terminal endpoint of every middleware chain: forwards to the matched
/// route's target and branches on streaming vs. bounded once the response
/// headers are in.
struct Forwarder {
    server: Arc<ProxyServer>,
    route: Route,
    remote_addr: SocketAddr,
    host: String,
}

#[async_trait]
impl Endpoint for Forwarder {
    async fn call(&self, req: Request<ProxyBody>) -> Result<Response<ProxyBody>> {
        let path = req.uri().path().to_string();

        let stream = self.server.connector.connect(&self.route.target).await?;
        let resp = self
            .server
            .connector
            .forward(stream, req, self.remote_addr.ip(), &self.host)
            .await?;

        if is_streaming_response(&resp) {
            // Session is established, and the no-compression decision
            // already applied, before the first frame is relayed.
            let guard = self.server.sessions.register(
                self.host.clone(),
                path,
                self.route.target.clone(),
            );
            let session_header = HeaderValue::from_str(&guard.id().to_string())
                .expect("uuid is a valid header value");

            let (mut parts, body) = resp.into_parts();
            parts
                .headers
                .insert(STREAM_SESSION_HEADER, session_header);

            let body = IdleTimeoutBody::new(body, self.server.idle_timeout, guard);
            Ok(Response::from_parts(parts, body.boxed()))
        } else {
            // Bounded response: relay in full, connection stays keep-alive
            // per HTTP/1.1 rules.
            let (parts, body) = resp.into_parts();
            let bytes = body.collect().await?.to_bytes();
            Ok(Response::from_parts(parts, full_body(bytes)))
        }
    }
}

/// Strip an optional port from a Host header value.
fn host_without_port(host: &str) -> &str {
    host.split(':').next().unwrap_or(host)
}

fn text_response(status: StatusCode, body: &str) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain")
        .body(full_body(Bytes::from(body.to_string())))
        .unwrap()
}

fn bad_gateway() -> Response<ProxyBody> {
    text_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
}
