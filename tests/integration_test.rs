//! Integration tests for Streamgate
//!
//! Tests the full proxy server over real TLS connections:
//! - SNI certificate selection
//! - Host + longest-path-prefix routing
//! - Compression suppression middleware
//! - Streaming relay, session header, and idle timeout
//! - Backend health cooldown
//! - Atomic route reload under concurrent traffic

use bytes::Bytes;
use futures_util::StreamExt;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use streamgate::{CertStore, Config, ProxyServer, RouteTable};
use streamgate::config::{CertBindingConfig, RouteConfig};
use tempfile::tempdir;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::sleep;

// Counter for unique port allocation
static PORT_COUNTER: AtomicU16 = AtomicU16::new(19000);

fn get_unique_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Generate a throwaway self-signed cert/key pair on disk.
fn write_cert_pair(dir: &Path, name: &str, hostnames: &[&str]) -> (PathBuf, PathBuf) {
    let cert = rcgen::generate_simple_self_signed(
        hostnames.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
    )
    .unwrap();
    let cert_path = dir.join(format!("{}.crt", name));
    let key_path = dir.join(format!("{}.key", name));
    std::fs::write(&cert_path, cert.cert.pem()).unwrap();
    std::fs::write(&key_path, cert.key_pair.serialize_pem()).unwrap();
    (cert_path, key_path)
}

fn route(host: &str, prefix: &str, middlewares: &[&str], target: &str) -> RouteConfig {
    RouteConfig {
        host: host.to_string(),
        path_prefix: prefix.to_string(),
        middlewares: middlewares.iter().map(|s| s.to_string()).collect(),
        target: target.to_string(),
    }
}

/// Simple backend server for testing; echoes request details.
async fn run_backend_server(port: u16, response_body: &'static str) -> tokio::task::JoinHandle<()> {
    let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
    let listener = TcpListener::bind(addr).await.unwrap();

    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let io = TokioIo::new(stream);
            let body = response_body;

            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let body = body;
                    async move {
                        let path = req.uri().path().to_string();
                        let host = req
                            .headers()
                            .get("host")
                            .and_then(|h| h.to_str().ok())
                            .unwrap_or("unknown");
                        let accept_encoding = req
                            .headers()
                            .get("accept-encoding")
                            .and_then(|h| h.to_str().ok())
                            .unwrap_or("none");
                        let x_forwarded_for = req
                            .headers()
                            .get("x-forwarded-for")
                            .and_then(|h| h.to_str().ok())
                            .unwrap_or("none");

                        let response_text = format!(
                            "{}|path={}|host={}|ae={}|xff={}",
                            body, path, host, accept_encoding, x_forwarded_for
                        );

                        Ok::<_, Infallible>(
                            Response::builder()
                                .status(200)
                                .body(Full::new(Bytes::from(response_text)))
                                .unwrap(),
                        )
                    }
                });

                let _ = http1::Builder::new().serve_connection(io, service).await;
            });
        }
    })
}

/// Streaming backend: every request gets a `text/event-stream` response
/// whose frames are fed by the returned broadcast sender.
async fn run_streaming_backend(port: u16) -> broadcast::Sender<Bytes> {
    let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
    let listener = TcpListener::bind(addr).await.unwrap();
    let (tx, _) = broadcast::channel::<Bytes>(16);
    let tx_server = tx.clone();

    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let io = TokioIo::new(stream);
            let tx = tx_server.clone();

            tokio::spawn(async move {
                let service = service_fn(move |_req: Request<Incoming>| {
                    let rx = tx.subscribe();
                    async move {
                        let frames = futures_util::stream::unfold(rx, |mut rx| async move {
                            match rx.recv().await {
                                Ok(bytes) => Some((Ok::<_, Infallible>(Frame::data(bytes)), rx)),
                                Err(_) => None,
                            }
                        });
                        Ok::<_, Infallible>(
                            Response::builder()
                                .status(200)
                                .header("content-type", "text/event-stream")
                                .body(BodyExt::boxed_unsync(StreamBody::new(frames)))
                                .unwrap(),
                        )
                    }
                });

                let _ = http1::Builder::new().serve_connection(io, service).await;
            });
        }
    });

    tx
}

/// Start a proxy for the given routes, serving a cert for the hostnames.
/// Returns the proxy address.
async fn setup_proxy(
    certs_dir: &Path,
    hostnames: &[&str],
    routes: Vec<RouteConfig>,
    idle_timeout_secs: u64,
    health_cooldown_secs: u64,
) -> (SocketAddr, Arc<RouteTable>) {
    let proxy_port = get_unique_port();
    let (cert, key) = write_cert_pair(certs_dir, "proxy", hostnames);

    let config = Config {
        listen: format!("127.0.0.1:{}", proxy_port),
        certificates: vec![CertBindingConfig {
            hostnames: hostnames.iter().map(|s| s.to_string()).collect(),
            cert,
            key,
        }],
        routes,
        idle_stream_timeout_secs: idle_timeout_secs,
        health_cooldown_secs,
        ..Config::default()
    };
    config.validate().unwrap();

    let cert_store = Arc::new(CertStore::load(&config.certificates).unwrap());
    let route_table = Arc::new(RouteTable::build(&config.routes).unwrap());
    let server = Arc::new(ProxyServer::new(&config, cert_store, route_table.clone()));

    tokio::spawn(async move {
        let _ = server.run().await;
    });

    // Wait for the listener to come up
    sleep(Duration::from_millis(200)).await;

    let addr: SocketAddr = format!("127.0.0.1:{}", proxy_port).parse().unwrap();
    (addr, route_table)
}

/// TLS client that trusts the proxy's self-signed cert and resolves the
/// given hostname to the proxy address (so SNI carries the real name).
fn tls_client(hostname: &str, proxy_addr: SocketAddr) -> reqwest::Client {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .resolve(hostname, proxy_addr)
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let dir = tempdir().unwrap();
    let (proxy_addr, _) = setup_proxy(
        dir.path(),
        &["example.com"],
        vec![route("example.com", "/", &[], "127.0.0.1:1")],
        1800,
        30,
    )
    .await;

    let client = tls_client("example.com", proxy_addr);
    let response = client
        .get(format!("https://example.com:{}/health", proxy_addr.port()))
        .send()
        .await
        .unwrap();

    assert!(response.status().is_success());
    assert_eq!(response.text().await.unwrap(), "OK");
}

#[tokio::test]
async fn test_routing_longest_prefix_wins() {
    let dir = tempdir().unwrap();
    let root_port = get_unique_port();
    let events_port = get_unique_port();

    let _root = run_backend_server(root_port, "ROOT").await;
    let _events = run_backend_server(events_port, "EVENTS").await;

    let (proxy_addr, _) = setup_proxy(
        dir.path(),
        &["example.com"],
        vec![
            route("example.com", "/", &[], &format!("127.0.0.1:{}", root_port)),
            route(
                "example.com",
                "/events",
                &[],
                &format!("127.0.0.1:{}", events_port),
            ),
        ],
        1800,
        30,
    )
    .await;

    let client = tls_client("example.com", proxy_addr);

    let body = client
        .get(format!("https://example.com:{}/events/feed", proxy_addr.port()))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(body.contains("EVENTS"));
    assert!(body.contains("path=/events/feed"));

    let body = client
        .get(format!("https://example.com:{}/other", proxy_addr.port()))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(body.contains("ROOT"));
    // Forwarding headers are set
    assert!(body.contains("xff=127.0.0.1"));
}

#[tokio::test]
async fn test_no_route_yields_bad_gateway() {
    let dir = tempdir().unwrap();
    let (proxy_addr, _) = setup_proxy(
        dir.path(),
        &["example.com"],
        vec![route("example.com", "/api", &[], "127.0.0.1:1")],
        1800,
        30,
    )
    .await;

    let client = tls_client("example.com", proxy_addr);
    let response = client
        .get(format!("https://example.com:{}/other", proxy_addr.port()))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 502);
}

#[tokio::test]
async fn test_unlisted_server_name_resets_connection() {
    let dir = tempdir().unwrap();
    let (proxy_addr, _) = setup_proxy(
        dir.path(),
        &["example.com"],
        vec![route("example.com", "/", &[], "127.0.0.1:1")],
        1800,
        30,
    )
    .await;

    // No certificate binding covers this name: the handshake fails and
    // no HTTP-level response ever exists.
    let client = tls_client("unlisted.com", proxy_addr);
    let result = client
        .get(format!("https://unlisted.com:{}/", proxy_addr.port()))
        .send()
        .await;

    assert!(result.is_err());
}

#[tokio::test]
async fn test_no_compression_middleware_forces_identity() {
    let dir = tempdir().unwrap();
    let plain_port = get_unique_port();
    let stream_port = get_unique_port();

    let _plain = run_backend_server(plain_port, "PLAIN").await;
    let _stream = run_backend_server(stream_port, "STREAM").await;

    let (proxy_addr, _) = setup_proxy(
        dir.path(),
        &["example.com"],
        vec![
            route("example.com", "/", &[], &format!("127.0.0.1:{}", plain_port)),
            route(
                "example.com",
                "/events",
                &["no-compression"],
                &format!("127.0.0.1:{}", stream_port),
            ),
        ],
        1800,
        30,
    )
    .await;

    let client = tls_client("example.com", proxy_addr);

    // Without the middleware the client's negotiation passes through.
    let body = client
        .get(format!("https://example.com:{}/api", proxy_addr.port()))
        .header("Accept-Encoding", "gzip, br")
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(body.contains("ae=gzip, br"));

    // With it, the backend always sees identity.
    let body = client
        .get(format!("https://example.com:{}/events", proxy_addr.port()))
        .header("Accept-Encoding", "gzip, br")
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(body.contains("ae=identity"));
}

#[tokio::test]
async fn test_streaming_relay_and_session_header() {
    let dir = tempdir().unwrap();
    let backend_port = get_unique_port();
    let frames = run_streaming_backend(backend_port).await;

    let (proxy_addr, _) = setup_proxy(
        dir.path(),
        &["example.com"],
        vec![route(
            "example.com",
            "/events",
            &["no-compression"],
            &format!("127.0.0.1:{}", backend_port),
        )],
        1800,
        30,
    )
    .await;

    let client = tls_client("example.com", proxy_addr);
    let response = client
        .get(format!("https://example.com:{}/events", proxy_addr.port()))
        .send()
        .await
        .unwrap();

    // The session token precedes any content frame.
    assert!(response.headers().contains_key("x-stream-session"));

    let mut body = response.bytes_stream();

    // Each frame is relayed promptly after the backend produces it, with
    // the stream still open: no buffering until close.
    frames.send(Bytes::from_static(b"data: one\n\n")).unwrap();
    let start = Instant::now();
    let chunk = body.next().await.unwrap().unwrap();
    assert_eq!(chunk, Bytes::from_static(b"data: one\n\n"));
    assert!(start.elapsed() < Duration::from_secs(2));

    frames.send(Bytes::from_static(b"data: two\n\n")).unwrap();
    let chunk = body.next().await.unwrap().unwrap();
    assert_eq!(chunk, Bytes::from_static(b"data: two\n\n"));
}

#[tokio::test]
async fn test_stream_idle_timeout_closes_session() {
    let dir = tempdir().unwrap();
    let backend_port = get_unique_port();
    let frames = run_streaming_backend(backend_port).await;

    // 1-second idle window for the test; production default is 30 minutes.
    let (proxy_addr, _) = setup_proxy(
        dir.path(),
        &["example.com"],
        vec![route(
            "example.com",
            "/events",
            &["no-compression"],
            &format!("127.0.0.1:{}", backend_port),
        )],
        1,
        30,
    )
    .await;

    let client = tls_client("example.com", proxy_addr);
    let response = client
        .get(format!("https://example.com:{}/events", proxy_addr.port()))
        .send()
        .await
        .unwrap();

    let mut body = response.bytes_stream();
    frames.send(Bytes::from_static(b"data: one\n\n")).unwrap();
    assert!(body.next().await.unwrap().is_ok());

    // Now go silent: the proxy must end the stream shortly after the
    // idle window, well before any client-side timeout.
    let start = Instant::now();
    while let Some(chunk) = body.next().await {
        chunk.unwrap();
    }
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(900), "closed too early: {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(5), "closed too late: {:?}", elapsed);
}

#[tokio::test]
async fn test_backend_outage_cooldown_and_probe() {
    let dir = tempdir().unwrap();
    let backend_port = get_unique_port();

    let (proxy_addr, _) = setup_proxy(
        dir.path(),
        &["example.com"],
        vec![route(
            "example.com",
            "/",
            &[],
            &format!("127.0.0.1:{}", backend_port),
        )],
        1800,
        1, // 1-second cooldown for the test
    )
    .await;

    let client = tls_client("example.com", proxy_addr);
    let url = format!("https://example.com:{}/", proxy_addr.port());

    // Three consecutive connect failures mark the target unhealthy.
    for _ in 0..3 {
        let response = client.get(&url).send().await.unwrap();
        assert_eq!(response.status(), 502);
    }

    // Backend comes up, but the cooldown window still fails fast without
    // a connect attempt.
    let _backend = run_backend_server(backend_port, "RECOVERED").await;
    let start = Instant::now();
    let response = client.get(&url).send().await.unwrap();
    assert_eq!(response.status(), 502);
    assert!(start.elapsed() < Duration::from_millis(500));

    // After the cooldown the next request probes and restores health.
    sleep(Duration::from_millis(1200)).await;
    let response = client.get(&url).send().await.unwrap();
    assert!(response.status().is_success());
    assert!(response.text().await.unwrap().contains("RECOVERED"));
}

#[tokio::test]
async fn test_reload_atomicity_under_traffic() {
    let dir = tempdir().unwrap();
    let a_port = get_unique_port();
    let b_port = get_unique_port();

    let _a = run_backend_server(a_port, "GEN_A").await;
    let _b = run_backend_server(b_port, "GEN_B").await;

    let (proxy_addr, route_table) = setup_proxy(
        dir.path(),
        &["example.com"],
        vec![route("example.com", "/", &[], &format!("127.0.0.1:{}", a_port))],
        1800,
        30,
    )
    .await;

    // Flip the route table between two generations while traffic flows.
    let flipper = tokio::spawn(async move {
        for i in 0..50u32 {
            let port = if i % 2 == 0 { b_port } else { a_port };
            route_table
                .reload(&[route("example.com", "/", &[], &format!("127.0.0.1:{}", port))])
                .unwrap();
            sleep(Duration::from_millis(5)).await;
        }
    });

    let client = tls_client("example.com", proxy_addr);
    let url = format!("https://example.com:{}/", proxy_addr.port());
    for _ in 0..40 {
        let response = client.get(&url).send().await.unwrap();
        assert!(response.status().is_success());
        let body = response.text().await.unwrap();
        // Every request sees a complete table: one generation or the
        // other, never a 502 from a half-applied swap.
        assert!(body.contains("GEN_A") || body.contains("GEN_B"));
    }

    flipper.await.unwrap();
}
