//! Streamgate - A TLS-terminating, streaming-aware reverse proxy
//!
//! A single-node proxy core providing:
//! - TLS termination with SNI-based certificate selection
//! - Host + longest-path-prefix routing to backend targets
//! - Per-route middleware chains (built-in compression suppression)
//! - Unbuffered relay of streaming responses with idle timeouts
//! - Backend health cooldowns and atomic configuration reload

pub mod backend;
pub mod certificate;
pub mod config;
pub mod error;
pub mod middleware;
pub mod proxy;
pub mod routes;
pub mod stream;

pub use backend::{BackendConnector, HealthRegistry};
pub use certificate::CertStore;
pub use config::Config;
pub use error::{ProxyError, Result};
pub use middleware::{Middleware, NoCompression};
pub use proxy::ProxyServer;
pub use routes::{Route, RouteTable};
pub use stream::{SessionRegistry, StreamSession};
