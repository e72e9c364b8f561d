//! Error taxonomy for the proxy core.
//!
//! Load-time errors (`ConfigNotFound`, `ConfigParse`, `ConfigValidation`,
//! `CertificateMismatch`) fail the load or reload attempt and leave any
//! currently-serving configuration untouched. Request-time errors map to a
//! synthesized 502 response; handshake-time errors drop the connection
//! before any HTTP context exists. Nothing here is retried at the proxy
//! layer.

use thiserror::Error;

/// Main error type for the streamgate proxy.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Configuration file could not be found.
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ConfigParse { message: String },

    /// Configuration validation failed.
    #[error("Invalid configuration: {message}")]
    ConfigValidation { message: String },

    /// Certificate and private key do not form a matching pair.
    #[error("Certificate and key mismatch for {hostname}")]
    CertificateMismatch { hostname: String },

    /// No certificate binding covers the requested server name.
    /// Surfaces as a TLS handshake failure (connection reset), never HTTP.
    #[error("No certificate for server name: {server_name}")]
    NoMatchingCertificate { server_name: String },

    /// No route matched the request host and path.
    #[error("No route for {host}{path}")]
    NoRoute { host: String, path: String },

    /// The matched target is in its unhealthy cooldown window.
    #[error("Target {target} is unhealthy")]
    UnhealthyTarget { target: String },

    /// TCP connect to the backend failed.
    #[error("Failed to connect to backend {target}: {message}")]
    BackendConnectFailure { target: String, message: String },

    /// The backend accepted the connection but the exchange failed.
    #[error("Backend exchange failed: {0}")]
    BackendExchange(#[from] hyper::Error),

    /// A streaming session saw no traffic for the configured idle window.
    /// Logged as normal termination, not an error condition.
    #[error("Stream idle timeout elapsed")]
    StreamIdleTimeout,

    /// I/O error wrapper.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Creates a new configuration parse error.
    pub fn config_parse(message: impl Into<String>) -> Self {
        Self::ConfigParse {
            message: message.into(),
        }
    }

    /// Creates a new configuration validation error.
    pub fn config_validation(message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
        }
    }

    /// True for error variants answered with a 502 Bad Gateway.
    pub fn is_bad_gateway(&self) -> bool {
        matches!(
            self,
            Self::NoRoute { .. }
                | Self::UnhealthyTarget { .. }
                | Self::BackendConnectFailure { .. }
                | Self::BackendExchange(_)
        )
    }
}

/// Result type alias using ProxyError.
pub type Result<T> = std::result::Result<T, ProxyError>;
