//! Certificate store with SNI-based resolution.
//!
//! Holds (hostname set, certificate, key) bindings loaded from PEM files
//! produced by an external tool. Bindings live in an immutable snapshot
//! that is atomically swapped on reload; the rustls resolver reads the
//! snapshot lock-free, so a handshake that started before a swap keeps the
//! bindings it captured. A server name with no binding makes the handshake
//! fail, which resets the connection before any HTTP exchange exists.

use crate::config::CertBindingConfig;
use crate::error::{ProxyError, Result};
use arc_swap::ArcSwap;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Immutable view of all loaded certificate bindings.
#[derive(Debug, Default)]
struct CertSnapshot {
    /// Exact hostname -> certified key.
    exact: HashMap<String, Arc<CertifiedKey>>,
    /// Wildcard suffixes (".example.com" for "*.example.com"), in
    /// declaration order.
    wildcard: Vec<(String, Arc<CertifiedKey>)>,
}

/// Certificate store. Shared across all connections; also installed as the
/// rustls certificate resolver.
#[derive(Debug)]
pub struct CertStore {
    snapshot: ArcSwap<CertSnapshot>,
}

impl CertStore {
    /// Build a store from configuration bindings. Fails if any PEM pair is
    /// unreadable or mismatched; nothing is installed on failure.
    pub fn load(bindings: &[CertBindingConfig]) -> Result<Self> {
        let snapshot = build_snapshot(bindings)?;
        Ok(Self {
            snapshot: ArcSwap::from_pointee(snapshot),
        })
    }

    /// Replace the active bindings. All-or-nothing: a bad binding leaves
    /// the previous snapshot serving.
    pub fn reload(&self, bindings: &[CertBindingConfig]) -> Result<()> {
        let snapshot = build_snapshot(bindings)?;
        let hostnames = snapshot.exact.len() + snapshot.wildcard.len();
        self.snapshot.store(Arc::new(snapshot));
        info!(hostnames, "Certificate bindings reloaded");
        Ok(())
    }

    /// Resolve a server name against the current snapshot: exact hostname
    /// first, then single-level wildcard suffix.
    pub fn resolve_name(&self, server_name: &str) -> Option<Arc<CertifiedKey>> {
        let snapshot = self.snapshot.load();
        let name = server_name.to_lowercase();

        if let Some(key) = snapshot.exact.get(&name) {
            return Some(key.clone());
        }

        // "*.example.com" covers "a.example.com" but not "a.b.example.com".
        for (suffix, key) in &snapshot.wildcard {
            if let Some(label) = name.strip_suffix(suffix.as_str()) {
                if !label.is_empty() && !label.contains('.') {
                    return Some(key.clone());
                }
            }
        }

        None
    }
}

impl ResolvesServerCert for CertStore {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let server_name = client_hello.server_name()?;
        match self.resolve_name(server_name) {
            Some(key) => {
                debug!(server_name, "Resolved certificate");
                Some(key)
            }
            None => {
                // Returning None aborts the handshake: no unencrypted
                // fallback exists for an untrusted name.
                warn!(server_name, "No certificate binding for server name");
                None
            }
        }
    }
}

fn build_snapshot(bindings: &[CertBindingConfig]) -> Result<CertSnapshot> {
    let mut snapshot = CertSnapshot::default();

    for binding in bindings {
        if binding.hostnames.is_empty() {
            return Err(ProxyError::config_validation(format!(
                "certificate {} has an empty hostname set",
                binding.cert.display()
            )));
        }

        let key = load_certified_key(&binding.cert, &binding.key, &binding.hostnames[0])?;

        for hostname in &binding.hostnames {
            let hostname = hostname.to_lowercase();
            if let Some(suffix) = hostname.strip_prefix("*.") {
                snapshot
                    .wildcard
                    .push((format!(".{}", suffix), key.clone()));
            } else {
                snapshot.exact.insert(hostname, key.clone());
            }
        }
    }

    Ok(snapshot)
}

/// Load a PEM cert chain and key and verify they form a matching pair.
fn load_certified_key(
    cert_path: &Path,
    key_path: &Path,
    hostname: &str,
) -> Result<Arc<CertifiedKey>> {
    let certs = load_certs(cert_path)?;
    if certs.is_empty() {
        return Err(ProxyError::CertificateMismatch {
            hostname: hostname.to_string(),
        });
    }
    let key = load_private_key(key_path)?;

    // from_der cross-checks the key against the leaf certificate's public
    // key; a mismatched pair fails the whole load attempt.
    let certified = CertifiedKey::from_der(certs, key, &rustls::crypto::ring::default_provider())
        .map_err(|e| {
            warn!(hostname, error = %e, "Certificate/key pair rejected");
            ProxyError::CertificateMismatch {
                hostname: hostname.to_string(),
            }
        })?;

    Ok(Arc::new(certified))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader).collect::<std::io::Result<Vec<_>>>()?;
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)?.ok_or_else(|| ProxyError::CertificateMismatch {
        hostname: path.display().to_string(),
    })
}
