//! Streamgate - Main entry point
//!
//! A TLS-terminating reverse proxy that routes by host and path prefix
//! and relays streaming responses without buffering.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use streamgate::{CertStore, Config, ProxyServer, RouteTable};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// Streamgate - A TLS-terminating, streaming-aware reverse proxy
#[derive(Parser, Debug)]
#[command(name = "streamgate")]
#[command(author = "Streamgate Contributors")]
#[command(version = "1.0.0")]
#[command(about = "A TLS-terminating, streaming-aware reverse proxy")]
struct Args {
    /// Path to the JSON configuration file
    #[arg(long, env = "STREAMGATE_CONFIG", default_value = "./streamgate.json")]
    config: PathBuf,

    /// Override the listen address from the config file
    #[arg(long, env = "STREAMGATE_LISTEN")]
    listen: Option<String>,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting Streamgate v1.0.0");

    let mut config = Config::load(&args.config)?;
    if let Some(listen) = args.listen {
        config.listen = listen;
        config.validate()?;
    }
    info!(
        config = %args.config.display(),
        listen = %config.listen,
        routes = config.routes.len(),
        "Configuration loaded"
    );

    let cert_store = Arc::new(CertStore::load(&config.certificates)?);
    let routes = Arc::new(RouteTable::build(&config.routes)?);

    // SIGHUP reloads the config file; a failed reload keeps the serving
    // snapshots untouched.
    {
        let cert_store = cert_store.clone();
        let routes = routes.clone();
        let config_path = args.config.clone();
        let mut hangup = signal(SignalKind::hangup())?;

        tokio::spawn(async move {
            while hangup.recv().await.is_some() {
                info!("SIGHUP received, reloading configuration");
                match Config::load(&config_path) {
                    Ok(new_config) => {
                        if let Err(e) = cert_store.reload(&new_config.certificates) {
                            error!("Certificate reload failed, keeping previous bindings: {}", e);
                            continue;
                        }
                        if let Err(e) = routes.reload(&new_config.routes) {
                            error!("Route reload failed, keeping previous table: {}", e);
                        }
                    }
                    Err(e) => {
                        error!("Configuration reload failed: {}", e);
                    }
                }
            }
        });
    }

    let server = Arc::new(ProxyServer::new(&config, cert_store, routes));

    info!("Streamgate started successfully");

    server.run().await?;

    Ok(())
}
