//! ollama-gate - Main entry point
//!
//! An authenticating reverse proxy in front of a local Ollama server

use anyhow::Result;
use clap::Parser;
use ollama_gate::config::{
    DEFAULT_API_KEY, DEFAULT_BODY_LIMIT, DEFAULT_OLLAMA_URL, DEFAULT_PORT,
};
use ollama_gate::{OriginPolicy, ProxyConfig, ProxyServer, UpstreamTarget};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// ollama-gate - An authenticating reverse proxy for Ollama
#[derive(Parser, Debug)]
#[command(name = "ollama-gate")]
#[command(version)]
#[command(about = "An authenticating reverse proxy in front of a local Ollama server")]
struct Args {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Shared secret callers must present as `Authorization: Bearer <key>`
    #[arg(long, env = "API_KEY", default_value = DEFAULT_API_KEY, hide_env_values = true)]
    api_key: String,

    /// Base URL of the Ollama server
    #[arg(long, env = "OLLAMA_URL", default_value = DEFAULT_OLLAMA_URL)]
    ollama_url: String,

    /// Comma separated origins allowed for CORS (unset or `*` reflects any origin)
    #[arg(long, env = "ALLOWED_ORIGINS")]
    allowed_origins: Option<String>,

    /// Maximum request body size in bytes
    #[arg(long, env = "BODY_LIMIT", default_value_t = DEFAULT_BODY_LIMIT)]
    body_limit: u64,

    /// Seconds to wait on the upstream before giving up
    #[arg(long, env = "UPSTREAM_TIMEOUT_SECS", default_value = "600")]
    timeout_secs: u64,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> Result<ProxyConfig> {
        Ok(ProxyConfig {
            port: self.port,
            api_key: self.api_key,
            upstream: UpstreamTarget::parse(&self.ollama_url)?,
            origins: OriginPolicy::parse(self.allowed_origins.as_deref()),
            body_limit: self.body_limit,
            upstream_timeout: Duration::from_secs(self.timeout_secs),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins over --log-level when set
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(args.log_level.to_lowercase()))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    let config = args.into_config()?;

    if config.uses_default_api_key() {
        warn!("API_KEY is not set, using the built-in placeholder key");
    }
    if let OriginPolicy::AllowList(origins) = &config.origins {
        info!("CORS allow-list: {}", origins.join(", "));
    }

    let server = Arc::new(ProxyServer::new(config)?);

    tokio::select! {
        result = server.run() => result?,
        _ = shutdown_signal() => info!("Shutdown signal received, stopping"),
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
