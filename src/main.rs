//! Entry point for the runarc HTTP API server.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use runarc::cli::Cli;
use runarc::server::{self, config::ServerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!("starting runarc HTTP API server");

    let mut config = ServerConfig::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.server.port = port;
        config.validate()?;
    }

    tracing::info!(
        port = config.server.port,
        auth_enabled = config.server.auth.enabled,
        api_keys_count = config.all_api_keys().len(),
        ip_whitelist_enabled = config.server.ip_whitelist.enabled,
        cors_enabled = config.server.cors.enabled,
        rate_limit_enabled = config.server.rate_limit.enabled,
        max_concurrent = config.server.max_concurrent,
        max_file_size = config.library.max_file_size,
        "configuration loaded"
    );

    server::run(config).await
}
