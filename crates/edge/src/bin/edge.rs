//! Edge server binary

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use edge::server::{EdgeConfig, Gateway, state_dir::EdgeStateDir};
use edge_core::ValidateConfig;
use edge_core::tracing::{
    config::InstrumentationConfig,
    init::{init_dev, init_tracing},
    metrics::{gauge, log_all_metrics},
};
use tracing::{error, info};

/// Self-hosted network edge: SNI routing, authoritative DNS and ACME certificates
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config")]
    config: Option<String>,

    /// Directory for the ACME account and certificates
    #[arg(long = "state-dir")]
    state_dir: Option<PathBuf>,

    /// Debug-level human readable logs, ignoring the configured log settings
    #[arg(long)]
    dev: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = if let Some(config_path) = &cli.config {
        EdgeConfig::load_from_file(config_path)
            .with_context(|| format!("Failed to load configuration from {config_path}"))?
    } else {
        EdgeConfig::load().context("Failed to load configuration")?
    };

    if cli.dev {
        init_dev()?;
    } else {
        let env = InstrumentationConfig::from_env();
        init_tracing(&InstrumentationConfig {
            log_level: config.server.log_level.clone(),
            json: config.server.json_logs || env.json,
            ..env
        })?;
    }

    config.validate().context("Invalid configuration")?;
    info!("Starting edge with {} domains", config.domains.len());

    let state_dir = match cli.state_dir.or_else(|| config.server.state_dir.clone()) {
        Some(path) => EdgeStateDir::with_override(path),
        None => EdgeStateDir::new(),
    };

    gauge("edge_info").set(1);

    let gateway = Arc::new(
        Gateway::new(config, &state_dir)
            .await
            .context("Failed to initialize gateway")?,
    );

    let shutdown = gateway.shutdown_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutting down..."),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
        shutdown.cancel();
    });

    let result = gateway.run().await;
    log_all_metrics();
    result?;
    Ok(())
}
