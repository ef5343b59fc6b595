//! Soundscape server

use clap::Parser;
use soundscape_app::{Cli, Soundscape};
use soundscape_core::domain::ConfigManager;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    tracing::info!("Soundscape starting...");

    let manager = match &cli.config {
        Some(path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(ConfigManager::default_config_dir()?),
    };
    let mut config = manager.load().await;
    cli.apply(&mut config);

    let soundscape = Soundscape::start(&config).await?;
    if let Some(addr) = soundscape.osc_addr() {
        tracing::info!(%addr, mode = %config.osc.mode, "OSC ready");
    }
    if let Some(addr) = soundscape.websocket_addr() {
        tracing::info!(%addr, "WebSocket ready");
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    soundscape.shutdown().await;

    Ok(())
}
