use anyhow::{Context, Result};
use homeport_sftp::{open_user_store, Server};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config;

/// Start the file server
///
/// NIST Controls:
/// - CM-6: Configuration Settings (load from config file)
/// - AU-3: Content of Audit Records (log startup events)
/// - IA-5: Authenticator Management (user store, host keys)
pub async fn run(config_path: &Path) -> Result<()> {
    info!("Starting Homeport file server...");

    let config = config::load_config(config_path)
        .await
        .context("Failed to load configuration")?;
    info!("Configuration loaded from {}", config_path.display());

    let store = open_user_store(&config)
        .await
        .context("Failed to open user store")?;
    let server = Server::new(config, store).context("Failed to create server")?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown requested");
        signal.cancel();
    });

    server.run(shutdown).await?;
    Ok(())
}
