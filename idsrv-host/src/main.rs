//! Identity Server Key Host
//!
//! Runs signing-key rotation against the shared key database until
//! interrupted. Several hosts may run against the same database.

use anyhow::{Context, Result};
use idsrv_config::KeyManagementConfig;
use idsrv_host::{init_host_logging, key_management_options};
use idsrv_keys::init_key_management;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = KeyManagementConfig::from_env()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

    // Initialize logging
    init_host_logging("idsrv-host", &config);

    info!("Starting Identity Server Key Host");
    info!(
        database_url = %config.database_url,
        activation_delay_secs = config.activation_delay.as_secs(),
        expiration_secs = config.expiration.as_secs(),
        retirement_secs = config.retirement.as_secs(),
        rotation_interval_secs = config.rotation_interval.as_secs(),
        cache_ttl_secs = config.cache_ttl.as_secs(),
        "Configuration loaded"
    );

    let options = key_management_options(&config)?;
    let key_management = init_key_management(options)
        .await
        .context("Failed to initialize key management")?;

    let token = CancellationToken::new();
    let task = key_management.start(token.clone());

    // Wait for shutdown signal
    info!("Key host running. Press Ctrl+C to stop.");
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Shutdown signal received");
        }
        Err(err) => {
            error!(error = %err, "Unable to listen for shutdown signal");
        }
    }

    // Let an in-flight cycle finish before exiting
    task.shutdown().await;
    info!("Key host stopped");

    Ok(())
}
