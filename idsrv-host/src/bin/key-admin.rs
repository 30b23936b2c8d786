//! Key Admin CLI
//!
//! Operator commands for inspecting and rotating signing keys in the shared
//! key database. Reads the same environment as the host.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use idsrv_config::KeyManagementConfig;
use idsrv_host::key_management_options;
use idsrv_keys::{init_key_management, KeyInfo, KeyRotationManager, RotationReport};

#[derive(Parser)]
#[command(name = "key-admin")]
#[command(about = "Identity Server signing key administration")]
struct Cli {
    /// SQLite database path, overrides DATABASE_URL
    #[arg(long)]
    database_url: Option<String>,

    /// Output as JSON
    #[arg(short, long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List every stored key with its current status
    List,
    /// Run one rotation cycle now
    Rotate,
    /// Delete expired keys only
    Purge,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = KeyManagementConfig::from_env()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;
    if let Some(database_url) = cli.database_url {
        config.database_url = database_url;
    }

    // Keep stdout clean for --json
    if !cli.json {
        idsrv_logging::init_console_logging("key-admin", "warn");
    }

    let key_management = init_key_management(key_management_options(&config)?)
        .await
        .context("Failed to initialize key management")?;
    let manager = &key_management.manager;

    match cli.command {
        Commands::List => cmd_list(manager, cli.json).await?,
        Commands::Rotate => {
            let report = manager.run_cycle(Utc::now()).await?;
            print_report("Rotation cycle", &report, cli.json)?;
        }
        Commands::Purge => {
            let report = manager.purge_expired(Utc::now()).await?;
            print_report("Purge", &report, cli.json)?;
        }
    }

    Ok(())
}

async fn cmd_list(manager: &KeyRotationManager, json: bool) -> Result<()> {
    let now = Utc::now();
    let keys: Vec<KeyInfo> = manager.list_keys(now).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&keys)?);
        return Ok(());
    }

    if keys.is_empty() {
        println!("No signing keys stored.");
        return Ok(());
    }

    let signing = manager.get_key_set(now).await.signing_key;

    println!("Signing Keys");
    println!("{}", "=".repeat(72));
    for key in &keys {
        let marker = match &signing {
            Some(credential) if credential.kid() == key.id => "  <- signing",
            _ => "",
        };
        println!(
            "  {:<32}  {:<8}  {}{}",
            key.id,
            key.status,
            key.created.format("%Y-%m-%d %H:%M:%S UTC"),
            marker
        );
    }

    Ok(())
}

fn print_report(title: &str, report: &RotationReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("{}", title);
    println!("{}", "=".repeat(60));
    println!(
        "  Pending: {}  Active: {}  Retired: {}  Expired: {}",
        report.pending, report.active, report.retired, report.expired
    );
    if let Some(id) = &report.generated {
        println!("  Generated: {}", id);
    }
    for id in &report.deleted {
        println!("  Deleted: {}", id);
    }
    for failure in &report.failures {
        println!("  Failed: {}", failure);
    }

    if !report.is_clean() {
        anyhow::bail!("{} completed with {} failure(s)", title, report.failures.len());
    }
    Ok(())
}
