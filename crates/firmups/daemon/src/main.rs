//! Firmups Daemon - Fleet reconciliation service
//!
//! The daemon provides:
//! - Periodic and on-demand firmware rollout toward each device's target
//! - TLS expiry checks and key rotation with delivery confirmation
//! - Event streaming for observability

use clap::Parser;
use firmups_daemon::{DaemonConfig, DaemonResult, Inventory, Server};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Firmups Daemon CLI
#[derive(Parser)]
#[command(name = "firmupsd")]
#[command(about = "Firmups Daemon - Fleet firmware and key reconciliation", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "FIRMUPS_CONFIG")]
    config: Option<String>,

    /// JSON seed inventory loaded at startup
    #[arg(short, long, env = "FIRMUPS_INVENTORY")]
    inventory: Option<String>,

    /// Log level (overrides the configuration file)
    #[arg(long, env = "FIRMUPS_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, env = "FIRMUPS_LOG_JSON")]
    json: bool,

    /// Run a single reconciliation pass, print its report, and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> DaemonResult<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = DaemonConfig::load(cli.config.as_deref())?;

    // Initialize tracing
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into());

    if cli.json || config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let inventory = cli
        .inventory
        .clone()
        .or_else(|| config.storage.inventory.clone());

    // Create server and seed it
    let server = Server::new(config)?;
    if let Some(path) = inventory {
        let summary = server.seed(&Inventory::load(&path)?).await?;
        tracing::info!(path = %path, devices = summary.devices, "Seed inventory applied");
    }

    if cli.once {
        let report = server.run_once().await;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        r#"
  firmupsd {}
  Fleet firmware rollout and key lifecycle
"#,
        env!("CARGO_PKG_VERSION"),
    );

    server.run().await
}
