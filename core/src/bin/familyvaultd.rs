//! FamilyVault daemon.
//!
//! Starts the core, brings the network up, runs the content indexer and
//! serves until interrupted.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use fv_core::{AppConfig, Core, NetworkEvent};

#[derive(Parser, Debug)]
#[command(name = "familyvaultd", about = "FamilyVault per-device daemon")]
struct Args {
    /// Data directory (defaults to the platform data dir).
    #[arg(long, env = "FAMILYVAULT_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Override the secure-transport TCP port.
    #[arg(long)]
    port: Option<u16>,

    /// Skip starting the network stack (index-only mode).
    #[arg(long)]
    no_network: bool,

    /// Log filter, e.g. `info` or `fv_core=debug`.
    #[arg(long, env = "FAMILYVAULT_LOG", default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let data_dir = match args.data_dir {
        Some(dir) => dir,
        None => fv_core::config::default_data_dir().context("resolving data directory")?,
    };
    let config = AppConfig::load_or_create(&data_dir).context("loading configuration")?;
    let core = Core::open(config).await.context("opening core")?;

    info!(
        device = %core.identity.device_name,
        id = %core.identity.device_id,
        "familyvaultd up"
    );

    // Log network events; the real UI subscribes the same way.
    let mut events = core.events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match &event {
                NetworkEvent::Error { message } => error!(code = event.code(), %message, "network error"),
                other => info!(code = other.code(), payload = %other.payload_json(), "event"),
            }
        }
    });

    if !args.no_network {
        if let Err(e) = core.network.start(args.port).await {
            error!(error = %e, "network start failed, continuing index-only");
        }
    }

    core.content.start(None).await?;
    core.index.scan_all(None).await?;

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");
    core.shutdown().await?;
    Ok(())
}
