use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use zeroclaw_sync::collab::{create_store, Services};
use zeroclaw_sync::{gateway, Hub, HubConfig};

#[derive(Parser)]
#[command(name = "zeroclaw-sync", version, about = "Cross-device sync hub")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the hub and its HTTP/WebSocket gateway
    Serve {
        /// Config file (defaults to the platform config dir)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Override `[gateway] host`
        #[arg(long)]
        host: Option<String>,
        /// Override `[gateway] port`
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print the JSON schema of the config file
    ConfigSchema,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::Serve { config, host, port } => serve(config, host, port).await,
        Command::ConfigSchema => {
            println!("{}", HubConfig::schema_json()?);
            Ok(())
        }
    }
}

async fn serve(path: Option<PathBuf>, host: Option<String>, port: Option<u16>) -> Result<()> {
    let mut config = HubConfig::load(path.as_deref())?;
    if let Some(host) = host {
        config.gateway.host = host;
    }
    if let Some(port) = port {
        config.gateway.port = port;
    }

    let store = create_store(&config.store).context("opening store")?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        store = store.name(),
        "Starting zeroclaw-sync"
    );
    let hub = Hub::new(config, Services::default().with_store(store))?;
    hub.restore_devices().await?;
    hub.start();

    if let Some(code) = hub.pairing_code() {
        println!();
        println!("  🔐 PAIRING REQUIRED (no [auth] device_secret set). Use this code:");
        println!("     ┌──────────────────┐");
        println!("     │  {code}  │");
        println!("     └──────────────────┘");
        println!("     Send: POST /api/devices with header X-Pairing-Code: {code}");
        println!();
    }

    let shutdown = CancellationToken::new();
    let mut gateway_task = tokio::spawn(gateway::run_gateway(hub.clone(), shutdown.clone()));

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("listening for ctrl-c")?;
            tracing::info!("Shutdown requested");
        }
        result = &mut gateway_task => {
            // Gateway exited on its own (bind failure or fatal error).
            hub.shutdown().await;
            return result.context("gateway task panicked")?;
        }
    }

    hub.shutdown().await;
    shutdown.cancel();
    gateway_task.await.context("gateway task panicked")??;
    Ok(())
}
