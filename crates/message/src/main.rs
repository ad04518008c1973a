//! Message node entry point

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use message::{Config, MessageNode};
use push_core::{CoordStore, PilotStore};

/// Message - message storage node of the push cluster
#[derive(Parser, Debug)]
#[command(name = "message")]
#[command(about = "Message node: stores offline and conversation messages")]
struct Args {
    /// Configuration file path (YAML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Node name
    #[arg(short, long)]
    node: Option<String>,

    /// Node weight
    #[arg(short, long)]
    weight: Option<u32>,

    /// RPC listen address
    #[arg(long)]
    rpc_bind: Option<String>,

    /// Pilot address
    #[arg(long)]
    pilot_addr: Option<String>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(node) = args.node {
        config.node.name = node;
    }
    if let Some(weight) = args.weight {
        config.node.weight = weight;
    }
    if let Some(bind) = args.rpc_bind {
        config.network.rpc_bind = vec![bind];
    }
    if let Some(addr) = args.pilot_addr {
        config.coord.pilot.pilot_addr = addr;
    }
    if let Some(level) = args.log_level {
        config.log.level = level;
    }
    config.validate()?;

    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting message node {}...", config.node.name);
    info!("  RPC bind: {:?}", config.network.rpc_bind);
    info!("  Max stored per key: {}", config.storage.max_store);
    info!("  Pilot: {}", config.coord.pilot.pilot_addr);

    let pilot = PilotStore::connect(config.coord.pilot.clone()).await?;
    let session_lost = pilot.session_lost();
    let store: Arc<dyn CoordStore> = Arc::new(pilot.clone());

    let cancel = CancellationToken::new();
    let node = MessageNode::new(config, store);
    let meta = node.start(cancel.clone()).await?;
    info!("Message node registered: {:?}", meta);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
        _ = session_lost.cancelled() => warn!("Coordination session lost, stopping"),
    }
    cancel.cancel();

    if let Err(e) = pilot.close().await {
        warn!("Failed to close coordination session: {}", e);
    }
    info!("Message node stopped");
    Ok(())
}
