//! Pilot coordination service entry point

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use pilot::{api::HttpApi, Pilot, PilotConfig};

/// Pilot - push cluster coordination service
#[derive(Parser, Debug)]
#[command(name = "pilot")]
#[command(about = "Coordination service for the push cluster")]
struct Args {
    /// Configuration file path (YAML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data directory
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// HTTP API listen address
    #[arg(long)]
    http_addr: Option<String>,

    /// Default session ttl (seconds)
    #[arg(long)]
    session_ttl: Option<u64>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => PilotConfig::from_file(path)?,
        None => PilotConfig::default(),
    };
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(http_addr) = args.http_addr {
        config.http_addr = http_addr;
    }
    if let Some(ttl) = args.session_ttl {
        config.session.default_ttl_secs = ttl;
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }
    config.validate()?;

    // Initialize logging
    let level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting Pilot coordination service...");
    info!("  Data dir: {:?}", config.data_dir);
    info!("  HTTP API: {}", config.http_addr);
    info!("  Session ttl: {}s", config.session.default_ttl_secs);

    let pilot = Arc::new(Pilot::new(config.clone()).await?);
    let cancel = CancellationToken::new();

    // Start background tasks
    let _checker_handle = pilot.start_session_checker(cancel.clone());
    let _save_handle = pilot.clone().start_periodic_save(cancel.clone());

    let app = HttpApi::new(pilot.clone()).router();
    let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;
    info!("HTTP API listening on {}", config.http_addr);

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
        }
        shutdown.cancel();
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.clone().cancelled_owned())
        .await?;

    pilot.save().await?;
    info!("Pilot stopped");
    Ok(())
}
