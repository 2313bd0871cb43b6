//! logloader: pulls flight logs off a device and uploads them to log servers.
//!
//! Usage:
//!   logloader [--config path/to/config.toml] [--verbose]

use anyhow::Result;
use clap::Parser;
use logloader::{load_config, prepare_storage};
use logloader_sync::{LogLoader, MountedStorageLink};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "logloader")]
#[command(about = "Downloads flight logs from a device and uploads them to log servers")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(log_level.as_str().to_lowercase())),
        )
        .with_target(false)
        .compact()
        .init();

    let (config_path, config) = load_config(args.config.as_deref())?;
    info!("Using configuration {}", config_path.display());

    let registry = prepare_storage(&config).inspect_err(|e| error!("{e:#}"))?;
    let device = Arc::new(MountedStorageLink::new(config.device.clone()));
    let loader = LogLoader::from_config(&config, device, registry)?;

    let recovered = loader.recover().await?;
    if recovered > 0 {
        info!("Reset {recovered} interrupted download(s)");
    }

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    if loader.wait_for_device(&shutdown).await {
        loader.run(shutdown).await?;
    }

    println!("exiting");
    Ok(())
}

/// Cancels `shutdown` on SIGINT or SIGTERM.
async fn watch_signals(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("Shutdown requested");
    shutdown.cancel();
}
