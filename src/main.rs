//! Warren - Multi-Protocol Tunneling Gateway
//!
//! This is the main entry point for the Warren gateway.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use warren::config::load_config;

/// Warren - multi-protocol tunneling gateway
#[derive(Parser, Debug)]
#[command(name = "warren")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging format
    #[arg(long)]
    json_log: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logging
    setup_logging(&args.log_level, args.json_log)?;

    // Load configuration
    let config = load_config(&args.config)?;

    info!("warren v{}", warren::VERSION);
    info!("Configuration loaded from: {:?}", args.config);
    info!(
        "Public entrypoint: {}:{}",
        config.listen.host, config.listen.public_port
    );

    // Setup shutdown signal
    let shutdown = CancellationToken::new();

    // Handle Ctrl+C and termination signals (cross-platform)
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm =
                signal(SignalKind::terminate()).expect("Failed to setup SIGTERM handler");

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C, shutting down...");
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                }
            }
        }

        #[cfg(not(unix))]
        {
            // On Windows, only handle Ctrl+C
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl+C, shutting down...");
        }

        signal_token.cancel();
    });

    // Run the gateway
    warren::gateway::run(config, shutdown).await
}

/// Setup logging based on CLI flags; unknown levels fall back to info.
fn setup_logging(level: &str, json: bool) -> Result<()> {
    let level: Level = level.parse().unwrap_or(Level::INFO);
    let builder = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true);

    if json {
        tracing::subscriber::set_global_default(builder.json().finish())?;
    } else {
        tracing::subscriber::set_global_default(builder.finish())?;
    }

    Ok(())
}
