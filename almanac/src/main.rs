//! Almanac - Persistent settings registry daemon
//!
//! Provides:
//! - Typed, bounded settings in a hierarchical namespace
//! - Crash-safe XML persistence with debounced saves
//! - Schema migrations at boot
//! - Factory default overlays

use almanac::config::{default_socket_path, AlmanacConfig};
use almanac::ipc::IpcServer;
use almanac::service;
use almanac_core::{Registry, SettingsRequest, SCHEMA_VERSION};
use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

/// Almanac - Settings registry daemon
#[derive(Parser, Debug)]
#[command(name = "almanacd", version, about)]
struct Args {
    /// Data directory holding the settings file
    #[arg(short, long, default_value = "/data/conf")]
    path: PathBuf,

    /// Configuration file
    #[arg(short, long, default_value = "/etc/almanac/almanac.yaml")]
    config: PathBuf,

    /// Socket path (overrides the configuration file)
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Factory default directory (repeatable, overrides the configuration file)
    #[arg(long = "defaults-dir")]
    defaults_dirs: Vec<PathBuf>,

    /// Save after every change instead of debouncing
    #[arg(long)]
    no_delay: bool,

    /// Debug mode
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = AlmanacConfig::load(&args.config)?;

    let log_level = if args.debug {
        "debug".to_string()
    } else {
        config.daemon.log_level.clone()
    };
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .init();

    info!("Almanac v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Data directory: {:?}", args.path);

    let mut options = config.registry_options(&args.path);
    if args.no_delay {
        options.save_delay = Duration::ZERO;
    }
    if !args.defaults_dirs.is_empty() {
        options.defaults_dirs = args.defaults_dirs.clone();
    }

    let registry = Registry::open(options)?;
    info!(
        "Registry ready: {} settings, schema version {}",
        registry.tree().setting_count(),
        SCHEMA_VERSION
    );

    let (handle, _task) = service::spawn(registry);

    let socket_path = args
        .socket
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| {
            if config.daemon.socket_path.is_empty() {
                default_socket_path()
            } else {
                config.daemon.socket_path.clone()
            }
        });
    let server = IpcServer::new(socket_path, handle.clone());

    info!("Almanac ready");
    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, saving settings...");
            if let Err(e) = handle.call(SettingsRequest::Flush).await {
                error!("Failed to flush settings: {}", e);
            }
            info!("Almanac shutting down");
            Ok(())
        }
    }
}
