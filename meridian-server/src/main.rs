//! Meridian sync server
//!
//! Serves `/rooms/{roomId}/ws?type={roomType}` until Ctrl-C, then closes
//! every socket and flushes dirty rooms to storage.

use std::path::PathBuf;

use clap::Parser;
use meridian_sync::{ServerConfig, SyncServer};

/// Meridian sync server
#[derive(Parser, Debug)]
#[command(name = "meridian-server")]
#[command(about = "Run the Meridian real-time document sync server")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address, overrides the configuration file
    #[arg(short, long)]
    bind: Option<String>,

    /// RocksDB directory, overrides the configuration file
    #[arg(short, long, conflicts_with = "in_memory")]
    storage: Option<PathBuf>,

    /// Keep documents in memory only
    #[arg(long)]
    in_memory: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => {
            log::info!("Loading configuration from {}", path.display());
            ServerConfig::load(path)?
        }
        None => ServerConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if let Some(storage) = args.storage {
        config.storage_path = Some(storage);
    }
    if args.in_memory {
        config.storage_path = None;
    }

    let server = SyncServer::new(config)?;
    server
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for Ctrl-C: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    log::info!("Server stopped");
    Ok(())
}
