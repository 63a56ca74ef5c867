use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use slotswap::config::Config;
use slotswap::metadata::UpdateSource;
use slotswap::server::{serve, UpdateService};
use slotswap::streaming::{SenderConfig, MAX_CHUNK_SIZE};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Serve update metadata and stream the update image to clients.
#[derive(Parser, Debug)]
#[command(name = "slotswap-server", version, about)]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "SLOTSWAP_LISTEN", default_value = "0.0.0.0:7070")]
    listen: String,

    /// Directory holding rootfs.ext4, update.version and update.crc
    #[arg(long, env = "SLOTSWAP_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Bytes per chunk
    #[arg(long)]
    chunk_size: Option<u32>,

    /// Delay between chunks in milliseconds
    #[arg(long)]
    pacing_ms: Option<u64>,

    /// Config file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    slotswap::logging::init(cli.verbose);

    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let data_dir = cli.data_dir.unwrap_or(config.paths.data_dir);
    let chunk_size = cli.chunk_size.unwrap_or(config.transfer.chunk_size);
    if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
        anyhow::bail!("--chunk-size must be in 1..={}", MAX_CHUNK_SIZE);
    }
    let pacing = cli
        .pacing_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| config.transfer.pacing());

    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create {}", data_dir.display()))?;
    let source = UpdateSource::from_data_dir(&data_dir);
    tracing::info!(
        "Serving {} (chunk size {}, pacing {:?})",
        source.image.display(),
        chunk_size,
        pacing
    );

    let service = Arc::new(UpdateService::new(
        source,
        SenderConfig { chunk_size, pacing },
    ));
    let listener = TcpListener::bind(&cli.listen)
        .await
        .with_context(|| format!("Failed to bind {}", cli.listen))?;

    tokio::select! {
        result = serve(listener, service) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
            Ok(())
        }
    }
}
