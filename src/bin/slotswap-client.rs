use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use slotswap::client::{run_update, UpdateOptions, UpdateOutcome};
use slotswap::config::Config;
use slotswap::metadata::{IMAGE_FILE, VERSION_FILE};
use slotswap::transport::{RetryPolicy, UpdateClient};
use slotswap::version_file::VersionFile;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

/// Check the update server for a newer image and download it.
#[derive(Parser, Debug)]
#[command(name = "slotswap-client", version, about)]
struct Cli {
    /// Update server address
    #[arg(long, env = "SLOTSWAP_SERVER", default_value = "127.0.0.1:7070")]
    server: String,

    /// Directory holding update.version and the download
    #[arg(long, env = "SLOTSWAP_CLIENT_DIR")]
    data_dir: Option<PathBuf>,

    /// Download destination [default: <data-dir>/rootfs.ext4]
    #[arg(long)]
    output: Option<PathBuf>,

    /// Give up when no chunk arrives for this many seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Connection attempts before giving up
    #[arg(long, default_value_t = 5)]
    retries: u32,

    /// Config file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    slotswap::logging::init(cli.verbose);

    match run(cli).await {
        Ok(outcome) => {
            let line = outcome.describe();
            match outcome {
                UpdateOutcome::Downloaded { .. } => println!("{} {}", "✓".green(), line.bold()),
                UpdateOutcome::Rejected | UpdateOutcome::Unavailable { .. } => {
                    println!("{} {}", "!".yellow(), line)
                }
                _ => println!("{}", line),
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<UpdateOutcome> {
    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let data_dir = cli.data_dir.unwrap_or(config.paths.client_dir);
    let version_file = VersionFile::open_or_create(data_dir.join(VERSION_FILE))?;

    let mut options = UpdateOptions::new(cli.output.unwrap_or_else(|| data_dir.join(IMAGE_FILE)));
    options.idle_timeout = cli
        .timeout_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.transfer.idle_timeout());

    let retry = RetryPolicy {
        attempts: cli.retries,
        ..RetryPolicy::default()
    };
    let mut client = UpdateClient::connect(&cli.server, &retry).await?;
    tracing::debug!("Server: {}", client.server_agent());

    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos:>3}% {msg}")?
            .progress_chars("=> "),
    );
    bar.set_message("downloading");

    let outcome = run_update(&mut client, &version_file, &options, |percent| {
        bar.set_position(percent.round() as u64)
    })
    .await;
    bar.finish_and_clear();

    Ok(outcome?)
}
