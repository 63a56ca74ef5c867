use clap::{ArgAction, Parser};
use slotswap::apply::confirm::{confirm_boot, ConfirmOutcome};
use slotswap::apply::host::{Host, SystemHost};
use slotswap::apply::{Applier, ApplyOptions, ApplyReport};
use slotswap::config::Config;
use slotswap::error::ApplyError;
use slotswap::metadata::VERSION_FILE;
use slotswap::version_file::VersionFile;
use std::path::PathBuf;
use std::process::ExitCode;

/// Write an update image into the inactive A/B slot and boot from it next.
///
/// Exit status: 0 success, 10 not root, 20 active slot unknown,
/// 30 image larger than the target slot, 50 any other failure.
#[derive(Parser, Debug)]
#[command(name = "ota-apply", version, about, long_about = None)]
struct Cli {
    /// Update image to write
    #[arg(long, required_unless_present = "confirm_boot")]
    image: Option<PathBuf>,

    /// Boot configuration to switch [default: /boot/extlinux/extlinux.conf]
    #[arg(long)]
    bootconf: Option<PathBuf>,

    /// Validate and print the plan without touching storage
    #[arg(long)]
    dry_run: bool,

    /// Config file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Built-in slot layout
    #[arg(long, value_parser = ["board", "qemu"])]
    layout: Option<String>,

    /// Record this version for --confirm-boot after the reboot
    #[arg(long)]
    pending_version: Option<u32>,

    /// After booting: promote the pending version if this slot is the updated one
    #[arg(long, conflicts_with_all = ["image", "dry_run", "pending_version"])]
    confirm_boot: bool,

    /// Directory for the lock file and pending version record
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Version file promoted by --confirm-boot [default: <client dir>/update.version]
    #[arg(long)]
    version_file: Option<PathBuf>,

    /// Kernel boot parameters [default: /proc/cmdline]
    #[arg(long, hide = true)]
    cmdline: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    slotswap::logging::init(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("FATAL: {}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

fn run(cli: Cli) -> Result<(), ApplyError> {
    // Privilege decides the exit status before any config is read
    if !cli.confirm_boot && !SystemHost::default().is_privileged() {
        return Err(ApplyError::NotPrivileged);
    }

    let config = Config::load(cli.config.as_deref())?;
    let layout = config.slots.resolve(cli.layout.as_deref())?;
    let host = SystemHost {
        cmdline_path: cli.cmdline.unwrap_or(config.paths.cmdline),
    };
    let state_dir = cli.state_dir.unwrap_or(config.paths.state_dir);

    if cli.confirm_boot {
        let version_file = VersionFile::open_or_create(
            cli.version_file
                .unwrap_or_else(|| config.paths.client_dir.join(VERSION_FILE)),
        )?;
        let cmdline = host
            .boot_cmdline()
            .map_err(|e| ApplyError::io("read kernel command line", e))?;
        match confirm_boot(&state_dir, &version_file, &cmdline, &layout)? {
            ConfirmOutcome::NothingPending => println!("Nothing pending"),
            ConfirmOutcome::Promoted(version) => println!("Version {} confirmed", version),
            ConfirmOutcome::Pending {
                version,
                target_label,
            } => println!(
                "Version {} still pending: not booted from {}",
                version, target_label
            ),
        }
        return Ok(());
    }

    let options = ApplyOptions {
        // clap requires --image without --confirm-boot
        image: cli.image.unwrap_or_default(),
        bootconf: cli.bootconf.unwrap_or(config.paths.bootconf),
        dry_run: cli.dry_run,
        layout,
        state_dir,
        pending_version: cli.pending_version,
    };

    let report = Applier::new(options, host).run()?;
    print_report(&report);
    Ok(())
}

fn print_report(report: &ApplyReport) {
    let plan = &report.plan;
    println!("Active slot: {}", plan.active);
    println!(
        "Target slot: {} ({}, {})",
        plan.target,
        plan.target_device.display(),
        plan.target_label
    );
    println!(
        "Image size:  {} bytes (target {} bytes)",
        report.image_size, report.target_size
    );
    if report.dry_run {
        println!("Dry run: no changes made");
    } else {
        println!(
            "Wrote {} bytes; next boot uses {}",
            report.bytes_written, plan.target_label
        );
    }
}
