//! OTA applier.
//!
//! Writes an image into the inactive slot and points the boot configuration
//! at it. The run is a straight line of checks followed by durable writes;
//! the boot configuration is only replaced after the slot write and the
//! pending version record have been flushed, so an interruption at any point
//! leaves the old slot bootable.
//!
//! ```text
//! privilege -> lock -> detect slot -> capacity -> rewrite bootconf (memory)
//!   -> [dry run stops here] -> write slot + sync -> pending version record
//!   -> commit bootconf + sync
//! ```

pub mod confirm;
pub mod host;
pub mod writer;

use crate::bootconf::{rewrite_root_partlabel, stage};
use crate::error::ApplyError;
use crate::slot::{build_plan, detect_active_slot, Plan, SlotLayout};
use confirm::PendingVersion;
use fs2::FileExt;
use host::Host;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

/// Lock file name inside the state directory
pub const LOCK_FILE: &str = "ota-apply.lock";

/// Default state directory for the lock and pending record
pub const DEFAULT_STATE_DIR: &str = "/var/lib/slotswap";

#[derive(Debug, Clone)]
pub struct ApplyOptions {
    pub image: PathBuf,
    pub bootconf: PathBuf,
    pub dry_run: bool,
    pub layout: SlotLayout,
    pub state_dir: PathBuf,
    /// Version to record for confirmation after reboot
    pub pending_version: Option<u32>,
}

/// What a successful run did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    pub plan: Plan,
    pub image_size: u64,
    pub target_size: u64,
    pub dry_run: bool,
    pub bytes_written: u64,
}

/// Exclusive advisory lock held for the whole run.
#[derive(Debug)]
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    pub fn acquire(state_dir: &Path) -> Result<Self, ApplyError> {
        fs::create_dir_all(state_dir)
            .map_err(|e| ApplyError::io(format!("create {}", state_dir.display()), e))?;
        let path = state_dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| ApplyError::io(format!("open {}", path.display()), e))?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Self { file, path }),
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                Err(ApplyError::AlreadyRunning(path))
            }
            Err(e) => Err(ApplyError::io(format!("lock {}", path.display()), e)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

pub struct Applier<H> {
    options: ApplyOptions,
    host: H,
}

impl<H: Host> Applier<H> {
    pub fn new(options: ApplyOptions, host: H) -> Self {
        Self { options, host }
    }

    pub fn options(&self) -> &ApplyOptions {
        &self.options
    }

    pub fn run(&self) -> Result<ApplyReport, ApplyError> {
        let opts = &self.options;

        if !self.host.is_privileged() {
            return Err(ApplyError::NotPrivileged);
        }

        let _lock = InstanceLock::acquire(&opts.state_dir)?;

        let cmdline = self
            .host
            .boot_cmdline()
            .map_err(|e| ApplyError::io("read kernel command line", e))?;
        let active = detect_active_slot(&cmdline, &opts.layout).ok_or_else(|| {
            tracing::error!("No slot matches kernel command line: {}", cmdline.trim());
            ApplyError::SlotUndetected
        })?;
        let plan = build_plan(active, &opts.layout);
        tracing::info!(
            "Active slot {}, target slot {} ({}, {})",
            plan.active,
            plan.target,
            plan.target_device.display(),
            plan.target_label
        );

        let image_meta = fs::metadata(&opts.image)
            .map_err(|e| ApplyError::io(format!("stat image {}", opts.image.display()), e))?;
        if !image_meta.is_file() {
            return Err(ApplyError::NotRegularFile(opts.image.clone()));
        }
        let image_size = image_meta.len();
        let target_size = writer::device_size(&plan.target_device)?;
        if image_size > target_size {
            return Err(ApplyError::ImageTooLarge {
                image: image_size,
                target: target_size,
            });
        }
        tracing::info!(
            "Image {} bytes fits target {} bytes",
            image_size,
            target_size
        );

        let original = fs::read_to_string(&opts.bootconf)
            .map_err(|e| ApplyError::io(format!("read {}", opts.bootconf.display()), e))?;
        let rewritten =
            rewrite_root_partlabel(&opts.bootconf, &original, &opts.layout, &plan.target_label)?;

        if opts.dry_run {
            tracing::info!(
                "Dry run: would write {} to {} and boot {}",
                opts.image.display(),
                plan.target_device.display(),
                plan.target_label
            );
            return Ok(ApplyReport {
                plan,
                image_size,
                target_size,
                dry_run: true,
                bytes_written: 0,
            });
        }

        let bytes_written =
            writer::write_image(&opts.image, &plan.target_device, image_size, |_| {})?;
        self.host.sync_filesystems();

        // A record for a slot that never boots stays pending
        if let Some(version) = opts.pending_version {
            PendingVersion::new(version, plan.target_label.clone()).store(&opts.state_dir)?;
        }

        stage(&opts.bootconf, &rewritten)?.commit()?;
        self.host.sync_filesystems();
        tracing::info!("Next boot uses {}", plan.target_label);

        Ok(ApplyReport {
            plan,
            image_size,
            target_size,
            dry_run: false,
            bytes_written,
        })
    }
}
