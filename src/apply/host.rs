//! Host facts and side effects the applier needs from the running system.

use std::fs;
use std::io;
use std::path::PathBuf;

/// Kernel boot parameters
pub const PROC_CMDLINE: &str = "/proc/cmdline";

pub trait Host {
    /// Effective uid is 0.
    fn is_privileged(&self) -> bool;

    /// Kernel boot parameters of the running system.
    fn boot_cmdline(&self) -> io::Result<String>;

    /// Flush all filesystem buffers.
    fn sync_filesystems(&self);
}

/// The real machine
#[derive(Debug, Clone)]
pub struct SystemHost {
    pub cmdline_path: PathBuf,
}

impl Default for SystemHost {
    fn default() -> Self {
        Self {
            cmdline_path: PathBuf::from(PROC_CMDLINE),
        }
    }
}

impl Host for SystemHost {
    fn is_privileged(&self) -> bool {
        // SAFETY: geteuid has no preconditions and cannot fail
        unsafe { libc::geteuid() == 0 }
    }

    fn boot_cmdline(&self) -> io::Result<String> {
        fs::read_to_string(&self.cmdline_path)
    }

    fn sync_filesystems(&self) {
        // SAFETY: sync(2) takes no arguments and always succeeds
        unsafe { libc::sync() }
    }
}
