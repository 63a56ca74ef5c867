//! Pending version record and post-boot confirmation.
//!
//! A successful apply records which version went into which slot. The
//! version file is only advanced once the device has actually booted from
//! that slot.

use crate::error::ApplyError;
use crate::slot::{detect_active_slot, SlotLayout};
use crate::version_file::{write_atomic, VersionFile};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Pending record file name inside the state directory
pub const PENDING_FILE: &str = "pending-version.json";

/// Version written to a slot but not yet booted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingVersion {
    pub version: u32,
    pub target_label: String,
    /// RFC 3339 timestamp of the apply run
    pub applied_at: String,
}

impl PendingVersion {
    pub fn new(version: u32, target_label: impl Into<String>) -> Self {
        Self {
            version,
            target_label: target_label.into(),
            applied_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn path(state_dir: &Path) -> PathBuf {
        state_dir.join(PENDING_FILE)
    }

    pub fn load(state_dir: &Path) -> Result<Option<Self>, ApplyError> {
        let path = Self::path(state_dir);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ApplyError::io(format!("read {}", path.display()), e)),
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|source| ApplyError::PendingRecord { path, source })
    }

    /// Atomic write into `state_dir`, creating it if needed.
    pub fn store(&self, state_dir: &Path) -> Result<(), ApplyError> {
        fs::create_dir_all(state_dir)
            .map_err(|e| ApplyError::io(format!("create {}", state_dir.display()), e))?;
        let path = Self::path(state_dir);
        let json = serde_json::to_vec_pretty(self).map_err(|source| ApplyError::PendingRecord {
            path: path.clone(),
            source,
        })?;
        write_atomic(&path, &json)
            .map_err(|e| ApplyError::io(format!("write {}", path.display()), e))?;
        tracing::info!(
            "Recorded pending version {} for {}",
            self.version,
            self.target_label
        );
        Ok(())
    }

    fn remove(state_dir: &Path) -> Result<(), ApplyError> {
        let path = Self::path(state_dir);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ApplyError::io(format!("remove {}", path.display()), e)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// No apply is awaiting confirmation
    NothingPending,
    /// Booted from the updated slot; version file now holds this version
    Promoted(u32),
    /// Still running from another slot; record kept
    Pending { version: u32, target_label: String },
}

/// Promote a pending version if the running slot is the one it was written to.
pub fn confirm_boot(
    state_dir: &Path,
    version_file: &VersionFile,
    cmdline: &str,
    layout: &SlotLayout,
) -> Result<ConfirmOutcome, ApplyError> {
    let Some(pending) = PendingVersion::load(state_dir)? else {
        tracing::info!("No pending version to confirm");
        return Ok(ConfirmOutcome::NothingPending);
    };

    let active = detect_active_slot(cmdline, layout).ok_or(ApplyError::SlotUndetected)?;
    let active_label = &layout.binding(active).label;

    if *active_label != pending.target_label {
        tracing::warn!(
            "Running from {} ({}), version {} is pending on {}",
            active,
            active_label,
            pending.version,
            pending.target_label
        );
        return Ok(ConfirmOutcome::Pending {
            version: pending.version,
            target_label: pending.target_label,
        });
    }

    version_file.store(pending.version)?;
    PendingVersion::remove(state_dir)?;
    tracing::info!(
        "Booted {} from slot {}: version {} confirmed",
        active_label,
        active,
        pending.version
    );
    Ok(ConfirmOutcome::Promoted(pending.version))
}
