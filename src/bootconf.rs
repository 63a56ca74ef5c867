//! Boot configuration rewrite and atomic commit.
//!
//! The new content is staged next to the original (temp file in the same
//! directory, written and fsynced) and only becomes visible through a
//! single rename. Dropping a [`StagedConfig`] without committing leaves the
//! original untouched.

use crate::error::ApplyError;
use crate::slot::SlotLayout;
use std::fs::{self, File, Permissions};
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Default extlinux configuration path
pub const DEFAULT_BOOTCONF: &str = "/boot/extlinux/extlinux.conf";

/// Mode for a boot config that does not exist yet
const NEW_CONFIG_MODE: u32 = 0o644;

fn root_token(label: &str) -> String {
    format!("root=PARTLABEL={}", label)
}

/// Replace every `root=PARTLABEL=<slot label>` token with one naming
/// `target_label`. Plain string substitution; nothing else is parsed.
pub fn rewrite_root_partlabel(
    path: &Path,
    text: &str,
    layout: &SlotLayout,
    target_label: &str,
) -> Result<String, ApplyError> {
    let target = root_token(target_label);
    let slot_tokens = [root_token(&layout.a.label), root_token(&layout.b.label)];
    let mut found = false;

    // Whole tokens only: `root=PARTLABEL=rootfsA2` is left alone
    let mut rewritten = String::with_capacity(text.len());
    let mut rest = text;
    for token in text.split_whitespace() {
        let Some(offset) = rest.find(token) else {
            continue;
        };
        rewritten.push_str(&rest[..offset]);
        if slot_tokens.iter().any(|t| t == token) {
            rewritten.push_str(&target);
            found = true;
        } else {
            rewritten.push_str(token);
        }
        rest = &rest[offset + token.len()..];
    }
    rewritten.push_str(rest);

    if !found {
        return Err(ApplyError::BootConfigToken {
            path: path.to_path_buf(),
            label_a: layout.a.label.clone(),
            label_b: layout.b.label.clone(),
        });
    }
    Ok(rewritten)
}

/// New boot configuration written beside the original, not yet visible.
#[derive(Debug)]
pub struct StagedConfig {
    target: PathBuf,
    temp: NamedTempFile,
}

/// Write `content` to a temp file in the same directory as `path` and fsync it.
///
/// The temp file takes the permissions of the file it will replace.
pub fn stage(path: &Path, content: &str) -> Result<StagedConfig, ApplyError> {
    let dir = parent_dir(path);
    let permissions = match fs::metadata(path) {
        Ok(meta) => meta.permissions(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Permissions::from_mode(NEW_CONFIG_MODE),
        Err(e) => return Err(ApplyError::io(format!("stat {}", path.display()), e)),
    };
    let mut temp = tempfile::Builder::new()
        .prefix(".extlinux.")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|e| ApplyError::io(format!("create temp file in {}", dir.display()), e))?;

    temp.as_file()
        .set_permissions(permissions)
        .map_err(|e| ApplyError::io(format!("chmod {}", temp.path().display()), e))?;
    temp.write_all(content.as_bytes())
        .map_err(|e| ApplyError::io(format!("write {}", temp.path().display()), e))?;
    temp.as_file()
        .sync_all()
        .map_err(|e| ApplyError::io(format!("fsync {}", temp.path().display()), e))?;

    tracing::debug!("Staged boot config at {}", temp.path().display());
    Ok(StagedConfig {
        target: path.to_path_buf(),
        temp,
    })
}

impl StagedConfig {
    pub fn temp_path(&self) -> &Path {
        self.temp.path()
    }

    /// Rename over the original and fsync the directory.
    pub fn commit(self) -> Result<(), ApplyError> {
        let target = self.target;
        self.temp
            .persist(&target)
            .map_err(|e| ApplyError::io(format!("rename over {}", target.display()), e.error))?;

        let dir = parent_dir(&target);
        File::open(dir)
            .and_then(|d| d.sync_all())
            .map_err(|e| ApplyError::io(format!("fsync directory {}", dir.display()), e))?;

        tracing::info!("Committed boot config {}", target.display());
        Ok(())
    }
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}
