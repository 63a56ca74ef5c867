// Persisted u32 markers (update.version, update.crc)
//
// Single-line text files holding a decimal or 0x-prefixed hexadecimal value.
// Only the first line is significant; surrounding whitespace is ignored.

use crate::error::MarkerError;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Parse a marker value: decimal, or hexadecimal with a `0x`/`0X` prefix.
pub fn parse_marker(text: &str) -> Option<u32> {
    let line = text.lines().next()?.trim();
    if line.is_empty() {
        return None;
    }

    if let Some(hex) = line
        .strip_prefix("0x")
        .or_else(|| line.strip_prefix("0X"))
    {
        u32::from_str_radix(hex, 16).ok()
    } else {
        line.parse().ok()
    }
}

/// Read a required marker file.
pub fn read_marker(path: &Path) -> Result<u32, MarkerError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(MarkerError::Missing(path.to_path_buf()))
        }
        Err(source) => {
            return Err(MarkerError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    if text.trim().is_empty() {
        return Err(MarkerError::Empty(path.to_path_buf()));
    }

    parse_marker(&text).ok_or_else(|| MarkerError::Invalid {
        path: path.to_path_buf(),
        value: text.lines().next().unwrap_or_default().trim().to_string(),
    })
}

/// Read an optional marker file. Absence or a bad value yields 0.
pub fn read_optional_marker(path: &Path) -> u32 {
    match read_marker(path) {
        Ok(v) => v,
        Err(MarkerError::Missing(_)) => 0,
        Err(e) => {
            tracing::warn!("Ignoring optional marker: {}", e);
            0
        }
    }
}

/// Write `contents` to `path` via a sibling temp file, fsync, and rename.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let mut temp = tempfile::NamedTempFile::new_in(&dir)?;
    temp.write_all(contents)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;

    // Make the rename itself durable
    fs::File::open(&dir)?.sync_all()?;
    Ok(())
}

/// The client's record of the last version it has activated.
#[derive(Debug, Clone)]
pub struct VersionFile {
    path: PathBuf,
}

impl VersionFile {
    /// Open the version file, creating it with value `0` if absent.
    pub fn open_or_create(path: impl Into<PathBuf>) -> Result<Self, MarkerError> {
        let path = path.into();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent).map_err(|source| MarkerError::Io {
                        path: parent.to_path_buf(),
                        source,
                    })?;
                }
            }
            write_atomic(&path, b"0\n").map_err(|source| MarkerError::Io {
                path: path.clone(),
                source,
            })?;
            tracing::info!("Created version file {} with version 0", path.display());
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> Result<u32, MarkerError> {
        read_marker(&self.path)
    }

    /// Overwrite the stored version (atomic write).
    pub fn store(&self, version: u32) -> Result<(), MarkerError> {
        write_atomic(&self.path, format!("{}\n", version).as_bytes()).map_err(|source| {
            MarkerError::Io {
                path: self.path.clone(),
                source,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_decimal_and_hex() {
        assert_eq!(parse_marker("42"), Some(42));
        assert_eq!(parse_marker("  7 \n"), Some(7));
        assert_eq!(parse_marker("0x1F"), Some(31));
        assert_eq!(parse_marker("0XdeadBEEF\nignored"), Some(0xdead_beef));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(parse_marker(""), None);
        assert_eq!(parse_marker("\n5"), None);
        assert_eq!(parse_marker("v5"), None);
        assert_eq!(parse_marker("0x"), None);
        assert_eq!(parse_marker("-1"), None);
        assert_eq!(parse_marker("4294967296"), None);
    }

    #[test]
    fn test_read_marker_errors() {
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("nope");
        assert!(matches!(read_marker(&missing), Err(MarkerError::Missing(_))));

        let empty = tmp.path().join("empty");
        fs::write(&empty, "   \n").unwrap();
        assert!(matches!(read_marker(&empty), Err(MarkerError::Empty(_))));

        let bad = tmp.path().join("bad");
        fs::write(&bad, "abc").unwrap();
        assert!(matches!(
            read_marker(&bad),
            Err(MarkerError::Invalid { .. })
        ));
    }

    #[test]
    fn test_optional_marker_defaults_to_zero() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(read_optional_marker(&tmp.path().join("update.crc")), 0);

        let crc = tmp.path().join("update.crc");
        fs::write(&crc, "0x12345678").unwrap();
        assert_eq!(read_optional_marker(&crc), 0x1234_5678);

        fs::write(&crc, "not-a-crc").unwrap();
        assert_eq!(read_optional_marker(&crc), 0);
    }

    #[test]
    fn test_version_file_created_with_zero() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("client").join("update.version");

        let vf = VersionFile::open_or_create(&path).unwrap();
        assert_eq!(vf.read().unwrap(), 0);
        assert_eq!(fs::read_to_string(&path).unwrap().trim(), "0");
    }

    #[test]
    fn test_version_file_store_preserves_existing() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("update.version");
        fs::write(&path, "0x10").unwrap();

        let vf = VersionFile::open_or_create(&path).unwrap();
        assert_eq!(vf.read().unwrap(), 16);

        vf.store(17).unwrap();
        assert_eq!(vf.read().unwrap(), 17);

        // No temp files left behind
        let leftovers: Vec<_> = fs::read_dir(tmp.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }
}
