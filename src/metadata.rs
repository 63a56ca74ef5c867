//! Update metadata resolution.
//!
//! Answers "is there an image newer than version V?" from the server's data
//! directory. Failures are reported as result codes inside [`UpdateInfo`]
//! rather than as errors, because the client branches on them.

use crate::streaming::chunk::{chunk_count, TransferManifest};
use crate::version_file::{read_marker, read_optional_marker};
use std::fs;
use std::path::{Path, PathBuf};

/// Image file name inside the server data directory
pub const IMAGE_FILE: &str = "rootfs.ext4";

/// Version marker file name
pub const VERSION_FILE: &str = "update.version";

/// Optional CRC marker file name
pub const CRC_FILE: &str = "update.crc";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ResultCode {
    Success = 0,
    /// Image absent or not a regular file
    ImageMissing = -10,
    /// Image size could not be determined
    SizeUnavailable = -11,
    /// Version marker absent or unparsable
    VersionUnavailable = -12,
}

impl ResultCode {
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(Self::Success),
            -10 => Some(Self::ImageMissing),
            -11 => Some(Self::SizeUnavailable),
            -12 => Some(Self::VersionUnavailable),
            _ => None,
        }
    }

    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Answer to a metadata query. Immutable once produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateInfo {
    pub exists: bool,
    pub is_new: bool,
    pub new_version: u32,
    pub size: u64,
    pub crc: u32,
    pub result_code: i32,
    /// Chunk size the transfer will use
    pub chunk_size: u32,
    /// Number of chunks the transfer will emit
    pub total_chunks: u32,
}

impl UpdateInfo {
    pub fn failed(code: ResultCode, exists: bool) -> Self {
        Self {
            exists,
            is_new: false,
            new_version: 0,
            size: 0,
            crc: 0,
            result_code: code.code(),
            chunk_size: 0,
            total_chunks: 0,
        }
    }

    pub fn result(&self) -> Option<ResultCode> {
        ResultCode::from_i32(self.result_code)
    }

    pub fn is_success(&self) -> bool {
        self.result_code == ResultCode::Success.code()
    }

    /// Transfer shape announced by this answer.
    pub fn manifest(&self) -> Option<TransferManifest> {
        if !self.is_success() {
            return None;
        }
        let manifest = TransferManifest::new(self.size, self.chunk_size, self.crc)?;
        (manifest.total_chunks == self.total_chunks).then_some(manifest)
    }
}

/// Location of the candidate image and its marker files.
#[derive(Debug, Clone)]
pub struct UpdateSource {
    pub image: PathBuf,
    pub version_file: PathBuf,
    pub crc_file: PathBuf,
}

impl UpdateSource {
    /// Standard layout: `<dir>/rootfs.ext4`, `<dir>/update.version`, `<dir>/update.crc`
    pub fn from_data_dir(dir: &Path) -> Self {
        Self {
            image: dir.join(IMAGE_FILE),
            version_file: dir.join(VERSION_FILE),
            crc_file: dir.join(CRC_FILE),
        }
    }

    /// Size of the image if it exists and is a regular file.
    pub fn image_size(&self) -> Option<u64> {
        fs::metadata(&self.image)
            .ok()
            .filter(|m| m.is_file())
            .map(|m| m.len())
    }

    /// Resolve metadata for a client currently at `current_version`.
    ///
    /// Checks run in fixed order: existence, size, version.
    pub fn request_update(&self, current_version: u32, chunk_size: u32) -> UpdateInfo {
        let is_file = fs::metadata(&self.image)
            .map(|m| m.is_file())
            .unwrap_or(false);
        if !is_file {
            tracing::info!("No update image at {}", self.image.display());
            return UpdateInfo::failed(ResultCode::ImageMissing, false);
        }

        let size = match self.image_size() {
            Some(size) => size,
            None => {
                tracing::warn!("Cannot determine size of {}", self.image.display());
                return UpdateInfo::failed(ResultCode::SizeUnavailable, true);
            }
        };
        let total_chunks = match chunk_count(size, chunk_size) {
            Some(n) => n,
            None => {
                tracing::warn!(
                    "Image of {} bytes cannot be chunked at {} bytes",
                    size,
                    chunk_size
                );
                let mut info = UpdateInfo::failed(ResultCode::SizeUnavailable, true);
                info.size = size;
                return info;
            }
        };

        let new_version = match read_marker(&self.version_file) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("Version marker unavailable: {}", e);
                let mut info = UpdateInfo::failed(ResultCode::VersionUnavailable, true);
                info.size = size;
                return info;
            }
        };

        let crc = read_optional_marker(&self.crc_file);
        let is_new = new_version > current_version;

        tracing::info!(
            client_version = current_version,
            new_version,
            size,
            is_new,
            "requestUpdate"
        );

        UpdateInfo {
            exists: true,
            is_new,
            new_version,
            size,
            crc,
            result_code: ResultCode::Success.code(),
            chunk_size,
            total_chunks,
        }
    }
}
