//! Receiver for chunk streams.
//!
//! Reassembles Chunk events into a local file. The output is opened before
//! any chunk can arrive; chunks must arrive strictly in index order.
//! Data goes to `<output>.part` and is renamed into place only after the
//! announced size (and CRC, when non-zero) check out.

use crate::error::TransferError;
use crate::streaming::channel::TransferStats;
use crate::streaming::chunk::{Chunk, ChunkSequence, TransferManifest};
use crate::temp_file::TempFileGuard;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Outcome of handing one chunk to the receiver
#[derive(Debug, Clone, PartialEq)]
pub enum ReceiveStatus {
    /// More chunks expected; download progress in percent
    InProgress { percent: f64 },
    /// Last chunk written, verified, and renamed into place
    Complete { path: PathBuf, bytes: u64 },
}

/// Receiver configuration
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Final output path
    pub output: PathBuf,
    /// Transfer shape from update metadata
    pub manifest: TransferManifest,
}

/// Receiver state
pub struct Receiver {
    output: PathBuf,
    part_path: PathBuf,
    file: Option<File>,
    guard: Option<TempFileGuard>,
    sequence: ChunkSequence,
    hasher: crc32fast::Hasher,
    stats: TransferStats,
}

fn part_path(output: &Path) -> PathBuf {
    let mut name = output.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    output.with_file_name(name)
}

impl Receiver {
    /// Open the output for writing. Failure here fails the session before
    /// it starts.
    pub async fn create(config: ReceiverConfig) -> Result<Self, TransferError> {
        let output = config.output;
        if output.file_name().is_none() {
            return Err(TransferError::Io {
                path: output,
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "output path has no file name",
                ),
            });
        }

        if let Some(parent) = output.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|source| TransferError::Io {
                        path: parent.to_path_buf(),
                        source,
                    })?;
            }
        }

        let part_path = part_path(&output);
        let guard = TempFileGuard::new(&part_path);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&part_path)
            .await
            .map_err(|source| TransferError::Io {
                path: part_path.clone(),
                source,
            })?;

        tracing::debug!("Receiving into {}", part_path.display());

        Ok(Self {
            output,
            part_path,
            file: Some(file),
            guard: Some(guard),
            sequence: ChunkSequence::new(config.manifest),
            hasher: crc32fast::Hasher::new(),
            stats: TransferStats::new(),
        })
    }

    pub fn manifest(&self) -> &TransferManifest {
        self.sequence.manifest()
    }

    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    /// Append one chunk. Must be called once per chunk, in delivery order.
    pub async fn on_chunk(&mut self, chunk: Chunk) -> Result<ReceiveStatus, TransferError> {
        let is_done = self
            .sequence
            .accept(chunk.index, chunk.payload.len(), chunk.is_last)?;

        let file = self.file.as_mut().ok_or(TransferError::AlreadyComplete {
            index: chunk.index,
        })?;
        file.write_all(&chunk.payload)
            .await
            .map_err(|source| TransferError::Io {
                path: self.part_path.clone(),
                source,
            })?;
        self.hasher.update(&chunk.payload);
        self.stats.record(&chunk);

        let percent = self.sequence.manifest().progress_percent(chunk.index);
        tracing::debug!(
            "Chunk {} ({} bytes) {:.0}%{}",
            chunk.index,
            chunk.payload.len(),
            percent,
            if chunk.is_last { " [LAST]" } else { "" }
        );

        if is_done {
            let bytes = self.finish().await?;
            return Ok(ReceiveStatus::Complete {
                path: self.output.clone(),
                bytes,
            });
        }

        Ok(ReceiveStatus::InProgress { percent })
    }

    async fn finish(&mut self) -> Result<u64, TransferError> {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| TransferError::Io { path, source }
        };

        if let Some(mut file) = self.file.take() {
            file.flush().await.map_err(io_err(&self.part_path))?;
            file.sync_all().await.map_err(io_err(&self.part_path))?;
        }

        let manifest = *self.sequence.manifest();
        let received = self.sequence.received();
        if received != manifest.size {
            return Err(TransferError::SizeMismatch {
                expected: manifest.size,
                received,
            });
        }

        if manifest.crc != 0 {
            let actual = std::mem::take(&mut self.hasher).finalize();
            if actual != manifest.crc {
                return Err(TransferError::CrcMismatch {
                    expected: manifest.crc,
                    actual,
                });
            }
        }

        fs::rename(&self.part_path, &self.output)
            .await
            .map_err(io_err(&self.output))?;
        if let Some(guard) = self.guard.take() {
            guard.defuse();
        }

        tracing::info!(
            "All chunks received. File saved to: {}",
            self.output.display()
        );
        Ok(received)
    }
}
