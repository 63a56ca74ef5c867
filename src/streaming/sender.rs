//! Sender task for chunk streaming.
//!
//! Reads the image in fixed windows and publishes one Chunk event per
//! window, in index order, with a small pacing delay between emissions.
//! Runs detached from the RPC reply path.

use crate::streaming::channel::{EventSender, TransferEvent, TransferStats};
use crate::streaming::chunk::{ChunkSplitter, TransferManifest};
use crate::streaming::protocol::ErrorCode;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::BufReader;
use tokio::task::JoinHandle;

/// Default delay between chunk emissions
pub const DEFAULT_PACING: Duration = Duration::from_millis(10);

/// Sender configuration
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Window size per chunk
    pub chunk_size: u32,
    /// Crude rate limit between chunks; never relied on for ordering
    pub pacing: Duration,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            chunk_size: crate::streaming::chunk::DEFAULT_CHUNK_SIZE,
            pacing: DEFAULT_PACING,
        }
    }
}

/// Sender state
pub struct Sender {
    config: SenderConfig,
}

impl Sender {
    pub fn new(config: SenderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SenderConfig {
        &self.config
    }

    /// Transfer shape for an image of `size` bytes at this sender's chunk size.
    pub fn manifest(&self, size: u64, crc: u32) -> Option<TransferManifest> {
        TransferManifest::new(size, self.config.chunk_size, crc)
    }

    /// Spawn the transfer of `path` onto its own task.
    pub fn spawn(
        self,
        path: PathBuf,
        manifest: TransferManifest,
        tx: EventSender,
    ) -> JoinHandle<TransferStats> {
        tokio::spawn(async move { self.run(path, manifest, tx).await })
    }

    /// Stream `path` as Chunk events.
    ///
    /// Read failures do not return an error: they are published as a
    /// terminal Aborted event so the subscriber learns the session is dead.
    pub async fn run(
        self,
        path: PathBuf,
        manifest: TransferManifest,
        tx: EventSender,
    ) -> TransferStats {
        let mut stats = TransferStats::new();

        let file = match File::open(&path).await {
            Ok(f) => f,
            Err(e) => {
                tracing::error!("Failed to open {}: {}", path.display(), e);
                abort(&tx, code_for(&e), format!("cannot open image: {}", e)).await;
                return stats;
            }
        };

        let mut splitter = ChunkSplitter::new(BufReader::new(file), manifest);
        tracing::info!(
            "Streaming {} ({} bytes, {} chunks of {})",
            path.display(),
            manifest.size,
            manifest.total_chunks,
            manifest.chunk_size
        );

        loop {
            let chunk = match splitter.next_chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(
                        "Read failed at chunk {} of {}: {}",
                        stats.chunks,
                        path.display(),
                        e
                    );
                    abort(&tx, code_for(&e), format!("read failed: {}", e)).await;
                    return stats;
                }
            };

            tracing::debug!(
                "Sending chunk {} ({} bytes){}",
                chunk.index,
                chunk.payload.len(),
                if chunk.is_last { " [LAST]" } else { "" }
            );

            stats.record(&chunk);
            let is_last = chunk.is_last;
            if tx.send(TransferEvent::Chunk(chunk)).await.is_err() {
                tracing::warn!("Subscriber went away after {} chunks", stats.chunks);
                stats.completed = false;
                return stats;
            }

            if !is_last && !self.config.pacing.is_zero() {
                tokio::time::sleep(self.config.pacing).await;
            }
        }

        tracing::info!("Completed sending {}", path.display());
        stats
    }
}

fn code_for(e: &io::Error) -> u16 {
    match e.kind() {
        io::ErrorKind::NotFound => ErrorCode::NotFound as u16,
        io::ErrorKind::UnexpectedEof | io::ErrorKind::InvalidData => {
            ErrorCode::SourceChanged as u16
        }
        _ => ErrorCode::IoError as u16,
    }
}

async fn abort(tx: &EventSender, code: u16, reason: String) {
    let _ = tx.send(TransferEvent::Aborted { code, reason }).await;
}
