//! Chunk codec.
//!
//! Splits a byte stream into ordered, bounded-size chunks and validates the
//! sequence on the receiving side.
//!
//! The last-chunk marker is derived from the announced chunk count, not from
//! a short read: a stream of `S` bytes cut into `C`-byte windows has
//! `ceil(S / C)` chunks, and when `S % C == 0` the final full chunk is the
//! last one. An empty stream is a single zero-length chunk marked last.

use crate::error::TransferError;
use bytes::Bytes;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Default chunk size for image transfer (64KB)
pub const DEFAULT_CHUNK_SIZE: u32 = 64 * 1024;

/// Chunk size used by the plain file-sharing variant (4KB)
pub const SMALL_CHUNK_SIZE: u32 = 4 * 1024;

/// Upper bound on negotiated chunk size (16MB - well under the 64MB frame limit)
pub const MAX_CHUNK_SIZE: u32 = 16 * 1024 * 1024;

/// One fragment of a streamed file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// 0-based, contiguous
    pub index: u32,
    pub payload: Bytes,
    pub is_last: bool,
}

/// Number of chunks a stream of `size` bytes is split into.
///
/// Returns `None` if the count does not fit the `u32` index space or
/// `chunk_size` is zero.
pub fn chunk_count(size: u64, chunk_size: u32) -> Option<u32> {
    if chunk_size == 0 {
        return None;
    }
    if size == 0 {
        return Some(1);
    }
    u32::try_from(size.div_ceil(chunk_size as u64)).ok()
}

/// Shape of a transfer as announced in update metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferManifest {
    pub size: u64,
    pub chunk_size: u32,
    pub total_chunks: u32,
    /// CRC32 of the whole stream; 0 means "not announced"
    pub crc: u32,
}

impl TransferManifest {
    pub fn new(size: u64, chunk_size: u32, crc: u32) -> Option<Self> {
        Some(Self {
            size,
            chunk_size,
            total_chunks: chunk_count(size, chunk_size)?,
            crc,
        })
    }

    /// Payload length of chunk `index` under this manifest.
    pub fn expected_len(&self, index: u32) -> usize {
        let start = index as u64 * self.chunk_size as u64;
        self.size
            .saturating_sub(start)
            .min(self.chunk_size as u64) as usize
    }

    /// Download progress when chunk `index` arrives, in percent.
    pub fn progress_percent(&self, index: u32) -> f64 {
        if self.size == 0 {
            return 100.0;
        }
        let done = (index as u64 * self.chunk_size as u64).min(self.size);
        done as f64 / self.size as f64 * 100.0
    }
}

// =============================================================================
// Splitting
// =============================================================================

/// Reads a source in fixed windows and yields chunks in index order.
pub struct ChunkSplitter<R> {
    reader: R,
    manifest: TransferManifest,
    next_index: u32,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> ChunkSplitter<R> {
    pub fn new(reader: R, manifest: TransferManifest) -> Self {
        Self {
            reader,
            manifest,
            next_index: 0,
            buf: vec![0u8; manifest.chunk_size as usize],
        }
    }

    pub fn manifest(&self) -> &TransferManifest {
        &self.manifest
    }

    /// Produce the next chunk, or `None` once the last chunk has been yielded.
    ///
    /// Fails if the source is shorter than announced, or still has data after
    /// the announced size.
    pub async fn next_chunk(&mut self) -> io::Result<Option<Chunk>> {
        if self.next_index >= self.manifest.total_chunks {
            return Ok(None);
        }

        let index = self.next_index;
        let len = self.manifest.expected_len(index);
        self.reader.read_exact(&mut self.buf[..len]).await?;

        let is_last = index + 1 == self.manifest.total_chunks;
        if is_last {
            let mut probe = [0u8; 1];
            if self.reader.read(&mut probe).await? != 0 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "source grew beyond announced size of {} bytes",
                        self.manifest.size
                    ),
                ));
            }
        }

        self.next_index += 1;
        Ok(Some(Chunk {
            index,
            payload: Bytes::copy_from_slice(&self.buf[..len]),
            is_last,
        }))
    }
}

// =============================================================================
// Sequence validation
// =============================================================================

/// Tracks an incoming chunk sequence against its manifest.
///
/// Accepts only the next expected index; anything else fails the session.
#[derive(Debug)]
pub struct ChunkSequence {
    manifest: TransferManifest,
    next_index: u32,
    received: u64,
    complete: bool,
}

impl ChunkSequence {
    pub fn new(manifest: TransferManifest) -> Self {
        Self {
            manifest,
            next_index: 0,
            received: 0,
            complete: false,
        }
    }

    pub fn manifest(&self) -> &TransferManifest {
        &self.manifest
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Validate chunk metadata before its payload is written.
    /// Returns true when this chunk completes the sequence.
    pub fn accept(&mut self, index: u32, len: usize, is_last: bool) -> Result<bool, TransferError> {
        if self.complete {
            return Err(TransferError::AlreadyComplete { index });
        }
        if index != self.next_index {
            return Err(TransferError::OutOfOrder {
                expected: self.next_index,
                got: index,
            });
        }

        let total = self.manifest.total_chunks;
        if index >= total {
            return Err(TransferError::Overflow {
                index,
                size: self.manifest.size,
            });
        }
        if is_last != (index + 1 == total) {
            return Err(TransferError::LastMismatch {
                index,
                total_chunks: total,
            });
        }

        let expected = self.manifest.expected_len(index);
        if len != expected {
            return Err(TransferError::ChunkSize {
                index,
                len,
                expected,
            });
        }

        self.next_index += 1;
        self.received += len as u64;
        self.complete = is_last;
        Ok(is_last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    async fn split_all(data: &[u8], chunk_size: u32) -> Vec<Chunk> {
        let manifest = TransferManifest::new(data.len() as u64, chunk_size, 0).unwrap();
        let mut splitter = ChunkSplitter::new(data, manifest);
        let mut chunks = Vec::new();
        while let Some(chunk) = splitter.next_chunk().await.unwrap() {
            chunks.push(chunk);
        }
        chunks
    }

    #[test]
    fn test_chunk_count() {
        assert_eq!(chunk_count(0, 4), Some(1));
        assert_eq!(chunk_count(1, 4), Some(1));
        assert_eq!(chunk_count(4, 4), Some(1));
        assert_eq!(chunk_count(5, 4), Some(2));
        assert_eq!(chunk_count(8, 4), Some(2));
        assert_eq!(chunk_count(10, 0), None);
        assert_eq!(chunk_count(u64::MAX, 1), None);
    }

    #[tokio::test]
    async fn test_exact_multiple_marks_final_full_chunk_last() {
        let data = vec![7u8; 8];
        let chunks = split_all(&data, 4).await;

        assert_eq!(chunks.len(), 2);
        assert!(!chunks[0].is_last);
        assert!(chunks[1].is_last);
        assert_eq!(chunks[1].payload.len(), 4);
    }

    #[tokio::test]
    async fn test_empty_stream_is_single_empty_last_chunk() {
        let chunks = split_all(&[], 4).await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].index, 0);
        assert!(chunks[0].payload.is_empty());
        assert!(chunks[0].is_last);
    }

    #[tokio::test]
    async fn test_short_source_fails() {
        let manifest = TransferManifest::new(10, 4, 0).unwrap();
        let data = [1u8; 6];
        let mut splitter = ChunkSplitter::new(&data[..], manifest);

        assert!(splitter.next_chunk().await.unwrap().is_some());
        let err = splitter.next_chunk().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_grown_source_fails_before_last_chunk() {
        let manifest = TransferManifest::new(4, 4, 0).unwrap();
        let data = [1u8; 5];
        let mut splitter = ChunkSplitter::new(&data[..], manifest);

        let err = splitter.next_chunk().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_sequence_rejects_gap_and_duplicate() {
        let manifest = TransferManifest::new(12, 4, 0).unwrap();
        let mut seq = ChunkSequence::new(manifest);

        assert!(!seq.accept(0, 4, false).unwrap());
        assert!(matches!(
            seq.accept(0, 4, false),
            Err(TransferError::OutOfOrder {
                expected: 1,
                got: 0
            })
        ));
        assert!(matches!(
            seq.accept(2, 4, true),
            Err(TransferError::OutOfOrder {
                expected: 1,
                got: 2
            })
        ));
    }

    #[test]
    fn test_sequence_rejects_early_last_and_bad_length() {
        let manifest = TransferManifest::new(10, 4, 0).unwrap();
        let mut seq = ChunkSequence::new(manifest);

        assert!(matches!(
            seq.accept(0, 4, true),
            Err(TransferError::LastMismatch { .. })
        ));
        assert!(matches!(
            seq.accept(0, 3, false),
            Err(TransferError::ChunkSize { .. })
        ));
        seq.accept(0, 4, false).unwrap();
        seq.accept(1, 4, false).unwrap();
        assert!(seq.accept(2, 2, true).unwrap());
        assert!(seq.is_complete());
        assert_eq!(seq.received(), 10);
        assert!(matches!(
            seq.accept(3, 1, true),
            Err(TransferError::AlreadyComplete { index: 3 })
        ));
    }

    #[test]
    fn test_progress_percent() {
        let manifest = TransferManifest::new(1000, 100, 0).unwrap();
        assert_eq!(manifest.progress_percent(0), 0.0);
        assert_eq!(manifest.progress_percent(5), 50.0);
        assert_eq!(manifest.progress_percent(9), 90.0);

        let empty = TransferManifest::new(0, 100, 0).unwrap();
        assert_eq!(empty.progress_percent(0), 100.0);
    }

    proptest! {
        #[test]
        fn prop_split_then_reassemble(
            data in proptest::collection::vec(any::<u8>(), 0..4096),
            chunk_size in 1u32..600,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let chunks = rt.block_on(split_all(&data, chunk_size));

            let expected = chunk_count(data.len() as u64, chunk_size).unwrap();
            prop_assert_eq!(chunks.len() as u32, expected);

            let manifest = TransferManifest::new(data.len() as u64, chunk_size, 0).unwrap();
            let mut seq = ChunkSequence::new(manifest);
            let mut out = Vec::with_capacity(data.len());
            for (i, chunk) in chunks.iter().enumerate() {
                prop_assert_eq!(chunk.index as usize, i);
                prop_assert_eq!(chunk.is_last, i + 1 == chunks.len());
                seq.accept(chunk.index, chunk.payload.len(), chunk.is_last).unwrap();
                out.extend_from_slice(&chunk.payload);
            }
            prop_assert!(seq.is_complete());
            prop_assert_eq!(out, data);
        }
    }
}
