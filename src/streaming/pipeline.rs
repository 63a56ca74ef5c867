//! Client receive session.
//!
//! Drives a [`Receiver`] from an [`EventSource`] until the last chunk, an
//! Aborted event, a closed stream, or the inactivity timeout.

use crate::error::TransferError;
use crate::streaming::channel::{EventSource, TransferEvent, TransferStats};
use crate::streaming::receiver::{ReceiveStatus, Receiver};
use std::path::PathBuf;
use std::time::Duration;

/// Default time allowed between two chunk events
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of a completed session
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedImage {
    pub path: PathBuf,
    pub bytes: u64,
    pub stats: TransferStats,
}

/// Pull events until the transfer completes.
///
/// `on_progress` is called with the percentage after every accepted
/// non-last chunk.
pub async fn receive_session<S, F>(
    source: &mut S,
    mut receiver: Receiver,
    idle_timeout: Duration,
    mut on_progress: F,
) -> Result<ReceivedImage, TransferError>
where
    S: EventSource + ?Sized,
    F: FnMut(f64),
{
    loop {
        let event = match tokio::time::timeout(idle_timeout, source.next_event()).await {
            Ok(event) => event?,
            Err(_) => {
                tracing::warn!(
                    "No chunk for {:?} after {} chunks",
                    idle_timeout,
                    receiver.stats().chunks
                );
                return Err(TransferError::Timeout(idle_timeout));
            }
        };

        match event {
            Some(TransferEvent::Chunk(chunk)) => match receiver.on_chunk(chunk).await? {
                ReceiveStatus::InProgress { percent } => on_progress(percent),
                ReceiveStatus::Complete { path, bytes } => {
                    on_progress(100.0);
                    return Ok(ReceivedImage {
                        path,
                        bytes,
                        stats: receiver.stats().clone(),
                    });
                }
            },
            Some(TransferEvent::Aborted { code, reason }) => {
                tracing::error!("Server aborted transfer (code {}): {}", code, reason);
                return Err(TransferError::Aborted(reason));
            }
            None => return Err(TransferError::StreamClosed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::channel::event_channel;
    use crate::streaming::chunk::{Chunk, TransferManifest};
    use crate::streaming::receiver::ReceiverConfig;
    use crate::streaming::sender::{Sender, SenderConfig};
    use bytes::Bytes;
    use tempfile::TempDir;

    async fn receiver(tmp: &TempDir, manifest: TransferManifest) -> Receiver {
        Receiver::create(ReceiverConfig {
            output: tmp.path().join("download.img"),
            manifest,
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_session_with_sender() {
        let tmp = TempDir::new().unwrap();
        let image = tmp.path().join("rootfs.ext4");
        let content: Vec<u8> = (0..50_000u32).map(|i| (i * 7 % 256) as u8).collect();
        std::fs::write(&image, &content).unwrap();

        let manifest =
            TransferManifest::new(content.len() as u64, 4096, crc32fast::hash(&content)).unwrap();
        let (tx, mut rx) = event_channel();
        Sender::new(SenderConfig {
            chunk_size: 4096,
            pacing: Duration::ZERO,
        })
        .spawn(image, manifest, tx);

        let mut progress = Vec::new();
        let received = receive_session(
            &mut rx,
            receiver(&tmp, manifest).await,
            Duration::from_secs(5),
            |p| progress.push(p),
        )
        .await
        .unwrap();

        assert_eq!(received.bytes, 50_000);
        assert_eq!(received.stats.chunks, 13);
        assert_eq!(std::fs::read(&received.path).unwrap(), content);
        assert_eq!(progress.first(), Some(&0.0));
        assert_eq!(progress.last(), Some(&100.0));
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn test_session_aborted() {
        let tmp = TempDir::new().unwrap();
        let manifest = TransferManifest::new(8, 4, 0).unwrap();
        let (tx, mut rx) = event_channel();
        tx.send(TransferEvent::Aborted {
            code: 1,
            reason: "disk gone".into(),
        })
        .await
        .unwrap();

        let err = receive_session(
            &mut rx,
            receiver(&tmp, manifest).await,
            Duration::from_secs(5),
            |_| {},
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TransferError::Aborted(reason) if reason == "disk gone"));
        assert!(!tmp.path().join("download.img").exists());
    }

    #[tokio::test]
    async fn test_session_stream_closed_early() {
        let tmp = TempDir::new().unwrap();
        let manifest = TransferManifest::new(8, 4, 0).unwrap();
        let (tx, mut rx) = event_channel();
        tx.send(TransferEvent::Chunk(Chunk {
            index: 0,
            payload: Bytes::from_static(b"1234"),
            is_last: false,
        }))
        .await
        .unwrap();
        drop(tx);

        let err = receive_session(
            &mut rx,
            receiver(&tmp, manifest).await,
            Duration::from_secs(5),
            |_| {},
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TransferError::StreamClosed));
        assert!(!tmp.path().join("download.img.part").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_times_out_when_stream_stalls() {
        let tmp = TempDir::new().unwrap();
        let manifest = TransferManifest::new(8, 4, 0).unwrap();
        // Keep the sender alive so the stream never closes
        let (_tx, mut rx) = event_channel();

        let err = receive_session(
            &mut rx,
            receiver(&tmp, manifest).await,
            Duration::from_secs(30),
            |_| {},
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TransferError::Timeout(d) if d == Duration::from_secs(30)));
    }
}
