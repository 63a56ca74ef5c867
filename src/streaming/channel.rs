//! Channel types for the transfer pipeline.
//!
//! Sender task -> connection writer -> wire -> client receiver.
//! Using bounded channels for backpressure.

use crate::error::TransferError;
use crate::streaming::chunk::Chunk;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// Channel size for Sender -> connection (chunk events)
pub const EVENT_CHANNEL_SIZE: usize = 16;

/// Channel size for encoded frames waiting on the socket writer
pub const OUTBOUND_CHANNEL_SIZE: usize = 64;

// =============================================================================
// TransferEvent: Sender -> client
// =============================================================================

/// Event published on a transfer's event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    Chunk(Chunk),
    /// Terminal: the server abandoned the transfer
    Aborted { code: u16, reason: String },
}

impl TransferEvent {
    pub fn is_terminal(&self) -> bool {
        match self {
            TransferEvent::Chunk(chunk) => chunk.is_last,
            TransferEvent::Aborted { .. } => true,
        }
    }

    pub fn encode(&self) -> Bytes {
        match self {
            TransferEvent::Chunk(chunk) => chunk.encode(),
            TransferEvent::Aborted { code, reason } => crate::streaming::protocol::Aborted {
                code: *code,
                reason: reason.clone(),
            }
            .encode(),
        }
    }
}

// =============================================================================
// Channel types
// =============================================================================

/// Publishing side of a transfer's event stream
pub type EventSender = mpsc::Sender<TransferEvent>;

/// Subscribing side of a transfer's event stream
pub type EventReceiver = mpsc::Receiver<TransferEvent>;

/// Create a bounded channel for Sender -> subscriber events
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::channel(EVENT_CHANNEL_SIZE)
}

/// Anything a client session can pull transfer events from.
///
/// `Ok(None)` means the stream ended.
#[async_trait]
pub trait EventSource: Send {
    async fn next_event(&mut self) -> Result<Option<TransferEvent>, TransferError>;
}

#[async_trait]
impl EventSource for EventReceiver {
    async fn next_event(&mut self) -> Result<Option<TransferEvent>, TransferError> {
        Ok(self.recv().await)
    }
}

// =============================================================================
// Transfer statistics
// =============================================================================

/// Statistics for one transfer session
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TransferStats {
    /// Chunks emitted or accepted
    pub chunks: u32,

    /// Payload bytes emitted or accepted
    pub bytes: u64,

    /// Whether the session ended with its last chunk
    pub completed: bool,
}

impl TransferStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, chunk: &Chunk) {
        self.chunks += 1;
        self.bytes += chunk.payload.len() as u64;
        self.completed = chunk.is_last;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_channel_preserves_order() {
        let (tx, mut rx) = event_channel();

        for index in 0..3u32 {
            tx.send(TransferEvent::Chunk(Chunk {
                index,
                payload: Bytes::from(vec![index as u8; 4]),
                is_last: index == 2,
            }))
            .await
            .unwrap();
        }
        drop(tx);

        let mut seen = Vec::new();
        while let Some(event) = rx.next_event().await.unwrap() {
            if let TransferEvent::Chunk(chunk) = event {
                seen.push(chunk.index);
            }
        }
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn test_terminal_events() {
        let mid = TransferEvent::Chunk(Chunk {
            index: 0,
            payload: Bytes::new(),
            is_last: false,
        });
        let aborted = TransferEvent::Aborted {
            code: 1,
            reason: "read failed".to_string(),
        };
        assert!(!mid.is_terminal());
        assert!(aborted.is_terminal());
    }

    #[test]
    fn test_transfer_stats() {
        let mut stats = TransferStats::new();
        stats.record(&Chunk {
            index: 0,
            payload: Bytes::from_static(b"abcd"),
            is_last: false,
        });
        stats.record(&Chunk {
            index: 1,
            payload: Bytes::from_static(b"ef"),
            is_last: true,
        });

        assert_eq!(stats.chunks, 2);
        assert_eq!(stats.bytes, 6);
        assert!(stats.completed);
    }
}
