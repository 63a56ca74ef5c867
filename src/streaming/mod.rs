//! Chunked image streaming.
//!
//! ```text
//! image file -> Sender task -> event channel -> connection writer -> wire
//!     wire -> UpdateClient (EventSource) -> receive_session -> Receiver -> file
//! ```
//!
//! Chunks flow one way with no acknowledgements. Ordering comes from the
//! single sender task and the single reader per session; the receiver
//! rejects anything that is not the next expected index.

pub mod channel;
pub mod chunk;
pub mod pipeline;
pub mod protocol;
pub mod receiver;
pub mod sender;

pub use channel::{
    event_channel, EventReceiver, EventSender, EventSource, TransferEvent, TransferStats,
    EVENT_CHANNEL_SIZE, OUTBOUND_CHANNEL_SIZE,
};
pub use chunk::{
    chunk_count, Chunk, ChunkSequence, ChunkSplitter, TransferManifest, DEFAULT_CHUNK_SIZE,
    MAX_CHUNK_SIZE, SMALL_CHUNK_SIZE,
};
pub use pipeline::{receive_session, ReceivedImage, DEFAULT_IDLE_TIMEOUT};
pub use receiver::{ReceiveStatus, Receiver, ReceiverConfig};
pub use sender::{Sender, SenderConfig, DEFAULT_PACING};

pub use protocol::{
    negotiate_version, read_frame, try_read_frame, write_frame, ErrorCode, MessageType,
    VersionNegotiationResult, MAX_FRAME_SIZE, PROTOCOL_VERSION, PROTOCOL_VERSION_MAX,
    PROTOCOL_VERSION_MIN,
};
