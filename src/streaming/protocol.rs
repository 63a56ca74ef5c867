//! Wire messages for update negotiation and chunk streaming.
//!
//! One protocol version, no backward compatibility. The two RPCs
//! (`RequestUpdate`, `StartTransfer`) are request/reply; chunks and the
//! terminal `Aborted` event flow server -> client without ACKs.

use crate::metadata::UpdateInfo;
use crate::streaming::chunk::Chunk;
use anyhow::{Context, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol version
pub const PROTOCOL_VERSION: u16 = 1;

/// Minimum supported protocol version
pub const PROTOCOL_VERSION_MIN: u16 = 1;

/// Maximum supported protocol version
pub const PROTOCOL_VERSION_MAX: u16 = 1;

/// Wire format: all multi-byte integers are big-endian
/// Strings are length-prefixed (u16 len + UTF-8)
/// Frame format: len:u32 | type:u8 | payload

// =============================================================================
// Message Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Hello = 0x01,
    RequestUpdate = 0x02,
    UpdateInfo = 0x03,
    StartTransfer = 0x04,
    TransferReply = 0x05,
    Chunk = 0x06,
    Aborted = 0x07,
    Fatal = 0x08,
}

impl MessageType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Hello),
            0x02 => Some(Self::RequestUpdate),
            0x03 => Some(Self::UpdateInfo),
            0x04 => Some(Self::StartTransfer),
            0x05 => Some(Self::TransferReply),
            0x06 => Some(Self::Chunk),
            0x07 => Some(Self::Aborted),
            0x08 => Some(Self::Fatal),
            _ => None,
        }
    }
}

// =============================================================================
// Flags
// =============================================================================

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ChunkFlags: u8 {
        const LAST = 1 << 0;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InfoFlags: u8 {
        const EXISTS = 1 << 0;
        const IS_NEW = 1 << 1;
    }
}

// =============================================================================
// Error Codes
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    IoError = 1,
    NotFound = 2,
    SourceChanged = 3,
    Protocol = 4,
    VersionMismatch = 5,
}

impl ErrorCode {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            1 => Some(Self::IoError),
            2 => Some(Self::NotFound),
            3 => Some(Self::SourceChanged),
            4 => Some(Self::Protocol),
            5 => Some(Self::VersionMismatch),
            _ => None,
        }
    }
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn get_string(payload: &mut Bytes, what: &str) -> Result<String> {
    if payload.remaining() < 2 {
        anyhow::bail!("{} length truncated", what);
    }
    let len = payload.get_u16() as usize;
    if payload.remaining() < len {
        anyhow::bail!(
            "{} truncated: expected {} bytes, got {}",
            what,
            len,
            payload.remaining()
        );
    }
    String::from_utf8(payload.copy_to_bytes(len).to_vec())
        .with_context(|| format!("Invalid UTF-8 in {}", what))
}

/// Clamp to the u16 length prefix.
fn truncate_str(s: &str) -> &str {
    if s.len() <= u16::MAX as usize {
        return s;
    }
    let mut end = u16::MAX as usize;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// =============================================================================
// HELLO (0x01)
// =============================================================================

#[derive(Debug, Clone)]
pub struct Hello {
    pub version: u16,
    pub agent: String,
}

impl Hello {
    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            agent: agent.into(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let agent = truncate_str(&self.agent);
        let payload_len = 2 + 2 + agent.len();
        let mut buf = BytesMut::with_capacity(5 + payload_len);

        buf.put_u32(payload_len as u32);
        buf.put_u8(MessageType::Hello as u8);
        buf.put_u16(self.version);
        put_string(&mut buf, agent);

        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 2 {
            anyhow::bail!("Hello payload too short");
        }
        let version = payload.get_u16();
        let agent = get_string(&mut payload, "Hello agent")?;
        Ok(Self { version, agent })
    }
}

// =============================================================================
// REQUEST_UPDATE (0x02)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestUpdate {
    pub current_version: u32,
}

impl RequestUpdate {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(5 + 4);
        buf.put_u32(4);
        buf.put_u8(MessageType::RequestUpdate as u8);
        buf.put_u32(self.current_version);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 4 {
            anyhow::bail!("RequestUpdate payload too short");
        }
        Ok(Self {
            current_version: payload.get_u32(),
        })
    }
}

// =============================================================================
// UPDATE_INFO (0x03)
// =============================================================================

impl UpdateInfo {
    const WIRE_SIZE: usize = 1 + 4 + 8 + 4 + 4 + 4 + 4;

    pub fn encode(&self) -> Bytes {
        let mut flags = InfoFlags::empty();
        if self.exists {
            flags |= InfoFlags::EXISTS;
        }
        if self.is_new {
            flags |= InfoFlags::IS_NEW;
        }

        let mut buf = BytesMut::with_capacity(5 + Self::WIRE_SIZE);
        buf.put_u32(Self::WIRE_SIZE as u32);
        buf.put_u8(MessageType::UpdateInfo as u8);
        buf.put_u8(flags.bits());
        buf.put_u32(self.new_version);
        buf.put_u64(self.size);
        buf.put_u32(self.crc);
        buf.put_i32(self.result_code);
        buf.put_u32(self.chunk_size);
        buf.put_u32(self.total_chunks);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < Self::WIRE_SIZE {
            anyhow::bail!("UpdateInfo payload too short");
        }
        let flags = InfoFlags::from_bits_truncate(payload.get_u8());
        Ok(Self {
            exists: flags.contains(InfoFlags::EXISTS),
            is_new: flags.contains(InfoFlags::IS_NEW),
            new_version: payload.get_u32(),
            size: payload.get_u64(),
            crc: payload.get_u32(),
            result_code: payload.get_i32(),
            chunk_size: payload.get_u32(),
            total_chunks: payload.get_u32(),
        })
    }
}

// =============================================================================
// START_TRANSFER (0x04)
// =============================================================================

#[derive(Debug, Clone)]
pub struct StartTransfer {
    pub name: String,
}

impl StartTransfer {
    pub fn encode(&self) -> Bytes {
        let name = truncate_str(&self.name);
        let payload_len = 2 + name.len();
        let mut buf = BytesMut::with_capacity(5 + payload_len);
        buf.put_u32(payload_len as u32);
        buf.put_u8(MessageType::StartTransfer as u8);
        put_string(&mut buf, name);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let name = get_string(&mut payload, "StartTransfer name")?;
        Ok(Self { name })
    }
}

// =============================================================================
// TRANSFER_REPLY (0x05)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferReply {
    pub accepted: bool,
}

impl TransferReply {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(5 + 1);
        buf.put_u32(1);
        buf.put_u8(MessageType::TransferReply as u8);
        buf.put_u8(self.accepted as u8);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 1 {
            anyhow::bail!("TransferReply payload too short");
        }
        Ok(Self {
            accepted: payload.get_u8() != 0,
        })
    }
}

// =============================================================================
// CHUNK (0x06)
// =============================================================================

impl Chunk {
    pub fn encode(&self) -> Bytes {
        let mut flags = ChunkFlags::empty();
        if self.is_last {
            flags |= ChunkFlags::LAST;
        }

        let payload_len = 4 + 1 + 4 + self.payload.len();
        let mut buf = BytesMut::with_capacity(5 + payload_len);
        buf.put_u32(payload_len as u32);
        buf.put_u8(MessageType::Chunk as u8);
        buf.put_u32(self.index);
        buf.put_u8(flags.bits());
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 9 {
            anyhow::bail!("Chunk payload too short");
        }
        let index = payload.get_u32();
        let flags = ChunkFlags::from_bits_truncate(payload.get_u8());
        let len = payload.get_u32() as usize;
        if payload.remaining() < len {
            anyhow::bail!(
                "Chunk {} data truncated: expected {} bytes, got {}",
                index,
                len,
                payload.remaining()
            );
        }
        Ok(Self {
            index,
            payload: payload.copy_to_bytes(len),
            is_last: flags.contains(ChunkFlags::LAST),
        })
    }
}

// =============================================================================
// ABORTED (0x07) / FATAL (0x08)
// =============================================================================

/// Terminal event: the server gave up on an accepted transfer.
#[derive(Debug, Clone)]
pub struct Aborted {
    pub code: u16,
    pub reason: String,
}

impl Aborted {
    pub fn encode(&self) -> Bytes {
        encode_coded(MessageType::Aborted, self.code, &self.reason)
    }

    pub fn decode(payload: Bytes) -> Result<Self> {
        let (code, reason) = decode_coded(payload, "Aborted")?;
        Ok(Self { code, reason })
    }
}

/// Connection-level failure; the server closes after sending it.
#[derive(Debug, Clone)]
pub struct Fatal {
    pub code: u16,
    pub message: String,
}

impl Fatal {
    pub fn encode(&self) -> Bytes {
        encode_coded(MessageType::Fatal, self.code, &self.message)
    }

    pub fn decode(payload: Bytes) -> Result<Self> {
        let (code, message) = decode_coded(payload, "Fatal")?;
        Ok(Self { code, message })
    }
}

fn encode_coded(msg_type: MessageType, code: u16, text: &str) -> Bytes {
    let text = truncate_str(text);
    let payload_len = 2 + 2 + text.len();
    let mut buf = BytesMut::with_capacity(5 + payload_len);
    buf.put_u32(payload_len as u32);
    buf.put_u8(msg_type as u8);
    buf.put_u16(code);
    put_string(&mut buf, text);
    buf.freeze()
}

fn decode_coded(mut payload: Bytes, what: &str) -> Result<(u16, String)> {
    if payload.remaining() < 2 {
        anyhow::bail!("{} payload too short", what);
    }
    let code = payload.get_u16();
    let text = get_string(&mut payload, what)?;
    Ok((code, text))
}

// =============================================================================
// Frame reading/writing
// =============================================================================

/// Maximum frame size (64MB) - prevents OOM from malicious/corrupted frames
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Read a single frame from the stream.
/// Returns (message_type, payload).
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<(MessageType, Bytes)> {
    let len = r.read_u32().await.context("Failed to read frame length")?;
    read_frame_body(r, len).await
}

/// Like [`read_frame`], but a clean end-of-stream before a new frame yields `None`.
pub async fn try_read_frame<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<Option<(MessageType, Bytes)>> {
    let mut len_buf = [0u8; 4];
    let n = r
        .read(&mut len_buf[..1])
        .await
        .context("Failed to read frame length")?;
    if n == 0 {
        return Ok(None);
    }
    r.read_exact(&mut len_buf[1..])
        .await
        .context("Failed to read frame length")?;
    let len = u32::from_be_bytes(len_buf);
    read_frame_body(r, len).await.map(Some)
}

async fn read_frame_body<R: AsyncRead + Unpin>(
    r: &mut R,
    len: u32,
) -> Result<(MessageType, Bytes)> {
    // Validate frame size before allocation
    if len > MAX_FRAME_SIZE {
        anyhow::bail!(
            "Frame size {} exceeds maximum allowed size {}",
            len,
            MAX_FRAME_SIZE
        );
    }

    let msg_type = r.read_u8().await.context("Failed to read message type")?;
    let msg_type = MessageType::from_u8(msg_type).context("Unknown message type")?;

    let payload_len = len as usize;
    let mut payload = vec![0u8; payload_len];
    r.read_exact(&mut payload)
        .await
        .context("Failed to read frame payload")?;

    Ok((msg_type, Bytes::from(payload)))
}

/// Write a pre-encoded frame to the stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Bytes) -> Result<()> {
    w.write_all(frame).await.context("Failed to write frame")?;
    Ok(())
}

// =============================================================================
// Version Negotiation
// =============================================================================

/// Result of version negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionNegotiationResult {
    /// Version is supported
    Supported(u16),
    /// Version is too old (client needs upgrade)
    TooOld { client: u16, min_supported: u16 },
    /// Version is too new (server needs upgrade)
    TooNew { client: u16, max_supported: u16 },
}

/// Check if a client protocol version is supported.
pub fn negotiate_version(client_version: u16) -> VersionNegotiationResult {
    if client_version < PROTOCOL_VERSION_MIN {
        VersionNegotiationResult::TooOld {
            client: client_version,
            min_supported: PROTOCOL_VERSION_MIN,
        }
    } else if client_version > PROTOCOL_VERSION_MAX {
        VersionNegotiationResult::TooNew {
            client: client_version,
            max_supported: PROTOCOL_VERSION_MAX,
        }
    } else {
        VersionNegotiationResult::Supported(client_version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_roundtrip() {
        let hello = Hello::new("slotswap-client/0.1.0");
        let encoded = hello.encode();

        assert_eq!(encoded[4], MessageType::Hello as u8);
        let decoded = Hello::decode(encoded.slice(5..)).unwrap();
        assert_eq!(decoded.version, PROTOCOL_VERSION);
        assert_eq!(decoded.agent, "slotswap-client/0.1.0");
    }

    #[test]
    fn test_update_info_roundtrip() {
        let info = UpdateInfo {
            exists: true,
            is_new: true,
            new_version: 7,
            size: 10 * 1024 * 1024,
            crc: 0xdead_beef,
            result_code: 0,
            chunk_size: 65536,
            total_chunks: 160,
        };
        let encoded = info.encode();
        let decoded = UpdateInfo::decode(encoded.slice(5..)).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn test_negative_result_code_survives_wire() {
        let info = UpdateInfo::failed(crate::metadata::ResultCode::VersionUnavailable, true);
        let decoded = UpdateInfo::decode(info.encode().slice(5..)).unwrap();
        assert_eq!(decoded.result_code, -12);
        assert!(decoded.exists);
    }

    #[test]
    fn test_chunk_last_flag() {
        let chunk = Chunk {
            index: 41,
            payload: Bytes::from_static(b"tail"),
            is_last: true,
        };
        let encoded = chunk.encode();
        assert_eq!(encoded[4], MessageType::Chunk as u8);
        assert_eq!(encoded[9], ChunkFlags::LAST.bits());

        let decoded = Chunk::decode(encoded.slice(5..)).unwrap();
        assert_eq!(decoded, chunk);
    }

    #[test]
    fn test_chunk_truncated_data_rejected() {
        let chunk = Chunk {
            index: 0,
            payload: Bytes::from_static(b"abcdef"),
            is_last: false,
        };
        let encoded = chunk.encode();
        let err = Chunk::decode(encoded.slice(5..encoded.len() - 2)).unwrap_err();
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn test_aborted_roundtrip() {
        let aborted = Aborted {
            code: ErrorCode::SourceChanged as u16,
            reason: "image shrank".to_string(),
        };
        let decoded = Aborted::decode(aborted.encode().slice(5..)).unwrap();
        assert_eq!(decoded.code, 3);
        assert_eq!(decoded.reason, "image shrank");
    }

    #[test]
    fn test_message_type_from_u8() {
        assert_eq!(MessageType::from_u8(0x06), Some(MessageType::Chunk));
        assert_eq!(MessageType::from_u8(0x00), None);
        assert_eq!(MessageType::from_u8(0x09), None);
    }

    #[tokio::test]
    async fn test_frame_io() {
        let mut wire = Vec::new();
        write_frame(&mut wire, &RequestUpdate { current_version: 5 }.encode())
            .await
            .unwrap();
        write_frame(&mut wire, &TransferReply { accepted: true }.encode())
            .await
            .unwrap();

        let mut r = &wire[..];
        let (t, p) = try_read_frame(&mut r).await.unwrap().unwrap();
        assert_eq!(t, MessageType::RequestUpdate);
        assert_eq!(RequestUpdate::decode(p).unwrap().current_version, 5);

        let (t, p) = read_frame(&mut r).await.unwrap();
        assert_eq!(t, MessageType::TransferReply);
        assert!(TransferReply::decode(p).unwrap().accepted);

        assert!(try_read_frame(&mut r).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&(MAX_FRAME_SIZE + 1).to_be_bytes());
        wire.push(MessageType::Chunk as u8);

        let mut r = &wire[..];
        let err = read_frame(&mut r).await.unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_version_negotiation() {
        assert_eq!(
            negotiate_version(PROTOCOL_VERSION),
            VersionNegotiationResult::Supported(PROTOCOL_VERSION)
        );
        assert_eq!(
            negotiate_version(0),
            VersionNegotiationResult::TooOld {
                client: 0,
                min_supported: PROTOCOL_VERSION_MIN
            }
        );
        assert_eq!(
            negotiate_version(PROTOCOL_VERSION_MAX + 1),
            VersionNegotiationResult::TooNew {
                client: PROTOCOL_VERSION_MAX + 1,
                max_supported: PROTOCOL_VERSION_MAX
            }
        );
    }
}
