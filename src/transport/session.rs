//! Client session - connects to `slotswap-server` and speaks the update protocol.
//!
//! One connection carries the request/reply RPCs and, after an accepted
//! `StartTransfer`, the chunk event stream.

use crate::error::{ClientError, TransferError};
use crate::metadata::UpdateInfo;
use crate::streaming::channel::{EventSource, TransferEvent};
use crate::streaming::protocol::{self as wire, MessageType};
use crate::streaming::chunk::Chunk;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

const CLIENT_AGENT: &str = concat!("slotswap-client/", env!("CARGO_PKG_VERSION"));

/// Bounded connect retry with exponential backoff
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

/// Client side of an update connection
pub struct UpdateClient<R, W> {
    reader: R,
    writer: W,
    server_agent: String,
}

impl UpdateClient<OwnedReadHalf, OwnedWriteHalf> {
    /// Connect over TCP, retrying per `retry`, then handshake.
    pub async fn connect(addr: &str, retry: &RetryPolicy) -> Result<Self, ClientError> {
        let attempts = retry.attempts.max(1);
        let mut attempt = 1;
        let stream = loop {
            match TcpStream::connect(addr).await {
                Ok(stream) => break stream,
                Err(e) if attempt >= attempts => {
                    return Err(ClientError::ConnectTimeout {
                        addr: addr.to_string(),
                        attempts,
                        source: e,
                    });
                }
                Err(e) => {
                    let delay = retry.delay_for(attempt);
                    tracing::info!(
                        "Update server {} not available ({}), retry {}/{} in {:?}",
                        addr,
                        e,
                        attempt,
                        attempts - 1,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        };
        stream.set_nodelay(true)?;

        let (reader, writer) = stream.into_split();
        Self::handshake(reader, writer).await
    }
}

impl<R, W> UpdateClient<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Exchange Hello frames over an established stream pair.
    pub async fn handshake(reader: R, writer: W) -> Result<Self, ClientError> {
        let mut client = Self {
            reader,
            writer,
            server_agent: String::new(),
        };
        client.send(wire::Hello::new(CLIENT_AGENT).encode()).await?;
        let hello = wire::Hello::decode(client.expect(MessageType::Hello).await?)?;
        tracing::debug!("Connected to {} (protocol {})", hello.agent, hello.version);
        client.server_agent = hello.agent;
        Ok(client)
    }

    pub fn server_agent(&self) -> &str {
        &self.server_agent
    }

    /// Ask whether an image newer than `current_version` exists.
    pub async fn request_update(&mut self, current_version: u32) -> Result<UpdateInfo, ClientError> {
        self.send(wire::RequestUpdate { current_version }.encode())
            .await?;
        let payload = self.expect(MessageType::UpdateInfo).await?;
        Ok(UpdateInfo::decode(payload)?)
    }

    /// Ask the server to start streaming. Chunks follow on this connection.
    pub async fn start_transfer(&mut self, name: &str) -> Result<bool, ClientError> {
        self.send(
            wire::StartTransfer {
                name: name.to_string(),
            }
            .encode(),
        )
        .await?;
        let payload = self.expect(MessageType::TransferReply).await?;
        Ok(wire::TransferReply::decode(payload)?.accepted)
    }

    async fn send(&mut self, frame: Bytes) -> Result<(), ClientError> {
        wire::write_frame(&mut self.writer, &frame).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn expect(&mut self, want: MessageType) -> Result<Bytes, ClientError> {
        let (msg_type, payload) = wire::read_frame(&mut self.reader).await?;
        if msg_type == want {
            return Ok(payload);
        }
        if msg_type == MessageType::Fatal {
            let fatal = wire::Fatal::decode(payload)?;
            return Err(ClientError::Fatal {
                code: fatal.code,
                message: fatal.message,
            });
        }
        Err(ClientError::Protocol(format!(
            "Expected {:?}, got {:?}",
            want, msg_type
        )))
    }
}

#[async_trait]
impl<R, W> EventSource for UpdateClient<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn next_event(&mut self) -> Result<Option<TransferEvent>, TransferError> {
        let frame = wire::try_read_frame(&mut self.reader)
            .await
            .map_err(|e| TransferError::Protocol(format!("{:#}", e)))?;
        let Some((msg_type, payload)) = frame else {
            return Ok(None);
        };

        let event = match msg_type {
            MessageType::Chunk => Chunk::decode(payload).map(TransferEvent::Chunk),
            MessageType::Aborted => wire::Aborted::decode(payload).map(|a| TransferEvent::Aborted {
                code: a.code,
                reason: a.reason,
            }),
            MessageType::Fatal => {
                let message = wire::Fatal::decode(payload)
                    .map(|f| f.message)
                    .unwrap_or_else(|e| format!("{:#}", e));
                return Err(TransferError::Protocol(format!("server fatal: {}", message)));
            }
            other => {
                return Err(TransferError::Protocol(format!(
                    "Unexpected {:?} during transfer",
                    other
                )))
            }
        };
        event
            .map(Some)
            .map_err(|e| TransferError::Protocol(format!("{:#}", e)))
    }
}
