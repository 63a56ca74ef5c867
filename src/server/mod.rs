//! Update server.
//!
//! Serves the two RPCs over one framed connection per client:
//! `RequestUpdate` answers from the data directory, `StartTransfer` replies
//! immediately and streams chunks from a detached sender task.

use crate::metadata::{UpdateInfo, UpdateSource};
use crate::streaming::channel::{event_channel, EventSender, OUTBOUND_CHANNEL_SIZE};
use crate::streaming::protocol::{
    self as wire, negotiate_version, ErrorCode, MessageType, VersionNegotiationResult,
};
use crate::streaming::sender::{Sender, SenderConfig};
use crate::version_file::read_optional_marker;
use anyhow::{Context, Result};
use bytes::Bytes;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

const SERVER_AGENT: &str = concat!("slotswap-server/", env!("CARGO_PKG_VERSION"));

/// Update service state shared by all connections
pub struct UpdateService {
    source: UpdateSource,
    sender: SenderConfig,
}

impl UpdateService {
    pub fn new(source: UpdateSource, sender: SenderConfig) -> Self {
        Self { source, sender }
    }

    pub fn source(&self) -> &UpdateSource {
        &self.source
    }

    pub fn request_update(&self, current_version: u32) -> UpdateInfo {
        self.source
            .request_update(current_version, self.sender.chunk_size)
    }

    /// Start streaming the configured image to `tx`.
    ///
    /// Returns as soon as the sender task is spawned. `name` is only logged;
    /// the served image is always the configured one.
    pub fn start_transfer(&self, name: &str, tx: EventSender) -> bool {
        let size = match self.source.image_size() {
            Some(size) => size,
            None => {
                tracing::warn!(
                    "startTransfer({}): no image at {}",
                    name,
                    self.source.image.display()
                );
                return false;
            }
        };

        let sender = Sender::new(self.sender.clone());
        let crc = read_optional_marker(&self.source.crc_file);
        let manifest = match sender.manifest(size, crc) {
            Some(m) => m,
            None => {
                tracing::warn!("startTransfer({}): {} bytes cannot be chunked", name, size);
                return false;
            }
        };

        tracing::info!("startTransfer({}): {} chunks", name, manifest.total_chunks);
        sender.spawn(self.source.image.clone(), manifest, tx);
        true
    }

    /// Serve one client connection until it closes.
    pub async fn serve_connection<R, W>(self: Arc<Self>, mut reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (out_tx, out_rx) = mpsc::channel::<Bytes>(OUTBOUND_CHANNEL_SIZE);
        let writer_handle = tokio::spawn(write_outbound(writer, out_rx));

        let result = self.dispatch(&mut reader, &out_tx).await;

        drop(out_tx);
        let written = writer_handle.await.context("Writer task panicked")?;
        result.and(written)
    }

    async fn dispatch<R>(&self, reader: &mut R, out: &mpsc::Sender<Bytes>) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        let (msg_type, payload) = wire::read_frame(reader).await?;
        if msg_type != MessageType::Hello {
            return fatal(out, ErrorCode::Protocol, format!("Expected Hello, got {:?}", msg_type))
                .await;
        }
        let hello = wire::Hello::decode(payload)?;
        match negotiate_version(hello.version) {
            VersionNegotiationResult::Supported(_) => {}
            other => {
                return fatal(
                    out,
                    ErrorCode::VersionMismatch,
                    format!("Unsupported protocol version: {:?}", other),
                )
                .await;
            }
        }
        tracing::debug!("Client connected: {}", hello.agent);
        send(out, wire::Hello::new(SERVER_AGENT).encode()).await?;

        while let Some((msg_type, payload)) = wire::try_read_frame(reader).await? {
            match msg_type {
                MessageType::RequestUpdate => {
                    let req = wire::RequestUpdate::decode(payload)?;
                    let info = self.request_update(req.current_version);
                    send(out, info.encode()).await?;
                }
                MessageType::StartTransfer => {
                    let req = wire::StartTransfer::decode(payload)?;
                    let (tx, mut rx) = event_channel();
                    let accepted = self.start_transfer(&req.name, tx);

                    // Reply goes out before any chunk frame
                    send(out, wire::TransferReply { accepted }.encode()).await?;

                    if accepted {
                        let out = out.clone();
                        tokio::spawn(async move {
                            while let Some(event) = rx.recv().await {
                                let terminal = event.is_terminal();
                                if out.send(event.encode()).await.is_err() || terminal {
                                    break;
                                }
                            }
                        });
                    }
                }
                other => {
                    return fatal(out, ErrorCode::Protocol, format!("Unexpected {:?}", other))
                        .await;
                }
            }
        }

        tracing::debug!("Client {} disconnected", hello.agent);
        Ok(())
    }
}

async fn write_outbound<W>(mut writer: W, mut rx: mpsc::Receiver<Bytes>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        wire::write_frame(&mut writer, &frame).await?;
        writer.flush().await?;
    }
    writer.shutdown().await.ok();
    Ok(())
}

async fn send(out: &mpsc::Sender<Bytes>, frame: Bytes) -> Result<()> {
    out.send(frame)
        .await
        .map_err(|_| anyhow::anyhow!("Connection writer closed"))
}

async fn fatal(out: &mpsc::Sender<Bytes>, code: ErrorCode, message: String) -> Result<()> {
    tracing::warn!("Closing connection: {}", message);
    send(
        out,
        wire::Fatal {
            code: code as u16,
            message,
        }
        .encode(),
    )
    .await
}

/// Accept connections forever, one task per client.
pub async fn serve(listener: TcpListener, service: Arc<UpdateService>) -> Result<()> {
    tracing::info!("Listening on {}", listener.local_addr()?);
    loop {
        let (stream, peer) = listener.accept().await.context("Accept failed")?;
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            let (reader, writer) = stream.into_split();
            if let Err(e) = service.serve_connection(reader, writer).await {
                tracing::warn!("Connection {} ended with error: {:#}", peer, e);
            }
        });
    }
}
