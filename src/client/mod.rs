//! Client update flow.
//!
//! Reads the local version, asks the server for something newer, and when
//! there is, downloads it. The version file is never written here: it only
//! moves once the image is activated and booted (see `apply::confirm`).

use crate::error::ClientError;
use crate::metadata::ResultCode;
use crate::streaming::pipeline::{receive_session, DEFAULT_IDLE_TIMEOUT};
use crate::streaming::receiver::{Receiver, ReceiverConfig};
use crate::transport::UpdateClient;
use crate::version_file::VersionFile;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

/// Name sent with `StartTransfer`
pub const DEFAULT_TRANSFER_NAME: &str = "rootfs.ext4";

/// Client update options
#[derive(Debug, Clone)]
pub struct UpdateOptions {
    /// Where the downloaded image lands
    pub output: PathBuf,
    pub transfer_name: String,
    /// Maximum silence between two chunks
    pub idle_timeout: Duration,
}

impl UpdateOptions {
    pub fn new(output: impl Into<PathBuf>) -> Self {
        Self {
            output: output.into(),
            transfer_name: DEFAULT_TRANSFER_NAME.to_string(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// How an update attempt ended
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// Server has no image
    NoUpdate,
    /// Server has an image but could not describe it
    Unavailable { result_code: i32 },
    /// Published version is not newer than ours
    UpToDate { current: u32, published: u32 },
    /// Server declined `StartTransfer`
    Rejected,
    /// New image downloaded and verified
    Downloaded {
        path: PathBuf,
        version: u32,
        bytes: u64,
    },
}

/// Run one update check and, if warranted, one download.
pub async fn run_update<R, W, F>(
    client: &mut UpdateClient<R, W>,
    version_file: &VersionFile,
    options: &UpdateOptions,
    on_progress: F,
) -> Result<UpdateOutcome, ClientError>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
    F: FnMut(f64),
{
    let current = version_file.read()?;
    tracing::info!("Current version: {}", current);

    let info = client.request_update(current).await?;
    if !info.exists {
        tracing::info!("No update image on server");
        return Ok(UpdateOutcome::NoUpdate);
    }
    if !info.is_success() {
        let reason = info
            .result()
            .map(|code| format!("{:?}", code))
            .unwrap_or_else(|| "unknown".to_string());
        tracing::warn!(
            "Server cannot describe its image: {} ({})",
            info.result_code,
            reason
        );
        return Ok(UpdateOutcome::Unavailable {
            result_code: info.result_code,
        });
    }
    if !info.is_new {
        tracing::info!(
            "Up to date (current {}, published {})",
            current,
            info.new_version
        );
        return Ok(UpdateOutcome::UpToDate {
            current,
            published: info.new_version,
        });
    }

    let manifest = info.manifest().ok_or_else(|| {
        ClientError::Protocol(format!(
            "inconsistent chunking: {} bytes / {} per chunk / {} chunks",
            info.size, info.chunk_size, info.total_chunks
        ))
    })?;
    tracing::info!(
        "Update {} -> {}: {} bytes in {} chunks",
        current,
        info.new_version,
        info.size,
        info.total_chunks
    );

    // Output must be writable before any chunk can arrive
    let receiver = Receiver::create(ReceiverConfig {
        output: options.output.clone(),
        manifest,
    })
    .await?;

    if !client.start_transfer(&options.transfer_name).await? {
        tracing::warn!("Server rejected transfer of {}", options.transfer_name);
        return Ok(UpdateOutcome::Rejected);
    }

    let received = receive_session(client, receiver, options.idle_timeout, on_progress).await?;
    Ok(UpdateOutcome::Downloaded {
        path: received.path,
        version: info.new_version,
        bytes: received.bytes,
    })
}

impl UpdateOutcome {
    /// One-line summary for the client binary.
    pub fn describe(&self) -> String {
        match self {
            UpdateOutcome::NoUpdate => "no update available".to_string(),
            UpdateOutcome::Unavailable { result_code } => {
                let name = ResultCode::from_i32(*result_code)
                    .map(|c| format!("{:?}", c))
                    .unwrap_or_else(|| "unknown".to_string());
                format!("update unavailable ({} {})", result_code, name)
            }
            UpdateOutcome::UpToDate { current, .. } => {
                format!("already up to date (version {})", current)
            }
            UpdateOutcome::Rejected => "server rejected the transfer".to_string(),
            UpdateOutcome::Downloaded {
                path,
                version,
                bytes,
            } => format!(
                "downloaded version {} ({} bytes) to {}",
                version,
                bytes,
                path.display()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe() {
        assert_eq!(UpdateOutcome::NoUpdate.describe(), "no update available");
        assert_eq!(
            UpdateOutcome::Unavailable { result_code: -12 }.describe(),
            "update unavailable (-12 VersionUnavailable)"
        );
        assert_eq!(
            UpdateOutcome::UpToDate {
                current: 5,
                published: 5
            }
            .describe(),
            "already up to date (version 5)"
        );
    }
}
