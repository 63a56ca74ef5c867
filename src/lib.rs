//! slotswap - A/B slot OTA updates.
//!
//! An update server offers a filesystem image; a device client checks
//! whether it is newer than what it runs and downloads it in ordered
//! chunks; `ota-apply` writes it into the inactive slot and switches the
//! boot configuration with a single atomic rename.

pub mod apply;
pub mod bootconf;
pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod metadata;
pub mod server;
pub mod slot;
pub mod streaming;
pub mod temp_file;
pub mod transport;
pub mod version_file;

pub use error::{ApplyError, ClientError, ConfigError, MarkerError, TransferError};
