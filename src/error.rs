use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failure reading a small persisted `u32` marker (version or CRC file).
#[derive(Error, Debug)]
pub enum MarkerError {
    #[error("marker file {0} does not exist")]
    Missing(PathBuf),

    #[error("marker file {0} is empty")]
    Empty(PathBuf),

    #[error("marker file {path} has invalid value {value:?}")]
    Invalid { path: PathBuf, value: String },

    #[error("I/O error on marker file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("unknown slot layout {0:?} (expected \"board\" or \"qemu\")")]
    UnknownLayout(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Errors that fail a client-side transfer session.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("chunk {got} received out of order (expected {expected})")]
    OutOfOrder { expected: u32, got: u32 },

    #[error("chunk {index} arrived after the transfer completed")]
    AlreadyComplete { index: u32 },

    #[error("chunk {index} last-marker mismatch: announced {total_chunks} chunks")]
    LastMismatch { index: u32, total_chunks: u32 },

    #[error("chunk {index} carries {len} bytes, expected {expected}")]
    ChunkSize { index: u32, len: usize, expected: usize },

    #[error("chunk {index} overflows announced size {size}")]
    Overflow { index: u32, size: u64 },

    #[error("received {received} bytes, announced {expected}")]
    SizeMismatch { expected: u64, received: u64 },

    #[error("CRC mismatch: expected {expected:08x}, got {actual:08x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("transfer aborted by server: {0}")]
    Aborted(String),

    #[error("no chunk received within {0:?}")]
    Timeout(std::time::Duration),

    #[error("event stream closed before the last chunk")]
    StreamClosed,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("could not connect to {addr} after {attempts} attempts: {source}")]
    ConnectTimeout {
        addr: String,
        attempts: u32,
        #[source]
        source: io::Error,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("server error {code}: {message}")]
    Fatal { code: u16, message: String },

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Marker(#[from] MarkerError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<anyhow::Error> for ClientError {
    fn from(err: anyhow::Error) -> Self {
        ClientError::Protocol(format!("{:#}", err))
    }
}

/// Fatal OTA application failures. Each maps to a distinct process exit code.
#[derive(Error, Debug)]
pub enum ApplyError {
    #[error("ota-apply must run as root")]
    NotPrivileged,

    #[error("another ota-apply instance holds {0}")]
    AlreadyRunning(PathBuf),

    #[error("cannot determine active slot from kernel command line")]
    SlotUndetected,

    #[error("image is {image} bytes but target partition holds only {target} bytes")]
    ImageTooLarge { image: u64, target: u64 },

    #[error("update image is not a regular file: {0}")]
    NotRegularFile(PathBuf),

    #[error("image changed during write: expected {expected} bytes, read {read}")]
    ImageChanged { expected: u64, read: u64 },

    #[error("boot config {path} does not contain root=PARTLABEL={label_a} or root=PARTLABEL={label_b}")]
    BootConfigToken {
        path: PathBuf,
        label_a: String,
        label_b: String,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Marker(#[from] MarkerError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("pending version record {path} is corrupt: {source}")]
    PendingRecord {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl ApplyError {
    pub const EXIT_NOT_PRIVILEGED: u8 = 10;
    pub const EXIT_SLOT_UNDETECTED: u8 = 20;
    pub const EXIT_IMAGE_TOO_LARGE: u8 = 30;
    pub const EXIT_FATAL: u8 = 50;

    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        ApplyError::Io {
            context: context.into(),
            source,
        }
    }

    /// Process exit status for this failure class.
    pub fn exit_code(&self) -> u8 {
        match self {
            ApplyError::NotPrivileged => Self::EXIT_NOT_PRIVILEGED,
            ApplyError::SlotUndetected => Self::EXIT_SLOT_UNDETECTED,
            ApplyError::ImageTooLarge { .. } => Self::EXIT_IMAGE_TOO_LARGE,
            _ => Self::EXIT_FATAL,
        }
    }
}
