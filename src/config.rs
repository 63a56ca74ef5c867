//! Optional TOML configuration shared by the three binaries.
//!
//! ```toml
//! [slots]
//! layout = "qemu"            # or give both bindings:
//! # a = { device = "/dev/sda2", label = "rootfsA" }
//! # b = { device = "/dev/sda3", label = "rootfsB" }
//!
//! [transfer]
//! chunk_size = 65536
//! pacing_ms = 10
//! timeout_secs = 30
//!
//! [paths]
//! data_dir = "data/server"
//! client_dir = "data/client"
//! state_dir = "/var/lib/slotswap"
//! cmdline = "/proc/cmdline"
//! bootconf = "/boot/extlinux/extlinux.conf"
//! ```
//!
//! Every key is optional. Command-line flags override the file.

use crate::apply::host::PROC_CMDLINE;
use crate::apply::DEFAULT_STATE_DIR;
use crate::bootconf::DEFAULT_BOOTCONF;
use crate::error::ConfigError;
use crate::slot::{SlotBinding, SlotLayout};
use crate::streaming::chunk::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming a config file
pub const CONFIG_ENV: &str = "SLOTSWAP_CONFIG";

/// System-wide config location
pub const SYSTEM_CONFIG: &str = "/etc/slotswap.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub slots: SlotsConfig,
    pub transfer: TransferConfig,
    pub paths: PathsConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SlotsConfig {
    /// Built-in layout name: "board" or "qemu"
    pub layout: Option<String>,
    pub a: Option<SlotBinding>,
    pub b: Option<SlotBinding>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransferConfig {
    pub chunk_size: u32,
    pub pacing_ms: u64,
    pub timeout_secs: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            pacing_ms: 10,
            timeout_secs: 30,
        }
    }
}

impl TransferConfig {
    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    /// Server: directory holding rootfs.ext4 / update.version / update.crc
    pub data_dir: PathBuf,
    /// Client: directory holding update.version and downloads
    pub client_dir: PathBuf,
    /// Applier: lock file and pending version record
    pub state_dir: PathBuf,
    pub cmdline: PathBuf,
    pub bootconf: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/server"),
            client_dir: PathBuf::from("data/client"),
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            cmdline: PathBuf::from(PROC_CMDLINE),
            bootconf: PathBuf::from(DEFAULT_BOOTCONF),
        }
    }
}

impl Config {
    /// Load configuration.
    ///
    /// An explicit path, or one named by `SLOTSWAP_CONFIG`, must exist.
    /// Otherwise `/etc/slotswap.toml` and then the user config dir are
    /// tried, and built-in defaults apply when neither exists.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|v| !v.is_empty()) {
            return Self::from_file(Path::new(&path));
        }

        let candidates = std::iter::once(PathBuf::from(SYSTEM_CONFIG))
            .chain(dirs::config_dir().map(|d| d.join("slotswap").join("slotswap.toml")));
        for path in candidates {
            if path.is_file() {
                return Self::from_file(&path);
            }
        }

        tracing::debug!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let chunk_size = self.transfer.chunk_size;
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::Invalid(format!(
                "transfer.chunk_size must be in 1..={}, got {}",
                MAX_CHUNK_SIZE, chunk_size
            )));
        }
        if self.transfer.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "transfer.timeout_secs must be positive".to_string(),
            ));
        }
        self.slots.resolve(None).map(|_| ())
    }
}

impl SlotsConfig {
    /// Slot layout, with `layout_override` (from the command line) winning.
    ///
    /// Explicit bindings take precedence over a named layout in the file.
    /// With nothing configured the board layout applies.
    pub fn resolve(&self, layout_override: Option<&str>) -> Result<SlotLayout, ConfigError> {
        if let Some(name) = layout_override {
            return SlotLayout::named(name).ok_or_else(|| ConfigError::UnknownLayout(name.into()));
        }
        match (&self.a, &self.b) {
            (Some(a), Some(b)) => {
                if a.label == b.label || a.device == b.device {
                    return Err(ConfigError::Invalid(
                        "slots.a and slots.b must differ in device and label".to_string(),
                    ));
                }
                Ok(SlotLayout {
                    a: a.clone(),
                    b: b.clone(),
                })
            }
            (None, None) => {
                let name = self.layout.as_deref().unwrap_or("board");
                SlotLayout::named(name).ok_or_else(|| ConfigError::UnknownLayout(name.into()))
            }
            _ => Err(ConfigError::Invalid(
                "slots.a and slots.b must be given together".to_string(),
            )),
        }
    }
}
