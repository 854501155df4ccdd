//! TOML-based configuration for a session.
//!
//! # What is stored? (for beginners)
//!
//! Everything `Ncl::init` and the transport need that an application would
//! rather not hard-code:
//!
//! ```toml
//! [session]
//! name = "door-lock"
//! mode = "asynchronous"
//! dev = false
//! log_level = "info"
//!
//! [ecodaemon]
//! host = "127.0.0.1"
//! port = 9089
//!
//! [connection]
//! interval_min = 8
//! interval_max = 500
//! supervision_timeout = 300
//! latency = 10
//! ```
//!
//! Every field has a serde default, so a missing file or a partial file
//! still yields a usable configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::delivery::DeliveryMode;
use crate::application::transport::ConnectionParams;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level session configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NclConfig {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub ecodaemon: EndpointConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
}

/// Application identity and delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    /// Name announced to the bands (1 to 18 characters).
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub mode: DeliveryMode,
    /// Talk to development bands.
    #[serde(default)]
    pub dev: bool,
    /// `tracing` log level: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Where a daemon-backed transport connects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EndpointConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Connection parameter hints, in radio units.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ConnectionConfig {
    #[serde(default = "default_interval_min")]
    pub interval_min: u16,
    #[serde(default = "default_interval_max")]
    pub interval_max: u16,
    #[serde(default = "default_supervision_timeout")]
    pub supervision_timeout: u16,
    #[serde(default = "default_latency")]
    pub latency: u16,
}

impl ConnectionConfig {
    pub fn params(&self) -> ConnectionParams {
        ConnectionParams {
            interval_min: self.interval_min,
            interval_max: self.interval_max,
            supervision_timeout: self.supervision_timeout,
            latency: self.latency,
        }
    }
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_name() -> String {
    "ncl-app".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    9089
}
fn default_interval_min() -> u16 {
    ConnectionParams::default().interval_min
}
fn default_interval_max() -> u16 {
    ConnectionParams::default().interval_max
}
fn default_supervision_timeout() -> u16 {
    ConnectionParams::default().supervision_timeout
}
fn default_latency() -> u16 {
    ConnectionParams::default().latency
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            mode: DeliveryMode::default(),
            dev: false,
            log_level: default_log_level(),
        }
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            interval_min: default_interval_min(),
            interval_max: default_interval_max(),
            supervision_timeout: default_supervision_timeout(),
            latency: default_latency(),
        }
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Loads [`NclConfig`] from `path`, returning the defaults if the file does
/// not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: &Path) -> Result<NclConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(NclConfig::default()),
        Err(e) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Persists `config` to `path`, creating parent directories as needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(path: &Path, config: &NclConfig) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
