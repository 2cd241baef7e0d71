//! Configuration Types
//!
//! Persisted document shape. Every field carries a serde default so partial
//! or older files still load.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::sftp::history::TransferRecord;
use crate::sftp::types::DEFAULT_CHUNK_SIZE;

/// Root configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Saved connections, in insertion order
    #[serde(default)]
    pub connections: Vec<SavedConnection>,

    /// Name of the most recently used connection
    #[serde(default)]
    pub last_connection: Option<String>,

    /// Application settings
    #[serde(default)]
    pub settings: Settings,

    /// Transfer history, oldest first
    #[serde(default)]
    pub history: Vec<TransferRecord>,
}

/// Saved connection entry
///
/// Credentials are never written here; they are supplied at connect time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedConnection {
    pub name: String,
    pub ip: String,
    pub user: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Pinned host key fingerprint (`SHA256:...`), recorded on first connect
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_key: Option<String>,
}

/// Application settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_remote_path")]
    pub default_remote_path: String,

    #[serde(default = "default_true")]
    pub auto_save_connections: bool,

    #[serde(default)]
    pub show_hidden_files: bool,

    /// Per I/O call timeout in seconds
    #[serde(default = "default_transfer_timeout")]
    pub transfer_timeout: u64,

    /// Connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// Transfer chunk size in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Settings {
    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout.max(1))
    }

    /// Chunk size clamped to a sane range
    pub fn chunk_size(&self) -> usize {
        self.chunk_size.clamp(1024, 4 * 1024 * 1024)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_remote_path: default_remote_path(),
            auto_save_connections: true,
            show_hidden_files: false,
            transfer_timeout: default_transfer_timeout(),
            connect_timeout: default_connect_timeout(),
            chunk_size: default_chunk_size(),
        }
    }
}

fn default_port() -> u16 {
    22
}

fn default_true() -> bool {
    true
}

fn default_remote_path() -> String {
    "/".to_string()
}

fn default_transfer_timeout() -> u64 {
    300
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}
