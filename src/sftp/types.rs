//! SFTP data types

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default chunk size for file transfers (64 KB)
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Suffix of in-flight destination files
pub const PART_SUFFIX: &str = ".ferry-part";

/// Suffix an existing remote destination is moved to while it is replaced
pub const BACKUP_SUFFIX: &str = ".ferry-old";

/// Window over which transfer rate is measured
pub const RATE_WINDOW: Duration = Duration::from_secs(2);

/// Identifier of a transfer task (uuid v4)
pub type TaskId = String;

/// File entry information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    /// File name (not full path)
    pub name: String,
    /// Full path
    pub path: String,
    pub is_dir: bool,
    /// The entry itself is a symbolic link; `is_dir` then describes the link
    #[serde(default)]
    pub is_symlink: bool,
    /// Size in bytes, when the server reports it
    pub size: Option<u64>,
    pub modified: Option<DateTime<Utc>>,
    /// Permission bits (`st_mode & 0o7777`)
    pub permissions: u32,
}

impl FileEntry {
    pub fn is_hidden(&self) -> bool {
        self.name.starts_with('.')
    }
}

/// Directories first, then case-insensitive name
pub fn sort_entries(entries: &mut [FileEntry]) {
    entries.sort_by(|a, b| {
        if a.is_dir != b.is_dir {
            return b.is_dir.cmp(&a.is_dir);
        }
        a.name.to_lowercase().cmp(&b.name.to_lowercase())
    });
}

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Upload,
    Download,
}

/// Transfer state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferState {
    /// Waiting in queue
    Queued,
    /// Currently transferring
    Running,
    Completed,
    Failed,
    /// Cancelled by user
    Cancelled,
}

impl TransferState {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Failed | TransferState::Cancelled
        )
    }
}

/// Transfer progress snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub id: TaskId,
    pub direction: TransferDirection,
    pub local_path: PathBuf,
    pub remote_path: String,
    pub state: TransferState,
    /// Total bytes, when known
    pub total_bytes: Option<u64>,
    pub transferred_bytes: u64,
    pub elapsed_ms: u64,
    /// Bytes/second over the trailing window
    pub rate_bytes_per_sec: Option<f64>,
    /// Estimated time remaining
    pub eta_ms: Option<u64>,
    /// Error message if failed
    pub error: Option<String>,
}

impl TransferProgress {
    /// Progress percentage (0-100), `None` when the total is unknown
    pub fn percentage(&self) -> Option<f64> {
        match self.total_bytes {
            None => None,
            Some(0) => Some(100.0),
            Some(total) => Some((self.transferred_bytes as f64 / total as f64) * 100.0),
        }
    }
}

/// Transfer request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    pub local_path: PathBuf,
    pub remote_path: String,
    pub direction: TransferDirection,
}

impl TransferRequest {
    pub fn upload(local_path: impl Into<PathBuf>, remote_path: impl Into<String>) -> Self {
        Self {
            local_path: local_path.into(),
            remote_path: remote_path.into(),
            direction: TransferDirection::Upload,
        }
    }

    pub fn download(remote_path: impl Into<String>, local_path: impl Into<PathBuf>) -> Self {
        Self {
            local_path: local_path.into(),
            remote_path: remote_path.into(),
            direction: TransferDirection::Download,
        }
    }
}

/// Human readable size: `0 B`, `512 B`, `1.5 KB`, `3.2 MB`, `1.0 GB`
pub fn format_size(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;

    let size = bytes as f64;
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if size < MB {
        format!("{:.1} KB", size / KB)
    } else if size < GB {
        format!("{:.1} MB", size / MB)
    } else {
        format!("{:.1} GB", size / GB)
    }
}

/// Human readable duration: `42s`, `3m 7s`, `2h 5m`
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}
