//! Remote filesystem transport
//!
//! [`RemoteFs`] is the seam between the session owner task and the wire.
//! The production implementation opens the `sftp` subsystem on a russh
//! connection; tests plug in an in-memory filesystem.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use russh::client::Handle;
use russh_sftp::client::fs::{File as SftpFile, Metadata};
use russh_sftp::client::SftpSession as RusshSftpSession;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use super::error::SftpError;
use super::path_utils::{join_remote_path, remote_file_name};
use super::types::FileEntry;
use crate::config::ConnectionProfile;
use crate::ssh::{ClientHandler, SshClient, SshConnection};

/// Sequential read side of a remote file
#[async_trait]
pub trait RemoteReader: Send {
    /// Read up to `buf.len()` bytes; `Ok(0)` is end of file
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, SftpError>;
}

/// Sequential write side of a remote file
#[async_trait]
pub trait RemoteWriter: Send {
    async fn write_all(&mut self, data: &[u8]) -> Result<(), SftpError>;

    /// Flush and release the remote handle
    async fn finish(&mut self) -> Result<(), SftpError>;
}

/// Remote filesystem operations, driven by exactly one owner task
#[async_trait]
pub trait RemoteFs: Send {
    /// Entries of `path`, excluding `.` and `..`
    async fn list_dir(&mut self, path: &str) -> Result<Vec<FileEntry>, SftpError>;
    /// Follows symbolic links
    async fn stat(&mut self, path: &str) -> Result<FileEntry, SftpError>;
    /// Describes the link itself when `path` is a symbolic link
    async fn lstat(&mut self, path: &str) -> Result<FileEntry, SftpError>;
    async fn mkdir(&mut self, path: &str) -> Result<(), SftpError>;
    async fn rename(&mut self, from: &str, to: &str) -> Result<(), SftpError>;
    async fn remove_file(&mut self, path: &str) -> Result<(), SftpError>;
    /// Remove an empty directory
    async fn remove_dir(&mut self, path: &str) -> Result<(), SftpError>;
    async fn open_read(&mut self, path: &str) -> Result<Box<dyn RemoteReader>, SftpError>;
    /// Create or truncate `path` for writing
    async fn open_write(&mut self, path: &str) -> Result<Box<dyn RemoteWriter>, SftpError>;
    async fn close(&mut self) -> Result<(), SftpError>;

    /// Fingerprint of the server key the transport was opened with
    fn host_key(&self) -> Option<String> {
        None
    }
}

/// Establishes authenticated transports
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        profile: &ConnectionProfile,
        timeout: Duration,
    ) -> Result<Box<dyn RemoteFs>, SftpError>;
}

/// SSH + SFTP connector backed by russh
#[derive(Debug, Default, Clone)]
pub struct SshConnector;

#[async_trait]
impl Connector for SshConnector {
    async fn connect(
        &self,
        profile: &ConnectionProfile,
        timeout: Duration,
    ) -> Result<Box<dyn RemoteFs>, SftpError> {
        let config = profile
            .ssh_config(timeout.as_secs().max(1))
            .ok_or_else(|| SftpError::Auth(format!("No credential for {}", profile.name)))?;

        let connection = tokio::time::timeout(timeout, SshClient::new(config).connect())
            .await
            .map_err(|_| {
                SftpError::Timeout(format!("Connecting to {} timed out", profile.display_id()))
            })??;

        let fs = tokio::time::timeout(timeout, RusshRemoteFs::open(connection))
            .await
            .map_err(|_| SftpError::Timeout("Opening SFTP subsystem timed out".to_string()))??;

        Ok(Box::new(fs))
    }
}

/// SFTP over a russh connection
pub struct RusshRemoteFs {
    handle: Handle<ClientHandler>,
    sftp: RusshSftpSession,
    host_key: Option<String>,
}

impl RusshRemoteFs {
    /// Open the `sftp` subsystem on an authenticated connection
    pub async fn open(connection: SshConnection) -> Result<Self, SftpError> {
        info!("Opening SFTP subsystem");
        let SshConnection { handle, host_key } = connection;

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| SftpError::Network(format!("Failed to open channel: {}", e)))?;

        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| SftpError::Protocol(format!("Failed to request SFTP subsystem: {}", e)))?;

        let sftp = RusshSftpSession::new(channel.into_stream())
            .await
            .map_err(|e| SftpError::Protocol(e.to_string()))?;

        info!("SFTP subsystem opened");
        Ok(Self {
            handle,
            sftp,
            host_key,
        })
    }
}

fn to_entry(name: String, path: String, attrs: &Metadata) -> FileEntry {
    FileEntry {
        name,
        path,
        is_dir: attrs.is_dir(),
        is_symlink: attrs.is_symlink(),
        size: attrs.size,
        modified: attrs
            .mtime
            .and_then(|t| DateTime::<Utc>::from_timestamp(i64::from(t), 0)),
        permissions: attrs.permissions.map(|p| p & 0o7777).unwrap_or(0),
    }
}

#[async_trait]
impl RemoteFs for RusshRemoteFs {
    async fn list_dir(&mut self, path: &str) -> Result<Vec<FileEntry>, SftpError> {
        debug!("Listing directory: {}", path);

        let read_dir = self
            .sftp
            .read_dir(path)
            .await
            .map_err(|e| SftpError::from_remote(e, path))?;

        let entries = read_dir
            .filter_map(|entry| {
                let name = entry.file_name();
                if name == "." || name == ".." {
                    return None;
                }
                let full_path = join_remote_path(path, &name);
                Some(to_entry(name, full_path, &entry.metadata()))
            })
            .collect();

        Ok(entries)
    }

    async fn stat(&mut self, path: &str) -> Result<FileEntry, SftpError> {
        let attrs = self
            .sftp
            .metadata(path)
            .await
            .map_err(|e| SftpError::from_remote(e, path))?;

        Ok(to_entry(
            remote_file_name(path).to_string(),
            path.to_string(),
            &attrs,
        ))
    }

    async fn lstat(&mut self, path: &str) -> Result<FileEntry, SftpError> {
        let attrs = self
            .sftp
            .symlink_metadata(path)
            .await
            .map_err(|e| SftpError::from_remote(e, path))?;

        Ok(to_entry(
            remote_file_name(path).to_string(),
            path.to_string(),
            &attrs,
        ))
    }

    async fn mkdir(&mut self, path: &str) -> Result<(), SftpError> {
        self.sftp
            .create_dir(path)
            .await
            .map_err(|e| SftpError::from_remote(e, path))
    }

    async fn rename(&mut self, from: &str, to: &str) -> Result<(), SftpError> {
        self.sftp
            .rename(from, to)
            .await
            .map_err(|e| SftpError::from_remote(e, from))
    }

    async fn remove_file(&mut self, path: &str) -> Result<(), SftpError> {
        self.sftp
            .remove_file(path)
            .await
            .map_err(|e| SftpError::from_remote(e, path))
    }

    async fn remove_dir(&mut self, path: &str) -> Result<(), SftpError> {
        self.sftp
            .remove_dir(path)
            .await
            .map_err(|e| SftpError::from_remote(e, path))
    }

    async fn open_read(&mut self, path: &str) -> Result<Box<dyn RemoteReader>, SftpError> {
        let file = self
            .sftp
            .open(path)
            .await
            .map_err(|e| SftpError::from_remote(e, path))?;
        Ok(Box::new(RusshFile {
            file,
            path: path.to_string(),
        }))
    }

    async fn open_write(&mut self, path: &str) -> Result<Box<dyn RemoteWriter>, SftpError> {
        let file = self
            .sftp
            .create(path)
            .await
            .map_err(|e| SftpError::from_remote(e, path))?;
        Ok(Box::new(RusshFile {
            file,
            path: path.to_string(),
        }))
    }

    async fn close(&mut self) -> Result<(), SftpError> {
        let _ = self.sftp.close().await;
        self.handle
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await
            .map_err(|e| SftpError::Network(e.to_string()))
    }

    fn host_key(&self) -> Option<String> {
        self.host_key.clone()
    }
}

struct RusshFile {
    file: SftpFile,
    path: String,
}

#[async_trait]
impl RemoteReader for RusshFile {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, SftpError> {
        self.file
            .read(buf)
            .await
            .map_err(|e| SftpError::from_remote(e, &self.path))
    }
}

#[async_trait]
impl RemoteWriter for RusshFile {
    async fn write_all(&mut self, data: &[u8]) -> Result<(), SftpError> {
        self.file
            .write_all(data)
            .await
            .map_err(|e| SftpError::from_remote(e, &self.path))
    }

    async fn finish(&mut self) -> Result<(), SftpError> {
        self.file
            .flush()
            .await
            .map_err(|e| SftpError::from_remote(e, &self.path))?;
        self.file
            .shutdown()
            .await
            .map_err(|e| SftpError::from_remote(e, &self.path))
    }
}
