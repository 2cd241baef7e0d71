//! SFTP error types

use serde::Serialize;

use crate::ssh::SshError;

/// Errors surfaced by sessions, transfers and the engine
#[derive(Debug, thiserror::Error)]
pub enum SftpError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Network error: {0}")]
    Network(String),

    /// The server presented a key other than the pinned one
    #[error("Host key verification failed: {0}")]
    HostKeyMismatch(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Not connected")]
    NotConnected,

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transfer cancelled")]
    Cancelled,
}

impl SftpError {
    /// Whether the caller has to establish a new session before retrying
    pub fn requires_reconnect(&self) -> bool {
        matches!(
            self,
            SftpError::Auth(_)
                | SftpError::Network(_)
                | SftpError::Timeout(_)
                | SftpError::ConnectionLost(_)
        )
    }

    /// Whether the error leaves the transport unusable
    pub(crate) fn is_fatal(&self) -> bool {
        matches!(
            self,
            SftpError::Network(_) | SftpError::Timeout(_) | SftpError::ConnectionLost(_)
        )
    }

    /// Map a russh-sftp error onto the taxonomy
    pub(crate) fn from_remote(err: impl std::fmt::Display, path: &str) -> Self {
        let err_str = err.to_string();
        if err_str.contains("No such file") || err_str.contains("not found") {
            SftpError::NotFound(path.to_string())
        } else if err_str.contains("Permission denied") {
            SftpError::PermissionDenied(path.to_string())
        } else if err_str.contains("already exists") || err_str.contains("File exists") {
            SftpError::AlreadyExists(path.to_string())
        } else if err_str.contains("not empty") {
            SftpError::DirectoryNotEmpty(path.to_string())
        } else if err_str.contains("Connection")
            || err_str.contains("channel")
            || err_str.contains("closed")
            || err_str.contains("Timeout")
        {
            SftpError::ConnectionLost(err_str)
        } else {
            SftpError::Protocol(err_str)
        }
    }
}

impl From<SshError> for SftpError {
    fn from(err: SshError) -> Self {
        match err {
            SshError::AuthenticationFailed(msg) | SshError::KeyError(msg) => SftpError::Auth(msg),
            SshError::Timeout(msg) => SftpError::Timeout(msg),
            SshError::HostKeyMismatch { .. } => SftpError::HostKeyMismatch(err.to_string()),
            SshError::ConnectionFailed(_) | SshError::ProtocolError(_) => {
                SftpError::Network(err.to_string())
            }
        }
    }
}

// Serialize as the display string for the presentation layer
impl Serialize for SftpError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
