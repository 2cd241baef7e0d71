//! SFTP Session
//!
//! Implements the "single owner" pattern for one authenticated connection.
//!
//! # Architecture
//!
//! Only the owner task touches the [`RemoteFs`]. [`Session`] is a cheap
//! `Clone` controller that sends commands through an mpsc channel and waits
//! on a oneshot reply, so listings, chunk I/O and deletes never interleave
//! on the wire.
//!
//! Every transport call is bounded by the I/O timeout. A timeout or a lost
//! transport marks the session `Failed`; it never reconnects by itself.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use super::error::SftpError;
use super::transport::{Connector, RemoteFs, RemoteReader, RemoteWriter};
use super::types::FileEntry;
use crate::config::{ConnectionProfile, Settings};

/// Grace period for the orderly shutdown of the transport
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    /// Transport lost or timed out; a new session is required
    Failed,
}

type Reply<T> = oneshot::Sender<Result<T, SftpError>>;
type StreamId = u64;

/// Commands sent to the session owner task
enum SessionCommand {
    List {
        path: String,
        reply_tx: Reply<Vec<FileEntry>>,
    },
    Stat {
        path: String,
        reply_tx: Reply<FileEntry>,
    },
    Lstat {
        path: String,
        reply_tx: Reply<FileEntry>,
    },
    Mkdir {
        path: String,
        reply_tx: Reply<()>,
    },
    Rename {
        from: String,
        to: String,
        reply_tx: Reply<()>,
    },
    RemoveFile {
        path: String,
        reply_tx: Reply<()>,
    },
    RemoveDir {
        path: String,
        reply_tx: Reply<()>,
    },
    OpenRead {
        path: String,
        reply_tx: Reply<StreamId>,
    },
    OpenWrite {
        path: String,
        reply_tx: Reply<StreamId>,
    },
    /// Read until `max` bytes or end of file; an empty chunk means EOF
    ReadChunk {
        stream: StreamId,
        max: usize,
        reply_tx: Reply<Bytes>,
    },
    WriteChunk {
        stream: StreamId,
        data: Bytes,
        reply_tx: Reply<()>,
    },
    /// `reply_tx` is `None` when sent from a dropped stream handle
    CloseStream {
        stream: StreamId,
        reply_tx: Option<Reply<()>>,
    },
    Close {
        reply_tx: oneshot::Sender<()>,
    },
}

enum OpenStream {
    Read(Box<dyn RemoteReader>),
    Write(Box<dyn RemoteWriter>),
}

/// Controller for one authenticated SFTP connection
///
/// Clones share the same owner task. The transport is released on
/// [`Session::close`], on a fatal transport error, or when the last clone
/// (including open streams) is dropped.
#[derive(Clone)]
pub struct Session {
    cmd_tx: mpsc::Sender<SessionCommand>,
    state_rx: watch::Receiver<SessionState>,
    profile: Arc<ConnectionProfile>,
    host_key: Option<String>,
}

impl Session {
    /// Connect and authenticate, bounded by the connect timeout
    pub async fn connect(
        connector: &dyn Connector,
        profile: ConnectionProfile,
        settings: &Settings,
    ) -> Result<Self, SftpError> {
        info!("Connecting session {}", profile.display_id());

        let fs = match connector.connect(&profile, settings.connect_timeout()).await {
            Ok(fs) => fs,
            Err(e) => {
                warn!("Connect to {} failed: {}", profile.display_id(), e);
                return Err(e);
            }
        };

        info!("Session {} connected", profile.display_id());
        Ok(Self::spawn(fs, profile, settings.io_timeout()))
    }

    /// Hand `fs` to a new owner task
    pub(crate) fn spawn(
        fs: Box<dyn RemoteFs>,
        profile: ConnectionProfile,
        io_timeout: Duration,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (state_tx, state_rx) = watch::channel(SessionState::Connected);
        let host_key = fs.host_key();

        tokio::spawn(run_owner(
            fs,
            cmd_rx,
            state_tx,
            io_timeout,
            profile.display_id(),
        ));

        Self {
            cmd_tx,
            state_rx,
            profile: Arc::new(profile),
            host_key,
        }
    }

    pub fn profile(&self) -> &ConnectionProfile {
        &self.profile
    }

    /// Fingerprint of the server key, when the transport reports one
    pub fn host_key(&self) -> Option<&str> {
        self.host_key.as_deref()
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// Observe state transitions
    pub fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    fn unavailable(&self) -> SftpError {
        match self.state() {
            SessionState::Failed => {
                SftpError::ConnectionLost(format!("Session {} failed", self.profile.display_id()))
            }
            _ => SftpError::ConnectionClosed,
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> SessionCommand,
    ) -> Result<T, SftpError> {
        if !self.is_connected() {
            return Err(self.unavailable());
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(build(reply_tx))
            .await
            .map_err(|_| self.unavailable())?;
        reply_rx.await.map_err(|_| self.unavailable())?
    }

    /// Entries of `path` (not recursive)
    pub async fn list_directory(&self, path: &str) -> Result<Vec<FileEntry>, SftpError> {
        let path = path.to_string();
        self.request(|reply_tx| SessionCommand::List { path, reply_tx })
            .await
    }

    pub async fn stat(&self, path: &str) -> Result<FileEntry, SftpError> {
        let path = path.to_string();
        self.request(|reply_tx| SessionCommand::Stat { path, reply_tx })
            .await
    }

    /// Like [`Session::stat`], but a symbolic link describes itself
    pub async fn symlink_stat(&self, path: &str) -> Result<FileEntry, SftpError> {
        let path = path.to_string();
        self.request(|reply_tx| SessionCommand::Lstat { path, reply_tx })
            .await
    }

    pub async fn make_directory(&self, path: &str) -> Result<(), SftpError> {
        info!("Creating directory: {}", path);
        let path = path.to_string();
        self.request(|reply_tx| SessionCommand::Mkdir { path, reply_tx })
            .await
    }

    pub async fn rename(&self, old_path: &str, new_path: &str) -> Result<(), SftpError> {
        info!("Renaming {} to {}", old_path, new_path);
        let (from, to) = (old_path.to_string(), new_path.to_string());
        self.request(|reply_tx| SessionCommand::Rename { from, to, reply_tx })
            .await
    }

    /// Delete a file or directory
    ///
    /// A non-empty directory requires `recursive`, which removes the tree
    /// depth-first. Symbolic links are removed, never followed.
    pub async fn delete(&self, path: &str, recursive: bool) -> Result<(), SftpError> {
        info!("Deleting: {} (recursive: {})", path, recursive);
        let entry = self.symlink_stat(path).await?;

        if entry.is_symlink || !entry.is_dir {
            return self.remove_file(path).await;
        }

        if recursive {
            let deleted = self.delete_tree(path).await?;
            debug!("Deleted {} entries under {}", deleted, path);
            return Ok(());
        }

        if !self.list_directory(path).await?.is_empty() {
            return Err(SftpError::DirectoryNotEmpty(path.to_string()));
        }
        self.remove_dir(path).await
    }

    async fn delete_tree(&self, path: &str) -> Result<u64, SftpError> {
        let mut deleted = 0u64;

        for child in self.list_directory(path).await? {
            if child.is_dir && !child.is_symlink {
                // Boxed to avoid infinite future size
                deleted += Box::pin(self.delete_tree(&child.path)).await?;
            } else {
                self.remove_file(&child.path).await?;
                deleted += 1;
            }
        }

        self.remove_dir(path).await?;
        Ok(deleted + 1)
    }

    async fn remove_file(&self, path: &str) -> Result<(), SftpError> {
        let path = path.to_string();
        self.request(|reply_tx| SessionCommand::RemoveFile { path, reply_tx })
            .await
    }

    async fn remove_dir(&self, path: &str) -> Result<(), SftpError> {
        let path = path.to_string();
        self.request(|reply_tx| SessionCommand::RemoveDir { path, reply_tx })
            .await
    }

    pub async fn open_read_stream(&self, path: &str) -> Result<RemoteReadStream, SftpError> {
        let path = path.to_string();
        let id = self
            .request(|reply_tx| SessionCommand::OpenRead { path, reply_tx })
            .await?;
        Ok(RemoteReadStream {
            session: self.clone(),
            id,
            closed: false,
        })
    }

    /// Create or truncate `path` for writing
    pub async fn open_write_stream(&self, path: &str) -> Result<RemoteWriteStream, SftpError> {
        let path = path.to_string();
        let id = self
            .request(|reply_tx| SessionCommand::OpenWrite { path, reply_tx })
            .await?;
        Ok(RemoteWriteStream {
            session: self.clone(),
            id,
            closed: false,
        })
    }

    /// Close the session; every later call fails with `ConnectionClosed`
    pub async fn close(&self) {
        if !self.is_connected() {
            return;
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(SessionCommand::Close { reply_tx })
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }

    async fn close_stream(&self, stream: StreamId) -> Result<(), SftpError> {
        self.request(|reply_tx| SessionCommand::CloseStream {
            stream,
            reply_tx: Some(reply_tx),
        })
        .await
    }

    fn release_stream(&self, stream: StreamId) {
        let _ = self.cmd_tx.try_send(SessionCommand::CloseStream {
            stream,
            reply_tx: None,
        });
    }
}

/// Chunked reader over a remote file
pub struct RemoteReadStream {
    session: Session,
    id: StreamId,
    closed: bool,
}

impl RemoteReadStream {
    /// Next chunk of at most `max` bytes; only the last chunk is short and
    /// an empty chunk means end of file
    pub async fn read_chunk(&mut self, max: usize) -> Result<Bytes, SftpError> {
        let stream = self.id;
        self.session
            .request(|reply_tx| SessionCommand::ReadChunk {
                stream,
                max,
                reply_tx,
            })
            .await
    }

    pub async fn close(mut self) -> Result<(), SftpError> {
        self.closed = true;
        self.session.close_stream(self.id).await
    }
}

impl Drop for RemoteReadStream {
    fn drop(&mut self) {
        if !self.closed {
            self.session.release_stream(self.id);
        }
    }
}

/// Chunked writer to a remote file
pub struct RemoteWriteStream {
    session: Session,
    id: StreamId,
    closed: bool,
}

impl RemoteWriteStream {
    pub async fn write_chunk(&mut self, data: Bytes) -> Result<(), SftpError> {
        let stream = self.id;
        self.session
            .request(|reply_tx| SessionCommand::WriteChunk {
                stream,
                data,
                reply_tx,
            })
            .await
    }

    /// Flush and release the remote handle
    pub async fn close(mut self) -> Result<(), SftpError> {
        self.closed = true;
        self.session.close_stream(self.id).await
    }
}

impl Drop for RemoteWriteStream {
    fn drop(&mut self) {
        if !self.closed {
            self.session.release_stream(self.id);
        }
    }
}

/// Bound one transport call by the I/O timeout
async fn bounded<T>(
    io_timeout: Duration,
    fut: impl std::future::Future<Output = Result<T, SftpError>>,
) -> Result<T, SftpError> {
    match tokio::time::timeout(io_timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(SftpError::ConnectionLost(format!(
            "I/O timeout after {:?}, connection may be dead",
            io_timeout
        ))),
    }
}

async fn read_full(reader: &mut dyn RemoteReader, max: usize) -> Result<Bytes, SftpError> {
    let mut buf = vec![0u8; max];
    let mut filled = 0;
    while filled < max {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(Bytes::from(buf))
}

/// Send a reply, returning the fatal error message if the result was one.
///
/// A fatal result marks the session Failed before the caller sees it.
fn respond<T>(
    state_tx: &watch::Sender<SessionState>,
    reply_tx: Reply<T>,
    result: Result<T, SftpError>,
) -> Option<String> {
    let fatal = fatal_message(&result);
    if fatal.is_some() {
        state_tx.send_replace(SessionState::Failed);
    }
    if reply_tx.send(result).is_err() {
        debug!("Caller dropped before receiving session reply");
    }
    fatal
}

fn fatal_message<T>(result: &Result<T, SftpError>) -> Option<String> {
    match result {
        Err(e) if e.is_fatal() => Some(e.to_string()),
        _ => None,
    }
}

async fn run_owner(
    mut fs: Box<dyn RemoteFs>,
    mut cmd_rx: mpsc::Receiver<SessionCommand>,
    state_tx: watch::Sender<SessionState>,
    io_timeout: Duration,
    label: String,
) {
    let mut streams: HashMap<StreamId, OpenStream> = HashMap::new();
    let mut next_stream: StreamId = 1;
    let mut close_reply = None;

    info!("Session owner task started for {}", label);

    while let Some(cmd) = cmd_rx.recv().await {
        let fatal = match cmd {
            SessionCommand::List { path, reply_tx } => {
                respond(&state_tx, reply_tx, bounded(io_timeout, fs.list_dir(&path)).await)
            }
            SessionCommand::Stat { path, reply_tx } => {
                respond(&state_tx, reply_tx, bounded(io_timeout, fs.stat(&path)).await)
            }
            SessionCommand::Lstat { path, reply_tx } => {
                respond(&state_tx, reply_tx, bounded(io_timeout, fs.lstat(&path)).await)
            }
            SessionCommand::Mkdir { path, reply_tx } => {
                respond(&state_tx, reply_tx, bounded(io_timeout, fs.mkdir(&path)).await)
            }
            SessionCommand::Rename { from, to, reply_tx } => {
                respond(&state_tx, reply_tx, bounded(io_timeout, fs.rename(&from, &to)).await)
            }
            SessionCommand::RemoveFile { path, reply_tx } => {
                respond(&state_tx, reply_tx, bounded(io_timeout, fs.remove_file(&path)).await)
            }
            SessionCommand::RemoveDir { path, reply_tx } => {
                respond(&state_tx, reply_tx, bounded(io_timeout, fs.remove_dir(&path)).await)
            }
            SessionCommand::OpenRead { path, reply_tx } => {
                let result = bounded(io_timeout, fs.open_read(&path)).await.map(|reader| {
                    let id = next_stream;
                    next_stream += 1;
                    streams.insert(id, OpenStream::Read(reader));
                    id
                });
                respond(&state_tx, reply_tx, result)
            }
            SessionCommand::OpenWrite { path, reply_tx } => {
                let result = bounded(io_timeout, fs.open_write(&path)).await.map(|writer| {
                    let id = next_stream;
                    next_stream += 1;
                    streams.insert(id, OpenStream::Write(writer));
                    id
                });
                respond(&state_tx, reply_tx, result)
            }
            SessionCommand::ReadChunk {
                stream,
                max,
                reply_tx,
            } => {
                let result = match streams.get_mut(&stream) {
                    Some(OpenStream::Read(reader)) => {
                        bounded(io_timeout, read_full(reader.as_mut(), max)).await
                    }
                    _ => Err(SftpError::Protocol(format!(
                        "Stream {} is not open for reading",
                        stream
                    ))),
                };
                respond(&state_tx, reply_tx, result)
            }
            SessionCommand::WriteChunk {
                stream,
                data,
                reply_tx,
            } => {
                let result = match streams.get_mut(&stream) {
                    Some(OpenStream::Write(writer)) => {
                        bounded(io_timeout, writer.write_all(&data)).await
                    }
                    _ => Err(SftpError::Protocol(format!(
                        "Stream {} is not open for writing",
                        stream
                    ))),
                };
                respond(&state_tx, reply_tx, result)
            }
            SessionCommand::CloseStream { stream, reply_tx } => {
                let result = match streams.remove(&stream) {
                    Some(OpenStream::Write(mut writer)) => {
                        bounded(io_timeout, writer.finish()).await
                    }
                    Some(OpenStream::Read(_)) | None => Ok(()),
                };
                match reply_tx {
                    Some(reply_tx) => respond(&state_tx, reply_tx, result),
                    None => fatal_message(&result),
                }
            }
            SessionCommand::Close { reply_tx } => {
                info!("Close requested for session {}", label);
                state_tx.send_replace(SessionState::Disconnected);
                close_reply = Some(reply_tx);
                break;
            }
        };

        if let Some(reason) = fatal {
            warn!("Session {} failed: {}", label, reason);
            state_tx.send_replace(SessionState::Failed);
            break;
        }
    }

    // === Cleanup phase ===
    if *state_tx.borrow() == SessionState::Connected {
        info!("All controllers dropped for session {}", label);
        state_tx.send_replace(SessionState::Disconnected);
    }

    let lost = *state_tx.borrow() == SessionState::Failed;
    drain_pending_commands(&mut cmd_rx, lost);

    streams.clear();
    if !lost {
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, fs.close()).await;
    }

    if let Some(reply_tx) = close_reply {
        let _ = reply_tx.send(());
    }
    info!("Session owner task terminated for {}", label);
}

/// Drain all pending commands, failing each one
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<SessionCommand>, lost: bool) {
    cmd_rx.close();

    let err = || {
        if lost {
            SftpError::ConnectionLost("Session failed".to_string())
        } else {
            SftpError::ConnectionClosed
        }
    };

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            SessionCommand::List { reply_tx, .. } => {
                let _ = reply_tx.send(Err(err()));
            }
            SessionCommand::Stat { reply_tx, .. } | SessionCommand::Lstat { reply_tx, .. } => {
                let _ = reply_tx.send(Err(err()));
            }
            SessionCommand::Mkdir { reply_tx, .. }
            | SessionCommand::Rename { reply_tx, .. }
            | SessionCommand::RemoveFile { reply_tx, .. }
            | SessionCommand::RemoveDir { reply_tx, .. }
            | SessionCommand::WriteChunk { reply_tx, .. } => {
                let _ = reply_tx.send(Err(err()));
            }
            SessionCommand::OpenRead { reply_tx, .. } | SessionCommand::OpenWrite { reply_tx, .. } => {
                let _ = reply_tx.send(Err(err()));
            }
            SessionCommand::ReadChunk { reply_tx, .. } => {
                let _ = reply_tx.send(Err(err()));
            }
            SessionCommand::CloseStream { reply_tx, .. } => {
                if let Some(reply_tx) = reply_tx {
                    let _ = reply_tx.send(Err(err()));
                }
            }
            SessionCommand::Close { reply_tx } => {
                let _ = reply_tx.send(());
            }
        }
    }
}
