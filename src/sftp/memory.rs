//! In-memory remote filesystem for tests

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::error::SftpError;
use super::path_utils::{join_remote_path, remote_file_name, remote_parent};
use super::transport::{Connector, RemoteFs, RemoteReader, RemoteWriter};
use super::types::FileEntry;
use crate::config::ConnectionProfile;
use crate::ssh::AuthMethod;

#[derive(Debug, Clone)]
enum Node {
    Dir,
    File(Vec<u8>),
    Symlink(String),
}

const MAX_LINK_HOPS: usize = 8;

#[derive(Debug, Default)]
struct State {
    nodes: BTreeMap<String, Node>,
    delay: Option<Duration>,
    disconnected: bool,
    hide_sizes: bool,
    host_key: Option<String>,
    reject_rename_from: Option<String>,
}

/// Shared in-memory tree; clones see the same files
#[derive(Debug, Clone)]
pub(crate) struct MemoryFs {
    state: Arc<Mutex<State>>,
    ops: Arc<AtomicUsize>,
}

impl MemoryFs {
    pub fn new() -> Self {
        let mut state = State::default();
        state.nodes.insert("/".to_string(), Node::Dir);
        Self {
            state: Arc::new(Mutex::new(state)),
            ops: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn add_dir(&self, path: &str) {
        self.state.lock().nodes.insert(path.to_string(), Node::Dir);
    }

    pub fn add_file(&self, path: &str, data: Vec<u8>) {
        self.state.lock().nodes.insert(path.to_string(), Node::File(data));
    }

    pub fn add_symlink(&self, path: &str, target: &str) {
        self.state
            .lock()
            .nodes
            .insert(path.to_string(), Node::Symlink(target.to_string()));
    }

    pub fn exists(&self, path: &str) -> bool {
        self.state.lock().nodes.contains_key(path)
    }

    pub fn read(&self, path: &str) -> Option<Vec<u8>> {
        match self.state.lock().nodes.get(path) {
            Some(Node::File(data)) => Some(data.clone()),
            _ => None,
        }
    }

    /// Delay applied before every operation
    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().delay = Some(delay);
    }

    /// Every later operation fails as if the peer went away
    pub fn drop_connection(&self) {
        self.state.lock().disconnected = true;
    }

    /// Report no sizes, like servers that omit the attribute
    pub fn hide_sizes(&self, hide: bool) {
        self.state.lock().hide_sizes = hide;
    }

    /// Fingerprint the fake server presents
    pub fn set_host_key(&self, fingerprint: &str) {
        self.state.lock().host_key = Some(fingerprint.to_string());
    }

    /// Renames whose source is `path` fail with PermissionDenied
    pub fn reject_rename_from(&self, path: &str) {
        self.state.lock().reject_rename_from = Some(path.to_string());
    }

    /// Operations served so far
    pub fn op_count(&self) -> usize {
        self.ops.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> Result<(), SftpError> {
        self.ops.fetch_add(1, Ordering::SeqCst);
        let delay = self.state.lock().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.state.lock().disconnected {
            return Err(SftpError::ConnectionLost("Connection reset by peer".to_string()));
        }
        Ok(())
    }

    fn entry(state: &State, path: &str, node: &Node) -> FileEntry {
        let (is_dir, size) = match node {
            Node::Dir => (true, None),
            Node::File(data) => (false, Some(data.len() as u64)),
            Node::Symlink(target) => (false, Some(target.len() as u64)),
        };
        FileEntry {
            name: remote_file_name(path).to_string(),
            path: path.to_string(),
            is_dir,
            is_symlink: matches!(node, Node::Symlink(_)),
            size: if state.hide_sizes { None } else { size },
            modified: None,
            permissions: if is_dir { 0o755 } else { 0o644 },
        }
    }

    fn require_parent(state: &State, path: &str) -> Result<(), SftpError> {
        match state.nodes.get(remote_parent(path)) {
            Some(Node::Dir) => Ok(()),
            _ => Err(SftpError::NotFound(remote_parent(path).to_string())),
        }
    }

    /// Follow symbolic links to the node they point at
    fn resolve<'a>(state: &'a State, path: &str) -> Option<(String, &'a Node)> {
        let mut current = path.to_string();
        for _ in 0..MAX_LINK_HOPS {
            match state.nodes.get(&current)? {
                Node::Symlink(target) => current = target.clone(),
                node => return Some((current, node)),
            }
        }
        None
    }

    fn children<'a>(
        state: &'a State,
        path: &'a str,
    ) -> impl Iterator<Item = (&'a String, &'a Node)> + 'a {
        state
            .nodes
            .iter()
            .filter(move |(key, _)| key.as_str() != "/" && remote_parent(key) == path)
    }
}

#[async_trait]
impl RemoteFs for MemoryFs {
    async fn list_dir(&mut self, path: &str) -> Result<Vec<FileEntry>, SftpError> {
        self.enter().await?;
        let state = self.state.lock();
        match Self::resolve(&state, path) {
            Some((resolved, Node::Dir)) => Ok(Self::children(&state, &resolved)
                .map(|(key, node)| {
                    let name = remote_file_name(key);
                    Self::entry(&state, &join_remote_path(path, name), node)
                })
                .collect()),
            Some(_) => Err(SftpError::Protocol(format!("{} is not a directory", path))),
            None => Err(SftpError::NotFound(path.to_string())),
        }
    }

    async fn stat(&mut self, path: &str) -> Result<FileEntry, SftpError> {
        self.enter().await?;
        let state = self.state.lock();
        let (_, node) =
            Self::resolve(&state, path).ok_or_else(|| SftpError::NotFound(path.to_string()))?;
        Ok(Self::entry(&state, path, node))
    }

    async fn lstat(&mut self, path: &str) -> Result<FileEntry, SftpError> {
        self.enter().await?;
        let state = self.state.lock();
        let node = state
            .nodes
            .get(path)
            .ok_or_else(|| SftpError::NotFound(path.to_string()))?;
        Ok(Self::entry(&state, path, node))
    }

    async fn mkdir(&mut self, path: &str) -> Result<(), SftpError> {
        self.enter().await?;
        let mut state = self.state.lock();
        if state.nodes.contains_key(path) {
            return Err(SftpError::AlreadyExists(path.to_string()));
        }
        Self::require_parent(&state, path)?;
        state.nodes.insert(path.to_string(), Node::Dir);
        Ok(())
    }

    async fn rename(&mut self, from: &str, to: &str) -> Result<(), SftpError> {
        self.enter().await?;
        let mut state = self.state.lock();
        if state.reject_rename_from.as_deref() == Some(from) {
            return Err(SftpError::PermissionDenied(from.to_string()));
        }
        if !state.nodes.contains_key(from) {
            return Err(SftpError::NotFound(from.to_string()));
        }
        if state.nodes.contains_key(to) {
            return Err(SftpError::AlreadyExists(to.to_string()));
        }
        Self::require_parent(&state, to)?;

        let prefix = format!("{}/", from);
        let moved: Vec<String> = state
            .nodes
            .keys()
            .filter(|key| key.as_str() == from || key.starts_with(&prefix))
            .cloned()
            .collect();
        for key in moved {
            if let Some(node) = state.nodes.remove(&key) {
                let new_key = format!("{}{}", to, &key[from.len()..]);
                state.nodes.insert(new_key, node);
            }
        }
        Ok(())
    }

    async fn remove_file(&mut self, path: &str) -> Result<(), SftpError> {
        self.enter().await?;
        let mut state = self.state.lock();
        match state.nodes.get(path) {
            Some(Node::File(_)) | Some(Node::Symlink(_)) => {
                state.nodes.remove(path);
                Ok(())
            }
            Some(Node::Dir) => Err(SftpError::Protocol(format!("{} is a directory", path))),
            None => Err(SftpError::NotFound(path.to_string())),
        }
    }

    async fn remove_dir(&mut self, path: &str) -> Result<(), SftpError> {
        self.enter().await?;
        let mut state = self.state.lock();
        match state.nodes.get(path) {
            Some(Node::Dir) => {
                if Self::children(&state, path).next().is_some() {
                    return Err(SftpError::DirectoryNotEmpty(path.to_string()));
                }
                state.nodes.remove(path);
                Ok(())
            }
            Some(_) => Err(SftpError::Protocol(format!("{} is not a directory", path))),
            None => Err(SftpError::NotFound(path.to_string())),
        }
    }

    async fn open_read(&mut self, path: &str) -> Result<Box<dyn RemoteReader>, SftpError> {
        self.enter().await?;
        let resolved = match Self::resolve(&self.state.lock(), path) {
            Some((resolved, Node::File(_))) => resolved,
            Some(_) => return Err(SftpError::Protocol(format!("{} is a directory", path))),
            None => return Err(SftpError::NotFound(path.to_string())),
        };
        Ok(Box::new(MemoryReader {
            fs: self.clone(),
            path: resolved,
            pos: 0,
        }))
    }

    async fn open_write(&mut self, path: &str) -> Result<Box<dyn RemoteWriter>, SftpError> {
        self.enter().await?;
        {
            let mut state = self.state.lock();
            match state.nodes.get(path) {
                Some(Node::Dir) => {
                    return Err(SftpError::Protocol(format!("{} is a directory", path)));
                }
                Some(Node::Symlink(_)) => {
                    return Err(SftpError::Protocol(format!("{} is a symbolic link", path)));
                }
                _ => {}
            }
            Self::require_parent(&state, path)?;
            state.nodes.insert(path.to_string(), Node::File(Vec::new()));
        }
        Ok(Box::new(MemoryWriter {
            fs: self.clone(),
            path: path.to_string(),
        }))
    }

    async fn close(&mut self) -> Result<(), SftpError> {
        Ok(())
    }

    fn host_key(&self) -> Option<String> {
        self.state.lock().host_key.clone()
    }
}

struct MemoryReader {
    fs: MemoryFs,
    path: String,
    pos: usize,
}

#[async_trait]
impl RemoteReader for MemoryReader {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, SftpError> {
        self.fs.enter().await?;
        let state = self.fs.state.lock();
        let data = match state.nodes.get(&self.path) {
            Some(Node::File(data)) => data,
            _ => return Err(SftpError::NotFound(self.path.clone())),
        };
        let remaining = data.len().saturating_sub(self.pos);
        let n = remaining.min(buf.len());
        buf[..n].copy_from_slice(&data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

struct MemoryWriter {
    fs: MemoryFs,
    path: String,
}

#[async_trait]
impl RemoteWriter for MemoryWriter {
    async fn write_all(&mut self, data: &[u8]) -> Result<(), SftpError> {
        self.fs.enter().await?;
        let mut state = self.fs.state.lock();
        match state.nodes.get_mut(&self.path) {
            Some(Node::File(contents)) => {
                contents.extend_from_slice(data);
                Ok(())
            }
            _ => Err(SftpError::NotFound(self.path.clone())),
        }
    }

    async fn finish(&mut self) -> Result<(), SftpError> {
        Ok(())
    }
}

/// Connector that accepts one user/password pair
pub(crate) struct MemoryConnector {
    pub fs: MemoryFs,
    user: String,
    password: String,
}

impl MemoryConnector {
    pub fn new(fs: MemoryFs, user: &str, password: &str) -> Self {
        Self {
            fs,
            user: user.to_string(),
            password: password.to_string(),
        }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        profile: &ConnectionProfile,
        _timeout: Duration,
    ) -> Result<Box<dyn RemoteFs>, SftpError> {
        // Handshake latency follows the configured operation delay
        let delay = self.fs.state.lock().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let accepted = matches!(
            &profile.credential,
            Some(AuthMethod::Password { password }) if *password == self.password
        );
        let presented = self.fs.host_key();
        if let (Some(expected), Some(actual)) = (&profile.host_key, &presented) {
            if expected != actual {
                return Err(SftpError::HostKeyMismatch(format!(
                    "{} presented {}, expected {}",
                    profile.display_id(),
                    actual,
                    expected
                )));
            }
        }
        if profile.user != self.user || !accepted {
            return Err(SftpError::Auth(format!(
                "Permission denied for {}",
                profile.display_id()
            )));
        }
        Ok(Box::new(self.fs.clone()))
    }
}
