//! Transfer Engine
//!
//! FIFO queue of [`TransferTask`]s driven by a single worker against one
//! [`Session`], plus the file-management calls that pass straight through
//! to the session.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::SftpError;
use super::events::{EventEmitter, TransferEvent};
use super::history::{HistoryLog, TransferRecord};
use super::path_utils::{
    is_absolute_local_path, is_absolute_remote_path, join_remote_path, renamed_path,
};
use super::session::Session;
use super::transfer::TransferTask;
use super::types::{
    sort_entries, FileEntry, TaskId, TransferDirection, TransferProgress, TransferRequest,
};
use crate::config::Settings;

struct EngineInner {
    session: Session,
    settings: Settings,
    /// Tasks waiting for the worker, in submission order
    queue: Mutex<VecDeque<Arc<TransferTask>>>,
    /// Every known task, for snapshots
    tasks: Mutex<Vec<Arc<TransferTask>>>,
    history: Arc<Mutex<HistoryLog>>,
    events: EventEmitter,
    notify: Notify,
    shutdown: CancellationToken,
}

impl EngineInner {
    /// Record history, then publish the terminal event
    fn finish(&self, task: &TransferTask, terminal: TransferEvent) {
        self.history.lock().append(task.record());
        self.events.emit(terminal);
    }
}

/// Queue and worker for one session
pub struct TransferEngine {
    inner: Arc<EngineInner>,
}

impl TransferEngine {
    /// Start the worker; finished transfers are appended to `history`
    pub fn new(session: Session, settings: Settings, history: Arc<Mutex<HistoryLog>>) -> Self {
        let inner = Arc::new(EngineInner {
            session,
            settings,
            queue: Mutex::new(VecDeque::new()),
            tasks: Mutex::new(Vec::new()),
            history,
            events: EventEmitter::new(),
            notify: Notify::new(),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(run_worker(inner.clone()));

        Self { inner }
    }

    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    /// Receive lifecycle events of every task enqueued from now on
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TransferEvent> {
        self.inner.events.subscribe()
    }

    /// Validate and queue a batch; nothing is queued unless every entry is valid
    pub async fn enqueue(&self, requests: Vec<TransferRequest>) -> Result<Vec<TaskId>, SftpError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(SftpError::ConnectionClosed);
        }
        if !self.inner.session.is_connected() {
            return Err(SftpError::NotConnected);
        }

        for request in &requests {
            validate_request(request).await?;
        }

        let tasks: Vec<Arc<TransferTask>> = requests
            .into_iter()
            .map(|request| Arc::new(TransferTask::new(request)))
            .collect();

        {
            let mut queue = self.inner.queue.lock();
            // Validation awaits; shutdown may have drained the queue meanwhile
            if self.inner.shutdown.is_cancelled() {
                return Err(SftpError::ConnectionClosed);
            }
            let mut table = self.inner.tasks.lock();
            for task in &tasks {
                table.push(task.clone());
                queue.push_back(task.clone());
                // Emitted under the queue lock so `Queued` precedes `Started`
                self.inner.events.emit(TransferEvent::Queued {
                    progress: task.snapshot(),
                });
            }
        }

        if !tasks.is_empty() {
            info!("Queued {} transfer(s)", tasks.len());
            self.inner.notify.notify_one();
        }

        Ok(tasks.iter().map(|t| t.id().to_string()).collect())
    }

    /// Queue every file below a directory, recreating the folder structure
    /// on the destination side first
    pub async fn enqueue_directory(
        &self,
        local_dir: &Path,
        remote_dir: &str,
        direction: TransferDirection,
    ) -> Result<Vec<TaskId>, SftpError> {
        if !self.inner.session.is_connected() {
            return Err(SftpError::NotConnected);
        }
        if !is_absolute_local_path(local_dir) {
            return Err(SftpError::InvalidPath(format!(
                "Local path must be absolute: {}",
                local_dir.display()
            )));
        }
        if !is_absolute_remote_path(remote_dir) {
            return Err(SftpError::InvalidPath(format!(
                "Remote path must be absolute: {}",
                remote_dir
            )));
        }

        let requests = match direction {
            TransferDirection::Upload => self.collect_upload(local_dir, remote_dir).await?,
            TransferDirection::Download => self.collect_download(local_dir, remote_dir).await?,
        };

        info!(
            "Directory {:?} {} <-> {}: {} file(s)",
            direction,
            local_dir.display(),
            remote_dir,
            requests.len()
        );
        self.enqueue(requests).await
    }

    async fn collect_upload(
        &self,
        local_dir: &Path,
        remote_dir: &str,
    ) -> Result<Vec<TransferRequest>, SftpError> {
        let metadata = tokio::fs::metadata(local_dir).await?;
        if !metadata.is_dir() {
            return Err(SftpError::InvalidPath(format!(
                "Not a directory: {}",
                local_dir.display()
            )));
        }

        let mut dirs = Vec::new();
        let mut requests = Vec::new();
        for entry in walkdir::WalkDir::new(local_dir)
            .min_depth(1)
            .sort_by_file_name()
        {
            let entry = entry.map_err(std::io::Error::from)?;
            let relative = match entry.path().strip_prefix(local_dir) {
                Ok(relative) => relative,
                Err(_) => continue,
            };
            let remote = relative
                .components()
                .fold(remote_dir.to_string(), |acc, part| {
                    join_remote_path(&acc, &part.as_os_str().to_string_lossy())
                });

            if entry.file_type().is_dir() {
                dirs.push(remote);
            } else if entry.file_type().is_file() {
                requests.push(TransferRequest::upload(entry.path(), remote));
            } else {
                debug!("Skipping {}", entry.path().display());
            }
        }

        self.ensure_remote_dir(remote_dir).await?;
        for dir in &dirs {
            self.ensure_remote_dir(dir).await?;
        }

        Ok(requests)
    }

    async fn collect_download(
        &self,
        local_dir: &Path,
        remote_dir: &str,
    ) -> Result<Vec<TransferRequest>, SftpError> {
        let root = self.inner.session.stat(remote_dir).await?;
        if !root.is_dir {
            return Err(SftpError::InvalidPath(format!("Not a directory: {}", remote_dir)));
        }

        let mut requests = Vec::new();
        let mut pending: Vec<(String, PathBuf)> = vec![(remote_dir.to_string(), local_dir.to_path_buf())];

        while let Some((remote, local)) = pending.pop() {
            tokio::fs::create_dir_all(&local).await?;

            let mut entries = self.inner.session.list_directory(&remote).await?;
            sort_entries(&mut entries);
            for entry in entries {
                let local_child = local.join(&entry.name);
                if entry.is_dir {
                    pending.push((entry.path, local_child));
                } else {
                    requests.push(TransferRequest::download(entry.path, local_child));
                }
            }
        }

        Ok(requests)
    }

    async fn ensure_remote_dir(&self, path: &str) -> Result<(), SftpError> {
        match self.inner.session.stat(path).await {
            Ok(entry) if entry.is_dir => Ok(()),
            Ok(_) => Err(SftpError::AlreadyExists(path.to_string())),
            Err(SftpError::NotFound(_)) => self.inner.session.make_directory(path).await,
            Err(e) => Err(e),
        }
    }

    /// Cancel one task; returns whether it was still pending or running
    pub fn cancel_one(&self, id: &str) -> bool {
        let queued = {
            let mut queue = self.inner.queue.lock();
            queue
                .iter()
                .position(|t| t.id() == id)
                .and_then(|pos| queue.remove(pos))
        };

        if let Some(task) = queued {
            info!("Cancelled queued transfer {}", id);
            let terminal = task.cancel_queued();
            self.inner.finish(&task, terminal);
            return true;
        }

        let tasks = self.inner.tasks.lock();
        match tasks.iter().find(|t| t.id() == id) {
            Some(task) if !task.state().is_finished() => {
                info!("Cancelling running transfer {}", id);
                task.cancel();
                true
            }
            _ => false,
        }
    }

    /// Cancel everything queued or running; returns the number of tasks hit
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<Arc<TransferTask>> = self.inner.queue.lock().drain(..).collect();
        let mut count = drained.len();

        for task in &drained {
            let terminal = task.cancel_queued();
            self.inner.finish(task, terminal);
        }

        for task in self.inner.tasks.lock().iter() {
            if !task.state().is_finished() && !task.is_cancelled() {
                task.cancel();
                count += 1;
            }
        }

        if count > 0 {
            info!("Cancelled {} transfer(s)", count);
        }
        count
    }

    pub fn snapshot(&self, id: &str) -> Option<TransferProgress> {
        self.inner
            .tasks
            .lock()
            .iter()
            .find(|t| t.id() == id)
            .map(|t| t.snapshot())
    }

    /// Snapshots of every known task, in submission order
    pub fn snapshots(&self) -> Vec<TransferProgress> {
        self.inner.tasks.lock().iter().map(|t| t.snapshot()).collect()
    }

    /// Forget finished tasks; returns how many were dropped
    pub fn clear_finished(&self) -> usize {
        let mut tasks = self.inner.tasks.lock();
        let before = tasks.len();
        tasks.retain(|t| !t.state().is_finished());
        before - tasks.len()
    }

    pub fn history(&self) -> Vec<TransferRecord> {
        self.inner.history.lock().all()
    }

    /// Cancel all work and stop the worker
    pub fn shutdown(&self) {
        // Token first: enqueue checks it under the queue lock cancel_all drains
        self.inner.shutdown.cancel();
        self.cancel_all();
    }

    /// Directory listing honoring the hidden-files setting, folders first
    pub async fn list_directory(&self, path: &str) -> Result<Vec<FileEntry>, SftpError> {
        let mut entries = self.inner.session.list_directory(path).await?;
        if !self.inner.settings.show_hidden_files {
            entries.retain(|e| !e.is_hidden());
        }
        sort_entries(&mut entries);
        Ok(entries)
    }

    pub async fn stat(&self, path: &str) -> Result<FileEntry, SftpError> {
        self.inner.session.stat(path).await
    }

    pub async fn create_folder(&self, path: &str) -> Result<(), SftpError> {
        if !is_absolute_remote_path(path) {
            return Err(SftpError::InvalidPath(format!("Remote path must be absolute: {}", path)));
        }
        self.inner.session.make_directory(path).await
    }

    pub async fn delete(&self, path: &str, recursive: bool) -> Result<(), SftpError> {
        self.inner.session.delete(path, recursive).await
    }

    /// Rename within the same folder; files keep their extension.
    /// Returns the new path.
    pub async fn rename(&self, path: &str, new_name: &str) -> Result<String, SftpError> {
        if new_name.is_empty() || new_name.contains('/') {
            return Err(SftpError::InvalidPath(format!("Invalid name: {:?}", new_name)));
        }

        let entry = self.inner.session.stat(path).await?;
        let new_path = renamed_path(path, new_name, entry.is_dir);
        if new_path == path {
            return Ok(new_path);
        }

        self.inner.session.rename(path, &new_path).await?;
        Ok(new_path)
    }
}

impl Drop for TransferEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn validate_request(request: &TransferRequest) -> Result<(), SftpError> {
    if request.local_path.as_os_str().is_empty() || request.remote_path.is_empty() {
        return Err(SftpError::InvalidPath("Empty path".to_string()));
    }
    if !is_absolute_local_path(&request.local_path) {
        return Err(SftpError::InvalidPath(format!(
            "Local path must be absolute: {}",
            request.local_path.display()
        )));
    }
    if !is_absolute_remote_path(&request.remote_path) {
        return Err(SftpError::InvalidPath(format!(
            "Remote path must be absolute: {}",
            request.remote_path
        )));
    }

    match request.direction {
        TransferDirection::Upload => match tokio::fs::metadata(&request.local_path).await {
            Ok(metadata) if metadata.is_file() => Ok(()),
            Ok(_) => Err(SftpError::InvalidPath(format!(
                "Not a regular file: {}",
                request.local_path.display()
            ))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(SftpError::NotFound(
                request.local_path.display().to_string(),
            )),
            Err(e) => Err(SftpError::Io(e)),
        },
        TransferDirection::Download => {
            let parent = request
                .local_path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .ok_or_else(|| {
                    SftpError::InvalidPath(format!(
                        "No parent directory: {}",
                        request.local_path.display()
                    ))
                })?;
            match tokio::fs::metadata(parent).await {
                Ok(metadata) if metadata.is_dir() => Ok(()),
                _ => Err(SftpError::NotFound(parent.display().to_string())),
            }
        }
    }
}

async fn run_worker(inner: Arc<EngineInner>) {
    debug!("Transfer worker started");

    loop {
        let next = inner.queue.lock().pop_front();
        match next {
            Some(task) => {
                let chunk_size = inner.settings.chunk_size();
                let terminal = task.run(&inner.session, chunk_size, &inner.events).await;
                inner.finish(&task, terminal);
            }
            None => {
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = inner.notify.notified() => {}
                }
            }
        }
    }

    let leftover: Vec<Arc<TransferTask>> = inner.queue.lock().drain(..).collect();
    if !leftover.is_empty() {
        warn!(
            "Transfer worker stopped with {} queued task(s), cancelling",
            leftover.len()
        );
    }
    for task in leftover {
        let terminal = task.cancel_queued();
        inner.finish(&task, terminal);
    }
    debug!("Transfer worker stopped");
}
