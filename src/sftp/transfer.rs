//! Transfer tasks
//!
//! A [`TransferTask`] copies one file in one direction in fixed-size chunks.
//! Data lands in `<destination>.ferry-part` and is renamed over the
//! destination once complete; a cancelled or failed task leaves the part
//! file behind and the destination untouched.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::error::SftpError;
use super::events::{EventEmitter, TransferEvent};
use super::history::{TransferOutcome, TransferRecord};
use super::path_utils::{local_part_path, remote_backup_path, remote_part_path};
use super::progress::{eta_ms, RateMeter};
use super::session::Session;
use super::types::{
    format_duration, format_size, TaskId, TransferDirection, TransferProgress, TransferRequest,
    TransferState, RATE_WINDOW,
};

/// Transfer control signals
#[derive(Debug)]
pub struct TransferControl {
    /// Cancellation signal via watch channel
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
}

impl TransferControl {
    pub fn new() -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            cancel_tx,
            cancel_rx,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }
}

impl Default for TransferControl {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct TaskProgress {
    state: TransferState,
    total_bytes: Option<u64>,
    transferred_bytes: u64,
    started_at: Option<Instant>,
    last_progress_at: Option<Instant>,
    /// Frozen once the task is finished
    elapsed: Option<Duration>,
    meter: RateMeter,
    error: Option<String>,
}

/// One file copy, mutated only by the engine worker
#[derive(Debug)]
pub struct TransferTask {
    id: TaskId,
    direction: TransferDirection,
    local_path: PathBuf,
    remote_path: String,
    control: TransferControl,
    progress: Mutex<TaskProgress>,
}

impl TransferTask {
    pub fn new(request: TransferRequest) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            direction: request.direction,
            local_path: request.local_path,
            remote_path: request.remote_path,
            control: TransferControl::new(),
            progress: Mutex::new(TaskProgress {
                state: TransferState::Queued,
                total_bytes: None,
                transferred_bytes: 0,
                started_at: None,
                last_progress_at: None,
                elapsed: None,
                meter: RateMeter::new(RATE_WINDOW),
                error: None,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn direction(&self) -> TransferDirection {
        self.direction
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn remote_path(&self) -> &str {
        &self.remote_path
    }

    pub fn state(&self) -> TransferState {
        self.progress.lock().state
    }

    /// Request cooperative cancellation; takes effect at the next chunk
    pub fn cancel(&self) {
        self.control.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.control.is_cancelled()
    }

    /// When the last chunk landed, if any
    pub fn last_progress_at(&self) -> Option<Instant> {
        self.progress.lock().last_progress_at
    }

    fn check_cancelled(&self) -> Result<(), SftpError> {
        if self.control.is_cancelled() {
            return Err(SftpError::Cancelled);
        }
        Ok(())
    }

    /// Point-in-time view for readers
    pub fn snapshot(&self) -> TransferProgress {
        let progress = self.progress.lock();
        self.snapshot_locked(&progress)
    }

    fn snapshot_locked(&self, progress: &TaskProgress) -> TransferProgress {
        let elapsed = progress
            .elapsed
            .or_else(|| progress.started_at.map(|at| at.elapsed()))
            .unwrap_or_default();
        let running = progress.state == TransferState::Running;
        let rate = if running {
            progress.meter.rate_at(Instant::now())
        } else {
            progress.meter.rate()
        };
        let eta = if running {
            eta_ms(progress.total_bytes, progress.transferred_bytes, rate)
        } else {
            None
        };

        TransferProgress {
            id: self.id.clone(),
            direction: self.direction,
            local_path: self.local_path.clone(),
            remote_path: self.remote_path.clone(),
            state: progress.state,
            total_bytes: progress.total_bytes,
            transferred_bytes: progress.transferred_bytes,
            elapsed_ms: elapsed.as_millis() as u64,
            rate_bytes_per_sec: rate,
            eta_ms: eta,
            error: progress.error.clone(),
        }
    }

    fn set_total(&self, total: Option<u64>) {
        self.progress.lock().total_bytes = total;
    }

    /// Account one chunk and emit its progress event
    fn advance(&self, bytes: usize, events: &EventEmitter) {
        let snapshot = {
            let mut progress = self.progress.lock();
            let now = Instant::now();
            progress.transferred_bytes += bytes as u64;
            let transferred = progress.transferred_bytes;
            progress.meter.record(now, transferred);
            progress.last_progress_at = Some(now);
            self.snapshot_locked(&progress)
        };
        events.emit(TransferEvent::Progress { progress: snapshot });
    }

    fn start(&self, events: &EventEmitter) {
        let snapshot = {
            let mut progress = self.progress.lock();
            let now = Instant::now();
            progress.state = TransferState::Running;
            progress.started_at = Some(now);
            progress.meter.record(now, 0);
            self.snapshot_locked(&progress)
        };
        events.emit(TransferEvent::Started { progress: snapshot });
    }

    /// Move to the terminal state and build the matching event
    fn finish(&self, result: Result<u64, SftpError>) -> TransferEvent {
        let (snapshot, failure) = {
            let mut progress = self.progress.lock();
            progress.elapsed = Some(
                progress
                    .started_at
                    .map(|at| at.elapsed())
                    .unwrap_or_default(),
            );
            let failure = match &result {
                Ok(_) => {
                    progress.state = TransferState::Completed;
                    None
                }
                Err(SftpError::Cancelled) => {
                    progress.state = TransferState::Cancelled;
                    None
                }
                Err(e) => {
                    progress.state = TransferState::Failed;
                    progress.error = Some(e.to_string());
                    Some((e.to_string(), e.requires_reconnect()))
                }
            };
            (self.snapshot_locked(&progress), failure)
        };

        match (snapshot.state, failure) {
            (TransferState::Completed, _) => TransferEvent::Completed { progress: snapshot },
            (_, Some((reason, reconnect_required))) => TransferEvent::Failed {
                progress: snapshot,
                reason,
                reconnect_required,
            },
            _ => TransferEvent::Cancelled { progress: snapshot },
        }
    }

    /// Terminal cancellation of a task that never left the queue
    pub(crate) fn cancel_queued(&self) -> TransferEvent {
        self.control.cancel();
        self.finish(Err(SftpError::Cancelled))
    }

    /// Run the copy to completion, failure or cancellation.
    ///
    /// `Started` and `Progress` go out through `events`; the terminal event
    /// is returned so the caller can record history before publishing it.
    pub async fn run(
        &self,
        session: &Session,
        chunk_size: usize,
        events: &EventEmitter,
    ) -> TransferEvent {
        // Cancelled between dequeue and start: never touch the session
        if self.is_cancelled() {
            return self.finish(Err(SftpError::Cancelled));
        }

        self.start(events);
        info!(
            "Starting {:?} {} <-> {}",
            self.direction,
            self.local_path.display(),
            self.remote_path
        );

        let result = match self.direction {
            TransferDirection::Upload => self.upload(session, chunk_size, events).await,
            TransferDirection::Download => self.download(session, chunk_size, events).await,
        };

        match &result {
            Ok(bytes) => {
                let elapsed = self
                    .progress
                    .lock()
                    .started_at
                    .map(|at| at.elapsed())
                    .unwrap_or_default();
                info!(
                    "{:?} completed: {} ({} in {})",
                    self.direction,
                    self.remote_path,
                    format_size(*bytes),
                    format_duration(elapsed)
                );
            }
            Err(SftpError::Cancelled) => {
                info!("{:?} cancelled: {}", self.direction, self.remote_path);
            }
            Err(e) => {
                warn!("{:?} failed: {}: {}", self.direction, self.remote_path, e);
            }
        }

        self.finish(result)
    }

    async fn upload(
        &self,
        session: &Session,
        chunk_size: usize,
        events: &EventEmitter,
    ) -> Result<u64, SftpError> {
        let metadata = tokio::fs::metadata(&self.local_path).await?;
        self.set_total(Some(metadata.len()));

        let mut local_file = tokio::fs::File::open(&self.local_path).await?;
        let part_path = remote_part_path(&self.remote_path);
        let mut remote_file = session.open_write_stream(&part_path).await?;

        let mut buffer = vec![0u8; chunk_size];
        let mut transferred = 0u64;

        loop {
            // Check for cancellation before each read/write cycle
            self.check_cancelled()?;

            let bytes_read = read_local_chunk(&mut local_file, &mut buffer).await?;
            if bytes_read == 0 {
                break;
            }

            remote_file
                .write_chunk(Bytes::copy_from_slice(&buffer[..bytes_read]))
                .await?;

            transferred += bytes_read as u64;
            self.advance(bytes_read, events);
        }

        remote_file.close().await?;
        self.check_cancelled()?;

        // SFTP rename does not replace an existing target
        match session.symlink_stat(&self.remote_path).await {
            Ok(existing) if existing.is_dir => {
                return Err(SftpError::AlreadyExists(self.remote_path.clone()));
            }
            Ok(_) => self.replace_remote(session, &part_path).await?,
            Err(SftpError::NotFound(_)) => session.rename(&part_path, &self.remote_path).await?,
            Err(e) => return Err(e),
        }

        Ok(transferred)
    }

    /// Move the old destination aside, rename the part file in, then drop
    /// the old copy. A failed swap puts the old destination back.
    async fn replace_remote(&self, session: &Session, part_path: &str) -> Result<(), SftpError> {
        let backup = remote_backup_path(&self.remote_path);
        debug!("Replacing existing {} via {}", self.remote_path, backup);

        match session.symlink_stat(&backup).await {
            Ok(_) => session.delete(&backup, false).await?,
            Err(SftpError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        session.rename(&self.remote_path, &backup).await?;

        if let Err(e) = session.rename(part_path, &self.remote_path).await {
            warn!("Failed to move {} into place: {}", part_path, e);
            if let Err(restore) = session.rename(&backup, &self.remote_path).await {
                warn!(
                    "Failed to restore {} from {}: {}",
                    self.remote_path, backup, restore
                );
            }
            return Err(e);
        }

        if let Err(e) = session.delete(&backup, false).await {
            warn!("Failed to remove {}: {}", backup, e);
        }
        Ok(())
    }

    async fn download(
        &self,
        session: &Session,
        chunk_size: usize,
        events: &EventEmitter,
    ) -> Result<u64, SftpError> {
        let total = match session.stat(&self.remote_path).await {
            Ok(entry) if entry.is_dir => {
                return Err(SftpError::InvalidPath(format!(
                    "{} is a directory",
                    self.remote_path
                )));
            }
            Ok(entry) => entry.size,
            Err(SftpError::Protocol(e)) => {
                warn!("Size of {} unknown: {}", self.remote_path, e);
                None
            }
            Err(e) => return Err(e),
        };
        self.set_total(total);

        let mut remote_file = session.open_read_stream(&self.remote_path).await?;
        let part_path = local_part_path(&self.local_path);
        let mut local_file = tokio::fs::File::create(&part_path).await?;

        let mut transferred = 0u64;

        loop {
            self.check_cancelled()?;

            let chunk = remote_file.read_chunk(chunk_size).await?;
            if chunk.is_empty() {
                break; // EOF
            }

            local_file.write_all(&chunk).await?;

            transferred += chunk.len() as u64;
            self.advance(chunk.len(), events);
        }

        local_file.flush().await?;
        local_file.sync_all().await?;
        drop(local_file);
        remote_file.close().await?;
        self.check_cancelled()?;

        tokio::fs::rename(&part_path, &self.local_path).await?;

        Ok(transferred)
    }

    /// History entry for the task's current (terminal) state
    pub fn record(&self) -> TransferRecord {
        let snapshot = self.snapshot();
        let outcome = match snapshot.state {
            TransferState::Completed => TransferOutcome::Success,
            TransferState::Failed => TransferOutcome::Failed {
                reason: snapshot.error.unwrap_or_else(|| "Unknown error".to_string()),
            },
            _ => TransferOutcome::Cancelled,
        };

        TransferRecord {
            timestamp: Utc::now(),
            direction: self.direction,
            local_path: self.local_path.clone(),
            remote_path: self.remote_path.clone(),
            size_bytes: snapshot.transferred_bytes,
            outcome,
            duration_ms: snapshot.elapsed_ms,
        }
    }
}

/// Fill `buffer` from the local file; short only at end of file
async fn read_local_chunk(
    file: &mut tokio::fs::File,
    buffer: &mut [u8],
) -> Result<usize, SftpError> {
    let mut filled = 0;
    while filled < buffer.len() {
        let n = file.read(&mut buffer[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionProfile;
    use crate::sftp::memory::MemoryFs;
    use tempfile::tempdir;

    fn session(fs: &MemoryFs) -> Session {
        Session::spawn(
            Box::new(fs.clone()),
            ConnectionProfile::quick("10.0.0.2", "pi", 22),
            Duration::from_secs(5),
        )
    }

    fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<TransferEvent>) -> Vec<TransferEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_upload_chunks_and_renames() {
        let temp = tempdir().unwrap();
        let local = temp.path().join("data.bin");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&local, &data).unwrap();

        let fs = MemoryFs::new();
        fs.add_dir("/srv");
        let session = session(&fs);
        let events = EventEmitter::new();
        let mut rx = events.subscribe();

        let task = TransferTask::new(TransferRequest::upload(&local, "/srv/data.bin"));
        let terminal = task.run(&session, 65536, &events).await;
        events.emit(terminal);

        assert_eq!(task.state(), TransferState::Completed);
        assert_eq!(fs.read("/srv/data.bin").unwrap(), data);
        assert!(!fs.exists("/srv/data.bin.ferry-part"));

        let events = drain(&mut rx);
        assert!(matches!(events[0], TransferEvent::Started { .. }));
        let progress: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                TransferEvent::Progress { progress } => Some(progress.transferred_bytes),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![65536, 131072, 196608, 200000]);
        assert!(matches!(events.last(), Some(TransferEvent::Completed { .. })));
    }

    #[tokio::test]
    async fn test_upload_overwrites_existing() {
        let temp = tempdir().unwrap();
        let local = temp.path().join("new.txt");
        std::fs::write(&local, b"fresh").unwrap();

        let fs = MemoryFs::new();
        fs.add_file("/new.txt", b"stale contents".to_vec());
        let session = session(&fs);

        let task = TransferTask::new(TransferRequest::upload(&local, "/new.txt"));
        let terminal = task.run(&session, 4, &EventEmitter::new()).await;
        assert!(matches!(terminal, TransferEvent::Completed { .. }));

        assert_eq!(task.state(), TransferState::Completed);
        assert_eq!(fs.read("/new.txt").unwrap(), b"fresh".to_vec());
        assert!(!fs.exists("/new.txt.ferry-old"));
    }

    #[tokio::test]
    async fn test_failed_replace_restores_destination() {
        let temp = tempdir().unwrap();
        let local = temp.path().join("report.pdf");
        std::fs::write(&local, b"second draft").unwrap();

        let fs = MemoryFs::new();
        fs.add_file("/report.pdf", b"first draft".to_vec());
        fs.reject_rename_from("/report.pdf.ferry-part");
        let session = session(&fs);

        let task = TransferTask::new(TransferRequest::upload(&local, "/report.pdf"));
        let terminal = task.run(&session, 1024, &EventEmitter::new()).await;
        assert!(matches!(terminal, TransferEvent::Failed { .. }));

        assert_eq!(fs.read("/report.pdf").unwrap(), b"first draft".to_vec());
        assert_eq!(
            fs.read("/report.pdf.ferry-part").unwrap(),
            b"second draft".to_vec()
        );
        assert!(!fs.exists("/report.pdf.ferry-old"));
    }

    #[tokio::test]
    async fn test_download_unknown_size() {
        let temp = tempdir().unwrap();
        let local = temp.path().join("log.txt");

        let fs = MemoryFs::new();
        fs.add_file("/var/log.txt", vec![7u8; 1000]);
        fs.hide_sizes(true);
        let session = session(&fs);
        let events = EventEmitter::new();
        let mut rx = events.subscribe();

        let task = TransferTask::new(TransferRequest::download("/var/log.txt", &local));
        let terminal = task.run(&session, 300, &events).await;
        events.emit(terminal);

        assert_eq!(task.state(), TransferState::Completed);
        assert_eq!(std::fs::read(&local).unwrap(), vec![7u8; 1000]);

        for event in drain(&mut rx) {
            let progress = event.progress();
            assert_eq!(progress.total_bytes, None);
            assert_eq!(progress.percentage(), None);
            assert_eq!(progress.eta_ms, None);
        }
    }

    #[tokio::test]
    async fn test_download_missing_file_fails() {
        let temp = tempdir().unwrap();
        let fs = MemoryFs::new();
        let session = session(&fs);
        let events = EventEmitter::new();
        let mut rx = events.subscribe();

        let task = TransferTask::new(TransferRequest::download("/nope.bin", temp.path().join("nope.bin")));
        let terminal = task.run(&session, 1024, &events).await;
        events.emit(terminal);

        assert_eq!(task.state(), TransferState::Failed);
        match drain(&mut rx).last() {
            Some(TransferEvent::Failed {
                reconnect_required, ..
            }) => assert!(!reconnect_required),
            other => panic!("unexpected terminal event: {:?}", other),
        }
        match task.record().outcome {
            TransferOutcome::Failed { reason } => assert!(reason.contains("/nope.bin")),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_before_start_skips_session() {
        let temp = tempdir().unwrap();
        let local = temp.path().join("a.txt");
        std::fs::write(&local, b"abc").unwrap();

        let fs = MemoryFs::new();
        let session = session(&fs);
        let events = EventEmitter::new();
        let mut rx = events.subscribe();

        let task = TransferTask::new(TransferRequest::upload(&local, "/a.txt"));
        task.cancel();
        let terminal = task.run(&session, 1024, &events).await;
        events.emit(terminal);

        assert_eq!(task.state(), TransferState::Cancelled);
        assert_eq!(fs.op_count(), 0);
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], TransferEvent::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_lost_connection_requires_reconnect() {
        let temp = tempdir().unwrap();
        let local = temp.path().join("big.bin");

        let fs = MemoryFs::new();
        fs.add_file("/big.bin", vec![0u8; 4096]);
        let session = session(&fs);
        let events = EventEmitter::new();
        let mut rx = events.subscribe();

        fs.drop_connection();
        let task = TransferTask::new(TransferRequest::download("/big.bin", &local));
        let terminal = task.run(&session, 1024, &events).await;
        events.emit(terminal);

        assert_eq!(task.state(), TransferState::Failed);
        assert!(matches!(
            drain(&mut rx).last(),
            Some(TransferEvent::Failed {
                reconnect_required: true,
                ..
            })
        ));
        assert!(!local.exists());
    }
}
