//! Transfer lifecycle events
//!
//! Per task the stream is `Queued`, `Started`, `Progress` x n, then exactly
//! one terminal event. A task cancelled while queued emits `Queued` and
//! `Cancelled` only.

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

use super::types::TransferProgress;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TransferEvent {
    Queued {
        progress: TransferProgress,
    },
    Started {
        progress: TransferProgress,
    },
    Progress {
        progress: TransferProgress,
    },
    Completed {
        progress: TransferProgress,
    },
    #[serde(rename_all = "camelCase")]
    Failed {
        progress: TransferProgress,
        reason: String,
        /// The session is gone; a new connection is needed
        reconnect_required: bool,
    },
    Cancelled {
        progress: TransferProgress,
    },
}

impl TransferEvent {
    pub fn progress(&self) -> &TransferProgress {
        match self {
            TransferEvent::Queued { progress }
            | TransferEvent::Started { progress }
            | TransferEvent::Progress { progress }
            | TransferEvent::Completed { progress }
            | TransferEvent::Failed { progress, .. }
            | TransferEvent::Cancelled { progress } => progress,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.progress().id
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferEvent::Completed { .. }
                | TransferEvent::Failed { .. }
                | TransferEvent::Cancelled { .. }
        )
    }
}

/// Fan-out of events to any number of subscribers
#[derive(Default)]
pub struct EventEmitter {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<TransferEvent>>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TransferEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Deliver to every live subscriber, pruning dropped ones
    pub fn emit(&self, event: TransferEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}
