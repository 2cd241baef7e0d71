//! Transfer history
//!
//! Bounded FIFO of finished transfers, most recent last.

use std::collections::VecDeque;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::TransferDirection;

/// Maximum number of retained records
pub const HISTORY_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TransferOutcome {
    Success,
    Failed { reason: String },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub timestamp: DateTime<Utc>,
    pub direction: TransferDirection,
    pub local_path: PathBuf,
    pub remote_path: String,
    /// Bytes actually moved
    pub size_bytes: u64,
    pub outcome: TransferOutcome,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct HistoryLog {
    records: VecDeque<TransferRecord>,
    capacity: usize,
}

impl HistoryLog {
    pub fn new() -> Self {
        Self::with_capacity(HISTORY_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Restore persisted records, keeping the newest
    pub fn from_records(records: Vec<TransferRecord>) -> Self {
        let mut log = Self::new();
        for record in records {
            log.append(record);
        }
        log
    }

    /// Append, evicting the oldest record at capacity
    pub fn append(&mut self, record: TransferRecord) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    /// Snapshot, oldest first
    pub fn all(&self) -> Vec<TransferRecord> {
        self.records.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for HistoryLog {
    fn default() -> Self {
        Self::new()
    }
}
