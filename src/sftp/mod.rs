//! SFTP transfer module
//!
//! Session ownership, chunked transfers, the transfer queue and history.

pub mod engine;
pub mod error;
pub mod events;
pub mod history;
pub mod path_utils;
pub mod progress;
pub mod session;
pub mod transfer;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod memory;

pub use engine::TransferEngine;
pub use error::SftpError;
pub use events::{EventEmitter, TransferEvent};
pub use history::{HistoryLog, TransferOutcome, TransferRecord, HISTORY_CAPACITY};
pub use session::{RemoteReadStream, RemoteWriteStream, Session, SessionState};
pub use transfer::{TransferControl, TransferTask};
pub use transport::{Connector, RemoteFs, RemoteReader, RemoteWriter, RusshRemoteFs, SshConnector};
pub use types::*;
