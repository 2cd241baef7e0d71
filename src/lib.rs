//! OxideFerry - SFTP transfer engine
//!
//! Moves files and directories between the local machine and a remote host
//! over SSH/SFTP. The crate owns the session lifecycle, the transfer queue,
//! progress accounting and transfer history; any UI drives it through
//! [`ConnectionManager`] and renders the [`sftp::TransferEvent`] stream.

pub mod config;
pub mod connection;
pub mod sftp;
pub mod ssh;

pub use connection::ConnectionManager;
pub use sftp::{SftpError, TransferEngine, TransferEvent, TransferProgress};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging
///
/// Honors `RUST_LOG`, defaults to `info`. Call once from the host application.
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
