//! SSH module - establishes authenticated connections
//!
//! Wraps russh to open the transport that SFTP sessions run on.
//!
//! # Features
//! - Password, private key and keychain-backed credentials
//! - Bounded connect timeout
//! - Host keys pinned per profile on first use; a changed key is rejected

mod client;
mod config;
mod error;

pub use client::{fingerprint, ClientHandler, SshClient, SshConnection};
pub use config::{AuthMethod, SshConfig};
pub use error::SshError;
