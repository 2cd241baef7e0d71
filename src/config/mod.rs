//! Configuration Management Module
//!
//! Connection profiles, application settings and their on-disk document,
//! plus keychain lookup for stored credentials.

pub mod keychain;
pub mod profiles;
pub mod storage;
pub mod types;

pub use keychain::{Keychain, KeychainError};
pub use profiles::{ConnectionProfile, ProfileStore};
pub use storage::{config_dir, config_file, ConfigStorage, StorageError};
pub use types::{ConfigFile, SavedConnection, Settings};
