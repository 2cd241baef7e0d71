//! Keychain Integration
//!
//! Resolves `AuthMethod::Keychain` references to the password stored in the
//! system keychain. Uses the `keyring` crate for cross-platform access.

use keyring::Entry;

/// Service name for keychain entries
const SERVICE_NAME: &str = "com.oxideferry.ssh";

/// Keychain errors
#[derive(Debug, thiserror::Error)]
pub enum KeychainError {
    #[error("Keychain error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("Secret not found for ID: {0}")]
    NotFound(String),
}

/// Keychain access for SSH credentials
pub struct Keychain {
    service: String,
}

impl Keychain {
    pub fn new() -> Self {
        Self {
            service: SERVICE_NAME.to_string(),
        }
    }

    /// Create with custom service name (for testing)
    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Store a secret under `id`
    pub fn store(&self, id: &str, secret: &str) -> Result<(), KeychainError> {
        tracing::info!("Keychain store: service={}, id={}", self.service, id);
        let entry = Entry::new(&self.service, id)?;
        entry.set_password(secret)?;
        Ok(())
    }

    /// Retrieve the secret stored under `id`
    pub fn get(&self, id: &str) -> Result<String, KeychainError> {
        tracing::debug!("Keychain get: service={}, id={}", self.service, id);
        let entry = Entry::new(&self.service, id)?;
        match entry.get_password() {
            Ok(secret) => Ok(secret),
            Err(keyring::Error::NoEntry) => Err(KeychainError::NotFound(id.to_string())),
            Err(e) => Err(KeychainError::Keyring(e)),
        }
    }

    /// Delete the secret stored under `id`; missing entries are not an error
    pub fn delete(&self, id: &str) -> Result<(), KeychainError> {
        let entry = Entry::new(&self.service, id)?;
        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(KeychainError::Keyring(e)),
        }
    }
}

impl Default for Keychain {
    fn default() -> Self {
        Self::new()
    }
}
