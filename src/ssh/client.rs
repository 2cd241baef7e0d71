//! SSH Client implementation using russh

use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use russh::client::{self, Handle};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{HashAlg, PublicKey};
use tracing::{debug, info, warn};

use super::config::{AuthMethod, SshConfig};
use super::error::SshError;
use crate::config::Keychain;

/// SSH Client handler for russh
pub struct SshClient {
    config: SshConfig,
}

/// Authenticated connection plus the host key it was made with
pub struct SshConnection {
    pub handle: Handle<ClientHandler>,
    /// `SHA256:...` fingerprint presented by the server
    pub host_key: Option<String>,
}

impl SshClient {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    /// Connect to the SSH server and authenticate
    ///
    /// The returned handle owns the connection; dropping it tears the
    /// transport down.
    pub async fn connect(self) -> Result<SshConnection, SshError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);

        info!("Connecting to SSH server at {}", addr);

        let socket_addr = addr
            .to_socket_addrs()
            .map_err(|e| SshError::ConnectionFailed(format!("Failed to resolve address: {}", e)))?
            .next()
            .ok_or_else(|| SshError::ConnectionFailed("No address found".to_string()))?;

        // Keepalive lets a dead peer surface as a transport error instead of a hang
        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };

        let seen_key = Arc::new(Mutex::new(None));
        let handler = ClientHandler::new(
            self.config.host.clone(),
            self.config.port,
            self.config.host_key.clone(),
            seen_key.clone(),
        );

        let mut handle = tokio::time::timeout(
            Duration::from_secs(self.config.timeout_secs),
            client::connect(Arc::new(ssh_config), socket_addr, handler),
        )
        .await
        .map_err(|_| SshError::Timeout("Connection timed out".to_string()))?
        .map_err(handshake_error)?;

        debug!("SSH handshake completed");

        let authenticated = match &self.config.auth {
            AuthMethod::Password { password } => handle
                .authenticate_password(&self.config.username, password)
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?,
            AuthMethod::Key {
                key_path,
                passphrase,
            } => {
                let key = russh::keys::load_secret_key(key_path, passphrase.as_deref())
                    .map_err(|e| SshError::KeyError(e.to_string()))?;

                let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);

                handle
                    .authenticate_publickey(&self.config.username, key_with_hash)
                    .await
                    .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
            }
            AuthMethod::Keychain { id } => {
                let password = Keychain::new().get(id).map_err(|e| {
                    SshError::AuthenticationFailed(format!("Keychain lookup failed: {}", e))
                })?;

                handle
                    .authenticate_password(&self.config.username, &password)
                    .await
                    .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
            }
        };

        if !authenticated.success() {
            return Err(SshError::AuthenticationFailed(
                "Authentication rejected by server".to_string(),
            ));
        }

        info!("SSH authentication successful for {}@{}", self.config.username, addr);

        let host_key = seen_key.lock().take();
        Ok(SshConnection { handle, host_key })
    }
}

/// Client handler for russh callbacks
///
/// Without an expected fingerprint the first key is accepted and reported
/// back through `seen_key` so the caller can pin it. A pinned key that no
/// longer matches is always rejected.
pub struct ClientHandler {
    host: String,
    port: u16,
    expected_key: Option<String>,
    seen_key: Arc<Mutex<Option<String>>>,
}

impl ClientHandler {
    pub fn new(
        host: String,
        port: u16,
        expected_key: Option<String>,
        seen_key: Arc<Mutex<Option<String>>>,
    ) -> Self {
        Self {
            host,
            port,
            expected_key,
            seen_key,
        }
    }

    fn verify(&self, fingerprint: &str) -> Result<(), SshError> {
        match &self.expected_key {
            Some(expected) if expected != fingerprint => {
                warn!(
                    "Host key changed for {}:{}: expected {}, got {}",
                    self.host, self.port, expected, fingerprint
                );
                Err(SshError::HostKeyMismatch {
                    host: format!("{}:{}", self.host, self.port),
                    expected: expected.clone(),
                    actual: fingerprint.to_string(),
                })
            }
            Some(_) => {
                info!("Host key verified for {}:{}", self.host, self.port);
                Ok(())
            }
            None => {
                info!(
                    "New host {}:{}, accepting key {}",
                    self.host, self.port, fingerprint
                );
                Ok(())
            }
        }
    }
}

// Host key rejections keep their variant
fn handshake_error(err: SshError) -> SshError {
    match err {
        SshError::HostKeyMismatch { .. } => err,
        other => SshError::ConnectionFailed(other.to_string()),
    }
}

/// SHA256 fingerprint in OpenSSH notation
pub fn fingerprint(key: &PublicKey) -> String {
    key.fingerprint(HashAlg::Sha256).to_string()
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = fingerprint(server_public_key);
        self.verify(&fingerprint)?;
        *self.seen_key.lock() = Some(fingerprint);
        Ok(true)
    }
}
