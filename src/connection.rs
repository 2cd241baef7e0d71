//! Connection Manager
//!
//! Public facade of the crate. Drives the Disconnected -> Connecting ->
//! Connected lifecycle, owns the profile store, settings, history and the
//! current session with its transfer engine, and persists them through
//! [`ConfigStorage`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::config::{ConfigFile, ConfigStorage, ConnectionProfile, ProfileStore, Settings};
use crate::sftp::{
    Connector, HistoryLog, Session, SessionState, SftpError, SshConnector, TransferEngine,
    TransferRecord,
};
use crate::ssh::AuthMethod;

struct Active {
    session: Session,
    engine: Arc<TransferEngine>,
}

/// Holds the Connecting flag; cleared on drop, including when the connect
/// future is abandoned mid-handshake
struct ConnectingGuard<'a>(&'a AtomicBool);

impl<'a> ConnectingGuard<'a> {
    fn set(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    storage: Option<ConfigStorage>,
    profiles: RwLock<ProfileStore>,
    settings: RwLock<Settings>,
    history: Arc<Mutex<HistoryLog>>,
    active: RwLock<Option<Active>>,
    connecting: AtomicBool,
    /// Serializes connect/disconnect
    lifecycle: tokio::sync::Mutex<()>,
}

impl ConnectionManager {
    /// In-memory manager; nothing is persisted
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self::from_config(connector, None, ConfigFile::default())
    }

    /// Load `~/.oxideferry/config.json` and connect over SSH
    pub async fn open_default() -> Result<Self, SftpError> {
        let storage = ConfigStorage::new().map_err(|e| SftpError::Protocol(e.to_string()))?;
        Self::load(Arc::new(SshConnector), storage).await
    }

    /// Build from a persisted document
    pub async fn load(connector: Arc<dyn Connector>, storage: ConfigStorage) -> Result<Self, SftpError> {
        let config = storage
            .load()
            .await
            .map_err(|e| SftpError::Protocol(format!("Failed to load config: {}", e)))?;
        info!(
            "Loaded {} saved connection(s) from {:?}",
            config.connections.len(),
            storage.path()
        );
        Ok(Self::from_config(connector, Some(storage), config))
    }

    fn from_config(
        connector: Arc<dyn Connector>,
        storage: Option<ConfigStorage>,
        config: ConfigFile,
    ) -> Self {
        Self {
            connector,
            storage,
            profiles: RwLock::new(ProfileStore::from_config(&config)),
            settings: RwLock::new(config.settings),
            history: Arc::new(Mutex::new(HistoryLog::from_records(config.history))),
            active: RwLock::new(None),
            connecting: AtomicBool::new(false),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn state(&self) -> SessionState {
        if self.connecting.load(Ordering::SeqCst) {
            return SessionState::Connecting;
        }
        match self.active.read().as_ref() {
            Some(active) => active.session.state(),
            None => SessionState::Disconnected,
        }
    }

    /// Connect with `profile`, replacing any current session.
    ///
    /// On failure the manager is left Disconnected. The server key seen on
    /// the first connect is pinned to the saved profile.
    pub async fn connect(&self, mut profile: ConnectionProfile) -> Result<(), SftpError> {
        let _guard = self.lifecycle.lock().await;
        self.teardown().await;

        if profile.host_key.is_none() {
            profile.host_key = self.pinned_key(&profile);
        }

        let settings = self.settings.read().clone();
        let session = {
            let _connecting = ConnectingGuard::set(&self.connecting);
            Session::connect(self.connector.as_ref(), profile.clone(), &settings).await?
        };

        if profile.host_key.is_none() {
            profile.host_key = session.host_key().map(str::to_string);
        }
        let engine = Arc::new(TransferEngine::new(
            session.clone(),
            settings.clone(),
            self.history.clone(),
        ));
        *self.active.write() = Some(Active { session, engine });

        {
            let mut profiles = self.profiles.write();
            if settings.auto_save_connections {
                profiles.save(profile.clone());
            } else if let Some(key) = &profile.host_key {
                profiles.pin_host_key(&profile.name, key);
            }
            profiles.mark_used(&profile.name);
        }
        self.persist().await;

        info!("Connected to {}", profile.display_id());
        Ok(())
    }

    /// Key pinned to the saved profile of the same name and endpoint
    fn pinned_key(&self, profile: &ConnectionProfile) -> Option<String> {
        self.profiles
            .read()
            .get(&profile.name)
            .filter(|saved| saved.host == profile.host && saved.port == profile.port)
            .and_then(|saved| saved.host_key.clone())
    }

    /// Connect to a saved profile with a credential supplied now
    pub async fn connect_saved(&self, name: &str, credential: AuthMethod) -> Result<(), SftpError> {
        let profile = self
            .profiles
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| SftpError::NotFound(format!("Saved connection {}", name)))?;
        self.connect(profile.with_credential(credential)).await
    }

    /// Ad-hoc connection named `user@host:port`
    pub async fn quick_connect(
        &self,
        host: &str,
        user: &str,
        port: u16,
        credential: AuthMethod,
    ) -> Result<(), SftpError> {
        self.connect(ConnectionProfile::quick(host, user, port).with_credential(credential))
            .await
    }

    /// Connect, list `/`, disconnect; the current session is untouched
    pub async fn test_connection(&self, profile: ConnectionProfile) -> Result<(), SftpError> {
        let settings = self.settings.read().clone();
        let session = Session::connect(self.connector.as_ref(), profile, &settings).await?;
        let result = session.list_directory("/").await.map(|_| ());
        session.close().await;
        result
    }

    /// Stop transfers and close the current session
    pub async fn disconnect(&self) {
        let _guard = self.lifecycle.lock().await;
        self.teardown().await;
        self.persist().await;
    }

    async fn teardown(&self) {
        let active = self.active.write().take();
        if let Some(active) = active {
            info!("Disconnecting {}", active.session.profile().display_id());
            active.engine.shutdown();
            active.session.close().await;
        }
    }

    /// Engine of the current session
    pub fn engine(&self) -> Result<Arc<TransferEngine>, SftpError> {
        match self.active.read().as_ref() {
            Some(active) if active.session.is_connected() => Ok(active.engine.clone()),
            Some(active) if active.session.state() == SessionState::Failed => Err(
                SftpError::ConnectionLost(format!(
                    "Session {} failed",
                    active.session.profile().display_id()
                )),
            ),
            _ => Err(SftpError::NotConnected),
        }
    }

    pub fn current_profile(&self) -> Option<ConnectionProfile> {
        self.active
            .read()
            .as_ref()
            .map(|active| active.session.profile().clone())
    }

    pub fn profiles(&self) -> Vec<ConnectionProfile> {
        self.profiles.read().list().to_vec()
    }

    pub fn profile_names(&self) -> Vec<String> {
        self.profiles.read().names()
    }

    pub fn last_used_profile(&self) -> Option<ConnectionProfile> {
        self.profiles.read().last_used().cloned()
    }

    pub async fn save_profile(&self, profile: ConnectionProfile) {
        self.profiles.write().save(profile);
        self.persist().await;
    }

    /// Forget the pinned host key so the next connect accepts a new one
    pub async fn forget_host_key(&self, name: &str) -> bool {
        let forgotten = self.profiles.write().forget_host_key(name);
        if forgotten {
            info!("Forgot host key for {}", name);
            self.persist().await;
        }
        forgotten
    }

    pub async fn remove_profile(&self, name: &str) -> Option<ConnectionProfile> {
        let removed = self.profiles.write().remove(name);
        if removed.is_some() {
            self.persist().await;
        }
        removed
    }

    pub fn settings(&self) -> Settings {
        self.settings.read().clone()
    }

    /// Applies to sessions opened from now on
    pub async fn update_settings(&self, settings: Settings) {
        *self.settings.write() = settings;
        self.persist().await;
    }

    pub fn history(&self) -> Vec<TransferRecord> {
        self.history.lock().all()
    }

    pub async fn clear_history(&self) {
        self.history.lock().clear();
        self.persist().await;
    }

    /// Current document, as it would be written to disk
    pub fn to_config(&self) -> ConfigFile {
        let mut config = ConfigFile {
            settings: self.settings.read().clone(),
            history: self.history.lock().all(),
            ..Default::default()
        };
        self.profiles.read().apply_to(&mut config);
        config
    }

    /// Write the document now
    pub async fn save(&self) -> Result<(), SftpError> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        storage
            .save(&self.to_config())
            .await
            .map_err(|e| SftpError::Protocol(format!("Failed to save config: {}", e)))
    }

    async fn persist(&self) {
        if let Err(e) = self.save().await {
            warn!("{}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::sftp::memory::{MemoryConnector, MemoryFs};
    use crate::sftp::TransferRequest;
    use tempfile::tempdir;

    fn manager(fs: &MemoryFs) -> ConnectionManager {
        ConnectionManager::new(Arc::new(MemoryConnector::new(fs.clone(), "pi", "raspberry")))
    }

    fn profile(password: &str) -> ConnectionProfile {
        ConnectionProfile::new("garden-pi", "192.168.1.20", "pi", 22)
            .with_credential(AuthMethod::password(password))
    }

    #[tokio::test]
    async fn test_wrong_credential_stays_disconnected() {
        let fs = MemoryFs::new();
        let manager = manager(&fs);

        let result = manager.connect(profile("wrong")).await;
        match result {
            Err(e) => {
                assert!(matches!(e, SftpError::Auth(_)));
                assert!(e.requires_reconnect());
            }
            Ok(()) => panic!("connect should fail"),
        }
        assert_eq!(manager.state(), SessionState::Disconnected);
        assert!(matches!(manager.engine(), Err(SftpError::NotConnected)));
        assert!(manager.profiles().is_empty());
        assert!(manager.last_used_profile().is_none());
    }

    #[tokio::test]
    async fn test_connect_saves_and_marks_used() {
        let fs = MemoryFs::new();
        let manager = manager(&fs);

        manager.connect(profile("raspberry")).await.unwrap();
        assert_eq!(manager.state(), SessionState::Connected);
        assert_eq!(manager.profile_names(), vec!["garden-pi"]);
        assert_eq!(manager.last_used_profile().unwrap().name, "garden-pi");

        // Reconnecting with the same name never duplicates the profile
        manager.connect(profile("raspberry")).await.unwrap();
        assert_eq!(manager.profiles().len(), 1);

        manager.disconnect().await;
        assert_eq!(manager.state(), SessionState::Disconnected);
        assert!(matches!(manager.engine(), Err(SftpError::NotConnected)));
    }

    #[tokio::test]
    async fn test_quick_connect_uses_display_id() {
        let fs = MemoryFs::new();
        let manager = manager(&fs);

        manager
            .quick_connect("192.168.1.20", "pi", 2222, AuthMethod::password("raspberry"))
            .await
            .unwrap();
        assert_eq!(manager.current_profile().unwrap().name, "pi@192.168.1.20:2222");
    }

    #[tokio::test]
    async fn test_lost_session_reports_connection_lost() {
        let fs = MemoryFs::new();
        let manager = manager(&fs);
        manager.connect(profile("raspberry")).await.unwrap();

        let engine = manager.engine().unwrap();
        fs.drop_connection();
        assert!(engine.list_directory("/").await.is_err());

        assert_eq!(manager.state(), SessionState::Failed);
        assert!(matches!(manager.engine(), Err(SftpError::ConnectionLost(_))));
    }

    #[tokio::test]
    async fn test_test_connection() {
        let fs = MemoryFs::new();
        let manager = manager(&fs);

        manager.test_connection(profile("raspberry")).await.unwrap();
        assert!(manager.test_connection(profile("nope")).await.is_err());
        assert_eq!(manager.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_persists_profiles_settings_and_history() {
        let temp = tempdir().unwrap();
        let config_path = temp.path().join("config.json");
        let local = temp.path().join("notes.txt");
        std::fs::write(&local, b"remember the milk").unwrap();

        let fs = MemoryFs::new();
        let connector: Arc<dyn Connector> =
            Arc::new(MemoryConnector::new(fs.clone(), "pi", "raspberry"));

        {
            let manager = ConnectionManager::load(
                connector.clone(),
                ConfigStorage::with_path(config_path.clone()),
            )
            .await
            .unwrap();
            manager
                .update_settings(Settings {
                    show_hidden_files: true,
                    ..Default::default()
                })
                .await;
            manager.connect(profile("raspberry")).await.unwrap();

            let engine = manager.engine().unwrap();
            let mut rx = engine.subscribe();
            engine
                .enqueue(vec![TransferRequest::upload(&local, "/notes.txt")])
                .await
                .unwrap();
            loop {
                if rx.recv().await.unwrap().is_terminal() {
                    break;
                }
            }
            manager.disconnect().await;
        }

        let manager = ConnectionManager::load(connector, ConfigStorage::with_path(config_path.clone()))
            .await
            .unwrap();
        assert_eq!(manager.profile_names(), vec!["garden-pi"]);
        assert_eq!(manager.last_used_profile().unwrap().host, "192.168.1.20");
        assert!(manager.settings().show_hidden_files);
        assert_eq!(manager.history().len(), 1);

        let raw = std::fs::read_to_string(&config_path).unwrap();
        assert!(!raw.contains("raspberry"));

        manager.clear_history().await;
        assert!(manager.history().is_empty());
        assert!(manager.remove_profile("garden-pi").await.is_some());
        assert!(manager.last_used_profile().is_none());
    }

    #[tokio::test]
    async fn test_abandoned_connect_returns_to_disconnected() {
        let fs = MemoryFs::new();
        fs.set_delay(Duration::from_millis(500));
        let manager = Arc::new(manager(&fs));

        let pending = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.connect(profile("raspberry")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.state(), SessionState::Connecting);

        pending.abort();
        let _ = pending.await;
        assert_eq!(manager.state(), SessionState::Disconnected);
        assert!(matches!(manager.engine(), Err(SftpError::NotConnected)));
    }

    #[tokio::test]
    async fn test_host_key_pinned_on_first_connect() {
        let fs = MemoryFs::new();
        fs.set_host_key("SHA256:Zmlyc3Qta2V5");
        let manager = manager(&fs);

        manager.connect(profile("raspberry")).await.unwrap();
        assert_eq!(
            manager.profiles()[0].host_key.as_deref(),
            Some("SHA256:Zmlyc3Qta2V5")
        );
        manager.disconnect().await;

        // Server key changes: both the saved profile and a fresh one are refused
        fs.set_host_key("SHA256:c2Vjb25kLWtleQ");
        let result = manager
            .connect_saved("garden-pi", AuthMethod::password("raspberry"))
            .await;
        assert!(matches!(result, Err(SftpError::HostKeyMismatch(_))));
        assert!(matches!(
            manager.connect(profile("raspberry")).await,
            Err(SftpError::HostKeyMismatch(_))
        ));
        assert_eq!(manager.state(), SessionState::Disconnected);

        assert!(manager.forget_host_key("garden-pi").await);
        manager
            .connect_saved("garden-pi", AuthMethod::password("raspberry"))
            .await
            .unwrap();
        assert_eq!(
            manager.profiles()[0].host_key.as_deref(),
            Some("SHA256:c2Vjb25kLWtleQ")
        );
    }

    #[tokio::test]
    async fn test_transfer_after_disconnect_is_refused() {
        let temp = tempdir().unwrap();
        let local = temp.path().join("a.txt");
        std::fs::write(&local, b"a").unwrap();

        let fs = MemoryFs::new();
        let manager = manager(&fs);
        manager.connect(profile("raspberry")).await.unwrap();
        let engine = manager.engine().unwrap();
        let mut rx = engine.subscribe();

        manager.disconnect().await;
        assert!(matches!(
            engine
                .enqueue(vec![TransferRequest::upload(&local, "/a.txt")])
                .await,
            Err(SftpError::ConnectionClosed)
        ));
        assert!(rx.try_recv().is_err());
    }
}
