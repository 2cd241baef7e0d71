//! Connection Profiles
//!
//! In-memory store of named connection profiles. Persistence is handled by
//! [`ConfigStorage`](super::ConfigStorage); this module does no I/O.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::types::{ConfigFile, SavedConnection};
use crate::ssh::{AuthMethod, SshConfig};

/// A named remote endpoint
#[derive(Clone, Serialize, Deserialize)]
pub struct ConnectionProfile {
    pub name: String,
    pub host: String,
    pub user: String,
    pub port: u16,
    /// Expected host key fingerprint; `None` accepts and pins the first key seen
    #[serde(default)]
    pub host_key: Option<String>,
    /// Never persisted
    #[serde(skip)]
    pub credential: Option<AuthMethod>,
}

impl ConnectionProfile {
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        user: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            user: user.into(),
            port,
            host_key: None,
            credential: None,
        }
    }

    /// Ad-hoc profile named by its display id
    pub fn quick(host: impl Into<String>, user: impl Into<String>, port: u16) -> Self {
        let mut profile = Self::new(String::new(), host, user, port);
        profile.name = profile.display_id();
        profile
    }

    pub fn with_credential(mut self, credential: AuthMethod) -> Self {
        self.credential = Some(credential);
        self
    }

    /// `user@host:port`
    pub fn display_id(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }

    /// Build the transport configuration; requires a credential
    pub fn ssh_config(&self, timeout_secs: u64) -> Option<SshConfig> {
        let auth = self.credential.clone()?;
        Some(SshConfig {
            host: self.host.clone(),
            port: self.port,
            username: self.user.clone(),
            auth,
            timeout_secs,
            host_key: self.host_key.clone(),
        })
    }

    fn to_saved(&self) -> SavedConnection {
        SavedConnection {
            name: self.name.clone(),
            ip: self.host.clone(),
            user: self.user.clone(),
            port: self.port,
            host_key: self.host_key.clone(),
        }
    }
}

impl From<SavedConnection> for ConnectionProfile {
    fn from(saved: SavedConnection) -> Self {
        let mut profile = Self::new(saved.name, saved.ip, saved.user, saved.port);
        profile.host_key = saved.host_key;
        profile
    }
}

impl fmt::Debug for ConnectionProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionProfile")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("user", &self.user)
            .field("port", &self.port)
            .field("host_key", &self.host_key)
            .field("credential", &self.credential)
            .finish()
    }
}

/// Name-keyed profile store, insertion ordered
#[derive(Debug, Default, Clone)]
pub struct ProfileStore {
    profiles: Vec<ConnectionProfile>,
    last_used: Option<String>,
}

impl ProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace by name; a replaced profile keeps its position
    pub fn save(&mut self, profile: ConnectionProfile) {
        match self.profiles.iter_mut().find(|p| p.name == profile.name) {
            Some(existing) => {
                tracing::debug!("Updating profile {}", profile.name);
                *existing = profile;
            }
            None => {
                tracing::debug!("Adding profile {}", profile.name);
                self.profiles.push(profile);
            }
        }
    }

    pub fn list(&self) -> &[ConnectionProfile] {
        &self.profiles
    }

    pub fn get(&self, name: &str) -> Option<&ConnectionProfile> {
        self.profiles.iter().find(|p| p.name == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.profiles.iter().map(|p| p.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn remove(&mut self, name: &str) -> Option<ConnectionProfile> {
        let idx = self.profiles.iter().position(|p| p.name == name)?;
        if self.last_used.as_deref() == Some(name) {
            self.last_used = None;
        }
        Some(self.profiles.remove(idx))
    }

    pub fn last_used(&self) -> Option<&ConnectionProfile> {
        self.last_used.as_deref().and_then(|name| self.get(name))
    }

    /// Record a successful connect; unknown names are ignored
    pub fn mark_used(&mut self, name: &str) {
        if self.get(name).is_some() {
            self.last_used = Some(name.to_string());
        } else {
            tracing::warn!("mark_used: unknown profile {}", name);
        }
    }

    /// Pin `fingerprint` for `name` unless a key is already pinned.
    ///
    /// Returns whether the profile changed.
    pub fn pin_host_key(&mut self, name: &str, fingerprint: &str) -> bool {
        match self.profiles.iter_mut().find(|p| p.name == name) {
            Some(profile) if profile.host_key.is_none() => {
                tracing::info!("Pinning host key {} for {}", fingerprint, name);
                profile.host_key = Some(fingerprint.to_string());
                true
            }
            _ => false,
        }
    }

    /// Drop the pinned key so the next connect accepts a new one
    pub fn forget_host_key(&mut self, name: &str) -> bool {
        match self.profiles.iter_mut().find(|p| p.name == name) {
            Some(profile) => profile.host_key.take().is_some(),
            None => false,
        }
    }

    /// Build a store from the persisted document, skipping invalid entries
    pub fn from_config(config: &ConfigFile) -> Self {
        let mut store = Self::new();

        for saved in &config.connections {
            if saved.name.trim().is_empty() || saved.ip.trim().is_empty() {
                tracing::warn!("Skipping saved connection with empty name or host: {:?}", saved);
                continue;
            }
            if store.get(&saved.name).is_some() {
                tracing::warn!("Duplicate saved connection {}, keeping the last one", saved.name);
            }
            store.save(saved.clone().into());
        }

        if let Some(name) = &config.last_connection {
            if store.get(name).is_some() {
                store.last_used = Some(name.clone());
            } else {
                tracing::warn!("last_connection {} names no saved connection", name);
            }
        }

        store
    }

    /// Write profiles and last-used marker into the persisted document
    pub fn apply_to(&self, config: &mut ConfigFile) {
        config.connections = self.profiles.iter().map(ConnectionProfile::to_saved).collect();
        config.last_connection = self.last_used.clone();
    }
}
