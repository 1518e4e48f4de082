//! Durable storage for the session triple.
//!
//! The store keeps an in-memory snapshot that is loaded once at open and
//! replaced on every write, so reads never touch the backend. The backend
//! always receives the whole triple as one document.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use keyring::Entry;
use thiserror::Error;
use tracing::{debug, warn};

use super::session::{SessionData, StoredSession, TokenPair, UserProfile};
use crate::config::{Config, StorageKind};

/// Session file name in the data directory
const SESSION_FILE: &str = "session.json";

/// Keychain service name
const SERVICE_NAME: &str = "fitsocial";

/// Keychain account holding the session document
const KEYRING_ACCOUNT: &str = "session";

pub const ACCESS_TOKEN_KEY: &str = "accessToken";
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";
pub const USER_KEY: &str = "user";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize session: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Keychain error: {0}")]
    Keyring(#[from] keyring::Error),
}

/// Raw persistence for the session document.
pub trait SessionBackend: Send + Sync {
    /// The stored document, or `None` if nothing is stored.
    fn load(&self) -> Result<Option<String>, StoreError>;
    /// Replace the stored document in one step.
    fn save(&self, document: &str) -> Result<(), StoreError>;
    /// Remove the stored document. Succeeds if nothing is stored.
    fn remove(&self) -> Result<(), StoreError>;
    fn describe(&self) -> String;
}

/// `session.json` in a directory, replaced by rename.
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(SESSION_FILE),
        }
    }

    fn temp_path(&self) -> PathBuf {
        self.path.with_extension("json.tmp")
    }
}

impl SessionBackend for FileBackend {
    fn load(&self) -> Result<Option<String>, StoreError> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, document: &str) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let temp = self.temp_path();
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&temp)?;
        file.write_all(document.as_bytes())?;
        file.sync_all()?;
        std::fs::rename(&temp, &self.path)?;
        Ok(())
    }

    fn remove(&self) -> Result<(), StoreError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// The session document as a single secret in the OS keychain.
pub struct KeyringBackend {
    service: String,
}

impl KeyringBackend {
    pub fn new() -> Self {
        Self::with_service(SERVICE_NAME)
    }

    pub fn with_service(service: &str) -> Self {
        Self {
            service: service.to_string(),
        }
    }

    fn entry(&self) -> Result<Entry, StoreError> {
        Ok(Entry::new(&self.service, KEYRING_ACCOUNT)?)
    }
}

impl Default for KeyringBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionBackend for KeyringBackend {
    fn load(&self) -> Result<Option<String>, StoreError> {
        match self.entry()?.get_password() {
            Ok(document) => Ok(Some(document)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, document: &str) -> Result<(), StoreError> {
        self.entry()?.set_password(document)?;
        Ok(())
    }

    fn remove(&self) -> Result<(), StoreError> {
        match self.entry()?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn describe(&self) -> String {
        format!("keychain:{}/{}", self.service, KEYRING_ACCOUNT)
    }
}

/// Encode the triple as a flat string map, the user as nested JSON text.
fn encode(session: &SessionData) -> Result<String, StoreError> {
    let mut document = BTreeMap::new();
    document.insert(ACCESS_TOKEN_KEY, session.access_token.clone());
    document.insert(REFRESH_TOKEN_KEY, session.refresh_token.clone());
    document.insert(USER_KEY, serde_json::to_string(&session.user)?);
    Ok(serde_json::to_string_pretty(&document)?)
}

fn decode(contents: &str) -> StoredSession {
    let mut document: BTreeMap<String, String> = match serde_json::from_str(contents) {
        Ok(document) => document,
        Err(e) => {
            warn!(error = %e, "Stored session is not valid JSON, ignoring it");
            return StoredSession::default();
        }
    };

    let user = document.remove(USER_KEY).and_then(|raw| {
        serde_json::from_str::<UserProfile>(&raw)
            .map_err(|e| warn!(error = %e, "Stored user profile is invalid"))
            .ok()
    });

    StoredSession {
        access_token: document.remove(ACCESS_TOKEN_KEY).filter(|t| !t.is_empty()),
        refresh_token: document.remove(REFRESH_TOKEN_KEY).filter(|t| !t.is_empty()),
        user,
    }
}

pub struct CredentialStore {
    backend: Box<dyn SessionBackend>,
    snapshot: RwLock<StoredSession>,
    // Serializes writers so the backend sees writes in snapshot order.
    write_lock: Mutex<()>,
}

impl CredentialStore {
    /// Open a store, loading whatever the backend currently holds.
    pub fn open(backend: Box<dyn SessionBackend>) -> Self {
        let snapshot = match backend.load() {
            Ok(Some(contents)) => decode(&contents),
            Ok(None) => StoredSession::default(),
            Err(e) => {
                warn!(error = %e, location = %backend.describe(), "Failed to load stored session");
                StoredSession::default()
            }
        };
        debug!(location = %backend.describe(), ?snapshot, "Credential store opened");

        Self {
            backend,
            snapshot: RwLock::new(snapshot),
            write_lock: Mutex::new(()),
        }
    }

    pub fn file(dir: impl AsRef<Path>) -> Self {
        Self::open(Box::new(FileBackend::new(dir)))
    }

    pub fn keyring() -> Self {
        Self::open(Box::new(KeyringBackend::new()))
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Ok(match config.storage {
            StorageKind::File => Self::file(config.data_dir()?),
            StorageKind::Keyring => Self::keyring(),
        })
    }

    /// Current contents. Never touches the backend.
    pub fn read(&self) -> StoredSession {
        self.snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .access_token
            .clone()
    }

    /// Replace the whole triple.
    pub(crate) fn write(&self, session: SessionData) {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        self.persist(&session);
        self.swap(session.into());
    }

    /// Install a refreshed token pair, keeping the cached user.
    ///
    /// Only writes while the stored session is still the one holding
    /// `expected_refresh`. Returns `false` without writing otherwise.
    pub(crate) fn replace_tokens(&self, expected_refresh: &str, pair: TokenPair) -> bool {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        let Some(current) = self.read().complete() else {
            return false;
        };
        if current.refresh_token != expected_refresh {
            debug!("Stored session changed during refresh, discarding new tokens");
            return false;
        }
        let next = current.with_tokens(pair);
        self.persist(&next);
        self.swap(next.into());
        true
    }

    /// Edit the cached user in place, keeping both tokens.
    pub(crate) fn update_user(&self, edit: impl FnOnce(&mut UserProfile)) -> Option<UserProfile> {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut next = self.read().complete()?;
        edit(&mut next.user);
        let user = next.user.clone();
        self.persist(&next);
        self.swap(next.into());
        Some(user)
    }

    /// Remove all three fields. Idempotent.
    pub(crate) fn clear(&self) {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        if let Err(e) = self.backend.remove() {
            warn!(error = %e, location = %self.backend.describe(), "Failed to remove stored session");
        }
        self.swap(StoredSession::default());
    }

    /// Clear only if the stored session still holds `refresh_token`.
    ///
    /// Returns the removed contents, or `None` if a different session (or
    /// nothing) was stored.
    pub(crate) fn clear_if(&self, refresh_token: &str) -> Option<StoredSession> {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        let current = self.read();
        if current.refresh_token.as_deref() != Some(refresh_token) {
            return None;
        }
        if let Err(e) = self.backend.remove() {
            warn!(error = %e, location = %self.backend.describe(), "Failed to remove stored session");
        }
        self.swap(StoredSession::default());
        Some(current)
    }

    fn persist(&self, session: &SessionData) {
        let result = encode(session).and_then(|document| self.backend.save(&document));
        if let Err(e) = result {
            warn!(error = %e, location = %self.backend.describe(), "Failed to persist session");
        }
    }

    fn swap(&self, next: StoredSession) {
        *self.snapshot.write().unwrap_or_else(|p| p.into_inner()) = next;
    }
}
