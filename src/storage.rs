//! Local durable key-value storage.
//!
//! [`Storage`] stores JSON values under string keys in a [`KeyValueStore`]:
//!
//! - [`MemoryStore`]: process-local, for tests and ephemeral sessions
//! - [`FileStore`]: one JSON file per key in a directory, by default the
//!   platform data directory:
//!   - Linux: `~/.local/share/studio-cache/`
//!   - macOS: `~/Library/Application Support/studio-cache/`
//!   - Windows: `%APPDATA%\studio-cache\`
//!
//! Values written with [`Storage::set_with_expiry`] carry an absolute expiry and
//! are evicted by the first read after it passes. Time comes from a [`Clock`], so
//! tests can drive it with [`ManualClock`].

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

const LAST_MODEL_KEY: &str = "last-visited-model";
const PROVIDER_TOKEN_PREFIX: &str = "provider-token:";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Stored value is not valid JSON: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("No platform data directory available")]
    NoDataDir,
}

/// Raw string storage.
pub trait KeyValueStore: Send + Sync {
    fn get_raw(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set_raw(&self, key: &str, value: &str) -> Result<(), StorageError>;
    /// Removing an absent key is not an error.
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    map: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get_raw(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.map.get(key).map(|v| v.value().clone()))
    }

    fn set_raw(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.map.remove(key);
        Ok(())
    }
}

/// One `<encoded key>.json` file per key.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Uses `dir`, creating it if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Uses `studio-cache/` under the platform data directory.
    pub fn open_default() -> Result<Self, StorageError> {
        Self::new(Self::default_dir()?)
    }

    pub fn default_dir() -> Result<PathBuf, StorageError> {
        dirs::data_dir()
            .map(|dir| dir.join("studio-cache"))
            .ok_or(StorageError::NoDataDir)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> PathBuf {
        // Form-encoding maps every key to a distinct, filesystem-safe name.
        let name: String = url::form_urlencoded::byte_serialize(key.as_bytes()).collect();
        self.dir.join(format!("{name}.json"))
    }
}

impl KeyValueStore for FileStore {
    fn get_raw(&self, key: &str) -> Result<Option<String>, StorageError> {
        match fs::read_to_string(self.path(key)) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set_raw(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let path = self.path(key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.path(key)) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

/// Source of wall-clock time for expiry.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub const fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Starts at the Unix epoch.
    pub fn at_epoch() -> Self {
        Self::new(DateTime::UNIX_EPOCH)
    }

    pub fn advance(&self, by: Duration) {
        let by = TimeDelta::from_std(by).unwrap_or(TimeDelta::MAX);
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now = now.checked_add_signed(by).unwrap_or(DateTime::<Utc>::MAX_UTC);
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Serialize, Deserialize)]
struct Expiring<T> {
    value: T,
    /// Unix milliseconds.
    expiry: i64,
}

/// Typed JSON storage over a [`KeyValueStore`].
#[derive(Clone)]
pub struct Storage {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").finish_non_exhaustive()
    }
}

impl Storage {
    pub fn new(store: impl KeyValueStore + 'static) -> Self {
        Self::with_clock(Arc::new(store), Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// In-memory storage with the system clock.
    pub fn in_memory() -> Self {
        Self::new(MemoryStore::new())
    }

    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let json = serde_json::to_string(value)?;
        self.store.set_raw(key, &json)
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        self.store
            .get_raw(key)?
            .map(|json| serde_json::from_str(&json))
            .transpose()
            .map_err(Into::into)
    }

    pub fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.store.remove(key)
    }

    /// Stores `value` until `ttl` from now.
    pub fn set_with_expiry<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), StorageError> {
        let ttl = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let expiry = self.clock.now().timestamp_millis().saturating_add(ttl);
        self.set(key, &Expiring { value, expiry })
    }

    /// Reads a value stored with [`set_with_expiry`](Self::set_with_expiry).
    ///
    /// Once the current time is past the expiry the entry is removed and `None`
    /// returned. A value is still readable at exactly its expiry instant.
    pub fn get_with_expiry<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        let Some(item) = self.get::<Expiring<T>>(key)? else {
            return Ok(None);
        };
        if self.clock.now().timestamp_millis() > item.expiry {
            debug!(key, "evicting expired value");
            self.store.remove(key)?;
            return Ok(None);
        }
        Ok(Some(item.value))
    }

    pub fn remember_last_model(&self, model_id: &str) -> Result<(), StorageError> {
        self.set(LAST_MODEL_KEY, model_id)
    }

    /// The model the user last opened, if any. Unreadable values count as absent.
    pub fn last_model(&self) -> Option<String> {
        self.get(LAST_MODEL_KEY).unwrap_or_else(|error| {
            warn!(%error, "could not read last model");
            None
        })
    }

    /// Stores a third-party provider token, optionally expiring.
    pub fn save_provider_token(
        &self,
        provider: &str,
        token: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StorageError> {
        let key = format!("{PROVIDER_TOKEN_PREFIX}{provider}");
        match ttl {
            Some(ttl) => self.set_with_expiry(&key, &token, ttl),
            None => self.set_with_expiry(&key, &token, Duration::MAX),
        }
    }

    pub fn provider_token(&self, provider: &str) -> Result<Option<String>, StorageError> {
        self.get_with_expiry(&format!("{PROVIDER_TOKEN_PREFIX}{provider}"))
    }

    pub fn remove_provider_token(&self, provider: &str) -> Result<(), StorageError> {
        self.remove(&format!("{PROVIDER_TOKEN_PREFIX}{provider}"))
    }
}
