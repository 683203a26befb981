//! Local Persistence
//!
//! Two small pieces of state outlive a session:
//!
//! - a key/value store (`guest_mode`, `avatar_override_url`)
//! - the location query, which remembers the current conversation as
//!   `chatId` so it can be restored after a reload
//!
//! Both are traits so surfaces can back them with whatever they have. The
//! crate ships in-memory versions and a JSON file store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

/// Key of the persisted guest-mode flag (`"true"` when set)
pub const GUEST_MODE_KEY: &str = "guest_mode";

/// Key of the cache-busted avatar URL kept after an upload
pub const AVATAR_OVERRIDE_KEY: &str = "avatar_override_url";

/// Query parameter naming the current conversation
pub const CONVERSATION_QUERY_PARAM: &str = "chatId";

/// Store key used by [`StoreLocation`]
const LOCATION_KEY_PREFIX: &str = "location.";

/// Errors from the file store
#[derive(Debug, Error)]
pub enum StorageError {
    /// Reading or writing the file failed
    #[error("storage I/O error at {path}: {source}")]
    Io {
        /// File path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The file does not contain a JSON object of strings
    #[error("corrupt storage file: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Persistent string key/value store
pub trait LocalStore: Send + Sync {
    /// Read a value
    fn get(&self, key: &str) -> Option<String>;

    /// Write a value
    fn set(&self, key: &str, value: &str);

    /// Delete a value
    fn remove(&self, key: &str);

    /// Whether the persisted guest flag is set
    fn is_local_guest(&self) -> bool {
        self.get(GUEST_MODE_KEY).as_deref() == Some("true")
    }

    /// Set or clear the persisted guest flag
    fn set_local_guest(&self, enabled: bool) {
        if enabled {
            self.set(GUEST_MODE_KEY, "true");
        } else {
            self.remove(GUEST_MODE_KEY);
        }
    }
}

/// Store that forgets everything on exit
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.values.lock().insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        self.values.lock().remove(key);
    }
}

/// Store persisted as a JSON object in one file
///
/// Every write rewrites the file. Write failures are logged and the in-memory
/// value is kept.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    values: Mutex<HashMap<String, String>>,
}

impl FileStore {
    /// Open (or lazily create) the store at `path`
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let values = if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|source| StorageError::Io {
                path: path.clone(),
                source,
            })?;
            if content.trim().is_empty() {
                HashMap::new()
            } else {
                serde_json::from_str(&content)?
            }
        } else {
            HashMap::new()
        };
        tracing::debug!(path = %path.display(), entries = values.len(), "Opened local store");
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    /// Default location: `$XDG_DATA_HOME/chat-session/storage.json`
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_local_dir().map(|p| p.join("chat-session").join("storage.json"))
    }

    /// File backing this store
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, values: &HashMap<String, String>) -> Result<(), StorageError> {
        let io_err = |source| StorageError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(values)?;
        std::fs::write(&self.path, json).map_err(io_err)
    }

    fn update(&self, apply: impl FnOnce(&mut HashMap<String, String>)) {
        let mut values = self.values.lock();
        apply(&mut values);
        if let Err(e) = self.persist(&values) {
            tracing::warn!(error = %e, "Failed to persist local store");
        }
    }
}

impl LocalStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.update(|values| {
            values.insert(key.to_string(), value.to_string());
        });
    }

    fn remove(&self, key: &str) {
        self.update(|values| {
            values.remove(key);
        });
    }
}

/// Location query holding the current conversation id
pub trait LocationSync: Send + Sync {
    /// Current `chatId` value
    fn conversation_param(&self) -> Option<String>;

    /// Set or clear `chatId`
    fn set_conversation_param(&self, value: Option<&str>);
}

/// Location kept in memory
#[derive(Debug, Default)]
pub struct MemoryLocation {
    param: Mutex<Option<String>>,
}

impl MemoryLocation {
    /// Location starting with the given `chatId`
    #[must_use]
    pub fn new(initial: Option<&str>) -> Self {
        Self {
            param: Mutex::new(initial.map(ToString::to_string)),
        }
    }
}

impl LocationSync for MemoryLocation {
    fn conversation_param(&self) -> Option<String> {
        self.param.lock().clone()
    }

    fn set_conversation_param(&self, value: Option<&str>) {
        *self.param.lock() = value.map(ToString::to_string);
    }
}

/// Location persisted in a [`LocalStore`], so a restarted client resumes the
/// last conversation
pub struct StoreLocation {
    store: Arc<dyn LocalStore>,
}

impl StoreLocation {
    /// Location backed by `store`
    #[must_use]
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self { store }
    }

    fn key() -> String {
        format!("{LOCATION_KEY_PREFIX}{CONVERSATION_QUERY_PARAM}")
    }
}

impl LocationSync for StoreLocation {
    fn conversation_param(&self) -> Option<String> {
        self.store.get(&Self::key())
    }

    fn set_conversation_param(&self, value: Option<&str>) {
        match value {
            Some(v) => self.store.set(&Self::key(), v),
            None => self.store.remove(&Self::key()),
        }
    }
}

/// Persistence handles a session works with
#[derive(Clone)]
pub struct SessionEnvironment {
    /// Key/value store
    pub store: Arc<dyn LocalStore>,
    /// Location query
    pub location: Arc<dyn LocationSync>,
}

impl SessionEnvironment {
    /// Environment with explicit store and location
    #[must_use]
    pub fn new(store: Arc<dyn LocalStore>, location: Arc<dyn LocationSync>) -> Self {
        Self { store, location }
    }

    /// Environment that persists nothing
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            location: Arc::new(MemoryLocation::default()),
        }
    }

    /// File-backed store with the location kept in the same file
    ///
    /// # Errors
    ///
    /// Returns an error if the store file cannot be read.
    pub fn file_backed(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let store: Arc<dyn LocalStore> = Arc::new(FileStore::open(path)?);
        let location = Arc::new(StoreLocation::new(Arc::clone(&store)));
        Ok(Self { store, location })
    }
}
