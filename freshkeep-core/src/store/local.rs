//! Durable key-value device storage.
//!
//! Values are opaque strings, one per key. The sync facade keeps the JSON
//! encoded item list under [`ITEMS_KEY`] and the guest identity under
//! [`DEVICE_ID_KEY`].
//!
//! Storage layout of [`FileStore`]:
//! ```text
//! ~/.local/share/freshkeep/
//! ├── freshkeep-items        # JSON array of items
//! ├── freshkeep-device-id    # guest identifier
//! └── freshkeep-session      # signed-in session (JSON)
//! ```

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use thiserror::Error;

/// Key holding the item list.
pub const ITEMS_KEY: &str = "freshkeep-items";

/// Key holding the generated guest identifier.
pub const DEVICE_ID_KEY: &str = "freshkeep-device-id";

/// Key holding the persisted auth session.
pub const SESSION_KEY: &str = "freshkeep-session";

#[derive(Error, Debug)]
pub enum LocalStoreError {
    #[error("I/O error on '{0}': {1}")]
    Io(PathBuf, #[source] io::Error),

    #[error("Local storage lock poisoned")]
    Poisoned,

    #[error("Failed to encode local data: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Key-value storage on the device.
///
/// Implementations are synchronous; callers treat them as fast and
/// non-blocking.
pub trait LocalStore: Send + Sync {
    /// Returns `Ok(None)` if the key has never been written.
    fn read(&self, key: &str) -> Result<Option<String>, LocalStoreError>;

    /// Replaces the whole value stored under `key`.
    fn write(&self, key: &str, value: &str) -> Result<(), LocalStoreError>;

    /// Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<(), LocalStoreError>;
}

/// File-backed store: one file per key in a data directory.
#[derive(Clone, Debug)]
pub struct FileStore {
    data_dir: PathBuf,
}

impl FileStore {
    pub fn new(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }

    /// Returns the file path for a key.
    ///
    /// Characters outside `[A-Za-z0-9._-]` are replaced so a key can never
    /// escape the data directory.
    pub fn path(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let name = name.trim_start_matches('.');
        self.data_dir.join(if name.is_empty() { "_" } else { name })
    }
}

impl LocalStore for FileStore {
    fn read(&self, key: &str) -> Result<Option<String>, LocalStoreError> {
        let path = self.path(key);

        match fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(LocalStoreError::Io(path, e)),
        }
    }

    fn write(&self, key: &str, value: &str) -> Result<(), LocalStoreError> {
        fs::create_dir_all(&self.data_dir)
            .map_err(|e| LocalStoreError::Io(self.data_dir.clone(), e))?;

        // Write to a sibling temp file first so a crash never leaves a
        // truncated value behind.
        let path = self.path(key);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, value).map_err(|e| LocalStoreError::Io(tmp.clone(), e))?;
        fs::rename(&tmp, &path).map_err(|e| LocalStoreError::Io(path, e))?;

        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), LocalStoreError> {
        let path = self.path(key);

        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LocalStoreError::Io(path, e)),
        }
    }
}

/// In-memory store, lost when dropped.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStore for MemoryStore {
    fn read(&self, key: &str) -> Result<Option<String>, LocalStoreError> {
        let entries = self.entries.lock().map_err(|_| LocalStoreError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> Result<(), LocalStoreError> {
        let mut entries = self.entries.lock().map_err(|_| LocalStoreError::Poisoned)?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), LocalStoreError> {
        let mut entries = self.entries.lock().map_err(|_| LocalStoreError::Poisoned)?;
        entries.remove(key);
        Ok(())
    }
}
