//! Key-Value Store Abstraction
//!
//! Persistence for the identity store. Only string keys and string values are
//! needed, so the interface is intentionally narrow.

use crate::error::StoreError;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// Key under which the self identifier is persisted
pub const USER_ID_KEY: &str = "tether.userId";

/// Key under which the comma-joined whitelist is persisted
pub const WHITELIST_KEY: &str = "tether.whitelist";

/// Synchronous string key-value storage
pub trait KeyValueStore: Send + Sync {
    /// Read a value, `None` if the key was never written
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a value, replacing any previous one
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

/// In-memory store for tests and ephemeral sessions
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
    offline: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with entries
    pub fn with_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let store = Self::new();
        store
            .entries
            .lock()
            .extend(entries.into_iter().map(|(k, v)| (k.into(), v.into())));
        store
    }

    /// Make every subsequent operation fail with [`StoreError::Offline`]
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Offline);
        }
        Ok(())
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check_online()?;
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.check_online()?;
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// JSON-object file store
///
/// The whole file is rewritten on each `set` via temp file and rename, so a
/// crash mid-write leaves the previous contents intact.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    /// Create a store backed by `path`; the file is created on first write
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Location of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self, key: &str) -> Result<BTreeMap<String, String>, StoreError> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) if contents.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(contents) => serde_json::from_str(&contents).map_err(|e| {
                StoreError::Corrupt(format!("{}: {e}", self.path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(StoreError::Io {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    fn write_all(&self, key: &str, entries: &BTreeMap<String, String>) -> Result<(), StoreError> {
        let io_err = |e: std::io::Error| StoreError::Io {
            key: key.to_string(),
            reason: e.to_string(),
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(io_err)?;
            }
        }

        let contents = serde_json::to_string_pretty(entries)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, contents).map_err(io_err)?;
        std::fs::rename(&tmp_path, &self.path).map_err(io_err)?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let _guard = self.lock.lock();
        Ok(self.read_all(key)?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock();
        let mut entries = self.read_all(key)?;
        entries.insert(key.to_string(), value.to_string());
        self.write_all(key, &entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        assert_eq!(store.get(USER_ID_KEY).unwrap(), None);

        store.set(USER_ID_KEY, "alice").unwrap();
        assert_eq!(store.get(USER_ID_KEY).unwrap().as_deref(), Some("alice"));
    }

    #[test]
    fn test_memory_store_offline() {
        let store = MemoryStore::with_entries([(WHITELIST_KEY, "*")]);
        store.set_offline(true);
        assert!(matches!(store.get(WHITELIST_KEY), Err(StoreError::Offline)));
        assert!(matches!(store.set(WHITELIST_KEY, "bob"), Err(StoreError::Offline)));

        store.set_offline(false);
        assert_eq!(store.get(WHITELIST_KEY).unwrap().as_deref(), Some("*"));
    }

    #[test]
    fn test_file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let store = FileStore::new(&path);
        assert_eq!(store.get(USER_ID_KEY).unwrap(), None);
        store.set(USER_ID_KEY, "18c2f").unwrap();
        store.set(WHITELIST_KEY, "alice,bob").unwrap();

        let reopened = FileStore::new(&path);
        assert_eq!(reopened.get(USER_ID_KEY).unwrap().as_deref(), Some("18c2f"));
        assert_eq!(
            reopened.get(WHITELIST_KEY).unwrap().as_deref(),
            Some("alice,bob")
        );
    }

    #[test]
    fn test_file_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "not json").unwrap();

        let store = FileStore::new(&path);
        assert!(matches!(store.get(USER_ID_KEY), Err(StoreError::Corrupt(_))));
    }
}
