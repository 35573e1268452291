//! Persisted key/value storage
//!
//! Two scopes mirror what a page gets from its host: `local` survives
//! indefinitely, `session` lives for one browsing session. Access is plain
//! read-then-write with no cross-process coordination; two processes sharing
//! a [`FileStorage`] may race on the final value of a key.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};

/// Stable key names. Changing any of these loses returning visitors.
pub mod keys {
    /// Local: anonymous visitor id
    pub const ANONYMOUS_ID: &str = "did";
    /// Local: opt-out flag, `"true"` when set
    pub const OPT_OUT: &str = "sl_opt_out";
    /// Session: session id
    pub const SESSION_ID: &str = "did_session";
    /// Session: last activity, epoch milliseconds
    pub const SESSION_TIMESTAMP: &str = "did_session_timestamp";
    /// Session: session start, epoch milliseconds
    pub const SESSION_START: &str = "did_session_start";
}

/// String key/value store
pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// Both storage scopes a tracker needs
#[derive(Clone)]
pub struct HostStorage {
    pub local: Arc<dyn Storage>,
    pub session: Arc<dyn Storage>,
}

impl HostStorage {
    pub fn new(local: Arc<dyn Storage>, session: Arc<dyn Storage>) -> Self {
        Self { local, session }
    }

    /// Fresh in-memory scopes
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStorage::new()), Arc::new(MemoryStorage::new()))
    }

    /// File-backed scopes under `dir` (`local.json` and `session.json`)
    pub fn in_dir(dir: &Path) -> Result<Self> {
        Ok(Self::new(
            Arc::new(FileStorage::open(dir.join("local.json"))?),
            Arc::new(FileStorage::open(dir.join("session.json"))?),
        ))
    }
}

/// In-memory storage.
///
/// `set_unavailable(true)` makes every call fail the way a browser with
/// storage disabled (or over quota) does.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
    unavailable: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage that rejects every read and write
    pub fn unavailable() -> Self {
        let storage = Self::new();
        storage.set_unavailable(true);
        storage
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Drop every entry (what a user clearing site data does)
    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Storage("storage is unavailable".to_string()));
        }
        Ok(())
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.entries
            .lock()
            .map_err(|_| Error::Storage("storage lock poisoned".to_string()))
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.check()?;
        Ok(self.entries()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.check()?;
        self.entries()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.check()?;
        self.entries()?.remove(key);
        Ok(())
    }
}

/// JSON-file storage with write-through.
///
/// The file is read once at open; every mutation rewrites it.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    entries: Mutex<HashMap<String, String>>,
}

impl FileStorage {
    /// Open (or lazily create) the store at `path`
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            if content.trim().is_empty() {
                HashMap::new()
            } else {
                serde_json::from_str(&content)?
            }
        } else {
            HashMap::new()
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &HashMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(entries)?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.entries
            .lock()
            .map_err(|_| Error::Storage("storage lock poisoned".to_string()))
    }
}

impl Storage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries()?;
        let previous = entries.insert(key.to_string(), value.to_string());
        if let Err(e) = self.persist(&entries) {
            // Memory must not run ahead of the file.
            match previous {
                Some(old) => entries.insert(key.to_string(), old),
                None => entries.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries()?;
        if let Some(old) = entries.remove(key) {
            if let Err(e) = self.persist(&entries) {
                entries.insert(key.to_string(), old);
                return Err(e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_memory_storage_roundtrip() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.get("k").unwrap(), None);

        storage.set("k", "v").unwrap();
        assert_eq!(storage.get("k").unwrap().as_deref(), Some("v"));

        storage.remove("k").unwrap();
        assert_eq!(storage.get("k").unwrap(), None);
    }

    #[test]
    fn test_unavailable_storage_errors() {
        let storage = MemoryStorage::unavailable();
        assert!(matches!(storage.set("k", "v"), Err(Error::Storage(_))));
        assert!(storage.get("k").is_err());

        storage.set_unavailable(false);
        storage.set("k", "v").unwrap();
        assert_eq!(storage.get("k").unwrap().as_deref(), Some("v"));
    }

    #[test]
    fn test_file_storage_failed_write_keeps_previous_value() {
        let dir = TempDir::new().unwrap();
        let profile = dir.path().join("profile");
        let storage = FileStorage::open(profile.join("local.json")).unwrap();
        storage.set("k", "v1").unwrap();

        // A plain file where the directory was makes every write fail.
        std::fs::remove_dir_all(&profile).unwrap();
        std::fs::write(&profile, "").unwrap();

        assert!(storage.set("k", "v2").is_err());
        assert!(storage.set("new", "x").is_err());
        assert!(storage.remove("k").is_err());
        assert_eq!(storage.get("k").unwrap().as_deref(), Some("v1"));
        assert_eq!(storage.get("new").unwrap(), None);
    }

    #[test]
    fn test_file_storage_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("local.json");

        let storage = FileStorage::open(&path).unwrap();
        storage.set(keys::ANONYMOUS_ID, "anon_123").unwrap();
        storage.set(keys::OPT_OUT, "true").unwrap();
        storage.remove(keys::OPT_OUT).unwrap();
        drop(storage);

        let reopened = FileStorage::open(&path).unwrap();
        assert_eq!(
            reopened.get(keys::ANONYMOUS_ID).unwrap().as_deref(),
            Some("anon_123")
        );
        assert_eq!(reopened.get(keys::OPT_OUT).unwrap(), None);
    }

    #[test]
    fn test_file_storage_rejects_corrupt_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("local.json");
        std::fs::write(&path, "{not json").unwrap();

        assert!(matches!(FileStorage::open(&path), Err(Error::Json(_))));
    }

    #[test]
    fn test_host_storage_in_dir() {
        let dir = TempDir::new().unwrap();
        let storage = HostStorage::in_dir(dir.path()).unwrap();
        storage.local.set("a", "1").unwrap();
        storage.session.set("b", "2").unwrap();

        assert!(dir.path().join("local.json").exists());
        assert!(dir.path().join("session.json").exists());
        assert_eq!(storage.local.get("b").unwrap(), None);
    }
}
