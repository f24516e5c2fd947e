//! Durable key-value state.
//!
//! The crash tracker persists two small string entries across sessions.
//! Where they live depends on the platform: a JSON file natively,
//! `localStorage` in the browser, or plain memory in tests.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};

use crate::error::StateError;

/// A string key-value store. Absent keys read as `None`.
pub trait StateStore {
    fn get(&self, key: &str) -> Result<Option<String>, StateError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StateError>;

    fn remove(&self, key: &str) -> Result<(), StateError>;
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    entries: RefCell<HashMap<String, String>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-populated with `entries`.
    pub fn with_entries<'a>(entries: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let store = Self::new();
        store.entries.borrow_mut().extend(
            entries
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string())),
        );
        store
    }
}

impl StateStore for MemoryStateStore {
    fn get(&self, key: &str) -> Result<Option<String>, StateError> {
        Ok(self.entries.borrow().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StateError> {
        self.entries.borrow_mut().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StateError> {
        self.entries.borrow_mut().remove(key);
        Ok(())
    }
}

#[cfg(not(target_arch = "wasm32"))]
pub use file::FileStateStore;

#[cfg(not(target_arch = "wasm32"))]
mod file {
    use std::fs;
    use std::path::{Path, PathBuf};

    use super::*;

    /// Store backed by a JSON object on disk.
    ///
    /// Every call re-reads the file, so separate processes observe each
    /// other's writes. Writes go through a temporary file and a rename.
    #[derive(Debug, Clone)]
    pub struct FileStateStore {
        path: PathBuf,
    }

    impl FileStateStore {
        pub fn new(path: impl Into<PathBuf>) -> Self {
            Self { path: path.into() }
        }

        pub fn path(&self) -> &Path {
            &self.path
        }

        fn read(&self) -> Result<BTreeMap<String, String>, StateError> {
            if !self.path.exists() {
                return Ok(BTreeMap::new());
            }
            let content = fs::read_to_string(&self.path)?;
            if content.trim().is_empty() {
                return Ok(BTreeMap::new());
            }
            serde_json::from_str(&content)
                .map_err(|e| StateError::Corrupt(format!("{}: {}", self.path.display(), e)))
        }

        fn write(&self, entries: &BTreeMap<String, String>) -> Result<(), StateError> {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)?;
            }
            let content = serde_json::to_string_pretty(entries)
                .map_err(|e| StateError::Corrupt(e.to_string()))?;
            let temp_path = self.path.with_extension("tmp");
            fs::write(&temp_path, content)?;
            fs::rename(&temp_path, &self.path)?;
            Ok(())
        }
    }

    impl StateStore for FileStateStore {
        fn get(&self, key: &str) -> Result<Option<String>, StateError> {
            Ok(self.read()?.remove(key))
        }

        fn set(&self, key: &str, value: &str) -> Result<(), StateError> {
            let mut entries = self.read()?;
            entries.insert(key.to_string(), value.to_string());
            self.write(&entries)
        }

        fn remove(&self, key: &str) -> Result<(), StateError> {
            let mut entries = self.read()?;
            if entries.remove(key).is_some() {
                self.write(&entries)?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store() {
        let store = MemoryStateStore::with_entries([("a", "1")]);
        assert_eq!(store.get("a").unwrap().as_deref(), Some("1"));
        assert_eq!(store.get("b").unwrap(), None);

        store.set("b", "2").unwrap();
        store.remove("a").unwrap();
        assert_eq!(store.get("a").unwrap(), None);
        assert_eq!(store.get("b").unwrap().as_deref(), Some("2"));
    }

    #[test]
    fn test_file_store_persists_between_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let first = FileStateStore::new(&path);
        assert_eq!(first.get("k").unwrap(), None);
        first.set("k", "running").unwrap();

        let second = FileStateStore::new(&path);
        assert_eq!(second.get("k").unwrap().as_deref(), Some("running"));
        second.remove("k").unwrap();
        assert_eq!(first.get("k").unwrap(), None);
    }

    #[test]
    fn test_file_store_reports_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = FileStateStore::new(&path);
        assert!(matches!(store.get("k"), Err(StateError::Corrupt(_))));
    }
}
