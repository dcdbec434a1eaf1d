//! JSON file key-value store.

use std::{
    collections::BTreeMap,
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::Mutex,
};

use push_relay_core::{KeyValueStore, traits::StoreError};
use serde_json::Value;

/// Key-value store persisted as a single JSON object file.
///
/// The whole document is cached in memory. Every `set` rewrites the file
/// through a temporary sibling that is fsynced and renamed over the
/// original, so the file on disk is always either the old or the new
/// document.
pub struct JsonFileStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, Value>>,
}

impl JsonFileStore {
    /// Open the store at `path`, creating parent directories.
    ///
    /// A missing file is an empty store.
    ///
    /// # Errors
    /// Returns error if the file exists but cannot be read or parsed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let values = match fs::read(&path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => BTreeMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        tracing::debug!(path = %path.display(), keys = values.len(), "Opened store");

        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, values: &BTreeMap<String, Value>) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(values)?;
        let temp_path = self.path.with_extension("tmp");

        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }

        fs::rename(&temp_path, &self.path)?;

        #[cfg(unix)]
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::File::open(parent)?.sync_all()?;
        }

        Ok(())
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self
            .values
            .lock()
            .map_err(|e| StoreError::Internal(e.to_string()))?
            .get(key)
            .cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let mut values = self
            .values
            .lock()
            .map_err(|e| StoreError::Internal(e.to_string()))?;

        let mut next = values.clone();
        next.insert(key.to_string(), value);
        self.persist(&next)?;
        *values = next;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("nested").join("store.json")).unwrap();
        assert_eq!(store.get("anything").unwrap(), None);
        assert!(!store.path().exists());
    }

    #[test]
    fn test_values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        let store = JsonFileStore::open(&path).unwrap();
        store.set("u1-senderId", Value::from("S1")).unwrap();
        store
            .set("u1-persistentIds", serde_json::json!(["d1", "d2"]))
            .unwrap();
        drop(store);

        let reopened = JsonFileStore::open(&path).unwrap();
        assert_eq!(reopened.get("u1-senderId").unwrap(), Some(Value::from("S1")));
        assert_eq!(
            reopened.get("u1-persistentIds").unwrap(),
            Some(serde_json::json!(["d1", "d2"]))
        );
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_corrupt_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        fs::write(&path, b"{ not json").unwrap();

        let err = JsonFileStore::open(&path).err().unwrap();
        assert!(matches!(err, StoreError::Serialization(_)));
    }

    #[test]
    fn test_failed_write_keeps_previous_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let store = JsonFileStore::open(&path).unwrap();
        store.set("k", Value::from("old")).unwrap();

        // A directory squatting on the temp path makes the next write fail.
        fs::create_dir(path.with_extension("tmp")).unwrap();
        assert!(store.set("k", Value::from("new")).is_err());

        assert_eq!(store.get("k").unwrap(), Some(Value::from("old")));
        let on_disk: BTreeMap<String, Value> =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(on_disk.get("k"), Some(&Value::from("old")));
    }
}
