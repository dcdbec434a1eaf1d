//! In-memory key-value store.

use std::{collections::HashMap, sync::RwLock};

use push_relay_core::{KeyValueStore, traits::StoreError};
use serde_json::Value;

/// In-memory store implementation.
///
/// Useful for tests and single-process deployments.
/// Data is lost on restart.
pub struct MemoryStore {
    values: RwLock<HashMap<String, Value>>,
}

impl MemoryStore {
    /// Create an empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            values: RwLock::new(HashMap::new()),
        }
    }

    /// Number of keys currently stored.
    ///
    /// # Errors
    /// Returns error if the lock is poisoned.
    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self
            .values
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?
            .len())
    }

    /// Whether the store holds no keys.
    ///
    /// # Errors
    /// Returns error if the lock is poisoned.
    pub fn is_empty(&self) -> Result<bool, StoreError> {
        self.len().map(|n| n == 0)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self
            .values
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?
            .get(key)
            .cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.values
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?
            .insert(key.to_string(), value);
        Ok(())
    }
}
