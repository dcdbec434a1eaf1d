//! Per-owner durable session state on top of a key-value store.

use std::sync::{Arc, Mutex};

use push_relay_core::{Credentials, KeyValueStore, SessionOwner, traits::StoreError};
use serde_json::Value;

const CREDENTIALS_KEY: &str = "credentials";
const SENDER_ID_KEY: &str = "senderId";
const CHECKPOINTS_KEY: &str = "persistentIds";

/// Credential store keyed by session owner.
///
/// Layout per owner: `{owner}-credentials`, `{owner}-senderId` and
/// `{owner}-persistentIds` (ordered checkpoint ids).
#[derive(Clone)]
pub struct CredentialStore {
    kv: Arc<dyn KeyValueStore>,
    append_lock: Arc<Mutex<()>>,
}

fn key(owner: &SessionOwner, suffix: &str) -> String {
    format!("{owner}-{suffix}")
}

impl CredentialStore {
    /// Create a credential store over `kv`.
    #[must_use]
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            kv,
            append_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Stored credentials for `owner`.
    ///
    /// # Errors
    /// Returns error if the store cannot be read or holds a malformed record.
    pub fn get_credentials(&self, owner: &SessionOwner) -> Result<Option<Credentials>, StoreError> {
        self.kv
            .get(&key(owner, CREDENTIALS_KEY))?
            .map(serde_json::from_value)
            .transpose()
            .map_err(Into::into)
    }

    /// Overwrite the credentials for `owner`.
    ///
    /// # Errors
    /// Returns error if the store write fails.
    pub fn put_credentials(
        &self,
        owner: &SessionOwner,
        credentials: &Credentials,
    ) -> Result<(), StoreError> {
        self.kv
            .set(&key(owner, CREDENTIALS_KEY), serde_json::to_value(credentials)?)
    }

    /// Sender identity `owner` last registered with.
    ///
    /// # Errors
    /// Returns error if the store cannot be read or holds a non-string.
    pub fn get_sender_id(&self, owner: &SessionOwner) -> Result<Option<String>, StoreError> {
        self.kv
            .get(&key(owner, SENDER_ID_KEY))?
            .map(serde_json::from_value)
            .transpose()
            .map_err(Into::into)
    }

    /// Overwrite the sender identity for `owner`.
    ///
    /// # Errors
    /// Returns error if the store write fails.
    pub fn put_sender_id(&self, owner: &SessionOwner, sender_id: &str) -> Result<(), StoreError> {
        self.kv
            .set(&key(owner, SENDER_ID_KEY), Value::from(sender_id))
    }

    /// Checkpoint ids in delivery order. Empty if none were persisted.
    ///
    /// # Errors
    /// Returns error if the store cannot be read or holds a malformed list.
    pub fn get_checkpoints(&self, owner: &SessionOwner) -> Result<Vec<String>, StoreError> {
        Ok(self
            .kv
            .get(&key(owner, CHECKPOINTS_KEY))?
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default())
    }

    /// Append one checkpoint id for `owner`.
    ///
    /// The list is rewritten as a whole, so a failed write leaves the
    /// previous list intact.
    ///
    /// # Errors
    /// Returns error if the list cannot be read or written.
    pub fn append_checkpoint(
        &self,
        owner: &SessionOwner,
        delivery_id: &str,
    ) -> Result<(), StoreError> {
        let _guard = self
            .append_lock
            .lock()
            .map_err(|e| StoreError::Internal(e.to_string()))?;

        let mut checkpoints = self.get_checkpoints(owner)?;
        checkpoints.push(delivery_id.to_string());
        self.kv
            .set(&key(owner, CHECKPOINTS_KEY), serde_json::to_value(checkpoints)?)
    }
}
