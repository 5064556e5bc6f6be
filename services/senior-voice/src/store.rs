//! Local Key/Value Persistence
//!
//! Each named key is stored as one JSON document (`<key>.json`) inside the data
//! directory. Writes go to a temporary file first and are renamed into place,
//! so a crash never leaves a half-written value behind.

use serde::{Serialize, de::DeserializeOwned};
use std::{
    io,
    path::{Path, PathBuf},
};
use tracing::{debug, info};
use tripot_core::UserId;

/// Key under which the durable per-install user id is stored.
pub const USER_ID_KEY: &str = "user_id";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Invalid storage key '{0}'")]
    InvalidKey(String),
    #[error("Storage I/O error for key '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: io::Error,
    },
    #[error("Invalid JSON stored under key '{key}': {source}")]
    Json {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A directory of JSON values addressed by key.
#[derive(Debug, Clone)]
pub struct KeyValueStore {
    dir: PathBuf,
}

impl KeyValueStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Reads the value stored under `key`, or `None` if nothing was ever stored.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let path = self.path(key)?;
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Io {
                    key: key.to_string(),
                    source,
                });
            }
        };
        let value = serde_json::from_slice(&raw).map_err(|source| StoreError::Json {
            key: key.to_string(),
            source,
        })?;
        Ok(Some(value))
    }

    /// Stores `value` under `key`, replacing any previous value.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let path = self.path(key)?;
        let io_err = |source| StoreError::Io {
            key: key.to_string(),
            source,
        };
        let json = serde_json::to_vec(value).map_err(|source| StoreError::Json {
            key: key.to_string(),
            source,
        })?;

        tokio::fs::create_dir_all(&self.dir).await.map_err(io_err)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &path).await.map_err(io_err)?;
        debug!(key, path = %path.display(), "Stored value.");
        Ok(())
    }

    fn path(&self, key: &str) -> Result<PathBuf, StoreError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", key)))
    }
}

/// Returns the persisted user id, generating and storing one on first run.
pub async fn load_or_create_user_id(store: &KeyValueStore) -> Result<UserId, StoreError> {
    if let Some(user_id) = store.get::<UserId>(USER_ID_KEY).await? {
        debug!(%user_id, "Loaded existing user id.");
        return Ok(user_id);
    }
    let user_id = UserId::generate();
    store.set(USER_ID_KEY, &user_id).await?;
    info!(%user_id, "Generated new user id.");
    Ok(user_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_get_missing_key_is_none() {
        let dir = tempdir().unwrap();
        let store = KeyValueStore::new(dir.path());
        let value: Option<String> = store.get("radioFavorites").await.unwrap();
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn test_set_then_get_in_nested_dir() {
        let dir = tempdir().unwrap();
        let store = KeyValueStore::new(dir.path().join("nested").join("tripot"));

        let mut status = BTreeMap::new();
        status.insert("morning".to_string(), true);
        status.insert("evening".to_string(), false);
        store.set("medicationStatus", &status).await.unwrap();

        let loaded: BTreeMap<String, bool> = store.get("medicationStatus").await.unwrap().unwrap();
        assert_eq!(loaded, status);
        assert!(!store.dir().join("medicationStatus.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_invalid_key_is_rejected() {
        let dir = tempdir().unwrap();
        let store = KeyValueStore::new(dir.path());
        let err = store.set("../escape", &1).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey(_)));
    }

    #[tokio::test]
    async fn test_corrupt_value_is_reported() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("user_id.json"), b"{oops").unwrap();
        let store = KeyValueStore::new(dir.path());

        let err = store.get::<UserId>(USER_ID_KEY).await.unwrap_err();
        assert!(matches!(err, StoreError::Json { ref key, .. } if key == USER_ID_KEY));
    }

    #[tokio::test]
    async fn test_user_id_is_created_once_and_reused() {
        let dir = tempdir().unwrap();
        let store = KeyValueStore::new(dir.path());

        let first = load_or_create_user_id(&store).await.unwrap();
        let second = load_or_create_user_id(&store).await.unwrap();
        assert_eq!(first, second);
        assert!(first.as_str().starts_with("user_"));

        let reopened = KeyValueStore::new(dir.path());
        assert_eq!(load_or_create_user_id(&reopened).await.unwrap(), first);
    }
}
