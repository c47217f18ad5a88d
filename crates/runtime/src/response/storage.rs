//! External storage capability for oversized response payloads.
//!
//! Locations are addressed by URI scheme (`local://`, `s3://`,
//! `azure://`). The core ships a filesystem provider; object-store
//! transports are injected by the embedding application.

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use std::path::PathBuf;

use crate::config::{ExternalStorageSettings, StorageProvider};
use crate::types::ResponseError;

/// Durable blob sink for payloads that exceed the response size bound.
#[async_trait]
pub trait ExternalStorage: Send + Sync {
    /// Store `bytes` under `key`, returning the full location URI.
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<String, ResponseError>;

    fn provider(&self) -> StorageProvider;
}

/// Generate an object key: `{prefix}/{timestamp}/{random hex}.json.gz`.
pub fn object_key(prefix: &str) -> String {
    let timestamp = Utc::now().timestamp_millis();
    let suffix: u64 = rand::thread_rng().gen();
    format!("{prefix}/{timestamp}/{suffix:016x}.json.gz")
}

/// Filesystem-backed storage provider.
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(settings: &ExternalStorageSettings) -> Self {
        Self {
            root: PathBuf::from(&settings.location),
        }
    }
}

#[async_trait]
impl ExternalStorage for LocalStorage {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<String, ResponseError> {
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ResponseError::StorageUnavailable(e.to_string()))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| ResponseError::StorageUnavailable(e.to_string()))?;
        Ok(format!("local://{}", path.display()))
    }

    fn provider(&self) -> StorageProvider {
        StorageProvider::Local
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_keys_are_unique_and_shaped() {
        let a = object_key("responses");
        let b = object_key("responses");
        assert_ne!(a, b);
        assert!(a.starts_with("responses/"));
        assert!(a.ends_with(".json.gz"));
    }

    #[tokio::test]
    async fn local_storage_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let settings = ExternalStorageSettings {
            provider: StorageProvider::Local,
            location: dir.path().to_str().unwrap().to_string(),
            key_prefix: "responses".to_string(),
            ttl_days: 30,
        };
        let storage = LocalStorage::new(&settings);

        let key = object_key(&settings.key_prefix);
        let location = storage.put(&key, b"payload").await.unwrap();
        assert!(location.starts_with("local://"));

        let path = location.strip_prefix("local://").unwrap();
        let stored = tokio::fs::read(path).await.unwrap();
        assert_eq!(stored, b"payload");
    }
}
