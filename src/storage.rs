//! Object storage for uploaded file bytes.
//!
//! Raw uploads are kept separately from the extracted text so a file can
//! be re-processed later. The default backend is a directory tree on the
//! local filesystem, addressed by `(bucket, key)`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::config::StorageConfig;

/// Where an uploaded file's bytes live. Serialized into the file record's
/// `storage_json` column.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageRef {
    pub bucket: String,
    pub key: String,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<StorageRef>;
    async fn get(&self, reference: &StorageRef) -> Result<Vec<u8>>;
    async fn delete(&self, reference: &StorageRef) -> Result<()>;
}

/// Filesystem-backed object store rooted at a configured directory.
pub struct LocalObjectStore {
    root: PathBuf,
    bucket: String,
}

impl LocalObjectStore {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            root: config.root.clone(),
            bucket: config.bucket.clone(),
        }
    }

    fn path_for(&self, bucket: &str, key: &str) -> PathBuf {
        // Keys are file names; strip any path components defensively.
        let safe: String = key
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.root.join(bucket).join(safe)
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<StorageRef> {
        let path = self.path_for(&self.bucket, key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write object {}", path.display()))?;

        Ok(StorageRef {
            bucket: self.bucket.clone(),
            key: key.to_string(),
        })
    }

    async fn get(&self, reference: &StorageRef) -> Result<Vec<u8>> {
        let path = self.path_for(&reference.bucket, &reference.key);
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read object {}", path.display()))
    }

    async fn delete(&self, reference: &StorageRef) -> Result<()> {
        let path = self.path_for(&reference.bucket, &reference.key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete object {}", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &tempfile::TempDir) -> LocalObjectStore {
        LocalObjectStore::new(&StorageConfig {
            root: dir.path().to_path_buf(),
            bucket: "uploads".to_string(),
        })
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let reference = store.put("a.txt", b"payload").await.unwrap();
        assert_eq!(reference.bucket, "uploads");
        assert_eq!(store.get(&reference).await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let reference = store.put("a.txt", b"payload").await.unwrap();
        store.delete(&reference).await.unwrap();
        store.delete(&reference).await.unwrap();
        assert!(store.get(&reference).await.is_err());
    }

    #[tokio::test]
    async fn test_key_path_components_stripped() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let reference = store.put("../escape.txt", b"x").await.unwrap();
        // Object lands inside the bucket directory.
        assert!(dir.path().join("uploads").join(".._escape.txt").exists());
        assert_eq!(store.get(&reference).await.unwrap(), b"x");
    }
}
