//! Blob store port

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::AdapterError;

/// Content-addressed blob storage. At-most-once semantics are not required;
/// `put` may be repeated freely.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, path: &str) -> Result<Vec<u8>, AdapterError>;

    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<(), AdapterError>;
}

/// In-memory blob store for tests.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a blob (test helper).
    pub fn with_blob(self, path: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.blobs.write().insert(path.into(), bytes.into());
        self
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, path: &str) -> Result<Vec<u8>, AdapterError> {
        self.blobs
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| AdapterError::NotFound(format!("blob not found: {path}")))
    }

    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<(), AdapterError> {
        self.blobs.write().insert(path.to_string(), bytes);
        Ok(())
    }
}

/// Filesystem-backed blob store for local deployments.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, AdapterError> {
        // Blob paths are opaque keys; reject anything trying to walk out of
        // the root.
        if path.contains("..") || path.starts_with('/') {
            return Err(AdapterError::Permanent(format!("invalid blob path: {path}")));
        }
        Ok(self.root.join(path))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn get(&self, path: &str) -> Result<Vec<u8>, AdapterError> {
        let full = self.resolve(path)?;
        match tokio::fs::read(&full).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(AdapterError::NotFound(format!("blob not found: {path}")))
            }
            Err(e) => Err(AdapterError::Transient(e.to_string())),
        }
    }

    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<(), AdapterError> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AdapterError::Transient(e.to_string()))?;
        }
        tokio::fs::write(&full, bytes)
            .await
            .map_err(|e| AdapterError::Transient(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_blob_round_trip() {
        let store = MemoryBlobStore::new();
        store.put("docs/d1.txt", b"hello".to_vec()).await.unwrap();

        let bytes = store.get("docs/d1.txt").await.unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[tokio::test]
    async fn test_memory_blob_missing() {
        let store = MemoryBlobStore::new();
        assert!(matches!(
            store.get("nope").await,
            Err(AdapterError::NotFound(_))
        ));
    }

    #[test]
    fn test_fs_blob_rejects_escaping_paths() {
        let store = FsBlobStore::new("/tmp/blobs");
        assert!(store.resolve("../etc/passwd").is_err());
        assert!(store.resolve("/etc/passwd").is_err());
        assert!(store.resolve("docs/d1.txt").is_ok());
    }
}
