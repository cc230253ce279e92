//! Key/value blob storage backing the repository.
//!
//! The repository persists each block under its hex hash and keeps the
//! current root's hash under [`ROOT_KEY`].

use parking_lot::RwLock;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{ChainError, Result};

/// Reserved key holding the hex hash of the current root.
pub const ROOT_KEY: &str = "root";

/// Get/put-by-key blob storage.
pub trait BlobStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `value` under `key`, overwriting any previous value.
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;
}

/// In-memory blob store.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

impl BlobStore for MemoryBlobStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.blobs.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }
}

/// File-per-key blob store with a two-level fan-out:
/// `{base_dir}/{key[0..2]}/{key[2..4]}/{key}`.
///
/// Writes go to a temporary file first and are renamed into place.
pub struct FileBlobStore {
    base_dir: PathBuf,
}

impl FileBlobStore {
    /// Open a store rooted at `base_dir`, creating the directory if needed.
    pub fn new(base_dir: impl AsRef<Path>) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_dir).map_err(storage_err)?;
        Ok(Self { base_dir })
    }

    fn blob_path(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || !key.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-') {
            return Err(ChainError::Storage(format!("invalid blob key {:?}", key)));
        }
        if key.len() < 4 {
            return Ok(self.base_dir.join(key));
        }
        Ok(self.base_dir.join(&key[0..2]).join(&key[2..4]).join(key))
    }
}

impl BlobStore for FileBlobStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.blob_path(key)?;
        match std::fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.blob_path(key)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(storage_err)?;
        }
        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, value).map_err(storage_err)?;
        std::fs::rename(&tmp_path, &path).map_err(storage_err)?;
        debug!(key, path = %path.display(), size = value.len(), "stored blob");
        Ok(())
    }
}

fn storage_err(e: std::io::Error) -> ChainError {
    ChainError::Storage(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_overwrites() {
        let store = MemoryBlobStore::new();
        assert!(store.get("k").unwrap().is_none());
        store.put("k", b"one").unwrap();
        store.put("k", b"two").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some(&b"two"[..]));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let key = "ab".repeat(32);
        {
            let store = FileBlobStore::new(dir.path()).unwrap();
            store.put(&key, b"block").unwrap();
            store.put(ROOT_KEY, b"ptr").unwrap();
        }
        let store = FileBlobStore::new(dir.path()).unwrap();
        assert_eq!(store.get(&key).unwrap().as_deref(), Some(&b"block"[..]));
        assert_eq!(store.get(ROOT_KEY).unwrap().as_deref(), Some(&b"ptr"[..]));
        assert!(dir.path().join("ab").join("ab").join(&key).exists());
        assert!(store.get("missing").unwrap().is_none());
    }

    #[test]
    fn file_store_rejects_path_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlobStore::new(dir.path()).unwrap();
        assert!(store.put("../escape", b"x").is_err());
        assert!(store.get("").is_err());
    }
}
