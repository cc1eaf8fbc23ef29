//! Source-document object storage.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::StoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub key: String,
    pub content_hash: String,
    pub byte_size: usize,
    pub deduplicated: bool,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_text(&self, key: &str) -> Result<String, StoreError>;

    async fn put_text(&self, prefix: &str, extension: &str, text: &str)
        -> Result<StoredObject, StoreError>;
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Content-addressed key: `<prefix>/<sha256>.<ext>`.
pub fn object_key(prefix: &str, content_hash: &str, extension: &str) -> String {
    let ext = extension.trim_start_matches('.').trim();
    let ext = if ext.is_empty() { "txt" } else { ext };
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("{content_hash}.{ext}")
    } else {
        format!("{prefix}/{content_hash}.{ext}")
    }
}

/// Filesystem-backed objects rooted at a directory.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if key.is_empty() || escapes {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn get_text(&self, key: &str) -> Result<String, StoreError> {
        let path = self.resolve(key)?;
        match fs::read_to_string(&path).await {
            Ok(text) => Ok(text),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::ObjectNotFound {
                    key: key.to_string(),
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Writes immutably under a hash-addressed key using an atomic temp-file rename.
    async fn put_text(
        &self,
        prefix: &str,
        extension: &str,
        text: &str,
    ) -> Result<StoredObject, StoreError> {
        let bytes = text.as_bytes();
        let content_hash = sha256_hex(bytes);
        let key = object_key(prefix, &content_hash, extension);
        let absolute_path = self.resolve(&key)?;
        let stored = |deduplicated| StoredObject {
            key: key.clone(),
            content_hash: content_hash.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        let parent = absolute_path
            .parent()
            .ok_or_else(|| StoreError::InvalidKey(key.clone()))?;
        fs::create_dir_all(parent).await?;

        if fs::try_exists(&absolute_path).await? {
            return Ok(stored(true));
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(stored(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(stored(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err.into())
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<String, String>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `text` under an exact key.
    pub async fn insert(&self, key: impl Into<String>, text: impl Into<String>) {
        self.objects.write().await.insert(key.into(), text.into());
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get_text(&self, key: &str) -> Result<String, StoreError> {
        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::ObjectNotFound {
                key: key.to_string(),
            })
    }

    async fn put_text(
        &self,
        prefix: &str,
        extension: &str,
        text: &str,
    ) -> Result<StoredObject, StoreError> {
        let content_hash = sha256_hex(text.as_bytes());
        let key = object_key(prefix, &content_hash, extension);
        let mut objects = self.objects.write().await;
        let deduplicated = objects.contains_key(&key);
        objects.entry(key.clone()).or_insert_with(|| text.to_string());
        Ok(StoredObject {
            key,
            content_hash,
            byte_size: text.len(),
            deduplicated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn object_hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(object_key("/reports/r-1/", "abc", ".txt"), "reports/r-1/abc.txt");
        assert_eq!(object_key("", "abc", ""), "abc.txt");
    }

    #[tokio::test]
    async fn atomic_writes_deduplicate_by_hash_key() {
        let dir = tempdir().expect("tempdir");
        let store = FsObjectStore::new(dir.path());

        let first = store
            .put_text("reports/r-1", "txt", "Section L instructions ...")
            .await
            .expect("first put");
        let second = store
            .put_text("reports/r-1", "txt", "Section L instructions ...")
            .await
            .expect("second put");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.key, second.key);
        assert_eq!(
            store.get_text(&first.key).await.expect("read back"),
            "Section L instructions ..."
        );
    }

    #[tokio::test]
    async fn missing_and_escaping_keys_are_rejected() {
        let dir = tempdir().expect("tempdir");
        let store = FsObjectStore::new(dir.path());
        assert!(matches!(
            store.get_text("reports/none.txt").await,
            Err(StoreError::ObjectNotFound { .. })
        ));
        assert!(matches!(
            store.get_text("../etc/passwd").await,
            Err(StoreError::InvalidKey(_))
        ));
        assert!(matches!(
            store.get_text("/etc/passwd").await,
            Err(StoreError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn memory_store_mirrors_fs_semantics() {
        let store = MemoryObjectStore::new();
        store.insert("k/one.txt", "one").await;
        assert_eq!(store.get_text("k/one.txt").await.unwrap(), "one");
        let put = store.put_text("k", "txt", "two").await.unwrap();
        assert!(!put.deduplicated);
        assert!(store.put_text("k", "txt", "two").await.unwrap().deduplicated);
        assert!(store.get_text("k/missing.txt").await.is_err());
    }
}
