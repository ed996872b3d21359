//! In-memory storage backend for testing.
//!
//! This backend stores all data in a `BTreeMap` behind a `RwLock`, together
//! with the set of directories that have been created. It is not persistent:
//! all data is lost when the process exits. Use this for unit tests where you
//! need a real storage backend without touching disk.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::{StorageBackend, StorageError, parent_key, validate_key};

#[derive(Debug, Default)]
struct Tree {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
}

impl Tree {
    fn has_dir(&self, key: &str) -> bool {
        key.is_empty() || self.dirs.contains(key)
    }
}

/// An in-memory storage backend backed by a `BTreeMap`.
///
/// Thread-safe and async-compatible. Data is sorted by key, which makes
/// prefix listing efficient via `BTreeMap::range`.
///
/// # Examples
///
/// ```
/// # use coffer_storage::{MemoryBackend, StorageBackend};
/// # #[tokio::main]
/// # async fn main() {
/// let backend = MemoryBackend::new();
/// backend.create_dir_all("sys").await.unwrap();
/// backend.put("sys/config", b"data").await.unwrap();
/// let val = backend.get("sys/config").await.unwrap();
/// assert_eq!(val, Some(b"data".to_vec()));
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    tree: Arc<RwLock<Tree>>,
}

impl MemoryBackend {
    /// Create a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        validate_key(key)?;
        let tree = self.tree.read().await;
        Ok(tree.files.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        validate_key(key)?;
        let mut tree = self.tree.write().await;
        if !tree.has_dir(parent_key(key)) {
            return Err(StorageError::MissingParent {
                key: key.to_owned(),
            });
        }
        tree.files.insert(key.to_owned(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        validate_key(key)?;
        let mut tree = self.tree.write().await;
        Ok(tree.files.remove(key).is_some())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        validate_key(prefix)?;
        let tree = self.tree.read().await;
        let dir_prefix = if prefix.is_empty() {
            String::new()
        } else {
            format!("{prefix}/")
        };
        let keys = tree
            .files
            .range(dir_prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&dir_prefix))
            .map(|(k, _)| k.clone())
            .collect();
        Ok(keys)
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        validate_key(key)?;
        let tree = self.tree.read().await;
        Ok(tree.files.contains_key(key))
    }

    async fn dir_exists(&self, key: &str) -> Result<bool, StorageError> {
        validate_key(key)?;
        Ok(self.tree.read().await.has_dir(key))
    }

    async fn create_dir_all(&self, key: &str) -> Result<(), StorageError> {
        validate_key(key)?;
        let mut tree = self.tree.write().await;
        if tree.files.contains_key(key) {
            return Err(StorageError::CreateDir {
                key: key.to_owned(),
                reason: "a file with that name exists".to_owned(),
            });
        }
        let mut current = key;
        while !current.is_empty() {
            tree.dirs.insert(current.to_owned());
            current = parent_key(current);
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_nonexistent_returns_none() {
        let backend = MemoryBackend::new();
        let result = backend.get("does/not/exist").await.unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn put_requires_parent_directory() {
        let backend = MemoryBackend::new();
        let result = backend.put("secret/app/db", b"x").await;
        assert!(matches!(result, Err(StorageError::MissingParent { .. })));

        backend.create_dir_all("secret/app").await.unwrap();
        backend.put("secret/app/db", b"x").await.unwrap();
        assert!(backend.dir_exists("secret").await.unwrap());
        assert_eq!(backend.get("secret/app/db").await.unwrap(), Some(b"x".to_vec()));
    }

    #[tokio::test]
    async fn put_overwrites_existing() {
        let backend = MemoryBackend::new();
        backend.put("key", b"v1").await.unwrap();
        backend.put("key", b"v2").await.unwrap();
        let val = backend.get("key").await.unwrap();
        assert_eq!(val, Some(b"v2".to_vec()));
    }

    #[tokio::test]
    async fn update_missing_key_fails() {
        let backend = MemoryBackend::new();
        let result = backend.update("key", b"v").await;
        assert!(matches!(result, Err(StorageError::NotFound { .. })));

        backend.put("key", b"v1").await.unwrap();
        backend.update("key", b"v2").await.unwrap();
        assert_eq!(backend.get("key").await.unwrap(), Some(b"v2".to_vec()));
    }

    #[tokio::test]
    async fn delete_reports_existence() {
        let backend = MemoryBackend::new();
        backend.put("key", b"val").await.unwrap();
        assert!(backend.delete("key").await.unwrap());
        assert!(!backend.delete("key").await.unwrap());
        assert_eq!(backend.get("key").await.unwrap(), None);
    }

    #[tokio::test]
    async fn list_is_recursive_and_bounded_by_directory() {
        let backend = MemoryBackend::new();
        backend.create_dir_all("kv/data/nested").await.unwrap();
        backend.create_dir_all("kvx").await.unwrap();
        backend.put("kv/data/a", b"1").await.unwrap();
        backend.put("kv/data/nested/b", b"2").await.unwrap();
        backend.put("kvx/c", b"3").await.unwrap();

        let keys = backend.list("kv").await.unwrap();
        assert_eq!(keys, vec!["kv/data/a", "kv/data/nested/b"]);
        assert_eq!(backend.list("").await.unwrap().len(), 3);
        assert!(backend.list("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn clone_shares_state() {
        let backend = MemoryBackend::new();
        let clone = backend.clone();
        backend.put("key", b"val").await.unwrap();
        let val = clone.get("key").await.unwrap();
        assert_eq!(val, Some(b"val".to_vec()));
    }

    #[tokio::test]
    async fn rejects_invalid_keys() {
        let backend = MemoryBackend::new();
        let result = backend.get("../escape").await;
        assert!(matches!(result, Err(StorageError::InvalidKey { .. })));
    }
}
