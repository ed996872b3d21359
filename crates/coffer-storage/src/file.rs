//! Directory-tree storage backend.
//!
//! Each key maps to a file below a root directory; `/` in keys maps to the
//! platform path separator. Writes go to a uniquely named sibling temp file
//! which is then renamed over the target, so readers observe either the old
//! or the new value and never a torn write.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::debug;

use crate::{StorageBackend, StorageError, parent_key, validate_key};

/// Suffix of in-flight temp files; such files are invisible to `list`.
const TEMP_SUFFIX: &str = ".tmp";

/// Storage backend rooted at a directory on the local file system.
#[derive(Debug, Clone)]
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    /// Create a backend rooted at `root`. The directory is created on
    /// first write if it does not exist.
    #[must_use]
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// The root directory of this backend.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        let mut path = self.root.clone();
        if !key.is_empty() {
            path.extend(key.split('/'));
        }
        Ok(path)
    }
}

fn is_temp_file(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(TEMP_SUFFIX)
}

#[async_trait::async_trait]
impl StorageBackend for FileBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.resolve(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Read {
                key: key.to_owned(),
                reason: e.to_string(),
            }),
        }
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let path = self.resolve(key)?;
        let parent = self.resolve(parent_key(key))?;
        if parent != self.root && !fs::try_exists(&parent).await.unwrap_or(false) {
            return Err(StorageError::MissingParent {
                key: key.to_owned(),
            });
        }
        if parent == self.root {
            fs::create_dir_all(&self.root)
                .await
                .map_err(|e| StorageError::Write {
                    key: key.to_owned(),
                    reason: e.to_string(),
                })?;
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp = parent.join(format!(".{name}.{}{TEMP_SUFFIX}", uuid::Uuid::new_v4()));

        let write_err = |e: std::io::Error| StorageError::Write {
            key: key.to_owned(),
            reason: e.to_string(),
        };
        fs::write(&temp, value).await.map_err(write_err)?;
        if let Err(e) = fs::rename(&temp, &path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(write_err(e));
        }
        debug!(key = %key, bytes = value.len(), "file written");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.resolve(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::Delete {
                key: key.to_owned(),
                reason: e.to_string(),
            }),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let base = self.resolve(prefix)?;
        let root = self.root.clone();
        let owned_prefix = prefix.to_owned();

        let listed = tokio::task::spawn_blocking(move || {
            if !base.is_dir() {
                return Ok(Vec::new());
            }
            let mut keys = Vec::new();
            for entry in walkdir::WalkDir::new(&base).follow_links(false) {
                let entry = entry.map_err(|e| e.to_string())?;
                if !entry.file_type().is_file() {
                    continue;
                }
                if is_temp_file(&entry.file_name().to_string_lossy()) {
                    continue;
                }
                let relative = entry.path().strip_prefix(&root).map_err(|e| e.to_string())?;
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                keys.push(key);
            }
            keys.sort();
            Ok::<_, String>(keys)
        })
        .await
        .map_err(|e| StorageError::List {
            prefix: owned_prefix.clone(),
            reason: e.to_string(),
        })?;

        listed.map_err(|reason| StorageError::List {
            prefix: owned_prefix,
            reason,
        })
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.resolve(key)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::Read {
                key: key.to_owned(),
                reason: e.to_string(),
            }),
        }
    }

    async fn dir_exists(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.resolve(key)?;
        if key.is_empty() {
            return Ok(true);
        }
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::Read {
                key: key.to_owned(),
                reason: e.to_string(),
            }),
        }
    }

    async fn create_dir_all(&self, key: &str) -> Result<(), StorageError> {
        let path = self.resolve(key)?;
        fs::create_dir_all(&path)
            .await
            .map_err(|e| StorageError::CreateDir {
                key: key.to_owned(),
                reason: e.to_string(),
            })
    }
}
