//! Storage backend abstraction for Coffer.
//!
//! This crate defines the [`StorageBackend`] trait, a file-tree shaped
//! storage interface that knows nothing about secrets, encryption, or
//! policies. The secret store in `coffer-core` encrypts everything before it
//! reaches this layer; only the bootstrap template and vault metadata are
//! ever written in plaintext.
//!
//! Two implementations are provided:
//!
//! - [`FileBackend`]: production default, a directory tree on the local disk
//! - [`MemoryBackend`]: in-memory, for testing only

mod error;
mod file;
mod memory;

pub use error::StorageError;
pub use file::FileBackend;
pub use memory::MemoryBackend;

/// A pluggable storage backend addressed by relative paths.
///
/// Keys are UTF-8 strings using `/` as a separator (e.g. `sys/policy/admin.sec`,
/// `.vault/vault.json`). Directories are explicit: [`put`](StorageBackend::put)
/// never creates a missing parent, callers decide whether they are allowed
/// to via [`create_dir_all`](StorageBackend::create_dir_all).
///
/// Implementations must be safe to share across async tasks (`Send + Sync`).
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Retrieve a value by key.
    ///
    /// Returns `Ok(None)` if the key does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Read`] if the underlying backend fails.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Store a value, creating the key or replacing it atomically.
    ///
    /// # Errors
    ///
    /// - [`StorageError::MissingParent`] if the parent directory does not exist.
    /// - [`StorageError::Write`] if the underlying backend fails.
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Replace the value of an existing key.
    ///
    /// # Errors
    ///
    /// - [`StorageError::NotFound`] if the key does not exist.
    /// - [`StorageError::Write`] if the underlying backend fails.
    async fn update(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        if !self.exists(key).await? {
            return Err(StorageError::NotFound {
                key: key.to_owned(),
            });
        }
        self.put(key, value).await
    }

    /// Delete a key. Returns whether the key existed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Delete`] if the underlying backend fails.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    /// List every file key below the directory `prefix`, recursively and in
    /// sorted order. An empty prefix lists the whole tree. A missing
    /// directory yields an empty list.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::List`] if the underlying backend fails.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Check whether a key exists in storage.
    ///
    /// The default implementation calls [`get`](StorageBackend::get) and checks
    /// for `Some`. Backends may override this with a more efficient check.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Read`] if the underlying backend fails.
    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.get(key).await?.is_some())
    }

    /// Check whether a directory exists. The empty key is the root and
    /// always exists.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Read`] if the underlying backend fails.
    async fn dir_exists(&self, key: &str) -> Result<bool, StorageError>;

    /// Create a directory and all of its missing ancestors.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::CreateDir`] if the underlying backend fails.
    async fn create_dir_all(&self, key: &str) -> Result<(), StorageError>;
}

/// Validate a storage key.
///
/// Keys are relative, `/`-separated, and may not contain empty, `.` or `..`
/// components or backslashes. The empty key is accepted and denotes the root.
///
/// # Errors
///
/// Returns [`StorageError::InvalidKey`] describing the first violation.
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    let invalid = |reason: &str| StorageError::InvalidKey {
        key: key.to_owned(),
        reason: reason.to_owned(),
    };

    if key.is_empty() {
        return Ok(());
    }
    if key.starts_with('/') {
        return Err(invalid("keys must be relative"));
    }
    if key.contains('\\') || key.contains('\0') {
        return Err(invalid("keys may not contain backslashes or NUL"));
    }
    for component in key.split('/') {
        match component {
            "" => return Err(invalid("empty path component")),
            "." | ".." => return Err(invalid("traversal component")),
            _ => {}
        }
    }
    Ok(())
}

/// Return the parent directory key of `key` (`""` for top-level keys).
#[must_use]
pub fn parent_key(key: &str) -> &str {
    key.rsplit_once('/').map_or("", |(parent, _)| parent)
}
