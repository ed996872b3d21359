//! Storage error types.
//!
//! Every error variant carries enough context to diagnose the problem
//! without a debugger. Values are never included, only keys.

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Failed to read a value from storage.
    #[error("failed to read key '{key}': {reason}")]
    Read { key: String, reason: String },

    /// Failed to write a value to storage.
    #[error("failed to write key '{key}': {reason}")]
    Write { key: String, reason: String },

    /// Failed to delete a key from storage.
    #[error("failed to delete key '{key}': {reason}")]
    Delete { key: String, reason: String },

    /// Failed to list keys under the given prefix.
    #[error("failed to list keys under '{prefix}': {reason}")]
    List { prefix: String, reason: String },

    /// Failed to create a directory.
    #[error("failed to create directory '{key}': {reason}")]
    CreateDir { key: String, reason: String },

    /// The parent directory of a key does not exist.
    #[error("parent directory of '{key}' does not exist")]
    MissingParent { key: String },

    /// An update targeted a key that does not exist.
    #[error("key '{key}' not found")]
    NotFound { key: String },

    /// A key was empty, absolute, or contained a traversal component.
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },
}
