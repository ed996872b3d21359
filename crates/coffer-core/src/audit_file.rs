//! JSON-lines audit backend.
//!
//! Appends one JSON object per line. The file is only ever appended to.
//! Writes are serialized through a mutex around the handle and flushed
//! before [`AuditBackend::log`] returns.

use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::audit::{AuditBackend, AuditEntry};
use crate::error::AuditError;

/// Audit backend appending to a local file.
pub struct FileAuditBackend {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileAuditBackend {
    /// Open (or create) the log at `path` for appending, creating missing
    /// parent directories.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::BackendFailure`] if the file cannot be opened.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| failure(format!("cannot create '{}': {e}", dir.display())))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| failure(format!("cannot open '{}': {e}", path.display())))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Location of the log.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn failure(reason: String) -> AuditError {
    AuditError::BackendFailure {
        name: "file".to_owned(),
        reason,
    }
}

#[async_trait::async_trait]
impl AuditBackend for FileAuditBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn log(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        let mut line = serde_json::to_vec(entry).map_err(|e| AuditError::Serialization {
            reason: e.to_string(),
        })?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        file.write_all(&line)
            .await
            .map_err(|e| failure(format!("write failed: {e}")))?;
        file.flush()
            .await
            .map_err(|e| failure(format!("flush failed: {e}")))
    }
}

impl std::fmt::Debug for FileAuditBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileAuditBackend")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::audit::AuditManager;

    #[tokio::test]
    async fn appends_one_line_per_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("audit.jsonl");
        let backend = FileAuditBackend::open(&path).await.unwrap();
        let manager = AuditManager::new(b"key").unwrap();

        let first = manager.entry("read", Some("secret/a"), Some("t.x"), Ok(()));
        let second = manager.entry("write", Some("secret/b"), None, Ok(()));
        backend.log(&first).await.unwrap();
        backend.log(&second).await.unwrap();

        let text = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<AuditEntry> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines, vec![first, second]);
        assert!(!text.contains("t.x"));
    }

    #[tokio::test]
    async fn reopening_keeps_existing_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let manager = AuditManager::new(b"key").unwrap();
        let entry = manager.entry("read", None, None, Ok(()));

        FileAuditBackend::open(&path).await.unwrap().log(&entry).await.unwrap();
        FileAuditBackend::open(&path).await.unwrap().log(&entry).await.unwrap();

        let text = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(text.lines().count(), 2);
    }
}
