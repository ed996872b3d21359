//! Audit trail for vault operations.
//!
//! Every public vault operation produces one [`AuditEntry`] after it
//! completes, successful or not. If backends are configured and all of them
//! fail to record the entry, the operation fails with
//! [`AuditError::AllBackendsFailed`] even if it succeeded otherwise.
//!
//! Presented tokens are HMAC'd with a per-manager key before they reach an
//! entry, so the log can correlate requests without exposing bearer values.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::{AuditError, VaultError};

type HmacSha256 = Hmac<Sha256>;

/// One audited operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Unique entry id.
    pub id: String,
    /// When the operation completed.
    pub timestamp: DateTime<Utc>,
    /// Operation name (`read`, `write`, `create_token`, ...).
    pub operation: String,
    /// Target path or principal id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// HMAC of the presented token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// `ok` or the error kind.
    pub outcome: String,
    /// Error message, if any. Never contains secret values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A sink for audit entries.
#[async_trait::async_trait]
pub trait AuditBackend: Send + Sync {
    /// Name used in diagnostics.
    fn name(&self) -> &str;

    /// Persist one entry. Must not drop entries silently.
    ///
    /// # Errors
    ///
    /// Returns an [`AuditError`] if the entry could not be persisted.
    async fn log(&self, entry: &AuditEntry) -> Result<(), AuditError>;
}

/// Fans entries out to every registered backend, failing closed.
pub struct AuditManager {
    backends: RwLock<Vec<Arc<dyn AuditBackend>>>,
    mac: HmacSha256,
}

impl AuditManager {
    /// Create a manager hashing tokens with `hmac_key`.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Serialization`] if the key is rejected.
    pub fn new(hmac_key: &[u8]) -> Result<Self, AuditError> {
        let mac = HmacSha256::new_from_slice(hmac_key).map_err(|e| AuditError::Serialization {
            reason: format!("invalid audit key: {e}"),
        })?;
        Ok(Self {
            backends: RwLock::new(Vec::new()),
            mac,
        })
    }

    /// Register a backend.
    pub async fn add_backend(&self, backend: Arc<dyn AuditBackend>) {
        self.backends.write().await.push(backend);
    }

    /// Whether any backend is registered.
    pub async fn has_backends(&self) -> bool {
        !self.backends.read().await.is_empty()
    }

    /// Hex HMAC-SHA256 of a sensitive value.
    #[must_use]
    pub fn hmac_field(&self, value: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(value.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Build the entry for a completed operation.
    #[must_use]
    pub fn entry(
        &self,
        operation: &str,
        path: Option<&str>,
        token: Option<&str>,
        outcome: Result<(), &VaultError>,
    ) -> AuditEntry {
        let (outcome, error) = match outcome {
            Ok(()) => ("ok".to_owned(), None),
            Err(e) => (e.kind().to_owned(), Some(e.to_string())),
        };
        AuditEntry {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            operation: operation.to_owned(),
            path: path.map(str::to_owned),
            token: token.map(|t| self.hmac_field(t)),
            outcome,
            error,
        }
    }

    /// Write an entry to every backend. With no backends this is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::AllBackendsFailed`] if every backend fails.
    pub async fn log(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        let backends = self.backends.read().await;
        if backends.is_empty() {
            return Ok(());
        }

        let mut recorded = false;
        for backend in backends.iter() {
            match backend.log(entry).await {
                Ok(()) => recorded = true,
                Err(e) => warn!(backend = backend.name(), error = %e, "audit backend failed"),
            }
        }

        if recorded {
            Ok(())
        } else {
            Err(AuditError::AllBackendsFailed)
        }
    }
}

impl std::fmt::Debug for AuditManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditManager")
            .field("hmac_key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}
