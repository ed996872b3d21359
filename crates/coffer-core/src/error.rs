//! Error types for `coffer-core`.
//!
//! Each error variant carries enough context to diagnose the problem without
//! a debugger. Errors never include key material, secret values, passwords,
//! or full token strings: only paths, key identifiers, and token ids.

use coffer_storage::StorageError;

/// Errors from cryptographic operations and key resolution.
#[derive(Debug, thiserror::Error)]
pub enum CypherError {
    /// AEAD encryption failed.
    #[error("encryption failed: {reason}")]
    Encryption { reason: String },

    /// AEAD decryption failed (wrong key, corrupted ciphertext, or tampered tag).
    #[error("decryption failed: {reason}")]
    Decryption { reason: String },

    /// Ciphertext is too short to contain a valid nonce + tag.
    #[error("ciphertext too short: expected at least {expected} bytes, got {actual}")]
    CiphertextTooShort { expected: usize, actual: usize },

    /// Cypher text or key material was not valid base64 / UTF-8.
    #[error("encoding error: {reason}")]
    Encoding { reason: String },

    /// The algorithm is not supported for the requested use.
    #[error("unsupported algorithm '{algorithm}'")]
    UnsupportedAlgorithm { algorithm: String },

    /// No key exists at the referenced path.
    #[error("key not found at '{path}'")]
    KeyNotFound { path: String },

    /// A key reference could not be resolved to usable material.
    #[error("failed to resolve key '{path}': {reason}")]
    KeyResolution { path: String, reason: String },

    /// Key or certificate generation failed.
    #[error("key generation failed: {reason}")]
    KeyGeneration { reason: String },

    /// The key store file is unreadable or corrupted.
    #[error("key store error: {reason}")]
    KeyStore { reason: String },

    /// Password hashing or key derivation failed.
    #[error("key derivation failed: {reason}")]
    KeyDerivation { reason: String },

    /// Signing or verifying a compact token failed.
    #[error("signature error: {reason}")]
    Signature { reason: String },

    /// The underlying storage backend returned an error.
    #[error("key store storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Errors from audit logging.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// Every configured audit backend failed to write; the request must be denied.
    #[error("all audit backends failed")]
    AllBackendsFailed,

    /// A single backend failed.
    #[error("audit backend '{name}' failed: {reason}")]
    BackendFailure { name: String, reason: String },

    /// The audit entry could not be serialized.
    #[error("audit serialization failed: {reason}")]
    Serialization { reason: String },
}

/// Errors surfaced by the vault service and its components.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// The capability check failed, or the target does not exist. Both cases
    /// are reported identically so existence is not leaked.
    #[error("access denied to '{path}'")]
    AccessDenied { path: String },

    /// The token is revoked, expired, malformed, out of scope, or its
    /// signature failed to verify.
    #[error("invalid token: {reason}")]
    InvalidToken { reason: String },

    /// Encryption, decryption, or key resolution failed.
    #[error("cypher error: {0}")]
    Cypher(#[from] CypherError),

    /// The underlying storage backend returned an error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A stored record could not be parsed or serialized.
    #[error("malformed {what}: {reason}")]
    Malformed { what: String, reason: String },

    /// A caller supplied path is not a valid vault path.
    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    /// No root principal record exists, neither encrypted nor plaintext.
    #[error("missing root principal")]
    MissingRootPrincipal,

    /// Unknown principal or wrong password. The two are not distinguished.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// A request parameter is out of range.
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// Renewal was requested for a token that is not renewable or already expired.
    #[error("token is not renewable")]
    NotRenewable,

    /// The service is not in the state the operation requires.
    #[error("vault is {state}, expected {expected}")]
    IllegalState {
        state: String,
        expected: &'static str,
    },

    /// The bootstrap template could not be applied.
    #[error("bootstrap template error: {reason}")]
    Template { reason: String },

    /// Audit logging failed closed.
    #[error("audit error: {0}")]
    Audit(#[from] AuditError),

    /// A worker task failed before completing the operation.
    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl VaultError {
    pub(crate) fn access_denied(path: &str) -> Self {
        Self::AccessDenied {
            path: path.to_owned(),
        }
    }

    pub(crate) fn invalid_token(reason: impl Into<String>) -> Self {
        Self::InvalidToken {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    pub(crate) fn malformed(what: &str, reason: impl std::fmt::Display) -> Self {
        Self::Malformed {
            what: what.to_owned(),
            reason: reason.to_string(),
        }
    }

    /// A short outcome label for audit entries.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AccessDenied { .. } => "access_denied",
            Self::InvalidToken { .. } => "invalid_token",
            Self::Cypher(_) => "cypher",
            Self::AuthenticationFailed => "authentication_failed",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::IllegalState { .. } => "illegal_state",
            _ => "error",
        }
    }
}
