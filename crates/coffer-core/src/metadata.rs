//! Vault, namespace, and cypher metadata records.
//!
//! These are plain serde documents stored as camelCase JSON. [`VaultMetaData`]
//! is read once from `.vault/vault.json` during configuration and is
//! immutable afterwards; [`NamespaceMetaData`] is read lazily per namespace.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::KdfParams;
use crate::error::VaultError;
use crate::keys::KeyReference;

fn default_algorithm() -> String {
    "AES-256-GCM".to_owned()
}

fn default_key_generator() -> String {
    "AES".to_owned()
}

fn default_key_size() -> u32 {
    256
}

fn default_key_ttl() -> u64 {
    10
}

fn default_key_store_path() -> String {
    "keystore.json".to_owned()
}

fn default_key_store_type() -> String {
    "json".to_owned()
}

fn default_user_ttl() -> i64 {
    60 * 24 * 365
}

fn default_user_token_ttl() -> i64 {
    60
}

fn default_service_token_ttl() -> i64 {
    60 * 24
}

/// Where key material lives and how a key is used.
///
/// Produces a [`KeyReference`] for the key provider and names the cypher
/// algorithm applied with the resolved key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CypherMetaData {
    /// Key reference path, e.g. `.vault/master` or `.vault/master@2`.
    pub key_path: String,
    /// Per-key password; falls back to the key-store password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Cypher or signature algorithm (`AES-256-GCM`, `EdDSA`).
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    /// Key generator used when the key is created (`AES`, `Ed25519`).
    #[serde(default = "default_key_generator")]
    pub key_generator: String,
    /// Key size in bits for secret keys.
    #[serde(default = "default_key_size")]
    pub key_size: u32,
    /// Certificate validity for generated signing keys, in days.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_days: Option<u32>,
    /// Certificate issuer DN for generated signing keys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    /// Certificate subject DN for generated signing keys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
}

impl CypherMetaData {
    /// A secret-key cypher definition with default algorithm parameters.
    #[must_use]
    pub fn secret(key_path: impl Into<String>) -> Self {
        Self {
            key_path: key_path.into(),
            password: None,
            algorithm: default_algorithm(),
            key_generator: default_key_generator(),
            key_size: default_key_size(),
            ttl_days: None,
            issuer: None,
            subject: None,
        }
    }

    /// The key reference this cypher resolves through the key provider.
    #[must_use]
    pub fn key_reference(&self) -> KeyReference {
        KeyReference {
            path: self.key_path.clone(),
            size: self.key_size,
            password: self.password.clone(),
            generator: self.key_generator.clone(),
            ttl_days: self.ttl_days,
            issuer: self.issuer.clone(),
            subject: self.subject.clone(),
        }
    }

    /// The same cypher, resolving only the public half of its key pair.
    #[must_use]
    pub fn public_key_reference(&self) -> KeyReference {
        let mut reference = self.key_reference();
        reference.path = format!("{}/public", reference.path);
        reference
    }
}

impl fmt::Debug for CypherMetaData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CypherMetaData")
            .field("key_path", &self.key_path)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("algorithm", &self.algorithm)
            .field("key_size", &self.key_size)
            .finish_non_exhaustive()
    }
}

/// Location and protection of the persistent key store.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyStoreMetaData {
    /// File name below `.vault/`.
    #[serde(default = "default_key_store_path")]
    pub path: String,
    /// Store format. Only `json` is supported.
    #[serde(rename = "type", default = "default_key_store_type")]
    pub store_type: String,
    /// Password wrapping every entry that has no password of its own.
    pub password: String,
    /// Argon2id cost for deriving wrapping keys from passwords.
    #[serde(default)]
    pub kdf: KdfParams,
}

impl fmt::Debug for KeyStoreMetaData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyStoreMetaData")
            .field("path", &self.path)
            .field("store_type", &self.store_type)
            .field("password", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

/// Root configuration of a vault.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultMetaData {
    /// The backing key store.
    pub key_store: KeyStoreMetaData,
    /// Cypher of the root namespace.
    pub master_cypher: CypherMetaData,
    /// Signing key for compact tokens. Without it every token is opaque.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_signature_cypher: Option<CypherMetaData>,
    /// Key cache TTL in seconds.
    #[serde(default = "default_key_ttl")]
    pub key_ttl: u64,
    /// Issuer DN for generated certificates.
    #[serde(rename = "issuerDN", default, skip_serializing_if = "Option::is_none")]
    pub issuer_dn: Option<String>,
    /// Subject DN for generated certificates.
    #[serde(rename = "subjectDN", default, skip_serializing_if = "Option::is_none")]
    pub subject_dn: Option<String>,
    /// Lifetime of user principals, minutes.
    #[serde(rename = "userPrincipleTTL", default = "default_user_ttl")]
    pub user_principal_ttl: i64,
    /// Lifetime of service principals, minutes.
    #[serde(rename = "servicePrincipleTTL", default = "default_user_ttl")]
    pub service_principal_ttl: i64,
    /// Lifetime of tokens issued by `authenticate`, minutes.
    #[serde(rename = "userPrincipleTokenTTL", default = "default_user_token_ttl")]
    pub user_principal_token_ttl: i64,
    /// Lifetime of service tokens, minutes.
    #[serde(rename = "servicePrincipleTokenTTL", default = "default_service_token_ttl")]
    pub service_principal_token_ttl: i64,
}

impl VaultMetaData {
    /// Parse `vault.json`.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Malformed`] if the document does not parse.
    pub fn parse(bytes: &[u8]) -> Result<Self, VaultError> {
        serde_json::from_slice(bytes).map_err(|e| VaultError::malformed("vault metadata", e))
    }
}

/// A node of the namespace tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NamespaceMetaData {
    /// Default TTL of secrets in this namespace, minutes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_ttl: Option<i64>,
    /// Explicit cypher; inherited from the parent when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cypher: Option<CypherMetaData>,
    /// Creation timestamp.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    /// Deletion timestamp.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted: Option<DateTime<Utc>>,
    /// Record version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    /// Whether the namespace contents were destroyed.
    pub destroyed: bool,
    /// Principal that created the namespace.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    /// Principal that deleted the namespace.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_by: Option<String>,
    /// Whether this is the root namespace.
    pub root: bool,
}
