//! Core library for Coffer.
//!
//! Contains the key store and cypher layer, namespace resolution, the
//! encrypted secret store, the policy engine, token management, the audit
//! system, the bootstrap template and the [`VaultService`] that ties them
//! together. This crate depends on `coffer-storage` for the storage backend
//! trait and knows nothing about command lines or transports.

pub mod audit;
pub mod audit_file;
pub mod claims;
pub mod crypto;
pub mod cypher;
pub mod error;
pub mod glob;
pub mod keys;
pub mod keystore;
pub mod metadata;
pub mod namespace;
pub mod paths;
pub mod policy;
pub mod principal;
pub mod secret_store;
pub mod template;
pub mod token;
pub mod vault;

pub use audit::{AuditBackend, AuditEntry, AuditManager};
pub use audit_file::FileAuditBackend;
pub use error::{AuditError, CypherError, VaultError};
pub use token::TokenRequest;
pub use vault::{InitializeGuard, VaultService, VaultState};
