//! Encrypted single-file secret storage.
//!
//! Every secret lives at `<path>.sec` as `base64(nonce || ciphertext || tag)`
//! under the cypher of its namespace. Every operation acts on the target path
//! of the [`Principal`] it is given and checks that principal's capabilities
//! first. A missing secret is reported exactly like a forbidden one.
//!
//! Operations are single-file and non-transactional. Concurrent writers to
//! one path race; the last atomic replace wins.

use std::collections::BTreeSet;
use std::sync::Arc;

use coffer_storage::StorageBackend;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::VaultError;
use crate::namespace::NamespaceResolver;
use crate::paths::{self, SECURE_EXTENSION};
use crate::policy::Capability;
use crate::principal::Principal;

/// Reads and writes encrypted secrets.
pub struct SecretStore {
    storage: Arc<dyn StorageBackend>,
    namespaces: Arc<NamespaceResolver>,
}

impl SecretStore {
    /// Create a store over `storage`, encrypting with `namespaces`.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>, namespaces: Arc<NamespaceResolver>) -> Self {
        Self {
            storage,
            namespaces,
        }
    }

    /// The namespace resolver used for encryption.
    #[must_use]
    pub fn namespaces(&self) -> &Arc<NamespaceResolver> {
        &self.namespaces
    }

    /// Read and decrypt the secret at the principal's path.
    ///
    /// # Errors
    ///
    /// - [`VaultError::AccessDenied`] without `READ`, or if the secret does not exist.
    /// - [`VaultError::Cypher`] if decryption fails.
    pub async fn read(&self, principal: &Principal) -> Result<String, VaultError> {
        self.read_optional(principal)
            .await?
            .ok_or_else(|| VaultError::access_denied(principal.path()))
    }

    /// Like [`read`](Self::read), with a missing secret as `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Same as [`read`](Self::read), except for absence.
    pub async fn read_optional(&self, principal: &Principal) -> Result<Option<String>, VaultError> {
        let path = target(principal)?;
        principal.require(Capability::Read)?;

        let Some(bytes) = self.storage.get(&paths::secured(&path)).await? else {
            return Ok(None);
        };
        let text =
            String::from_utf8(bytes).map_err(|e| VaultError::malformed("cypher text", e))?;
        let cypher = self.namespaces.cypher_for(&path).await?;
        Ok(Some(cypher.decrypt(&text)?))
    }

    /// Whether a secret exists at the principal's path.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::AccessDenied`] without `READ`.
    pub async fn exists(&self, principal: &Principal) -> Result<bool, VaultError> {
        let path = target(principal)?;
        principal.require(Capability::Read)?;
        Ok(self.storage.exists(&paths::secured(&path)).await?)
    }

    /// Encrypt and store `text` at the principal's path.
    ///
    /// Creating missing parent directories needs `MANAGE`, creating a new
    /// secret needs `CREATE` or `MANAGE`, replacing one needs `UPDATE`.
    ///
    /// # Errors
    ///
    /// - [`VaultError::AccessDenied`] if a required capability is missing.
    /// - [`VaultError::Cypher`] or [`VaultError::Storage`] on failure.
    pub async fn write(&self, principal: &Principal, text: &str) -> Result<(), VaultError> {
        let path = target(principal)?;
        let key = paths::secured(&path);

        let dir = paths::parent(&path).unwrap_or_default();
        if !self.storage.dir_exists(dir).await? {
            principal.require(Capability::Manage)?;
            self.storage.create_dir_all(dir).await?;
            debug!(dir = %dir, "created secret directory");
        }

        let exists = self.storage.exists(&key).await?;
        if exists {
            principal.require(Capability::Update)?;
        } else if !principal.has(Capability::Manage) {
            principal.require(Capability::Create)?;
        }

        let cypher = self.namespaces.cypher_for(&path).await?;
        let encrypted = cypher.encrypt(text)?;
        if exists {
            self.storage.update(&key, encrypted.as_bytes()).await?;
        } else {
            self.storage.put(&key, encrypted.as_bytes()).await?;
        }

        if paths::is_namespace_file(&path) {
            self.namespaces.clear();
        }
        Ok(())
    }

    /// Serialize `value` as JSON and [`write`](Self::write) it.
    ///
    /// # Errors
    ///
    /// Same as [`write`](Self::write), plus [`VaultError::Malformed`] if
    /// serialization fails.
    pub async fn write_value<T: Serialize + Sync>(
        &self,
        principal: &Principal,
        value: &T,
    ) -> Result<(), VaultError> {
        let text = serde_json::to_string(value)
            .map_err(|e| VaultError::malformed("secret value", e))?;
        self.write(principal, &text).await
    }

    /// Delete the secret at the principal's path.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::AccessDenied`] without `DELETE`, or if the
    /// secret does not exist.
    pub async fn delete(&self, principal: &Principal) -> Result<(), VaultError> {
        if self.remove(principal).await? {
            Ok(())
        } else {
            Err(VaultError::access_denied(principal.path()))
        }
    }

    /// Delete the secret at the principal's path, returning whether it existed.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::AccessDenied`] without `DELETE`.
    pub async fn remove(&self, principal: &Principal) -> Result<bool, VaultError> {
        let path = target(principal)?;
        principal.require(Capability::Delete)?;
        let removed = self.storage.delete(&paths::secured(&path)).await?;
        if removed && paths::is_namespace_file(&path) {
            self.namespaces.clear();
        }
        Ok(removed)
    }

    /// Names directly below the principal's path: secrets without their
    /// extension and sub-directories with a trailing `/`. Namespace metadata
    /// is hidden.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::AccessDenied`] without `LIST`.
    pub async fn list(&self, principal: &Principal) -> Result<Vec<String>, VaultError> {
        let dir = paths::normalize(principal.path())?;
        if paths::is_meta(&dir) {
            return Err(VaultError::access_denied(principal.path()));
        }
        principal.require(Capability::List)?;

        let mut names = BTreeSet::new();
        for key in self.storage.list(&dir).await? {
            let relative = if dir.is_empty() {
                key.as_str()
            } else {
                key.strip_prefix(&dir)
                    .and_then(|rest| rest.strip_prefix('/'))
                    .unwrap_or(&key)
            };
            match relative.split_once('/') {
                Some((child, _)) => {
                    if child != paths::META_DIR {
                        names.insert(format!("{child}/"));
                    }
                }
                None => match relative.strip_suffix(SECURE_EXTENSION) {
                    Some(name) if name != paths::NAMESPACE_FILE => {
                        names.insert(name.to_owned());
                    }
                    _ => {}
                },
            }
        }
        Ok(names.into_iter().collect())
    }

    /// Read a plaintext file that has not been migrated yet. No capability
    /// check; only the bootstrap path uses this.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Storage`] or [`VaultError::Malformed`] on failure.
    pub async fn read_unsecured(&self, path: &str) -> Result<Option<String>, VaultError> {
        let Some(bytes) = self.storage.get(path).await? else {
            return Ok(None);
        };
        String::from_utf8(bytes)
            .map(Some)
            .map_err(|e| VaultError::malformed("plaintext secret", e))
    }

    /// Every plaintext file outside the metadata directory, namespace
    /// metadata first (shallowest first), then everything else in order.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Storage`] if listing fails.
    pub async fn unsecured_files(&self) -> Result<Vec<String>, VaultError> {
        let mut files: Vec<String> = self
            .storage
            .list("")
            .await?
            .into_iter()
            .filter(|key| !paths::is_secured(key) && !paths::is_meta(key))
            .collect();
        files.sort_by_key(|key| {
            (
                !paths::is_namespace_file(key),
                key.matches('/').count(),
                key.clone(),
            )
        });
        Ok(files)
    }

    /// Encrypt the plaintext file at the principal's path in place and
    /// delete the original.
    ///
    /// # Errors
    ///
    /// Same as [`write`](Self::write); the plaintext is kept if encryption fails.
    pub async fn migrate(&self, principal: &Principal) -> Result<(), VaultError> {
        let path = target(principal)?;
        let Some(text) = self.read_unsecured(&path).await? else {
            return Ok(());
        };
        self.write(principal, &text).await?;
        self.storage.delete(&path).await?;
        info!(path = %path, "migrated plaintext secret");
        Ok(())
    }
}

impl std::fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretStore").finish_non_exhaustive()
    }
}

/// The normalized target path of a principal. The root and the metadata
/// directory are never secrets.
fn target(principal: &Principal) -> Result<String, VaultError> {
    let path = paths::normalize(principal.path())?;
    if path.is_empty() {
        return Err(VaultError::InvalidPath {
            path,
            reason: "empty secret path".to_owned(),
        });
    }
    if paths::is_meta(&path) {
        return Err(VaultError::access_denied(principal.path()));
    }
    Ok(path)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod tests {
    use chrono::Duration;
    use coffer_storage::MemoryBackend;

    use super::*;
    use crate::claims::PrincipalClaims;
    use crate::crypto::tests::FAST_KDF;
    use crate::cypher::CypherProvider;
    use crate::glob::PatternType;
    use crate::keys::KeyStoreKeyProvider;
    use crate::keystore::KeyStore;
    use crate::metadata::{CypherMetaData, KeyStoreMetaData};
    use crate::policy::Policy;

    pub(crate) struct StoreFixture {
        pub storage: Arc<MemoryBackend>,
        pub store: Arc<SecretStore>,
        pub root: Arc<PrincipalClaims>,
        pub cyphers: Arc<CypherProvider>,
        pub signature: CypherMetaData,
    }

    pub(crate) async fn store_fixture() -> StoreFixture {
        let storage = Arc::new(MemoryBackend::new());
        let meta = KeyStoreMetaData {
            path: "keystore.json".to_owned(),
            store_type: "json".to_owned(),
            password: "pw".to_owned(),
            kdf: FAST_KDF,
        };
        let keys = Arc::new(KeyStore::open(storage.clone(), &meta).await.unwrap());
        let master = CypherMetaData::secret(".vault/master");
        let mut signature = CypherMetaData::secret(".vault/token-signature");
        signature.algorithm = "EdDSA".to_owned();
        signature.key_generator = "Ed25519".to_owned();
        keys.generate(&master.key_reference()).await.unwrap();
        keys.generate(&signature.key_reference()).await.unwrap();
        let cyphers = Arc::new(CypherProvider::new(Arc::new(KeyStoreKeyProvider::new(keys))));
        let namespaces = Arc::new(NamespaceResolver::new(
            storage.clone(),
            cyphers.clone(),
            master,
        ));
        namespaces.bootstrap().await.unwrap();
        StoreFixture {
            store: Arc::new(SecretStore::new(storage.clone(), namespaces)),
            storage,
            root: Arc::new(PrincipalClaims::temporary_root(Duration::minutes(30))),
            cyphers,
            signature,
        }
    }

    fn acting(path: &str, capabilities: &[Capability]) -> Principal {
        Principal::new(
            Arc::new(PrincipalClaims::default()),
            "t.test",
            "sys/principle/test",
            path,
            Arc::new(Policy::new(
                "test",
                "**",
                PatternType::Glob,
                capabilities.iter().copied(),
            )),
        )
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let f = store_fixture().await;
        let root = Principal::root(f.root.clone(), "secret/app1/db");
        f.store.write(&root, "s3cr3t ✓").await.unwrap();
        assert_eq!(f.store.read(&root).await.unwrap(), "s3cr3t ✓");

        let raw = f.storage.get("secret/app1/db.sec").await.unwrap().unwrap();
        assert!(!String::from_utf8(raw).unwrap().contains("s3cr3t"));
    }

    #[tokio::test]
    async fn missing_and_forbidden_look_the_same() {
        let f = store_fixture().await;
        let root = Principal::root(f.root.clone(), "secret/foo");
        f.store.write(&root, "v").await.unwrap();

        let blind = acting("secret/foo", &[]);
        let reader = acting("secret/missing", &[Capability::Read, Capability::Delete]);
        let forbidden = f.store.read(&blind).await.unwrap_err();
        let missing = f.store.read(&reader).await.unwrap_err();
        assert!(matches!(forbidden, VaultError::AccessDenied { .. }));
        assert!(matches!(missing, VaultError::AccessDenied { .. }));
        assert!(matches!(
            f.store.delete(&reader).await,
            Err(VaultError::AccessDenied { .. })
        ));
    }

    #[tokio::test]
    async fn create_needs_manage_for_new_directories() {
        let f = store_fixture().await;
        let creator = acting("secret/new/leaf", &[Capability::Create]);
        assert!(matches!(
            f.store.write(&creator, "v").await,
            Err(VaultError::AccessDenied { .. })
        ));

        f.storage.create_dir_all("secret/new").await.unwrap();
        f.store.write(&creator, "v").await.unwrap();

        assert!(matches!(
            f.store.write(&creator, "again").await,
            Err(VaultError::AccessDenied { .. })
        ));
        let updater = acting("secret/new/leaf", &[Capability::Update, Capability::Read]);
        f.store.write(&updater, "again").await.unwrap();
        assert_eq!(f.store.read(&updater).await.unwrap(), "again");
    }

    #[tokio::test]
    async fn read_only_principal_cannot_write() {
        let f = store_fixture().await;
        let root = Principal::root(f.root.clone(), "secret/foo");
        f.store.write(&root, "v").await.unwrap();

        let reader = acting("secret/foo", &[Capability::Read]);
        assert!(matches!(
            f.store.write(&reader, "w").await,
            Err(VaultError::AccessDenied { .. })
        ));
        assert_eq!(f.store.read(&reader).await.unwrap(), "v");
    }

    #[tokio::test]
    async fn metadata_directory_is_off_limits() {
        let f = store_fixture().await;
        let root = Principal::root(f.root.clone(), ".vault/keystore.json");
        assert!(matches!(
            f.store.read(&root).await,
            Err(VaultError::AccessDenied { .. })
        ));
        let empty = Principal::root(f.root.clone(), "");
        assert!(matches!(
            f.store.write(&empty, "v").await,
            Err(VaultError::InvalidPath { .. })
        ));
    }

    #[tokio::test]
    async fn list_shows_direct_children() {
        let f = store_fixture().await;
        for path in ["secret/a", "secret/b", "secret/nested/c", "secret/namespace.json"] {
            f.store
                .write(&Principal::root(f.root.clone(), path), "v")
                .await
                .unwrap();
        }
        let names = f
            .store
            .list(&Principal::root(f.root.clone(), "secret"))
            .await
            .unwrap();
        assert_eq!(names, vec!["a", "b", "nested/"]);

        assert!(matches!(
            f.store.list(&acting("secret", &[Capability::Read])).await,
            Err(VaultError::AccessDenied { .. })
        ));
        let top = f
            .store
            .list(&Principal::root(f.root.clone(), ""))
            .await
            .unwrap();
        assert_eq!(top, vec!["secret/"]);
    }

    #[tokio::test]
    async fn migration_order_and_effect() {
        let f = store_fixture().await;
        f.storage.create_dir_all("secret/app1").await.unwrap();
        f.storage.put("secret/app1/db", b"pw").await.unwrap();
        f.storage.put("secret/app1/namespace.json", b"{}").await.unwrap();
        f.storage.put("secret/namespace.json", b"{}").await.unwrap();
        f.storage.put("top", b"t").await.unwrap();

        let files = f.store.unsecured_files().await.unwrap();
        assert_eq!(
            files,
            vec![
                "secret/namespace.json",
                "secret/app1/namespace.json",
                "top",
                "secret/app1/db",
            ]
        );

        let principal = Principal::root(f.root.clone(), "secret/app1/db");
        f.store.migrate(&principal).await.unwrap();
        assert!(!f.storage.exists("secret/app1/db").await.unwrap());
        assert_eq!(f.store.read(&principal).await.unwrap(), "pw");
    }
}
