//! Persistent key store.
//!
//! A single JSON document below `.vault/` holding every key alias as a list
//! of versioned entries. Generating a key for an alias that already exists
//! appends a new version (rotation); older versions stay resolvable through
//! pinned references.
//!
//! # Security model
//!
//! - Private material (secret keys, PKCS#8 signing keys) is wrapped with
//!   AES-256-GCM under a key derived from the store password, or the
//!   entry's own password, with Argon2id over a per-store random salt.
//! - Public keys and certificates are stored in the clear.
//! - A zero-length store file is treated as absent and replaced.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Datelike, Utc};
use coffer_storage::StorageBackend;
use serde::{Deserialize, Serialize};
use tokio::sync::{OnceCell, RwLock};
use tracing::info;
use zeroize::Zeroizing;

use crate::crypto::{self, EncryptionKey, KdfParams, SymmetricAlgorithm};
use crate::error::CypherError;
use crate::keys::{KeyLocator, KeyMaterial, KeyReference, KeyVersion};
use crate::metadata::KeyStoreMetaData;
use crate::paths::{self, META_DIR};

/// Current on-disk format.
const FORMAT_VERSION: u32 = 1;

/// Salt length for wrapping-key derivation.
const SALT_LEN: usize = 16;

/// Default certificate validity for generated signing keys.
const DEFAULT_CERT_DAYS: u32 = 365;

/// Kind of a stored key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyKind {
    /// Symmetric key.
    Secret,
    /// Asymmetric signing pair.
    Signing,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredKey {
    version: u32,
    kind: KeyKind,
    generator: String,
    wrapped: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    certificate: Option<String>,
    created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct KeyStoreFile {
    format: u32,
    salt: String,
    #[serde(default)]
    entries: BTreeMap<String, Vec<StoredKey>>,
}

impl KeyStoreFile {
    fn new() -> Self {
        Self {
            format: FORMAT_VERSION,
            salt: BASE64.encode(crypto::random_bytes(SALT_LEN).as_slice()),
            entries: BTreeMap::new(),
        }
    }
}

struct Generated {
    kind: KeyKind,
    private: Zeroizing<Vec<u8>>,
    public: Option<Vec<u8>>,
    certificate: Option<String>,
}

/// The persistent key store of a vault.
pub struct KeyStore {
    storage: Arc<dyn StorageBackend>,
    key: String,
    password: Zeroizing<String>,
    kdf: KdfParams,
    file: RwLock<KeyStoreFile>,
    store_key: OnceCell<EncryptionKey>,
}

impl KeyStore {
    /// Open the store described by `meta`, creating an empty one when the
    /// file is missing or zero-length.
    ///
    /// # Errors
    ///
    /// - [`CypherError::KeyStore`] if the type is unsupported or the file is corrupted.
    /// - [`CypherError::Storage`] if the backend fails.
    pub async fn open(
        storage: Arc<dyn StorageBackend>,
        meta: &KeyStoreMetaData,
    ) -> Result<Self, CypherError> {
        if !meta.store_type.eq_ignore_ascii_case("json") {
            return Err(CypherError::KeyStore {
                reason: format!("unsupported key store type '{}'", meta.store_type),
            });
        }
        let key = paths::join(META_DIR, &meta.path);

        let file = match storage.get(&key).await? {
            Some(bytes) if !bytes.is_empty() => {
                let file: KeyStoreFile =
                    serde_json::from_slice(&bytes).map_err(|e| CypherError::KeyStore {
                        reason: format!("corrupted key store '{key}': {e}"),
                    })?;
                if file.format != FORMAT_VERSION {
                    return Err(CypherError::KeyStore {
                        reason: format!("unsupported key store format {}", file.format),
                    });
                }
                file
            }
            existing => {
                if existing.is_some() {
                    storage.delete(&key).await?;
                    info!(path = %key, "removed empty key store");
                }
                storage.create_dir_all(paths::parent(&key).unwrap_or("")).await?;
                let file = KeyStoreFile::new();
                write_file(storage.as_ref(), &key, &file).await?;
                info!(path = %key, "key store created");
                file
            }
        };

        Ok(Self {
            storage,
            key,
            password: Zeroizing::new(meta.password.clone()),
            kdf: meta.kdf,
            file: RwLock::new(file),
            store_key: OnceCell::new(),
        })
    }

    /// Whether the store holds no keys at all.
    pub async fn is_empty(&self) -> bool {
        self.file.read().await.entries.is_empty()
    }

    /// Whether an alias has at least one version.
    pub async fn contains(&self, alias: &str) -> bool {
        self.file
            .read()
            .await
            .entries
            .get(alias)
            .is_some_and(|versions| !versions.is_empty())
    }

    /// All stored versions of an alias, ascending.
    pub async fn versions(&self, alias: &str) -> Vec<u32> {
        self.file
            .read()
            .await
            .entries
            .get(alias)
            .map(|versions| versions.iter().map(|k| k.version).collect())
            .unwrap_or_default()
    }

    /// Append a new version to an existing alias. Older versions stay
    /// resolvable by pinned reference.
    ///
    /// # Errors
    ///
    /// - [`CypherError::KeyNotFound`] if the alias has no versions yet.
    /// - Any error from [`generate`](Self::generate).
    pub async fn rotate(&self, reference: &KeyReference) -> Result<u32, CypherError> {
        let locator = KeyLocator::parse(&reference.path)?;
        if !self.contains(&locator.alias).await {
            return Err(CypherError::KeyNotFound {
                path: reference.path.clone(),
            });
        }
        let version = self.generate(reference).await?;
        info!(alias = %locator.alias, version, "key rotated");
        Ok(version)
    }

    /// Generate new material for the referenced alias and persist it as the
    /// next version. Returns the new version number.
    ///
    /// # Errors
    ///
    /// - [`CypherError::KeyResolution`] for malformed or `/public` references.
    /// - [`CypherError::UnsupportedAlgorithm`] for unknown generators or sizes.
    /// - [`CypherError::KeyGeneration`] if key or certificate creation fails.
    pub async fn generate(&self, reference: &KeyReference) -> Result<u32, CypherError> {
        let locator = KeyLocator::parse(&reference.path)?;
        if locator.public_only || locator.version != KeyVersion::Latest {
            return Err(CypherError::KeyResolution {
                path: reference.path.clone(),
                reason: "keys are generated by alias only".to_owned(),
            });
        }

        let owned = reference.clone();
        let generated = tokio::task::spawn_blocking(move || generate_material(&owned))
            .await
            .map_err(|e| CypherError::KeyGeneration {
                reason: e.to_string(),
            })??;

        let wrapping = self.wrapping_key(reference.password.as_deref()).await?;
        let wrapped = crypto::encrypt(
            SymmetricAlgorithm::Aes256Gcm,
            wrapping.as_bytes(),
            &generated.private,
        )?;

        let mut file = self.file.write().await;
        let versions = file.entries.entry(locator.alias.clone()).or_default();
        let version = versions.iter().map(|k| k.version).max().unwrap_or(0) + 1;
        versions.push(StoredKey {
            version,
            kind: generated.kind,
            generator: reference.generator.clone(),
            wrapped: BASE64.encode(wrapped),
            public_key: generated.public.map(|p| BASE64.encode(p)),
            certificate: generated.certificate,
            created_at: Utc::now(),
        });
        write_file(self.storage.as_ref(), &self.key, &file).await?;

        info!(alias = %locator.alias, version, kind = ?generated.kind, "key generated");
        Ok(version)
    }

    /// Load key material. `Ok(None)` if the alias or version does not exist.
    ///
    /// # Errors
    ///
    /// - [`CypherError::KeyResolution`] if a public key is requested from a secret key.
    /// - [`CypherError::Decryption`] if the password is wrong or the entry is corrupted.
    pub async fn load(
        &self,
        locator: &KeyLocator,
        password: Option<&str>,
    ) -> Result<Option<KeyMaterial>, CypherError> {
        let stored = {
            let file = self.file.read().await;
            let Some(versions) = file.entries.get(&locator.alias) else {
                return Ok(None);
            };
            let found = match locator.version {
                KeyVersion::Latest => versions.iter().max_by_key(|k| k.version),
                KeyVersion::Exact(v) => versions.iter().find(|k| k.version == v),
            };
            match found {
                Some(stored) => stored.clone(),
                None => return Ok(None),
            }
        };

        let decode = |value: &str| {
            BASE64.decode(value).map_err(|e| CypherError::Encoding {
                reason: format!("key '{}': {e}", locator.alias),
            })
        };

        if locator.public_only {
            let public = stored
                .public_key
                .as_deref()
                .ok_or_else(|| CypherError::KeyResolution {
                    path: locator.alias.clone(),
                    reason: "key has no public half".to_owned(),
                })?;
            return Ok(Some(KeyMaterial::Verifying {
                version: stored.version,
                public: decode(public)?,
                certificate: stored.certificate,
            }));
        }

        let wrapping = self.wrapping_key(password).await?;
        let private = Zeroizing::new(crypto::decrypt(
            SymmetricAlgorithm::Aes256Gcm,
            wrapping.as_bytes(),
            &decode(&stored.wrapped)?,
        )?);

        let material = match stored.kind {
            KeyKind::Secret => KeyMaterial::Secret {
                version: stored.version,
                bytes: private,
            },
            KeyKind::Signing => KeyMaterial::Signing {
                version: stored.version,
                private_der: private,
                public: decode(stored.public_key.as_deref().unwrap_or_default())?,
                certificate: stored.certificate,
            },
        };
        Ok(Some(material))
    }

    async fn wrapping_key(&self, password: Option<&str>) -> Result<EncryptionKey, CypherError> {
        let salt = BASE64
            .decode(&self.file.read().await.salt)
            .map_err(|e| CypherError::KeyStore {
                reason: format!("corrupted salt: {e}"),
            })?;

        match password {
            Some(own) if own != self.password.as_str() => {
                derive(Zeroizing::new(own.to_owned()), salt, self.kdf).await
            }
            _ => {
                let key = self
                    .store_key
                    .get_or_try_init(|| derive(self.password.clone(), salt, self.kdf))
                    .await?;
                Ok(key.clone())
            }
        }
    }
}

impl fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyStore")
            .field("key", &self.key)
            .field("password", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

async fn derive(
    password: Zeroizing<String>,
    salt: Vec<u8>,
    kdf: KdfParams,
) -> Result<EncryptionKey, CypherError> {
    tokio::task::spawn_blocking(move || {
        crypto::derive_key_from_password(password.as_bytes(), &salt, &kdf)
    })
    .await
    .map_err(|e| CypherError::KeyDerivation {
        reason: e.to_string(),
    })?
}

async fn write_file(
    storage: &dyn StorageBackend,
    key: &str,
    file: &KeyStoreFile,
) -> Result<(), CypherError> {
    let bytes = serde_json::to_vec_pretty(file).map_err(|e| CypherError::KeyStore {
        reason: format!("serialization failed: {e}"),
    })?;
    storage.put(key, &bytes).await?;
    Ok(())
}

fn generate_material(reference: &KeyReference) -> Result<Generated, CypherError> {
    match reference.generator.to_ascii_uppercase().as_str() {
        "AES" | "AES-GCM" => {
            if reference.size != 128 && reference.size != 256 {
                return Err(CypherError::UnsupportedAlgorithm {
                    algorithm: format!("AES-{}", reference.size),
                });
            }
            Ok(Generated {
                kind: KeyKind::Secret,
                private: crypto::random_bytes(reference.size as usize / 8),
                public: None,
                certificate: None,
            })
        }
        "ED25519" | "EDDSA" => generate_signing_pair(reference),
        other => Err(CypherError::UnsupportedAlgorithm {
            algorithm: other.to_owned(),
        }),
    }
}

fn generate_signing_pair(reference: &KeyReference) -> Result<Generated, CypherError> {
    let key_pair = rcgen::KeyPair::generate_for(&rcgen::PKCS_ED25519).map_err(|e| {
        CypherError::KeyGeneration {
            reason: format!("key generation failed: {e}"),
        }
    })?;

    let mut params = rcgen::CertificateParams::new(Vec::<String>::new()).map_err(|e| {
        CypherError::KeyGeneration {
            reason: format!("failed to create cert params: {e}"),
        }
    })?;
    let subject = reference
        .subject
        .as_deref()
        .or(reference.issuer.as_deref())
        .unwrap_or("CN=coffer");
    params.distinguished_name = distinguished_name(subject);

    let now = Utc::now();
    let days = reference.ttl_days.unwrap_or(DEFAULT_CERT_DAYS);
    let (year, month, day) = ymd(now);
    params.not_before = rcgen::date_time_ymd(year, month, day);
    let (year, month, day) = ymd(now + chrono::Duration::days(i64::from(days)));
    params.not_after = rcgen::date_time_ymd(year, month, day);

    let certificate = params
        .self_signed(&key_pair)
        .map_err(|e| CypherError::KeyGeneration {
            reason: format!("self-signing failed: {e}"),
        })?;

    Ok(Generated {
        kind: KeyKind::Signing,
        private: Zeroizing::new(key_pair.serialize_der()),
        public: Some(key_pair.public_key_raw().to_vec()),
        certificate: Some(certificate.pem()),
    })
}

fn ymd(at: DateTime<Utc>) -> (i32, u8, u8) {
    (
        at.year(),
        u8::try_from(at.month()).unwrap_or(1),
        u8::try_from(at.day()).unwrap_or(1),
    )
}

/// Parse `CN=..., O=..., C=...` into a distinguished name. Anything without
/// recognised attributes becomes the common name.
fn distinguished_name(dn: &str) -> rcgen::DistinguishedName {
    let mut name = rcgen::DistinguishedName::new();
    for part in dn.split(',') {
        let Some((attr, value)) = part.split_once('=') else {
            continue;
        };
        let dn_type = match attr.trim().to_ascii_uppercase().as_str() {
            "CN" => rcgen::DnType::CommonName,
            "O" => rcgen::DnType::OrganizationName,
            "OU" => rcgen::DnType::OrganizationalUnitName,
            "C" => rcgen::DnType::CountryName,
            "L" => rcgen::DnType::LocalityName,
            "ST" => rcgen::DnType::StateOrProvinceName,
            _ => continue,
        };
        name.push(dn_type, value.trim());
    }
    if name.iter().next().is_none() {
        name.push(rcgen::DnType::CommonName, dn.trim());
    }
    name
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use coffer_storage::MemoryBackend;

    use super::*;
    use crate::crypto::tests::FAST_KDF;
    use crate::metadata::CypherMetaData;

    fn meta() -> KeyStoreMetaData {
        KeyStoreMetaData {
            path: "keystore.json".to_owned(),
            store_type: "json".to_owned(),
            password: "store-password".to_owned(),
            kdf: FAST_KDF,
        }
    }

    fn signing(path: &str) -> KeyReference {
        let mut cypher = CypherMetaData::secret(path);
        cypher.algorithm = "EdDSA".to_owned();
        cypher.key_generator = "Ed25519".to_owned();
        cypher.subject = Some("CN=coffer test, O=Coffer".to_owned());
        cypher.key_reference()
    }

    #[tokio::test]
    async fn creates_store_and_generates_secret_key() {
        let storage = Arc::new(MemoryBackend::new());
        let store = KeyStore::open(storage.clone(), &meta()).await.unwrap();
        assert!(store.is_empty().await);
        assert!(storage.exists(".vault/keystore.json").await.unwrap());

        let reference = CypherMetaData::secret(".vault/master").key_reference();
        assert_eq!(store.generate(&reference).await.unwrap(), 1);
        assert!(store.contains("master").await);

        let locator = KeyLocator::parse(".vault/master").unwrap();
        let material = store.load(&locator, None).await.unwrap().unwrap();
        assert_eq!(material.secret_bytes().unwrap().len(), 32);
    }

    #[tokio::test]
    async fn reopened_store_resolves_same_key() {
        let storage = Arc::new(MemoryBackend::new());
        let reference = CypherMetaData::secret(".vault/master").key_reference();
        let locator = KeyLocator::parse(".vault/master").unwrap();

        let first = KeyStore::open(storage.clone(), &meta()).await.unwrap();
        first.generate(&reference).await.unwrap();
        let a = first.load(&locator, None).await.unwrap().unwrap();

        let second = KeyStore::open(storage, &meta()).await.unwrap();
        let b = second.load(&locator, None).await.unwrap().unwrap();
        assert_eq!(a.secret_bytes(), b.secret_bytes());
    }

    #[tokio::test]
    async fn rotation_keeps_old_versions() {
        let storage = Arc::new(MemoryBackend::new());
        let store = KeyStore::open(storage, &meta()).await.unwrap();
        let reference = CypherMetaData::secret(".vault/app").key_reference();
        assert!(matches!(
            store.rotate(&reference).await,
            Err(CypherError::KeyNotFound { .. })
        ));
        store.generate(&reference).await.unwrap();
        assert_eq!(store.rotate(&reference).await.unwrap(), 2);
        assert_eq!(store.versions("app").await, vec![1, 2]);

        let latest = store
            .load(&KeyLocator::parse(".vault/app").unwrap(), None)
            .await
            .unwrap()
            .unwrap();
        let pinned = store
            .load(&KeyLocator::parse(".vault/app@1").unwrap(), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.version(), 2);
        assert_eq!(pinned.version(), 1);
        assert_ne!(latest.secret_bytes(), pinned.secret_bytes());
        assert!(
            store
                .load(&KeyLocator::parse(".vault/app@9").unwrap(), None)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn signing_pair_has_public_half_and_certificate() {
        let storage = Arc::new(MemoryBackend::new());
        let store = KeyStore::open(storage, &meta()).await.unwrap();
        store.generate(&signing(".vault/token-signature")).await.unwrap();

        let full = store
            .load(&KeyLocator::parse(".vault/token-signature").unwrap(), None)
            .await
            .unwrap()
            .unwrap();
        assert!(full.private_der().is_some());
        assert_eq!(full.public_key().unwrap().len(), 32);
        assert!(full.certificate().unwrap().contains("BEGIN CERTIFICATE"));

        let public = store
            .load(
                &KeyLocator::parse(".vault/token-signature/public").unwrap(),
                None,
            )
            .await
            .unwrap()
            .unwrap();
        assert!(public.private_der().is_none());
        assert_eq!(public.public_key(), full.public_key());
    }

    #[tokio::test]
    async fn per_key_password_is_required_to_unwrap() {
        let storage = Arc::new(MemoryBackend::new());
        let store = KeyStore::open(storage, &meta()).await.unwrap();
        let mut cypher = CypherMetaData::secret(".vault/guarded");
        cypher.password = Some("own-password".to_owned());
        store.generate(&cypher.key_reference()).await.unwrap();

        let locator = KeyLocator::parse(".vault/guarded").unwrap();
        assert!(store.load(&locator, Some("own-password")).await.unwrap().is_some());
        assert!(matches!(
            store.load(&locator, None).await,
            Err(CypherError::Decryption { .. })
        ));
    }

    #[tokio::test]
    async fn empty_file_is_replaced() {
        let storage = Arc::new(MemoryBackend::new());
        storage.create_dir_all(".vault").await.unwrap();
        storage.put(".vault/keystore.json", b"").await.unwrap();
        let store = KeyStore::open(storage.clone(), &meta()).await.unwrap();
        assert!(store.is_empty().await);
        let bytes = storage.get(".vault/keystore.json").await.unwrap().unwrap();
        assert!(!bytes.is_empty());
    }

    #[tokio::test]
    async fn corrupted_file_is_an_error() {
        let storage = Arc::new(MemoryBackend::new());
        storage.create_dir_all(".vault").await.unwrap();
        storage.put(".vault/keystore.json", b"{not json").await.unwrap();
        let result = KeyStore::open(storage, &meta()).await;
        assert!(matches!(result, Err(CypherError::KeyStore { .. })));
    }

    #[tokio::test]
    async fn unsupported_generator_is_rejected() {
        let storage = Arc::new(MemoryBackend::new());
        let store = KeyStore::open(storage, &meta()).await.unwrap();
        let mut cypher = CypherMetaData::secret(".vault/odd");
        cypher.key_generator = "DES".to_owned();
        assert!(matches!(
            store.generate(&cypher.key_reference()).await,
            Err(CypherError::UnsupportedAlgorithm { .. })
        ));
    }

    #[test]
    fn distinguished_name_parsing() {
        let dn = distinguished_name("CN=vault, O=Example, C=US");
        assert_eq!(dn.iter().count(), 3);
        let bare = distinguished_name("just a name");
        assert_eq!(bare.iter().count(), 1);
    }
}
