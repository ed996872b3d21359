//! Key references, resolved key material, and key providers.
//!
//! A [`KeyReference`] names key material by path (`.vault/<alias>`), with an
//! optional `@<version>` pin and an optional `/public` suffix selecting only
//! the verifying half of a signing pair. Providers resolve references:
//!
//! - [`KeyStoreKeyProvider`] reads the persistent [`KeyStore`].
//! - [`CachedKeyProvider`] decorates any provider with a TTL-bounded cache.
//!
//! # Security model
//!
//! - All private material is held in `Zeroizing` buffers and cleared on drop,
//!   including when a cache entry is replaced.
//! - `Debug` output never contains key bytes or passwords.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::CypherError;
use crate::keystore::KeyStore;
use crate::paths::META_DIR;

/// Suffix selecting the public half of a key pair.
const PUBLIC_SUFFIX: &str = "/public";

/// A named request for key material.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyReference {
    /// Reference path, `.vault/<alias>[@<version>][/public]`.
    pub path: String,
    /// Key size in bits (secret keys).
    pub size: u32,
    /// Password protecting this entry; the store password is used when absent.
    pub password: Option<String>,
    /// Generator used if the key has to be created.
    pub generator: String,
    /// Validity of generated certificates, in days.
    pub ttl_days: Option<u32>,
    /// Issuer DN of generated certificates.
    pub issuer: Option<String>,
    /// Subject DN of generated certificates.
    pub subject: Option<String>,
}

impl fmt::Debug for KeyReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyReference")
            .field("path", &self.path)
            .field("size", &self.size)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("generator", &self.generator)
            .finish_non_exhaustive()
    }
}

/// Which version of an alias to resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyVersion {
    /// The highest stored version.
    Latest,
    /// A pinned version.
    Exact(u32),
}

/// A parsed [`KeyReference::path`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyLocator {
    /// Alias inside the key store.
    pub alias: String,
    /// Requested version.
    pub version: KeyVersion,
    /// Resolve only the public key.
    pub public_only: bool,
}

impl KeyLocator {
    /// Parse a reference path.
    ///
    /// # Errors
    ///
    /// Returns [`CypherError::KeyResolution`] if the path is outside the
    /// metadata directory or carries a malformed version.
    pub fn parse(path: &str) -> Result<Self, CypherError> {
        let unsupported = |reason: &str| CypherError::KeyResolution {
            path: path.to_owned(),
            reason: reason.to_owned(),
        };
        let rest = path
            .strip_prefix(META_DIR)
            .and_then(|r| r.strip_prefix('/'))
            .ok_or_else(|| unsupported("key paths must live under .vault/"))?;
        let (rest, public_only) = match rest.strip_suffix(PUBLIC_SUFFIX) {
            Some(stripped) => (stripped, true),
            None => (rest, false),
        };
        let (alias, version) = match rest.rsplit_once('@') {
            Some((alias, v)) => {
                let n: u32 = v.parse().map_err(|_| unsupported("malformed key version"))?;
                // Version 0 means "latest".
                let version = if n == 0 {
                    KeyVersion::Latest
                } else {
                    KeyVersion::Exact(n)
                };
                (alias, version)
            }
            None => (rest, KeyVersion::Latest),
        };
        if alias.is_empty() || alias.contains('/') {
            return Err(unsupported("malformed key alias"));
        }
        Ok(Self {
            alias: alias.to_owned(),
            version,
            public_only,
        })
    }
}

/// Resolved key material.
pub enum KeyMaterial {
    /// Symmetric key bytes.
    Secret {
        version: u32,
        bytes: Zeroizing<Vec<u8>>,
    },
    /// A signing pair: PKCS#8 private key, raw public key, and certificate.
    Signing {
        version: u32,
        private_der: Zeroizing<Vec<u8>>,
        public: Vec<u8>,
        certificate: Option<String>,
    },
    /// The public half of a signing pair.
    Verifying {
        version: u32,
        public: Vec<u8>,
        certificate: Option<String>,
    },
}

impl KeyMaterial {
    /// Version of the stored entry this material came from.
    #[must_use]
    pub fn version(&self) -> u32 {
        match self {
            Self::Secret { version, .. }
            | Self::Signing { version, .. }
            | Self::Verifying { version, .. } => *version,
        }
    }

    /// Symmetric key bytes, if this is a secret key.
    #[must_use]
    pub fn secret_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Secret { bytes, .. } => Some(bytes),
            _ => None,
        }
    }

    /// PKCS#8 private key, if this is a full signing pair.
    #[must_use]
    pub fn private_der(&self) -> Option<&[u8]> {
        match self {
            Self::Signing { private_der, .. } => Some(private_der),
            _ => None,
        }
    }

    /// Raw public key of a signing pair.
    #[must_use]
    pub fn public_key(&self) -> Option<&[u8]> {
        match self {
            Self::Signing { public, .. } | Self::Verifying { public, .. } => Some(public),
            Self::Secret { .. } => None,
        }
    }

    /// PEM certificate of a signing pair.
    #[must_use]
    pub fn certificate(&self) -> Option<&str> {
        match self {
            Self::Signing { certificate, .. } | Self::Verifying { certificate, .. } => {
                certificate.as_deref()
            }
            Self::Secret { .. } => None,
        }
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::Secret { .. } => "secret",
            Self::Signing { .. } => "signing",
            Self::Verifying { .. } => "verifying",
        };
        f.debug_struct("KeyMaterial")
            .field("kind", &kind)
            .field("version", &self.version())
            .finish_non_exhaustive()
    }
}

/// Resolves key references to key material.
#[async_trait::async_trait]
pub trait KeyProvider: Send + Sync {
    /// Resolve a reference. `Ok(None)` means no such key exists.
    ///
    /// # Errors
    ///
    /// Returns a [`CypherError`] if the reference is malformed or the backing
    /// store cannot produce the key.
    async fn resolve_key(
        &self,
        reference: &KeyReference,
    ) -> Result<Option<Arc<KeyMaterial>>, CypherError>;
}

/// Key provider backed by the persistent key store.
pub struct KeyStoreKeyProvider {
    store: Arc<KeyStore>,
}

impl KeyStoreKeyProvider {
    /// Create a provider over the given store.
    #[must_use]
    pub fn new(store: Arc<KeyStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl KeyProvider for KeyStoreKeyProvider {
    async fn resolve_key(
        &self,
        reference: &KeyReference,
    ) -> Result<Option<Arc<KeyMaterial>>, CypherError> {
        let locator = KeyLocator::parse(&reference.path)?;
        let material = self
            .store
            .load(&locator, reference.password.as_deref())
            .await?;
        Ok(material.map(Arc::new))
    }
}

impl fmt::Debug for KeyStoreKeyProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyStoreKeyProvider").finish_non_exhaustive()
    }
}

struct CacheEntry {
    resolved_at: Instant,
    material: Arc<KeyMaterial>,
}

/// TTL-bounded cache in front of another provider.
///
/// An entry is reused while its age is within the TTL; after that the next
/// lookup re-resolves and replaces it, bounding how long a rotated key stays
/// in use. Misses are not cached.
pub struct CachedKeyProvider {
    inner: Arc<dyn KeyProvider>,
    ttl: Duration,
    entries: DashMap<String, CacheEntry>,
}

impl CachedKeyProvider {
    /// Wrap `inner` with a cache of the given TTL.
    #[must_use]
    pub fn new(inner: Arc<dyn KeyProvider>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            entries: DashMap::new(),
        }
    }

    /// Drop every cached key.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn cache_key(reference: &KeyReference) -> String {
        // Entries resolved with different passwords must not share a slot.
        match &reference.password {
            Some(password) => {
                let digest = Sha256::digest(password.as_bytes());
                format!("{}#{}", reference.path, hex::encode(digest))
            }
            None => reference.path.clone(),
        }
    }
}

#[async_trait::async_trait]
impl KeyProvider for CachedKeyProvider {
    async fn resolve_key(
        &self,
        reference: &KeyReference,
    ) -> Result<Option<Arc<KeyMaterial>>, CypherError> {
        let key = Self::cache_key(reference);
        if let Some(entry) = self.entries.get(&key) {
            if entry.resolved_at.elapsed() <= self.ttl {
                return Ok(Some(Arc::clone(&entry.material)));
            }
        }

        let resolved = self.inner.resolve_key(reference).await?;
        match &resolved {
            Some(material) => {
                debug!(path = %reference.path, version = material.version(), "key cached");
                self.entries.insert(
                    key,
                    CacheEntry {
                        resolved_at: Instant::now(),
                        material: Arc::clone(material),
                    },
                );
            }
            None => {
                self.entries.remove(&key);
            }
        }
        Ok(resolved)
    }
}

impl fmt::Debug for CachedKeyProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedKeyProvider")
            .field("ttl", &self.ttl)
            .field("entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}
