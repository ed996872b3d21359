//! Namespace resolution.
//!
//! Namespaces form a tree keyed by directory path. A directory becomes a
//! namespace by holding a `namespace.json` metadata file; directories
//! without one inherit the namespace of their parent. The effective cypher
//! of a namespace is its own if declared, otherwise the nearest ancestor's.
//! The root namespace always uses the master cypher from `vault.json`.
//!
//! Namespace metadata files are themselves encrypted under the namespace one
//! level up. Reading the root's file therefore needs a cypher before any
//! namespace is known: [`NamespaceResolver::new`] seeds the cache with a
//! master-only root, which [`NamespaceResolver::bootstrap`] replaces with the
//! real one.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use coffer_storage::StorageBackend;
use dashmap::DashMap;
use tracing::debug;

use crate::cypher::{CypherProvider, StringCypher};
use crate::error::VaultError;
use crate::metadata::{CypherMetaData, NamespaceMetaData};
use crate::paths;

/// A resolved namespace node.
#[derive(Debug)]
pub struct Namespace {
    path: String,
    meta: NamespaceMetaData,
    cypher: CypherMetaData,
    parent: Option<Arc<Namespace>>,
}

impl Namespace {
    fn master(master: CypherMetaData, meta: NamespaceMetaData) -> Self {
        Self {
            path: String::new(),
            meta: NamespaceMetaData { root: true, ..meta },
            cypher: master,
            parent: None,
        }
    }

    fn child(path: &str, meta: NamespaceMetaData, parent: Arc<Namespace>) -> Self {
        let cypher = meta
            .cypher
            .clone()
            .unwrap_or_else(|| parent.cypher.clone());
        Self {
            path: path.to_owned(),
            meta,
            cypher,
            parent: Some(parent),
        }
    }

    /// Directory path of the namespace (`""` for the root).
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The namespace's own metadata.
    #[must_use]
    pub fn meta(&self) -> &NamespaceMetaData {
        &self.meta
    }

    /// The enclosing namespace; `None` for the root.
    #[must_use]
    pub fn parent(&self) -> Option<&Arc<Namespace>> {
        self.parent.as_ref()
    }

    /// Effective cypher.
    #[must_use]
    pub fn cypher(&self) -> &CypherMetaData {
        &self.cypher
    }

    /// Whether this is the root namespace.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

type NamespaceFuture<'a> = Pin<Box<dyn Future<Output = Result<Arc<Namespace>, VaultError>> + Send + 'a>>;

/// Lazily loads and caches namespaces by path.
pub struct NamespaceResolver {
    storage: Arc<dyn StorageBackend>,
    cyphers: Arc<CypherProvider>,
    master: CypherMetaData,
    cache: DashMap<String, Arc<Namespace>>,
}

impl NamespaceResolver {
    /// Create a resolver whose root is, until [`bootstrap`](Self::bootstrap),
    /// a bare namespace carrying only the master cypher.
    #[must_use]
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        cyphers: Arc<CypherProvider>,
        master: CypherMetaData,
    ) -> Self {
        let cache = DashMap::new();
        cache.insert(
            String::new(),
            Arc::new(Namespace::master(master.clone(), NamespaceMetaData::default())),
        );
        Self {
            storage,
            cyphers,
            master,
            cache,
        }
    }

    /// Read the real root namespace, accepting a plaintext metadata file, and
    /// install it in place of the master-only root.
    ///
    /// # Errors
    ///
    /// Returns a [`VaultError`] if the metadata exists but cannot be
    /// decrypted or parsed.
    pub async fn bootstrap(&self) -> Result<Arc<Namespace>, VaultError> {
        let meta = self.read_namespace("", true).await?.unwrap_or_default();
        if meta.cypher.as_ref().is_some_and(|c| *c != self.master) {
            debug!("root namespace declares its own cypher; the master cypher is used");
        }
        let root = Arc::new(Namespace::master(self.master.clone(), meta));
        self.cache.clear();
        self.cache.insert(String::new(), Arc::clone(&root));
        Ok(root)
    }

    /// Resolve the namespace of a directory path.
    pub fn get<'a>(&'a self, path: &'a str) -> NamespaceFuture<'a> {
        Box::pin(async move {
            if let Some(cached) = self.cache.get(path).map(|e| Arc::clone(e.value())) {
                return Ok(cached);
            }
            let Some(parent_path) = paths::parent(path) else {
                let root = Arc::new(Namespace::master(
                    self.master.clone(),
                    NamespaceMetaData::default(),
                ));
                self.cache.insert(String::new(), Arc::clone(&root));
                return Ok(root);
            };

            let meta = self.read_namespace(path, false).await?;
            let parent = self.get(parent_path).await?;
            let resolved = match meta {
                Some(meta) => {
                    debug!(namespace = %path, "namespace loaded");
                    Arc::new(Namespace::child(path, meta, parent))
                }
                None => parent,
            };
            self.cache.insert(path.to_owned(), Arc::clone(&resolved));
            Ok(resolved)
        })
    }

    /// The string cypher protecting the secret at `path`.
    ///
    /// # Errors
    ///
    /// Returns a [`VaultError`] if namespace resolution or key resolution fails.
    pub async fn cypher_for(&self, path: &str) -> Result<StringCypher, VaultError> {
        let namespace = self.get(paths::namespace_of(path)).await?;
        Ok(self.cyphers.cypher(namespace.cypher()).await?)
    }

    /// Forget every namespace except the root.
    pub fn clear(&self) {
        self.cache.retain(|path, _| path.is_empty());
    }

    async fn read_namespace(
        &self,
        path: &str,
        allow_unsecure: bool,
    ) -> Result<Option<NamespaceMetaData>, VaultError> {
        let file = paths::namespace_file(path);
        let content = if let Some(bytes) = self.storage.get(&paths::secured(&file)).await? {
            let text = String::from_utf8(bytes)
                .map_err(|e| VaultError::malformed("namespace metadata", e))?;
            let cypher = self.cypher_for(&file).await?;
            cypher.decrypt(&text)?
        } else if allow_unsecure {
            match self.storage.get(&file).await? {
                Some(bytes) => String::from_utf8(bytes)
                    .map_err(|e| VaultError::malformed("namespace metadata", e))?,
                None => return Ok(None),
            }
        } else {
            return Ok(None);
        };

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| VaultError::malformed("namespace metadata", e))
    }
}

impl std::fmt::Debug for NamespaceResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamespaceResolver")
            .field("cached", &self.cache.len())
            .finish_non_exhaustive()
    }
}
