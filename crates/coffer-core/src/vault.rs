//! The vault service.
//!
//! [`VaultService`] owns the lifecycle and every configured component. Its
//! state machine is:
//!
//! ```text
//! Created ──begin_initialize──▶ Initializing ──guard released──▶ Initialized ──close──▶ Closed
//!                                    │                                                   │
//!                                    └──configure fails──▶ Error        begin_initialize ◀┘
//! ```
//!
//! `Compromised` is entered only through [`VaultService::mark_compromised`].
//!
//! `configure` applies the bootstrap template, loads `vault.json`, opens the
//! key store (generating the master and token-signature keys if missing),
//! resolves the root namespace, reads the root principal and encrypts every
//! plaintext file left in the tree.
//!
//! Every public operation runs on its own task and is audited once it
//! completes.

use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration as StdDuration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{Duration, Utc};
use coffer_storage::{FileBackend, StorageBackend};
use tracing::{error, info, warn};
use zeroize::Zeroizing;

use crate::audit::AuditManager;
use crate::claims::PrincipalClaims;
use crate::crypto;
use crate::cypher::CypherProvider;
use crate::error::VaultError;
use crate::keys::{CachedKeyProvider, KeyLocator, KeyStoreKeyProvider};
use crate::keystore::KeyStore;
use crate::metadata::{CypherMetaData, VaultMetaData};
use crate::namespace::NamespaceResolver;
use crate::paths::{self, POLICY_PATH, TOKEN_PATH, VAULT_FILE};
use crate::policy::{Capability, PolicyEngine};
use crate::principal::Principal;
use crate::secret_store::SecretStore;
use crate::template::{Template, TemplateAction};
use crate::token::{TokenManager, TokenRequest};

/// Id of the root principal record.
pub const ROOT_PRINCIPAL: &str = "root";

/// Lifetime of the bootstrap root identity.
const BOOTSTRAP_ROOT_TTL_MINUTES: i64 = 30;

/// Lifecycle state of a [`VaultService`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaultState {
    /// Constructed, never initialized.
    Created,
    /// Between `begin_initialize` and releasing the guard.
    Initializing,
    /// Serving requests.
    Initialized,
    /// Closed; may be initialized again.
    Closed,
    /// `configure` failed.
    Error,
    /// An unrecoverable security failure was reported.
    Compromised,
}

impl fmt::Display for VaultState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Initializing => "initializing",
            Self::Initialized => "initialized",
            Self::Closed => "closed",
            Self::Error => "error",
            Self::Compromised => "compromised",
        };
        f.write_str(name)
    }
}

/// Everything `configure` builds.
struct Components {
    meta: VaultMetaData,
    root: Arc<PrincipalClaims>,
    keys: Arc<CachedKeyProvider>,
    namespaces: Arc<NamespaceResolver>,
    store: Arc<SecretStore>,
    policies: Arc<PolicyEngine>,
    tokens: Arc<TokenManager>,
}

struct Inner {
    state: VaultState,
    components: Option<Arc<Components>>,
}

/// The vault façade.
pub struct VaultService {
    inner: Mutex<Inner>,
    audit: Arc<AuditManager>,
}

impl VaultService {
    /// A service with its own, backend-less audit manager.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Audit`] if the audit manager cannot be created.
    pub fn new() -> Result<Self, VaultError> {
        let key = crypto::random_bytes(32);
        Ok(Self::with_audit(Arc::new(AuditManager::new(&key)?)))
    }

    /// A service auditing through `audit`.
    #[must_use]
    pub fn with_audit(audit: Arc<AuditManager>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: VaultState::Created,
                components: None,
            }),
            audit,
        }
    }

    /// The audit manager.
    #[must_use]
    pub fn audit(&self) -> &Arc<AuditManager> {
        &self.audit
    }

    /// Current lifecycle state.
    pub fn state(&self) -> VaultState {
        self.inner().state
    }

    /// Whether the service is initialized and configured.
    pub fn is_ready(&self) -> bool {
        let inner = self.inner();
        inner.state == VaultState::Initialized && inner.components.is_some()
    }

    /// Whether the service is in the `Initialized` state.
    pub fn is_initialized(&self) -> bool {
        self.state() == VaultState::Initialized
    }

    /// Enter `Initializing`. Releasing the returned guard moves the service
    /// to `Initialized` unless configuration failed meanwhile.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::IllegalState`] unless the service is `Created` or `Closed`.
    pub fn begin_initialize(&self) -> Result<InitializeGuard<'_>, VaultError> {
        let mut inner = self.inner();
        match inner.state {
            VaultState::Created | VaultState::Closed => {
                inner.state = VaultState::Initializing;
                Ok(InitializeGuard { service: self })
            }
            state => Err(VaultError::IllegalState {
                state: state.to_string(),
                expected: "created or closed",
            }),
        }
    }

    /// Configure a vault rooted at a directory on the local disk.
    ///
    /// # Errors
    ///
    /// See [`configure_with_storage`](Self::configure_with_storage).
    pub async fn configure(&self, root: impl AsRef<Path>) -> Result<(), VaultError> {
        self.assert_initializing()?;
        let storage: Arc<dyn StorageBackend> = Arc::new(FileBackend::new(root.as_ref()));
        self.configure_with_storage(storage).await
    }

    /// Configure a vault over an arbitrary storage backend. Any failure
    /// moves the service to `Error`.
    ///
    /// # Errors
    ///
    /// - [`VaultError::IllegalState`] unless the service is `Initializing`.
    /// - [`VaultError::MissingRootPrincipal`] if no root principal exists.
    /// - Any template, key store, namespace or storage error.
    pub async fn configure_with_storage(
        &self,
        storage: Arc<dyn StorageBackend>,
    ) -> Result<(), VaultError> {
        self.assert_initializing()?;
        match build(storage).await {
            Ok(components) => {
                self.inner().components = Some(Arc::new(components));
                info!("vault configured");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "vault configuration failed");
                self.inner().state = VaultState::Error;
                Err(e)
            }
        }
    }

    /// Move to `Closed` and drop every cache.
    pub fn close(&self) {
        let mut inner = self.inner();
        if let Some(components) = inner.components.take() {
            components.keys.clear();
            components.namespaces.clear();
            components.policies.clear();
        }
        inner.state = VaultState::Closed;
        info!("vault closed");
    }

    /// Report an unrecoverable security failure. The service stops serving
    /// and can not be initialized again.
    pub fn mark_compromised(&self, reason: &str) {
        let mut inner = self.inner();
        inner.components = None;
        inner.state = VaultState::Compromised;
        error!(reason = %reason, "vault marked compromised");
    }

    /// Read and decrypt the secret at `path`.
    ///
    /// # Errors
    ///
    /// - [`VaultError::InvalidToken`] if the token does not validate for `path`.
    /// - [`VaultError::AccessDenied`] without `READ` or if the secret does not exist.
    pub async fn read_from_vault(&self, token: &str, path: &str) -> Result<String, VaultError> {
        let request = (token.to_owned(), path.to_owned());
        self.dispatch("read", Some(path), Some(token), move |c| async move {
            let (token, path) = request;
            let principal = c.tokens.validate_token(&token, &path).await?.principal;
            c.store.read(&principal).await
        })
        .await
    }

    /// Encrypt and store `text` at `path`.
    ///
    /// # Errors
    ///
    /// - [`VaultError::InvalidToken`] if the token does not validate for `path`.
    /// - [`VaultError::AccessDenied`] without the capabilities the write needs.
    pub async fn write_to_vault(
        &self,
        token: &str,
        path: &str,
        text: &str,
    ) -> Result<(), VaultError> {
        let request = (token.to_owned(), path.to_owned(), Zeroizing::new(text.to_owned()));
        self.dispatch("write", Some(path), Some(token), move |c| async move {
            let (token, path, text) = request;
            let principal = c.tokens.validate_token(&token, &path).await?.principal;
            c.store.write(&principal, &text).await?;
            forget_policy(&c, principal.path());
            Ok(())
        })
        .await
    }

    /// Delete the secret at `path`.
    ///
    /// # Errors
    ///
    /// - [`VaultError::InvalidToken`] if the token does not validate for `path`.
    /// - [`VaultError::AccessDenied`] without `DELETE` or if the secret does not exist.
    pub async fn remove_from_vault(&self, token: &str, path: &str) -> Result<(), VaultError> {
        let request = (token.to_owned(), path.to_owned());
        self.dispatch("remove", Some(path), Some(token), move |c| async move {
            let (token, path) = request;
            let principal = c.tokens.validate_token(&token, &path).await?.principal;
            c.store.delete(&principal).await?;
            forget_policy(&c, principal.path());
            Ok(())
        })
        .await
    }

    /// Names directly below `path`; directories carry a trailing `/`.
    ///
    /// # Errors
    ///
    /// - [`VaultError::InvalidToken`] if the token does not validate for `path`.
    /// - [`VaultError::AccessDenied`] without `LIST`.
    pub async fn list_from_vault(
        &self,
        token: &str,
        path: &str,
    ) -> Result<Vec<String>, VaultError> {
        let request = (token.to_owned(), path.to_owned());
        self.dispatch("list", Some(path), Some(token), move |c| async move {
            let (token, path) = request;
            let principal = c.tokens.validate_token(&token, &path).await?.principal;
            c.store.list(&principal).await
        })
        .await
    }

    /// Issue a token acting as the caller's principal.
    ///
    /// The caller is validated against the first scope prefix, or against
    /// the token path when no scope is requested. A scoped caller can only
    /// issue tokens within its own scope; an unscoped request from a scoped
    /// caller inherits the caller's scope.
    ///
    /// # Errors
    ///
    /// - [`VaultError::InvalidToken`] if the caller's token does not validate
    ///   or the requested scope exceeds it.
    /// - Any error from issuing the token.
    pub async fn create_vault_token(
        &self,
        token: &str,
        request: TokenRequest,
    ) -> Result<String, VaultError> {
        let target = request
            .scope
            .as_ref()
            .and_then(|scope| scope.first())
            .map_or(TOKEN_PATH, String::as_str)
            .to_owned();
        let owned = (token.to_owned(), target.clone());
        self.dispatch("create_token", Some(&target), Some(token), move |c| async move {
            let (token, target) = owned;
            let caller = c.tokens.validate_token(&token, &target).await?;
            let mut request = request;
            if let Some(own) = &caller.claims.scope {
                match &request.scope {
                    None => request.scope = Some(own.clone()),
                    Some(scope) => {
                        if !scope.iter().all(|prefix| caller.claims.covers(prefix)) {
                            return Err(VaultError::invalid_token(
                                "requested scope exceeds the caller's scope",
                            ));
                        }
                    }
                }
            }
            c.tokens
                .create_token(caller.principal.subject(), &request)
                .await
        })
        .await
    }

    /// Revoke `target`. Revoking a token other than the caller's own needs
    /// `MANAGE` on the token path.
    ///
    /// # Errors
    ///
    /// - [`VaultError::InvalidToken`] if either token does not validate.
    /// - [`VaultError::AccessDenied`] if the caller may not manage tokens.
    pub async fn revoke_vault_token(&self, token: &str, target: &str) -> Result<(), VaultError> {
        let request = (token.to_owned(), target.to_owned());
        self.dispatch("revoke_token", Some(TOKEN_PATH), Some(token), move |c| async move {
            let (token, target) = request;
            let caller = c.tokens.validate_token(&token, TOKEN_PATH).await?;
            if target != token {
                caller.principal.require(Capability::Manage)?;
            }
            c.tokens.revoke_token(&target).await
        })
        .await
    }

    /// Revoke the caller's own token.
    ///
    /// # Errors
    ///
    /// See [`revoke_vault_token`](Self::revoke_vault_token).
    pub async fn revoke_self(&self, token: &str) -> Result<(), VaultError> {
        self.revoke_vault_token(token, token).await
    }

    /// Keep `target` alive without extending its expiry. Renewing a token
    /// other than the caller's own needs `MANAGE` on the token path.
    ///
    /// # Errors
    ///
    /// - [`VaultError::InvalidToken`] if either token does not validate.
    /// - [`VaultError::NotRenewable`] if `target` is not renewable or expired.
    /// - [`VaultError::AccessDenied`] if the caller may not manage tokens.
    pub async fn renew_vault_token(&self, token: &str, target: &str) -> Result<String, VaultError> {
        let request = (token.to_owned(), target.to_owned());
        self.dispatch("renew_token", Some(TOKEN_PATH), Some(token), move |c| async move {
            let (token, target) = request;
            let caller = c.tokens.validate_token(&token, TOKEN_PATH).await?;
            if target != token {
                caller.principal.require(Capability::Manage)?;
            }
            c.tokens.renew_token(&target).await
        })
        .await
    }

    /// Renew the caller's own token.
    ///
    /// # Errors
    ///
    /// See [`renew_vault_token`](Self::renew_vault_token).
    pub async fn renew_self(&self, token: &str) -> Result<String, VaultError> {
        self.renew_vault_token(token, token).await
    }

    /// Exchange a principal id and password for a renewable opaque token.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::AuthenticationFailed`] for unknown principals,
    /// expired principals, principals without a password, and wrong
    /// passwords alike.
    pub async fn authenticate(&self, principal_id: &str, password: &str) -> Result<String, VaultError> {
        let request = (principal_id.to_owned(), Zeroizing::new(password.to_owned()));
        self.dispatch("authenticate", Some(principal_id), None, move |c| async move {
            let (id, password) = request;
            let subject =
                paths::principal_path(&id).map_err(|_| VaultError::AuthenticationFailed)?;
            let claims = match c.tokens.load_principal(&subject).await {
                Ok(Some(claims)) => claims,
                Ok(None) => return Err(VaultError::AuthenticationFailed),
                Err(e) => {
                    warn!(principal = %id, error = %e, "unreadable principal record");
                    return Err(VaultError::AuthenticationFailed);
                }
            };
            if claims.is_expired(Utc::now().timestamp()) {
                return Err(VaultError::AuthenticationFailed);
            }

            let verified = tokio::task::spawn_blocking(move || claims.verify_password(&password))
                .await
                .map_err(|e| VaultError::Internal {
                    reason: e.to_string(),
                })?;
            if !verified {
                return Err(VaultError::AuthenticationFailed);
            }

            let request = TokenRequest {
                scope: None,
                uses: None,
                ttl_minutes: c.meta.user_principal_token_ttl,
                opaque: true,
                renewable: true,
            };
            let token = c.tokens.create_token(&subject, &request).await?;
            info!(principal = %id, "principal authenticated");
            Ok(token)
        })
        .await
    }

    /// Set the root principal's password if it has none yet. This is the
    /// only way to a first token on a vault created from the template.
    ///
    /// # Errors
    ///
    /// - [`VaultError::InvalidRequest`] if the root principal already has a password.
    /// - Any error from reading or writing the root principal record.
    pub async fn provision_root_password(&self, password: &str) -> Result<(), VaultError> {
        let path = paths::principal_path(ROOT_PRINCIPAL)?;
        let password = Zeroizing::new(password.to_owned());
        let target = path.clone();
        self.dispatch("provision_root", Some(&path), None, move |c| async move {
            let admin = Principal::root(Arc::clone(&c.root), target);
            let text = c.store.read(&admin).await?;
            let mut claims: PrincipalClaims = serde_json::from_str(&text)
                .map_err(|e| VaultError::malformed("root principal", e))?;
            if claims.password.is_some() {
                return Err(VaultError::invalid_request("root password is already set"));
            }

            let hash = tokio::task::spawn_blocking(move || crypto::hash_password(&password))
                .await
                .map_err(|e| VaultError::Internal {
                    reason: e.to_string(),
                })??;
            claims.password = Some(hash);
            c.store.write_value(&admin, &claims).await?;
            info!("root password provisioned");
            Ok(())
        })
        .await
    }

    /// Run `operation` on its own task against the configured components,
    /// then audit the outcome.
    async fn dispatch<T, F, Fut>(
        &self,
        operation: &'static str,
        path: Option<&str>,
        token: Option<&str>,
        body: F,
    ) -> Result<T, VaultError>
    where
        T: Send + 'static,
        F: FnOnce(Arc<Components>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, VaultError>> + Send + 'static,
    {
        let components = self.ready()?;
        let audit = Arc::clone(&self.audit);
        let path = path.map(str::to_owned);
        let token = token.map(str::to_owned);

        let task = tokio::spawn(async move {
            let result = body(components).await;
            if let Err(e) = &result {
                warn!(operation, path = ?path, error = %e, "vault operation failed");
            }
            let entry = audit.entry(
                operation,
                path.as_deref(),
                token.as_deref(),
                result.as_ref().map(|_| ()),
            );
            match audit.log(&entry).await {
                Ok(()) => result,
                Err(e) => Err(VaultError::Audit(e)),
            }
        });

        task.await.map_err(|e| VaultError::Internal {
            reason: format!("{operation} task failed: {e}"),
        })?
    }

    fn ready(&self) -> Result<Arc<Components>, VaultError> {
        let inner = self.inner();
        match (&inner.state, &inner.components) {
            (VaultState::Initialized, Some(components)) => Ok(Arc::clone(components)),
            (state, _) => Err(VaultError::IllegalState {
                state: state.to_string(),
                expected: "initialized",
            }),
        }
    }

    fn assert_initializing(&self) -> Result<(), VaultError> {
        match self.state() {
            VaultState::Initializing => Ok(()),
            state => Err(VaultError::IllegalState {
                state: state.to_string(),
                expected: "initializing",
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for VaultService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultService")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Scoped initialization handle returned by [`VaultService::begin_initialize`].
#[must_use = "releasing the guard finishes initialization"]
pub struct InitializeGuard<'a> {
    service: &'a VaultService,
}

impl InitializeGuard<'_> {
    /// Finish initialization now.
    pub fn finish(self) {}
}

impl Drop for InitializeGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.service.inner();
        if inner.state == VaultState::Initializing {
            if inner.components.is_none() {
                warn!("initialization finished without configuration");
            }
            inner.state = VaultState::Initialized;
        }
    }
}

impl fmt::Debug for InitializeGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InitializeGuard").finish_non_exhaustive()
    }
}

/// Policies are cached by name; a write or delete below the policy path
/// evicts the affected entry.
fn forget_policy(components: &Components, path: &str) {
    if paths::parent(path) == Some(POLICY_PATH) {
        components.policies.forget(paths::file_name(path));
    }
}

async fn build(storage: Arc<dyn StorageBackend>) -> Result<Components, VaultError> {
    let password = BASE64.encode(crypto::random_bytes(32).as_slice());
    Template::new_vault()?
        .with_variable("keystore-password", password)
        .apply(storage.as_ref(), TemplateAction::Keep)
        .await?;

    let meta_bytes = storage
        .get(VAULT_FILE)
        .await?
        .ok_or_else(|| VaultError::malformed("vault metadata", format!("'{VAULT_FILE}' is missing")))?;
    let meta = VaultMetaData::parse(&meta_bytes)?;

    let key_store = Arc::new(KeyStore::open(Arc::clone(&storage), &meta.key_store).await?);
    ensure_key(&key_store, &meta.master_cypher, &meta).await?;
    if let Some(signature) = &meta.token_signature_cypher {
        ensure_key(&key_store, signature, &meta).await?;
    }

    let keys = Arc::new(CachedKeyProvider::new(
        Arc::new(KeyStoreKeyProvider::new(key_store)),
        StdDuration::from_secs(meta.key_ttl),
    ));
    let cyphers = Arc::new(CypherProvider::new(keys.clone()));
    let namespaces = Arc::new(NamespaceResolver::new(
        Arc::clone(&storage),
        Arc::clone(&cyphers),
        meta.master_cypher.clone(),
    ));
    namespaces.bootstrap().await?;
    let store = Arc::new(SecretStore::new(Arc::clone(&storage), Arc::clone(&namespaces)));

    let root = Arc::new(read_root_principal(&store).await?);
    migrate(&store, &root).await?;

    let policies = Arc::new(PolicyEngine::new(Arc::clone(&store), Arc::clone(&root)));
    let (signer, verifier) = match &meta.token_signature_cypher {
        Some(signature) => (
            Some(cyphers.signer(signature).await?),
            Some(cyphers.verifier(signature).await?),
        ),
        None => (None, None),
    };
    let tokens = Arc::new(TokenManager::new(
        Arc::clone(&store),
        Arc::clone(&policies),
        Arc::clone(&root),
        signer,
        verifier,
    ));

    Ok(Components {
        meta,
        root,
        keys,
        namespaces,
        store,
        policies,
        tokens,
    })
}

/// Generate the key behind `cypher` if its alias has no version yet.
async fn ensure_key(
    store: &KeyStore,
    cypher: &CypherMetaData,
    meta: &VaultMetaData,
) -> Result<(), VaultError> {
    let mut reference = cypher.key_reference();
    let locator = KeyLocator::parse(&reference.path)?;
    if store.contains(&locator.alias).await {
        return Ok(());
    }
    if reference.issuer.is_none() {
        reference.issuer.clone_from(&meta.issuer_dn);
    }
    if reference.subject.is_none() {
        reference.subject.clone_from(&meta.subject_dn);
    }
    let version = store.generate(&reference).await?;
    info!(alias = %locator.alias, version, "generated missing key");
    Ok(())
}

/// Read the root principal through a short-lived bootstrap identity,
/// accepting a plaintext record that has not been migrated yet.
async fn read_root_principal(store: &SecretStore) -> Result<PrincipalClaims, VaultError> {
    let path = paths::principal_path(ROOT_PRINCIPAL)?;
    let bootstrap = Arc::new(PrincipalClaims::temporary_root(Duration::minutes(
        BOOTSTRAP_ROOT_TTL_MINUTES,
    )));
    let text = match store.read_optional(&Principal::root(bootstrap, &path)).await? {
        Some(text) => text,
        None => store
            .read_unsecured(&path)
            .await?
            .ok_or(VaultError::MissingRootPrincipal)?,
    };
    serde_json::from_str(&text).map_err(|e| VaultError::malformed("root principal", e))
}

/// Encrypt every plaintext file in place as the root principal. Failures
/// are logged per file and do not stop the migration.
async fn migrate(store: &SecretStore, root: &Arc<PrincipalClaims>) -> Result<(), VaultError> {
    let files = store.unsecured_files().await?;
    let mut migrated = 0usize;
    for file in &files {
        match store.migrate(&Principal::root(Arc::clone(root), file.as_str())).await {
            Ok(()) => migrated += 1,
            Err(e) => warn!(path = %file, error = %e, "failed to migrate plaintext file"),
        }
    }
    store.namespaces().clear();
    if !files.is_empty() {
        info!(migrated, skipped = files.len() - migrated, "bootstrap migration finished");
    }
    Ok(())
}
