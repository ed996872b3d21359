//! Token issuance, validation, renewal and revocation.
//!
//! Two token kinds exist:
//!
//! - **Opaque**: `t.<id>`. The claims live only in the vault, encrypted at
//!   `sys/token/<id>`.
//! - **Signed**: a compact `header.payload.signature` token carrying its own
//!   claims, verified against the public half of the token-signature key.
//!   The vault stores only use-count bookkeeping and revocation markers.
//!
//! Revocation writes a marker to `sys/token/.revoked/<id>` and removes the
//! live record. A token whose id has a marker never validates again.
//!
//! Use counting is a read-modify-write on the live record. Validations of
//! the same token id are serialized through a striped lock so a single-use
//! token cannot be spent twice by concurrent requests in one process.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::claims::{OPAQUE_PREFIX, PrincipalClaims, TOKEN_ISSUER, TokenClaims};
use crate::cypher::{TokenSigner, TokenVerifier};
use crate::error::VaultError;
use crate::paths::{self, REVOKED_TOKEN_PATH, TOKEN_PATH};
use crate::policy::PolicyEngine;
use crate::principal::Principal;
use crate::secret_store::SecretStore;

const LOCK_STRIPES: usize = 64;
const LEEWAY_SECS: u64 = 30;

/// Content of a revocation marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RevocationMarker {
    jti: String,
    revoked_at: DateTime<Utc>,
}

/// A token that passed validation, bound to the requested path.
#[derive(Debug, Clone)]
pub struct ValidatedToken {
    /// The token's claims, before this validation consumed a use.
    pub claims: TokenClaims,
    /// The token's principal on the requested path.
    pub principal: Principal,
}

/// Parameters of a new token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenRequest {
    /// Path prefixes the token is restricted to.
    pub scope: Option<Vec<String>>,
    /// Number of uses; `None` is unlimited.
    pub uses: Option<i64>,
    /// Lifetime in minutes.
    pub ttl_minutes: i64,
    /// Issue an opaque token instead of a signed one.
    pub opaque: bool,
    /// Whether the token may be renewed.
    pub renewable: bool,
}

/// A presented token after parsing: an opaque id, or verified signed claims.
enum Presented {
    Opaque(String),
    Signed(TokenClaims),
}

impl Presented {
    fn jti(&self) -> &str {
        match self {
            Self::Opaque(jti) => jti,
            Self::Signed(claims) => &claims.jti,
        }
    }

    fn is_opaque(&self) -> bool {
        matches!(self, Self::Opaque(_))
    }
}

/// Issues and validates vault tokens.
pub struct TokenManager {
    store: Arc<SecretStore>,
    policies: Arc<PolicyEngine>,
    root: Arc<PrincipalClaims>,
    signer: Option<TokenSigner>,
    verifier: Option<TokenVerifier>,
    locks: Box<[Mutex<()>]>,
}

impl TokenManager {
    /// Create a manager.
    ///
    /// Without a signer every token is issued opaque; without a verifier
    /// signed tokens are rejected. `root` is used for all bookkeeping reads
    /// and writes.
    #[must_use]
    pub fn new(
        store: Arc<SecretStore>,
        policies: Arc<PolicyEngine>,
        root: Arc<PrincipalClaims>,
        signer: Option<TokenSigner>,
        verifier: Option<TokenVerifier>,
    ) -> Self {
        Self {
            store,
            policies,
            root,
            signer,
            verifier,
            locks: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Issue a token acting as `subject`.
    ///
    /// Returns the opaque id or the signed compact token.
    ///
    /// # Errors
    ///
    /// - [`VaultError::InvalidPath`] for malformed scope prefixes.
    /// - [`VaultError::InvalidRequest`] if the ttl is out of range.
    /// - [`VaultError::Cypher`] if signing fails.
    /// - Any error from persisting an opaque record.
    pub async fn create_token(
        &self,
        subject: &str,
        request: &TokenRequest,
    ) -> Result<String, VaultError> {
        let scope = request
            .scope
            .as_ref()
            .map(|prefixes| {
                prefixes
                    .iter()
                    .map(|p| paths::normalize(p))
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?;
        let claims = TokenClaims::issue(
            subject,
            request.ttl_minutes,
            request.uses,
            request.renewable,
            scope,
        )?;

        let token = match (&self.signer, request.opaque) {
            (Some(signer), false) => signer.sign(&claims)?,
            _ => {
                self.store
                    .write_value(&self.system(&record_path(&claims.jti)), &claims)
                    .await?;
                claims.opaque_id()
            }
        };

        info!(
            token_id = %claims.jti,
            subject = %subject,
            opaque = token.starts_with(OPAQUE_PREFIX),
            uses = ?claims.uses,
            "token created"
        );
        Ok(token)
    }

    /// Validate `token` for a request on `path`, consuming one use.
    ///
    /// Revocation, validity window, remaining uses and scope are checked
    /// before a use is consumed. A token on its last use is revoked.
    ///
    /// # Errors
    ///
    /// - [`VaultError::InvalidToken`] if the token is unknown, revoked,
    ///   expired, used up, out of scope, or fails verification.
    /// - Any storage or cypher error from the bookkeeping.
    pub async fn validate_token(
        &self,
        token: &str,
        path: &str,
    ) -> Result<ValidatedToken, VaultError> {
        let path = paths::normalize(path)?;
        let presented = self.parse(token, true)?;
        let jti = presented.jti().to_owned();
        let _guard = self.lock(&jti).await;

        if self.is_revoked(&jti).await? {
            return Err(VaultError::invalid_token("revoked"));
        }

        let record = self.read_record(&jti).await?;
        let claims = match presented {
            Presented::Opaque(_) => {
                let claims = record.ok_or_else(|| VaultError::invalid_token("unknown token"))?;
                let now = Utc::now().timestamp();
                if claims.exp < now {
                    self.revoke_id(&jti, true).await?;
                    return Err(VaultError::invalid_token("expired"));
                }
                if claims.is_expired(now) {
                    return Err(VaultError::invalid_token("not yet valid"));
                }
                claims
            }
            Presented::Signed(signed) => match record {
                Some(stored) => signed.with_uses(stored.uses),
                None => signed,
            },
        };

        if claims.is_used_up() {
            return Err(VaultError::invalid_token("no uses left"));
        }
        if !claims.covers(&path) {
            debug!(token_id = %jti, path = %path, "token scope does not cover path");
            return Err(VaultError::invalid_token("path is outside the token scope"));
        }

        self.consume(&claims, token.starts_with(OPAQUE_PREFIX)).await?;

        let principal_claims = self
            .load_principal(&claims.sub)
            .await?
            .ok_or_else(|| VaultError::invalid_token("unknown subject"))?;
        let policy = self
            .policies
            .compute_policy_for_path(&principal_claims, &path)
            .await;
        let principal = Principal::new(
            Arc::new(principal_claims),
            jti,
            claims.sub.clone(),
            path,
            Arc::new(policy),
        );
        Ok(ValidatedToken { claims, principal })
    }

    /// Revoke `token`. Revoking an already revoked token succeeds.
    ///
    /// # Errors
    ///
    /// - [`VaultError::InvalidToken`] if the token is unknown or fails verification.
    /// - [`VaultError::AccessDenied`] if an opaque token's live record cannot be deleted.
    pub async fn revoke_token(&self, token: &str) -> Result<(), VaultError> {
        let presented = self.parse(token, false)?;
        let jti = presented.jti();
        let _guard = self.lock(jti).await;

        if self.is_revoked(jti).await? {
            debug!(token_id = %jti, "token already revoked");
            return Ok(());
        }
        if presented.is_opaque() && self.read_record(jti).await?.is_none() {
            return Err(VaultError::invalid_token("unknown token"));
        }
        self.revoke_id(jti, presented.is_opaque()).await
    }

    /// Keep a renewable token alive. The expiry is not extended; the
    /// returned token is the same string.
    ///
    /// # Errors
    ///
    /// - [`VaultError::InvalidToken`] if the token is unknown, revoked, or fails verification.
    /// - [`VaultError::NotRenewable`] if it is not renewable or already expired.
    pub async fn renew_token(&self, token: &str) -> Result<String, VaultError> {
        let presented = self.parse(token, false)?;
        let jti = presented.jti().to_owned();
        let _guard = self.lock(&jti).await;

        if self.is_revoked(&jti).await? {
            return Err(VaultError::invalid_token("revoked"));
        }
        let record = self.read_record(&jti).await?;
        let opaque = presented.is_opaque();
        let claims = match presented {
            Presented::Opaque(_) => {
                record.ok_or_else(|| VaultError::invalid_token("unknown token"))?
            }
            Presented::Signed(signed) => match record {
                Some(stored) => signed.with_uses(stored.uses),
                None => signed,
            },
        };

        if !claims.renewable || claims.is_expired(Utc::now().timestamp()) {
            return Err(VaultError::NotRenewable);
        }
        if opaque {
            self.store
                .write_value(&self.system(&record_path(&jti)), &claims)
                .await?;
        }
        info!(token_id = %jti, "token renewed");
        Ok(token.to_owned())
    }

    /// Read a principal record by its path. `Ok(None)` if none exists or
    /// `subject` does not name a record under the principal directory.
    ///
    /// # Errors
    ///
    /// Returns a [`VaultError`] if the record cannot be decrypted or parsed.
    pub async fn load_principal(&self, subject: &str) -> Result<Option<PrincipalClaims>, VaultError> {
        if !paths::is_principal_path(subject) {
            warn!(subject = %subject, "subject outside the principal directory");
            return Ok(None);
        }
        let Some(text) = self.store.read_optional(&self.system(subject)).await? else {
            return Ok(None);
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| VaultError::malformed("principal", e))
    }

    fn parse(&self, token: &str, check_expiry: bool) -> Result<Presented, VaultError> {
        if let Some(jti) = token.strip_prefix(OPAQUE_PREFIX) {
            if !is_token_id(jti) {
                return Err(VaultError::invalid_token("malformed token"));
            }
            return Ok(Presented::Opaque(jti.to_owned()));
        }
        let claims = self.verify_with(token, check_expiry)?;
        if !is_token_id(&claims.jti) {
            return Err(VaultError::invalid_token("malformed token id"));
        }
        Ok(Presented::Signed(claims))
    }

    fn verify_with(&self, token: &str, check_expiry: bool) -> Result<TokenClaims, VaultError> {
        let verifier = self
            .verifier
            .as_ref()
            .ok_or_else(|| VaultError::invalid_token("signed tokens are not accepted"))?;
        let mut validation = verifier.validation();
        validation.set_issuer(&[TOKEN_ISSUER]);
        validation.set_audience(&[TOKEN_ISSUER]);
        validation.set_required_spec_claims(&["exp", "sub", "iss", "aud"]);
        validation.leeway = LEEWAY_SECS;
        validation.validate_exp = check_expiry;
        validation.validate_nbf = true;

        verifier.verify(token, &validation).map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => VaultError::invalid_token("expired"),
            ErrorKind::ImmatureSignature => VaultError::invalid_token("not yet valid"),
            ErrorKind::InvalidSignature => VaultError::invalid_token("signature verification failed"),
            _ => VaultError::invalid_token(format!("rejected: {e}")),
        })
    }

    async fn consume(&self, claims: &TokenClaims, opaque: bool) -> Result<(), VaultError> {
        match claims.uses {
            None => Ok(()),
            Some(1) => {
                debug!(token_id = %claims.jti, "last use consumed");
                self.revoke_id(&claims.jti, opaque).await
            }
            Some(uses) => {
                self.store
                    .write_value(
                        &self.system(&record_path(&claims.jti)),
                        &claims.with_uses(Some(uses - 1)),
                    )
                    .await
            }
        }
    }

    async fn revoke_id(&self, jti: &str, ensure_deletion: bool) -> Result<(), VaultError> {
        let marker = RevocationMarker {
            jti: jti.to_owned(),
            revoked_at: Utc::now(),
        };
        self.store
            .write_value(&self.system(&marker_path(jti)), &marker)
            .await?;

        let live = self.system(&record_path(jti));
        if ensure_deletion {
            self.store.delete(&live).await?;
        } else if let Err(e) = self.store.remove(&live).await {
            warn!(token_id = %jti, error = %e, "failed to remove live token record");
        }
        info!(token_id = %jti, "token revoked");
        Ok(())
    }

    async fn is_revoked(&self, jti: &str) -> Result<bool, VaultError> {
        self.store.exists(&self.system(&marker_path(jti))).await
    }

    async fn read_record(&self, jti: &str) -> Result<Option<TokenClaims>, VaultError> {
        let Some(text) = self.store.read_optional(&self.system(&record_path(jti))).await? else {
            return Ok(None);
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| VaultError::malformed("token record", e))
    }

    async fn lock(&self, jti: &str) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        jti.hash(&mut hasher);
        let stripe = usize::try_from(hasher.finish() % LOCK_STRIPES as u64).unwrap_or_default();
        self.locks[stripe].lock().await
    }

    fn system(&self, path: &str) -> Principal {
        Principal::root(Arc::clone(&self.root), path)
    }
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("signed", &self.signer.is_some())
            .finish_non_exhaustive()
    }
}

/// Token ids become file names: URL-safe base64 characters only.
fn is_token_id(jti: &str) -> bool {
    !jti.is_empty()
        && jti
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn record_path(jti: &str) -> String {
    paths::join(TOKEN_PATH, jti)
}

fn marker_path(jti: &str) -> String {
    paths::join(REVOKED_TOKEN_PATH, jti)
}
