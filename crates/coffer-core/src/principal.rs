//! The authenticated caller of a single request.
//!
//! A [`Principal`] binds an identity to exactly one target path and the
//! policy computed for that pair. It is never reused for another path.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use crate::claims::PrincipalClaims;
use crate::error::VaultError;
use crate::policy::{Capability, Policy, root_policy};

/// An identity acting on one path under one effective policy.
#[derive(Debug, Clone)]
pub struct Principal {
    claims: Arc<PrincipalClaims>,
    id: String,
    subject: String,
    path: String,
    policy: Arc<Policy>,
}

impl Principal {
    /// Bind `claims` to `path` under `policy`.
    ///
    /// `id` is the id of the token the caller presented; `subject` is the
    /// path of the principal record the claims were loaded from.
    #[must_use]
    pub fn new(
        claims: Arc<PrincipalClaims>,
        id: impl Into<String>,
        subject: impl Into<String>,
        path: impl Into<String>,
        policy: Arc<Policy>,
    ) -> Self {
        Self {
            claims,
            id: id.into(),
            subject: subject.into(),
            path: path.into(),
            policy,
        }
    }

    /// A root principal on `path`: allow-all, limited only by the expiry of
    /// `claims`.
    #[must_use]
    pub fn root(claims: Arc<PrincipalClaims>, path: impl Into<String>) -> Self {
        let subject = claims.sub.clone().unwrap_or_else(|| "root".to_owned());
        Self::new(
            claims,
            "root",
            subject,
            path,
            Arc::new(root_policy()),
        )
    }

    /// The same identity on another path under another policy.
    #[must_use]
    pub fn rebind(&self, path: impl Into<String>, policy: Arc<Policy>) -> Self {
        Self {
            path: path.into(),
            policy,
            ..self.clone()
        }
    }

    /// Id of the presented token.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Display name: preferred username, falling back to the subject.
    #[must_use]
    pub fn name(&self) -> &str {
        match self.claims.name() {
            "" => &self.subject,
            name => name,
        }
    }

    /// Path of the principal record.
    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Target path of the request.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Effective policy on [`path`](Self::path).
    #[must_use]
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// The underlying claims.
    #[must_use]
    pub fn claims(&self) -> &Arc<PrincipalClaims> {
        &self.claims
    }

    /// Look up an arbitrary claim.
    #[must_use]
    pub fn claim(&self, name: &str) -> Option<Value> {
        self.claims.claim(name)
    }

    /// Whether the principal holds `capability` on its path.
    #[must_use]
    pub fn has(&self, capability: Capability) -> bool {
        !self.claims.is_expired(Utc::now().timestamp()) && self.policy.grants(capability)
    }

    /// [`has`](Self::has), as an access-denied error on the target path.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::AccessDenied`] if the capability is missing.
    pub fn require(&self, capability: Capability) -> Result<(), VaultError> {
        if self.has(capability) {
            Ok(())
        } else {
            Err(VaultError::access_denied(&self.path))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::glob::PatternType;

    #[test]
    fn root_grants_until_claims_expire() {
        let live = Principal::root(
            Arc::new(PrincipalClaims::temporary_root(Duration::minutes(30))),
            "secret/x",
        );
        assert!(live.has(Capability::Manage));
        assert_eq!(live.subject(), "root");

        let stale = Principal::root(
            Arc::new(PrincipalClaims::temporary_root(Duration::minutes(-1))),
            "secret/x",
        );
        assert!(!stale.has(Capability::Read));
        assert!(matches!(
            stale.require(Capability::Read),
            Err(VaultError::AccessDenied { path }) if path == "secret/x"
        ));
    }

    #[test]
    fn name_falls_back_to_subject() {
        let principal = Principal::new(
            Arc::new(PrincipalClaims::default()),
            "t.abc",
            "sys/principle/svc",
            "secret/x",
            Arc::new(Policy::deny_all()),
        );
        assert_eq!(principal.name(), "sys/principle/svc");
        assert!(!principal.has(Capability::Read));
    }

    #[test]
    fn rebind_changes_only_path_and_policy() {
        let principal = Principal::new(
            Arc::new(PrincipalClaims::with_policies(["reader"])),
            "t.abc",
            "sys/principle/alice",
            "secret/a",
            Arc::new(Policy::deny_all()),
        );
        let reader = Arc::new(Policy::new("reader", "**", PatternType::Glob, [Capability::Read]));
        let rebound = principal.rebind("secret/b", reader);
        assert_eq!(rebound.path(), "secret/b");
        assert_eq!(rebound.id(), "t.abc");
        assert!(rebound.has(Capability::Read));
        assert!(!principal.has(Capability::Read));
    }
}
