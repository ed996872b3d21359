//! Token and principal claim records.
//!
//! Both are immutable value records. Changing a field (the use count of a
//! token, for example) goes through a `with_*` constructor that returns a new
//! record, which is then persisted in place of the old one.

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::crypto;
use crate::error::VaultError;
use crate::paths;
use crate::policy::ROOT_POLICY;

/// Issuer and audience stamped on every token.
pub const TOKEN_ISSUER: &str = "vault-service";
/// Prefix that marks a token string as an opaque id.
pub const OPAQUE_PREFIX: &str = "t.";

/// Claims of an issued token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Issuer.
    pub iss: String,
    /// Audience.
    pub aud: String,
    /// Path of the principal record this token acts as.
    pub sub: String,
    /// Expiry, seconds since the epoch.
    pub exp: i64,
    /// Not valid before, seconds since the epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
    /// Issued at, seconds since the epoch.
    pub iat: i64,
    /// Unique token id.
    pub jti: String,
    /// Remaining uses; `None` is unlimited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uses: Option<i64>,
    /// Whether the token may be renewed.
    #[serde(rename = "ren", default)]
    pub renewable: bool,
    /// Path prefixes the token is restricted to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<Vec<String>>,
}

impl TokenClaims {
    /// Fresh claims for `subject`, valid for `ttl_minutes` from now. A
    /// non-positive `uses` means unlimited.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::InvalidRequest`] if the expiry is not representable.
    pub fn issue(
        subject: impl Into<String>,
        ttl_minutes: i64,
        uses: Option<i64>,
        renewable: bool,
        scope: Option<Vec<String>>,
    ) -> Result<Self, VaultError> {
        let now = Utc::now();
        let exp = Duration::try_minutes(ttl_minutes)
            .and_then(|ttl| now.checked_add_signed(ttl))
            .ok_or_else(|| {
                VaultError::invalid_request(format!("ttl of {ttl_minutes} minutes is out of range"))
            })?;
        Ok(Self {
            iss: TOKEN_ISSUER.to_owned(),
            aud: TOKEN_ISSUER.to_owned(),
            sub: subject.into(),
            exp: exp.timestamp(),
            nbf: Some(now.timestamp()),
            iat: now.timestamp(),
            jti: URL_SAFE_NO_PAD.encode(uuid::Uuid::new_v4().as_bytes()),
            uses: uses.filter(|&uses| uses > 0),
            renewable,
            scope: scope.filter(|s| !s.is_empty()),
        })
    }

    /// The opaque token string for this record.
    #[must_use]
    pub fn opaque_id(&self) -> String {
        format!("{OPAQUE_PREFIX}{}", self.jti)
    }

    /// Whether the token is outside its validity window at `now` (seconds).
    #[must_use]
    pub fn is_expired(&self, now: i64) -> bool {
        self.exp < now || self.nbf.is_some_and(|nbf| nbf > now)
    }

    /// Whether the use count is exhausted.
    #[must_use]
    pub fn is_used_up(&self) -> bool {
        self.uses.is_some_and(|uses| uses <= 0)
    }

    /// Whether `path` lies under one of the scope prefixes. Unscoped tokens
    /// cover every path.
    #[must_use]
    pub fn covers(&self, path: &str) -> bool {
        self.scope.as_ref().is_none_or(|scope| {
            scope
                .iter()
                .any(|prefix| paths::starts_with(path, prefix))
        })
    }

    /// The same claims with a different use count.
    #[must_use]
    pub fn with_uses(&self, uses: Option<i64>) -> Self {
        Self {
            uses,
            ..self.clone()
        }
    }
}

/// A persisted identity record.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct PrincipalClaims {
    /// Issuer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    /// Audience.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
    /// Subject.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    /// Expiry, seconds since the epoch. Expired principals are granted nothing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
    /// Names of the policies attached to this principal.
    #[serde(rename = "pol", default)]
    pub policies: Vec<String>,
    /// Argon2 PHC hash of the principal's password.
    #[serde(rename = "pass", default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Any other claims.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PrincipalClaims {
    /// Claims carrying only a policy list.
    #[must_use]
    pub fn with_policies<I, S>(policies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            policies: policies.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Short-lived claims of the bootstrap root identity.
    #[must_use]
    pub fn temporary_root(ttl: Duration) -> Self {
        Self {
            sub: Some("root".to_owned()),
            exp: Some((Utc::now() + ttl).timestamp()),
            ..Self::with_policies([ROOT_POLICY])
        }
    }

    /// Preferred username, falling back to the subject.
    #[must_use]
    pub fn name(&self) -> &str {
        self.preferred_username
            .as_deref()
            .or(self.sub.as_deref())
            .unwrap_or_default()
    }

    /// Look up a claim by its JSON name.
    #[must_use]
    pub fn claim(&self, name: &str) -> Option<Value> {
        match name {
            "iss" => self.iss.clone().map(Value::String),
            "aud" => self.aud.clone().map(Value::String),
            "sub" => self.sub.clone().map(Value::String),
            "exp" => self.exp.map(Value::from),
            "preferred_username" => self.preferred_username.clone().map(Value::String),
            "pol" => Some(Value::from(self.policies.clone())),
            "pass" => None,
            other => self.extra.get(other).cloned(),
        }
    }

    /// Whether the record is past its expiry at `now` (seconds).
    #[must_use]
    pub fn is_expired(&self, now: i64) -> bool {
        self.exp.is_some_and(|exp| exp < now)
    }

    /// Verify a password against the stored hash. A record without a hash
    /// never matches.
    #[must_use]
    pub fn verify_password(&self, password: &str) -> bool {
        self.password
            .as_deref()
            .is_some_and(|hash| crypto::verify_password(password, hash))
    }
}

impl fmt::Debug for PrincipalClaims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrincipalClaims")
            .field("sub", &self.sub)
            .field("preferred_username", &self.preferred_username)
            .field("policies", &self.policies)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::crypto::hash_password_with;
    use crate::crypto::tests::FAST_KDF;

    #[test]
    fn issued_claims_are_valid_now() {
        let claims = TokenClaims::issue("sys/principle/root", 5, Some(2), true, None).unwrap();
        let now = Utc::now().timestamp();
        assert!(!claims.is_expired(now));
        assert!(claims.is_expired(now + 6 * 60));
        assert!(claims.opaque_id().starts_with(OPAQUE_PREFIX));
        assert_eq!(claims.iss, TOKEN_ISSUER);
    }

    #[test]
    fn scope_is_prefix_based() {
        let claims =
            TokenClaims::issue("x", 5, None, false, Some(vec!["secret/app1".into()])).unwrap();
        assert!(claims.covers("secret/app1/db"));
        assert!(!claims.covers("secret/app2/x"));
        assert!(!claims.covers("secret/app10"));

        let unscoped = TokenClaims::issue("x", 5, None, false, Some(Vec::new())).unwrap();
        assert!(unscoped.scope.is_none());
        assert!(unscoped.covers("anything"));
    }

    #[test]
    fn with_uses_leaves_the_original_alone() {
        let claims = TokenClaims::issue("x", 5, Some(2), false, None).unwrap();
        let next = claims.with_uses(Some(1));
        assert_eq!(claims.uses, Some(2));
        assert_eq!(next.uses, Some(1));
        assert_eq!(next.jti, claims.jti);
        assert!(claims.with_uses(Some(0)).is_used_up());
    }

    #[test]
    fn non_positive_uses_are_unlimited() {
        for uses in [0, -3] {
            let claims = TokenClaims::issue("x", 5, Some(uses), false, None).unwrap();
            assert_eq!(claims.uses, None);
            assert!(!claims.is_used_up());
        }
    }

    #[test]
    fn out_of_range_ttl_is_an_error() {
        for ttl in [i64::MAX, i64::MIN, i64::MAX / 60] {
            assert!(matches!(
                TokenClaims::issue("x", ttl, None, false, None),
                Err(VaultError::InvalidRequest { .. })
            ));
        }
    }

    #[test]
    fn token_claims_wire_names() {
        let claims = TokenClaims::issue("x", 5, None, true, None).unwrap();
        let json = serde_json::to_value(&claims).unwrap();
        assert_eq!(json["ren"], Value::Bool(true));
        assert!(json.get("uses").is_none());
    }

    #[test]
    fn principal_claims_parse_and_lookup() {
        let json = r#"{"sub": "alice", "pol": ["reader"], "team": "ops"}"#;
        let claims: PrincipalClaims = serde_json::from_str(json).unwrap();
        assert_eq!(claims.name(), "alice");
        assert_eq!(claims.policies, vec!["reader"]);
        assert_eq!(claims.claim("team"), Some(Value::from("ops")));
        assert!(claims.claim("pass").is_none());
    }

    #[test]
    fn password_verification() {
        let claims = PrincipalClaims {
            password: Some(hash_password_with("hunter2", &FAST_KDF).unwrap()),
            ..PrincipalClaims::default()
        };
        assert!(claims.verify_password("hunter2"));
        assert!(!claims.verify_password("hunter3"));
        assert!(!PrincipalClaims::default().verify_password(""));
    }

    #[test]
    fn debug_redacts_password() {
        let claims = PrincipalClaims {
            password: Some("$argon2id$secret".to_owned()),
            ..PrincipalClaims::default()
        };
        assert!(!format!("{claims:?}").contains("argon2id"));
    }

    #[test]
    fn temporary_root_expires() {
        let root = PrincipalClaims::temporary_root(Duration::minutes(30));
        let now = Utc::now().timestamp();
        assert!(!root.is_expired(now));
        assert!(root.is_expired(now + 31 * 60));
        assert_eq!(root.policies, vec![ROOT_POLICY]);
    }
}
