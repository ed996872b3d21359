//! Policy engine for Coffer.
//!
//! A policy is a path pattern (glob or regex) plus a set of capabilities
//! (`CREATE`, `READ`, `UPDATE`, `DELETE`, `LIST`, `MANAGE`, `DENY`). Policies
//! are stored encrypted under `sys/policy/<name>` and cached by name for the
//! lifetime of the engine.
//!
//! For a request, every policy named by the principal whose pattern matches
//! the path is folded together: `DENY` in either operand yields deny-all,
//! otherwise capabilities are unioned. No match, or a policy name that does
//! not resolve, yields deny-all.
//!
//! The built-in `root` policy grants everything on every path and is never
//! read from storage.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::claims::PrincipalClaims;
use crate::error::VaultError;
use crate::glob::{PathMatcher, PatternType};
use crate::paths::{self, POLICY_PATH};
use crate::principal::Principal;
use crate::secret_store::SecretStore;

/// Name of the built-in allow-all policy.
pub const ROOT_POLICY: &str = "root";

/// An access capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Capability {
    /// Create new secrets.
    Create,
    /// Read secrets.
    Read,
    /// Update existing secrets.
    Update,
    /// Delete secrets.
    Delete,
    /// List secrets under a path.
    List,
    /// Administrative operations, including creating directories.
    Manage,
    /// Explicitly deny access (overrides all other capabilities).
    Deny,
}

/// A path pattern with the capabilities it grants.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    /// Policy name.
    #[serde(default)]
    pub name: String,
    /// Path pattern.
    pub path: String,
    /// How [`path`](Self::path) is interpreted.
    #[serde(default)]
    pub path_type: PatternType,
    /// Granted capabilities.
    pub capabilities: BTreeSet<Capability>,
    #[serde(skip)]
    matcher: OnceLock<Option<PathMatcher>>,
}

impl Policy {
    /// Build a policy.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        path: impl Into<String>,
        path_type: PatternType,
        capabilities: impl IntoIterator<Item = Capability>,
    ) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            path_type,
            capabilities: capabilities.into_iter().collect(),
            matcher: OnceLock::new(),
        }
    }

    /// Grants every capability except `DENY` on every path.
    #[must_use]
    pub fn allow_all() -> Self {
        Self::new(
            "allow-all",
            "**",
            PatternType::Glob,
            [
                Capability::Create,
                Capability::Delete,
                Capability::List,
                Capability::Read,
                Capability::Update,
                Capability::Manage,
            ],
        )
    }

    /// Denies everything on every path.
    #[must_use]
    pub fn deny_all() -> Self {
        Self::new("deny-all", "**", PatternType::Glob, [Capability::Deny])
    }

    /// Whether this policy denies.
    #[must_use]
    pub fn is_deny(&self) -> bool {
        self.capabilities.contains(&Capability::Deny)
    }

    /// Whether this policy grants `capability`. A denying policy grants nothing.
    #[must_use]
    pub fn grants(&self, capability: Capability) -> bool {
        !self.is_deny() && self.capabilities.contains(&capability)
    }

    /// Combine two policies: deny dominates, otherwise capabilities are unioned.
    #[must_use]
    pub fn combine(&self, other: &Policy) -> Policy {
        if self.is_deny() || other.is_deny() {
            return Self::deny_all();
        }
        Self::new(
            format!("{}+{}", self.name, other.name),
            self.path.clone(),
            self.path_type,
            self.capabilities.union(&other.capabilities).copied(),
        )
    }

    /// Whether the pattern matches `path`. A malformed regex matches nothing.
    #[must_use]
    pub fn applies_to(&self, path: &str) -> bool {
        let matcher = self.matcher.get_or_init(|| {
            PathMatcher::compile(&self.path, self.path_type)
                .inspect_err(|e| warn!(policy = %self.name, error = %e, "invalid policy pattern"))
                .ok()
        });
        matcher.as_ref().is_some_and(|m| m.matches(path))
    }
}

impl PartialEq for Policy {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.path == other.path
            && self.path_type == other.path_type
            && self.capabilities == other.capabilities
    }
}

impl Eq for Policy {}

impl fmt::Debug for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Policy")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("path_type", &self.path_type)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

/// The built-in `root` policy.
#[must_use]
pub fn root_policy() -> Policy {
    let mut policy = Policy::allow_all();
    policy.name = ROOT_POLICY.to_owned();
    policy
}

/// Loads policies and computes the effective policy for a request.
pub struct PolicyEngine {
    store: Arc<SecretStore>,
    root: Arc<PrincipalClaims>,
    cache: DashMap<String, Arc<Policy>>,
}

impl PolicyEngine {
    /// Create an engine reading policies through `store` as `root`.
    #[must_use]
    pub fn new(store: Arc<SecretStore>, root: Arc<PrincipalClaims>) -> Self {
        Self {
            store,
            root,
            cache: DashMap::new(),
        }
    }

    /// Resolve a policy by name. `Ok(None)` if no such policy is stored.
    ///
    /// # Errors
    ///
    /// Returns a [`VaultError`] if the stored policy cannot be decrypted or parsed.
    pub async fn get(&self, name: &str) -> Result<Option<Arc<Policy>>, VaultError> {
        if name == ROOT_POLICY {
            return Ok(Some(Arc::new(root_policy())));
        }
        if let Some(cached) = self.cache.get(name).map(|e| Arc::clone(e.value())) {
            return Ok(Some(cached));
        }

        let path = paths::join(POLICY_PATH, name);
        let principal = Principal::root(Arc::clone(&self.root), &path);
        let Some(text) = self.store.read_optional(&principal).await? else {
            return Ok(None);
        };
        let mut policy: Policy =
            serde_json::from_str(&text).map_err(|e| VaultError::malformed("policy", e))?;
        if policy.name.is_empty() {
            name.clone_into(&mut policy.name);
        }
        let policy = Arc::new(policy);
        self.cache.insert(name.to_owned(), Arc::clone(&policy));
        Ok(Some(policy))
    }

    /// Drop a cached policy so the next lookup reads it from storage again.
    pub fn forget(&self, name: &str) {
        if self.cache.remove(name).is_some() {
            info!(policy = %name, "policy evicted");
        }
    }

    /// Compute the effective policy of `claims` on `path`.
    ///
    /// Never fails: unresolvable or unreadable policies degrade to deny-all.
    pub async fn compute_policy_for_path(&self, claims: &PrincipalClaims, path: &str) -> Policy {
        let rooted = paths::rooted(path);
        let mut combined: Option<Policy> = None;

        for name in &claims.policies {
            let policy = match self.get(name).await {
                Ok(Some(policy)) => policy,
                Ok(None) => {
                    info!(policy = %name, principal = %claims.name(), "missing policy");
                    return Policy::deny_all();
                }
                Err(e) => {
                    warn!(
                        policy = %name,
                        principal = %claims.name(),
                        path = %rooted,
                        error = %e,
                        "error computing policy"
                    );
                    return Policy::deny_all();
                }
            };
            if policy.applies_to(&rooted) {
                combined = Some(match combined {
                    None => policy.as_ref().clone(),
                    Some(acc) => acc.combine(&policy),
                });
            }
        }

        combined.unwrap_or_else(Policy::deny_all)
    }

    /// Forget every cached policy.
    pub fn clear(&self) {
        self.cache.clear();
    }
}

impl fmt::Debug for PolicyEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyEngine")
            .field("cached", &self.cache.len())
            .finish_non_exhaustive()
    }
}
