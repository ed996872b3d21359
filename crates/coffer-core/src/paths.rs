//! Vault path conventions.
//!
//! Secret paths are relative, `/`-separated strings (`secret/app1/db`). The
//! on-disk key of a secret carries the [`SECURE_EXTENSION`]; everything
//! under [`META_DIR`] belongs to the vault itself and is never migrated.

use crate::error::VaultError;

/// Extension of every encrypted secret file.
pub const SECURE_EXTENSION: &str = ".sec";
/// Directory holding vault metadata and the key store.
pub const META_DIR: &str = ".vault";
/// Vault configuration file inside [`META_DIR`].
pub const VAULT_FILE: &str = ".vault/vault.json";
/// Name of namespace metadata files.
pub const NAMESPACE_FILE: &str = "namespace.json";
/// Directory of live token records.
pub const TOKEN_PATH: &str = "sys/token";
/// Directory of token revocation markers.
pub const REVOKED_TOKEN_PATH: &str = "sys/token/.revoked";
/// Directory of policy definitions.
pub const POLICY_PATH: &str = "sys/policy";
/// Directory of principal records.
pub const PRINCIPAL_PATH: &str = "sys/principle";

/// Normalize a caller supplied path: strip surrounding slashes, collapse
/// repeated separators, and reject traversal.
///
/// # Errors
///
/// Returns [`VaultError::InvalidPath`] for `.`/`..` components or backslashes.
pub fn normalize(path: &str) -> Result<String, VaultError> {
    let invalid = |reason: &str| VaultError::InvalidPath {
        path: path.to_owned(),
        reason: reason.to_owned(),
    };
    if path.contains('\\') || path.contains('\0') {
        return Err(invalid("backslashes and NUL are not allowed"));
    }
    let mut parts = Vec::new();
    for component in path.split('/') {
        match component {
            "" => {}
            "." | ".." => return Err(invalid("traversal component")),
            other => parts.push(other),
        }
    }
    Ok(parts.join("/"))
}

/// Parent of a path, `""` for top-level paths and `None` for the root.
#[must_use]
pub fn parent(path: &str) -> Option<&str> {
    if path.is_empty() {
        return None;
    }
    Some(path.rsplit_once('/').map_or("", |(parent, _)| parent))
}

/// Last component of a path.
#[must_use]
pub fn file_name(path: &str) -> &str {
    path.rsplit_once('/').map_or(path, |(_, name)| name)
}

/// Join a directory and a child name.
#[must_use]
pub fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_owned()
    } else {
        format!("{dir}/{name}")
    }
}

/// Component-wise prefix test: `a/bc` does not start with `a/b`.
#[must_use]
pub fn starts_with(path: &str, prefix: &str) -> bool {
    let path = path.trim_matches('/');
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        return true;
    }
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// The rooted form used for policy matching (`/secret/app1/db`).
#[must_use]
pub fn rooted(path: &str) -> String {
    format!("/{}", path.trim_start_matches('/'))
}

/// Storage key of the encrypted form of a secret.
#[must_use]
pub fn secured(path: &str) -> String {
    format!("{path}{SECURE_EXTENSION}")
}

/// Whether a storage key is an encrypted secret file.
#[must_use]
pub fn is_secured(key: &str) -> bool {
    key.ends_with(SECURE_EXTENSION)
}

/// Whether a path lives inside the metadata directory.
#[must_use]
pub fn is_meta(path: &str) -> bool {
    path == META_DIR || starts_with(path, META_DIR)
}

/// Whether a path names a namespace metadata file.
#[must_use]
pub fn is_namespace_file(path: &str) -> bool {
    file_name(path) == NAMESPACE_FILE
}

/// Path of the namespace metadata file for a namespace. The root namespace
/// keeps its metadata in [`META_DIR`].
#[must_use]
pub fn namespace_file(namespace: &str) -> String {
    if namespace.is_empty() {
        join(META_DIR, NAMESPACE_FILE)
    } else {
        join(namespace, NAMESPACE_FILE)
    }
}

/// The namespace whose cypher protects `path`: its parent directory, or one
/// level higher for namespace metadata files. Files directly inside
/// [`META_DIR`] belong to the root namespace.
#[must_use]
pub fn namespace_of(path: &str) -> &str {
    let dir = parent(path).unwrap_or("");
    let dir = if is_namespace_file(path) {
        parent(dir).unwrap_or("")
    } else {
        dir
    };
    if dir == META_DIR { "" } else { dir }
}

/// Secret path of a principal record. A bare id maps into
/// [`PRINCIPAL_PATH`]; a full path is accepted only if it already names a
/// record there.
///
/// # Errors
///
/// Returns [`VaultError::InvalidPath`] for anything that would resolve
/// outside [`PRINCIPAL_PATH`].
pub fn principal_path(id: &str) -> Result<String, VaultError> {
    let id = normalize(id)?;
    let path = if id.contains('/') {
        id
    } else {
        join(PRINCIPAL_PATH, &id)
    };
    if is_principal_path(&path) {
        Ok(path)
    } else {
        Err(VaultError::InvalidPath {
            path,
            reason: format!("principal records live directly under '{PRINCIPAL_PATH}'"),
        })
    }
}

/// Whether `path` names a principal record.
#[must_use]
pub fn is_principal_path(path: &str) -> bool {
    parent(path) == Some(PRINCIPAL_PATH) && !file_name(path).is_empty()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_and_rejects() {
        assert_eq!(normalize("/secret//app1/db/").ok().as_deref(), Some("secret/app1/db"));
        assert_eq!(normalize("").ok().as_deref(), Some(""));
        assert!(normalize("secret/../sys").is_err());
        assert!(normalize("a\\b").is_err());
    }

    #[test]
    fn parent_and_file_name() {
        assert_eq!(parent("a/b/c"), Some("a/b"));
        assert_eq!(parent("a"), Some(""));
        assert_eq!(parent(""), None);
        assert_eq!(file_name("a/b/c"), "c");
        assert_eq!(file_name("c"), "c");
    }

    #[test]
    fn starts_with_is_component_wise() {
        assert!(starts_with("secret/app1/db", "secret/app1"));
        assert!(starts_with("secret/app1", "/secret/app1/"));
        assert!(!starts_with("secret/app10/db", "secret/app1"));
        assert!(!starts_with("secret/app2/x", "secret/app1"));
        assert!(starts_with("anything", ""));
    }

    #[test]
    fn namespace_of_skips_metadata_files() {
        assert_eq!(namespace_of("secret/app1/db"), "secret/app1");
        assert_eq!(namespace_of("secret/app1/namespace.json"), "secret");
        assert_eq!(namespace_of("top"), "");
        assert_eq!(namespace_of("a/namespace.json"), "");
        assert_eq!(namespace_of(".vault/namespace.json"), "");
    }

    #[test]
    fn namespace_file_of_root_lives_in_meta_dir() {
        assert_eq!(namespace_file(""), ".vault/namespace.json");
        assert_eq!(namespace_file("secret"), "secret/namespace.json");
    }

    #[test]
    fn principal_path_stays_in_the_principal_directory() {
        assert_eq!(principal_path("root").unwrap(), "sys/principle/root");
        assert_eq!(principal_path("sys/principle/alice").unwrap(), "sys/principle/alice");
        for id in ["secret/app1/evil", "sys/principle", "sys/principle/a/b", "../root", ""] {
            assert!(principal_path(id).is_err(), "{id} should be rejected");
        }
    }

    #[test]
    fn meta_detection() {
        assert!(is_meta(".vault/vault.json"));
        assert!(is_meta(".vault"));
        assert!(!is_meta(".vaults/x"));
        assert!(!is_meta("sys/token/.revoked/t.1"));
    }
}
