//! Bootstrap templates.
//!
//! A template is a JSON tree mirroring the vault's directory layout. Object
//! members are directories, except objects holding a `:content` (text or
//! JSON) or `:binaryContent` (base64) member, which are files. An `:action`
//! member overrides the action for that node and its descendants.
//!
//! `{{name}}` placeholders inside text content are replaced with variables
//! registered through [`Template::with_variable`].

use std::collections::BTreeMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use coffer_storage::StorageBackend;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::VaultError;
use crate::paths;

const CONTENT: &str = ":content";
const BINARY_CONTENT: &str = ":binaryContent";
const ACTION: &str = ":action";

const NEW_VAULT: &str = include_str!("../templates/new-vault.json");

/// How a template node treats what already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateAction {
    /// Create what is missing, leave everything else alone.
    #[default]
    Keep,
    /// Overwrite files and delete directory entries not in the template.
    Replace,
}

/// A parsed template.
#[derive(Debug, Clone)]
pub struct Template {
    root: Value,
    variables: BTreeMap<String, String>,
}

impl Template {
    /// The skeleton of a new vault.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Template`] if the embedded template is invalid.
    pub fn new_vault() -> Result<Self, VaultError> {
        Self::parse(NEW_VAULT)
    }

    /// Parse a template document.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Template`] if the text is not a JSON object.
    pub fn parse(text: &str) -> Result<Self, VaultError> {
        let root: Value = serde_json::from_str(text).map_err(|e| VaultError::Template {
            reason: e.to_string(),
        })?;
        if !root.is_object() {
            return Err(VaultError::Template {
                reason: "template root must be an object".to_owned(),
            });
        }
        Ok(Self {
            root,
            variables: BTreeMap::new(),
        })
    }

    /// Register a `{{name}}` substitution.
    #[must_use]
    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    /// Apply the template below the storage root. Returns the files written.
    ///
    /// A file counts as present if either its plaintext or its encrypted
    /// form exists.
    ///
    /// # Errors
    ///
    /// - [`VaultError::Template`] for malformed nodes or actions.
    /// - [`VaultError::Storage`] if the backend fails.
    pub async fn apply(
        &self,
        storage: &dyn StorageBackend,
        action: TemplateAction,
    ) -> Result<Vec<String>, VaultError> {
        let mut written = Vec::new();
        let mut pending = vec![(String::new(), &self.root, action)];

        while let Some((path, node, inherited)) = pending.pop() {
            let action = node_action(node, inherited)?;
            let Some(members) = node.as_object() else {
                return Err(VaultError::Template {
                    reason: format!("node '{path}' is not an object"),
                });
            };

            if is_file(node) {
                let exists = storage.exists(&path).await?
                    || storage.exists(&paths::secured(&path)).await?;
                if exists && action == TemplateAction::Keep {
                    continue;
                }
                let content = self.content(&path, node)?;
                storage.put(&path, &content).await?;
                debug!(path = %path, "template file written");
                written.push(path);
                continue;
            }

            storage.create_dir_all(&path).await?;
            if action == TemplateAction::Replace {
                clean(storage, &path, members).await?;
            }
            for (name, child) in members.iter().rev() {
                if name.starts_with(':') || !child.is_object() {
                    continue;
                }
                pending.push((paths::join(&path, name), child, action));
            }
        }

        if !written.is_empty() {
            info!(files = written.len(), "bootstrap template applied");
        }
        Ok(written)
    }

    fn content(&self, path: &str, node: &Value) -> Result<Vec<u8>, VaultError> {
        if let Some(content) = node.get(CONTENT) {
            let text = match content {
                Value::String(text) => text.clone(),
                other => serde_json::to_string_pretty(other).map_err(|e| VaultError::Template {
                    reason: e.to_string(),
                })?,
            };
            return Ok(self.substitute(&text).into_bytes());
        }
        let encoded = node
            .get(BINARY_CONTENT)
            .and_then(Value::as_str)
            .ok_or_else(|| VaultError::Template {
                reason: format!("no content at node '{path}'"),
            })?;
        BASE64.decode(encoded).map_err(|e| VaultError::Template {
            reason: format!("invalid binary content at '{path}': {e}"),
        })
    }

    fn substitute(&self, text: &str) -> String {
        self.variables
            .iter()
            .fold(text.to_owned(), |acc, (name, value)| {
                acc.replace(&format!("{{{{{name}}}}}"), value)
            })
    }
}

fn is_file(node: &Value) -> bool {
    node.get(CONTENT).is_some() || node.get(BINARY_CONTENT).is_some()
}

fn node_action(node: &Value, inherited: TemplateAction) -> Result<TemplateAction, VaultError> {
    match node.get(ACTION) {
        None => Ok(inherited),
        Some(value) => serde_json::from_value(value.clone()).map_err(|e| VaultError::Template {
            reason: format!("invalid action {value}: {e}"),
        }),
    }
}

/// Delete every file below `dir` whose top-level entry is not named in the
/// template. Encrypted files match on their name without the extension.
async fn clean(
    storage: &dyn StorageBackend,
    dir: &str,
    members: &serde_json::Map<String, Value>,
) -> Result<(), VaultError> {
    for key in storage.list(dir).await? {
        let relative = if dir.is_empty() {
            key.as_str()
        } else {
            key.strip_prefix(dir)
                .and_then(|rest| rest.strip_prefix('/'))
                .unwrap_or(&key)
        };
        let entry = relative.split('/').next().unwrap_or(relative);
        let name = entry.strip_suffix(paths::SECURE_EXTENSION).unwrap_or(entry);
        if !members.contains_key(name) {
            storage.delete(&key).await?;
            debug!(path = %key, "removed entry not in template");
        }
    }
    Ok(())
}
