//! CLI configuration.
//!
//! Loads settings from `COFFER_*` environment variables with defaults;
//! command-line flags override whatever the environment provides.

use std::path::PathBuf;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

impl LogFormat {
    fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Text
        }
    }
}

/// Process configuration for one CLI invocation.
#[derive(Clone)]
pub struct CliConfig {
    /// Vault root directory.
    pub root: PathBuf,
    /// Caller token, if any.
    pub token: Option<String>,
    /// Log filter used when `RUST_LOG` is unset.
    pub log_level: String,
    /// Log output format.
    pub log_format: LogFormat,
    /// JSON-lines audit log, if enabled.
    pub audit_file: Option<PathBuf>,
}

impl CliConfig {
    /// Load configuration from environment variables.
    ///
    /// - `COFFER_ROOT`: vault root directory (default: `./vault`)
    /// - `COFFER_TOKEN`: caller token
    /// - `COFFER_LOG_LEVEL`: log filter (default: `info`)
    /// - `COFFER_LOG_FORMAT`: `text` or `json` (default: `text`)
    /// - `COFFER_AUDIT_FILE`: audit log path (optional)
    #[must_use]
    pub fn from_env() -> Self {
        let root = std::env::var_os("COFFER_ROOT")
            .map_or_else(|| PathBuf::from("./vault"), PathBuf::from);

        let token = std::env::var("COFFER_TOKEN").ok().filter(|t| !t.is_empty());

        let log_level = std::env::var("COFFER_LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());

        let log_format = std::env::var("COFFER_LOG_FORMAT")
            .map(|v| LogFormat::parse(&v))
            .unwrap_or_default();

        let audit_file = std::env::var_os("COFFER_AUDIT_FILE").map(PathBuf::from);

        Self {
            root,
            token,
            log_level,
            log_format,
            audit_file,
        }
    }
}

impl std::fmt::Debug for CliConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CliConfig")
            .field("root", &self.root)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("log_level", &self.log_level)
            .field("log_format", &self.log_format)
            .field("audit_file", &self.audit_file)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_parsing() {
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse("JSON"), LogFormat::Json);
        assert_eq!(LogFormat::parse("pretty"), LogFormat::Text);
    }

    #[test]
    fn debug_redacts_token() {
        let config = CliConfig {
            root: PathBuf::from("/tmp/v"),
            token: Some("t.secret".to_owned()),
            log_level: "info".to_owned(),
            log_format: LogFormat::Text,
            audit_file: None,
        };
        let debug = format!("{config:?}");
        assert!(!debug.contains("t.secret"));
        assert!(debug.contains("REDACTED"));
    }
}
