//! Path pattern matching for policies.
//!
//! Patterns and paths are both compared in rooted form (`/secret/app1/db`);
//! a pattern written without the leading slash is rooted first, so
//! `secret/**` and `/secret/**` are equivalent.
//!
//! - Glob: `*` matches within one segment, `**` across segments.
//! - Regex: the whole rooted path must match.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::paths;

/// How a policy path pattern is interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternType {
    /// Shell-style glob.
    #[default]
    Glob,
    /// Regular expression, anchored at both ends.
    Regex,
}

/// A compiled path pattern.
#[derive(Debug, Clone)]
pub enum PathMatcher {
    /// A rooted glob pattern.
    Glob(String),
    /// An anchored regular expression.
    Regex(Regex),
}

impl PathMatcher {
    /// Compile a pattern.
    ///
    /// # Errors
    ///
    /// Returns the regex compile error for malformed regular expressions.
    pub fn compile(pattern: &str, pattern_type: PatternType) -> Result<Self, regex::Error> {
        match pattern_type {
            PatternType::Glob => Ok(Self::Glob(paths::rooted(pattern))),
            PatternType::Regex => Regex::new(&format!("^(?:{pattern})$")).map(Self::Regex),
        }
    }

    /// Test a vault path (rooted or not) against this pattern.
    #[must_use]
    pub fn matches(&self, path: &str) -> bool {
        let path = paths::rooted(path);
        match self {
            Self::Glob(glob) => glob_match::glob_match(glob, &path),
            Self::Regex(re) => re.is_match(&path),
        }
    }
}
