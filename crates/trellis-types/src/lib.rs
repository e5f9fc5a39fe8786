//! Shared types and errors for the Trellis pipeline controller.
//!
//! This crate provides the foundational types used across all other Trellis crates:
//! - `TrellisError`: unified error taxonomy
//! - `Category`: the definition categories a controller knows about
//! - `DefKey`: the `(category, name)` identity of a definition
//! - `Fingerprint`: content hash of a definition and its dependencies

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Unified error type for all Trellis subsystems.
#[derive(Debug, thiserror::Error)]
pub enum TrellisError {
    // === State Errors ===
    #[error("Unknown parameter '{name}'")]
    UnknownParameter { name: String },

    #[error("Parameter '{name}' is already declared")]
    DuplicateParameter { name: String },

    #[error("Invalid value '{value}' for parameter '{parameter}': {reason}")]
    InvalidValue {
        parameter: String,
        value: String,
        reason: String,
    },

    #[error("Parameter '{name}' has no value")]
    UnsetParameter { name: String },

    // === Template Errors ===
    #[error("Template '{template}' has no value for slot '{slot}'")]
    MissingSlot { slot: String, template: String },

    #[error("Template syntax error at offset {offset} in '{template}': {message}")]
    TemplateSyntax {
        template: String,
        offset: usize,
        message: String,
    },

    // === Definition Errors ===
    #[error("Duplicate {category} definition '{name}'")]
    DuplicateDefinition { category: Category, name: String },

    #[error("{category} definition '{name}' references unknown {target}")]
    UnknownUpstream {
        category: Category,
        name: String,
        target: DefKey,
    },

    #[error("Dependency cycle in {category} definitions: {}", .cycle.join(" -> "))]
    Cycle { category: Category, cycle: Vec<String> },

    #[error("No {category} definition named '{name}'")]
    UnknownDefinition { category: Category, name: String },

    #[error("Invalid {category} definition '{name}': {message}")]
    InvalidDefinition {
        category: Category,
        name: String,
        message: String,
    },

    #[error("Configuration validation failed: {0}")]
    Validation(String),

    // === Cache Errors ===
    #[error("Cached artifact {} is stale: {reason}", .path.display())]
    StaleCacheConflict { path: PathBuf, reason: String },

    #[error("Input file {} does not exist", .path.display())]
    MissingInput { path: PathBuf },

    #[error("{count} stale cache records need confirmation but no interviewer is attached")]
    ConfirmationRequired { count: usize },

    #[error("Cache invalidation aborted by user")]
    InvalidationAborted,

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl TrellisError {
    /// Returns `true` for errors raised while building the definition catalog,
    /// i.e. errors that a corrected configuration fixes.
    pub fn is_definition_error(&self) -> bool {
        matches!(
            self,
            TrellisError::DuplicateDefinition { .. }
                | TrellisError::UnknownUpstream { .. }
                | TrellisError::Cycle { .. }
                | TrellisError::InvalidDefinition { .. }
                | TrellisError::Validation(_)
                | TrellisError::DuplicateParameter { .. }
        )
    }
}

/// A convenience alias for `Result<T, TrellisError>`.
pub type Result<T> = std::result::Result<T, TrellisError>;

// ---------------------------------------------------------------------------
// Category
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Raw,
    Variable,
    Epoch,
    Test,
    Group,
    Parc,
    Cov,
}

impl Category {
    pub const ALL: [Category; 7] = [
        Category::Raw,
        Category::Variable,
        Category::Epoch,
        Category::Test,
        Category::Group,
        Category::Parc,
        Category::Cov,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Raw => "raw",
            Category::Variable => "variable",
            Category::Epoch => "epoch",
            Category::Test => "test",
            Category::Group => "group",
            Category::Parc => "parc",
            Category::Cov => "cov",
        }
    }

    /// The state parameter that selects a definition of this category, if any.
    /// Variables are referenced by other definitions, never selected.
    pub fn parameter(&self) -> Option<&'static str> {
        match self {
            Category::Variable => None,
            other => Some(other.as_str()),
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = TrellisError;

    fn from_str(s: &str) -> Result<Self> {
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| TrellisError::Other(format!("unknown definition category '{s}'")))
    }
}

// ---------------------------------------------------------------------------
// DefKey
// ---------------------------------------------------------------------------

/// Identity of a definition: its category plus its name. Serialized as
/// `"category:name"` so it can key JSON maps.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DefKey {
    pub category: Category,
    pub name: String,
}

impl DefKey {
    pub fn new(category: Category, name: impl Into<String>) -> Self {
        Self {
            category,
            name: name.into(),
        }
    }
}

impl fmt::Display for DefKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.category, self.name)
    }
}

impl FromStr for DefKey {
    type Err = TrellisError;

    fn from_str(s: &str) -> Result<Self> {
        let (category, name) = s
            .split_once(':')
            .ok_or_else(|| TrellisError::Other(format!("malformed definition key '{s}'")))?;
        Ok(DefKey::new(category.parse()?, name))
    }
}

impl Serialize for DefKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DefKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Fingerprint
// ---------------------------------------------------------------------------

/// Hex digest identifying the content of a definition and everything it
/// depends on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 characters, for log output.
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(12) {
            Some((end, _)) => &self.0[..end],
            None => &self.0,
        }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
