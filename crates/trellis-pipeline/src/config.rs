//! Declarative controller configuration, loaded from JSON.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use trellis_template::Template;
use trellis_types::{Result, TrellisError};

use crate::definitions::{CovDef, EpochDef, GroupDef, ParcDef, RawPipe, TestDef, VariableDef};
use crate::invalidation::{CacheSettings, CachePolicy};
use crate::registry::Registry;

pub const ENV_CACHE_POLICY: &str = "TRELLIS_CACHE_POLICY";
pub const ENV_CACHE_VERBOSE: &str = "TRELLIS_CACHE_VERBOSE";

fn default_subject_pattern() -> String {
    r"^[A-Za-z]+\d+$".to_string()
}

fn default_subject_dir() -> Template {
    Template::parse("{root}/meg").unwrap_or_default()
}

/// Where subjects come from: an explicit list, otherwise directory names
/// under `dir` matching `pattern`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubjectsConfig {
    #[serde(default)]
    pub list: Option<Vec<String>>,
    #[serde(default = "default_subject_pattern")]
    pub pattern: String,
    #[serde(default = "default_subject_dir")]
    pub dir: Template,
}

impl Default for SubjectsConfig {
    fn default() -> Self {
        Self {
            list: None,
            pattern: default_subject_pattern(),
            dir: default_subject_dir(),
        }
    }
}

/// A user parameter. With neither `options` nor `pattern` any value is
/// accepted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParameterSpec {
    #[serde(default)]
    pub options: Option<Vec<String>>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub default: Option<String>,
}

/// Setting `parameter` to `value` also sets every pair in `set`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CascadeRule {
    pub parameter: String,
    pub value: String,
    pub set: IndexMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControllerConfig {
    pub root: PathBuf,
    #[serde(default)]
    pub sessions: Vec<String>,
    #[serde(default)]
    pub subjects: SubjectsConfig,
    #[serde(default)]
    pub parameters: IndexMap<String, ParameterSpec>,
    /// Named templates; replace the built-in ones of the same name.
    #[serde(default)]
    pub templates: IndexMap<String, Template>,
    /// Initial parameter values, applied with cascades.
    #[serde(default)]
    pub defaults: IndexMap<String, String>,
    #[serde(default)]
    pub cascades: Vec<CascadeRule>,
    #[serde(default)]
    pub raw: IndexMap<String, RawPipe>,
    #[serde(default)]
    pub variables: IndexMap<String, VariableDef>,
    #[serde(default)]
    pub epochs: IndexMap<String, EpochDef>,
    #[serde(default)]
    pub tests: IndexMap<String, TestDef>,
    #[serde(default)]
    pub groups: IndexMap<String, GroupDef>,
    #[serde(default)]
    pub parcs: IndexMap<String, ParcDef>,
    #[serde(default)]
    pub covs: IndexMap<String, CovDef>,
    #[serde(default)]
    pub cache: CacheSettings,
}

impl ControllerConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    /// Read a JSON configuration file. A relative `root` is taken relative
    /// to the file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let mut config = Self::from_json_str(&json)?;
        if config.root.is_relative() {
            if let Some(dir) = path.parent() {
                config.root = dir.join(&config.root);
            }
        }
        tracing::debug!(path = %path.display(), root = %config.root.display(), "Configuration loaded");
        Ok(config)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Apply `TRELLIS_CACHE_POLICY` and `TRELLIS_CACHE_VERBOSE`.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(policy) = lookup(ENV_CACHE_POLICY) {
            self.cache.policy = policy.parse::<CachePolicy>()?;
        }
        if let Some(verbose) = lookup(ENV_CACHE_VERBOSE) {
            self.cache.verbose = match verbose.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" | "" => false,
                other => {
                    return Err(TrellisError::Validation(format!(
                        "{ENV_CACHE_VERBOSE}: expected a boolean, got '{other}'"
                    )))
                }
            };
        }
        Ok(())
    }

    /// Register every configured definition.
    pub fn registry(&self) -> Result<Registry> {
        let mut registry = Registry::new();
        for (name, def) in &self.raw {
            registry.register(name, def.clone())?;
        }
        for (name, def) in &self.variables {
            registry.register(name, def.clone())?;
        }
        for (name, def) in &self.epochs {
            registry.register(name, def.clone())?;
        }
        for (name, def) in &self.tests {
            registry.register(name, def.clone())?;
        }
        for (name, def) in &self.groups {
            registry.register(name, def.clone())?;
        }
        for (name, def) in &self.parcs {
            registry.register(name, def.clone())?;
        }
        for (name, def) in &self.covs {
            registry.register(name, def.clone())?;
        }
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const CONFIG: &str = r#"{
        "root": "/data/exp",
        "sessions": ["words", "pictures"],
        "subjects": {"list": ["R0001", "R0002"]},
        "raw": {
            "1-40": {"type": "filter", "source": "raw", "l_freq": 1.0, "h_freq": 40.0}
        },
        "epochs": {
            "word": {"type": "primary", "session": "words", "sel": "stimulus == 'word'"}
        },
        "cache": {"policy": "ask"}
    }"#;

    #[test]
    fn parses_and_registers() {
        let config = ControllerConfig::from_json_str(CONFIG).unwrap();
        assert_eq!(config.sessions, vec!["words", "pictures"]);
        assert_eq!(config.cache.policy, CachePolicy::Ask);
        assert_eq!(config.subjects.pattern, default_subject_pattern());
        assert_eq!(config.subjects.dir.source(), "{root}/meg");
        let registry = config.registry().unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = ControllerConfig::from_json_str(r#"{"root": "/x", "sesions": []}"#).unwrap_err();
        assert!(matches!(err, TrellisError::Json(_)));
        let err = ControllerConfig::from_json_str(
            r#"{"root": "/x", "raw": {"f": {"type": "filter", "source": "raw", "hfreq": 40}}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, TrellisError::Json(_)));
    }

    #[test]
    fn malformed_template_is_rejected() {
        let err = ControllerConfig::from_json_str(r#"{"root": "/x", "templates": {"a": "{b"}}"#)
            .unwrap_err();
        assert!(matches!(err, TrellisError::Json(_)));
    }

    #[test]
    fn env_overrides_cache_settings() {
        let mut config = ControllerConfig::from_json_str(CONFIG).unwrap();
        let env: HashMap<&str, &str> = [(ENV_CACHE_POLICY, "OFF"), (ENV_CACHE_VERBOSE, "1")]
            .into_iter()
            .collect();
        config
            .apply_env_from(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.cache.policy, CachePolicy::Off);
        assert!(config.cache.verbose);

        let err = config
            .apply_env_from(|k| (k == ENV_CACHE_POLICY).then(|| "sometimes".to_string()))
            .unwrap_err();
        assert!(matches!(err, TrellisError::Validation(_)));
    }

    #[test]
    fn relative_root_follows_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trellis.json");
        std::fs::write(&path, r#"{"root": "data"}"#).unwrap();
        let config = ControllerConfig::load(&path).unwrap();
        assert_eq!(config.root, dir.path().join("data"));
    }
}
