//! Artifact resolution: where an artifact lives and whether it must be
//! (re)computed.
//!
//! The resolver walks the relevant chains, expands the artifact's named
//! template under the current state (with the requested definition
//! selected) and checks the path's [`CacheRecord`] against current
//! fingerprints and input modification times. It never computes anything.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use trellis_types::{Category, DefKey, Fingerprint, Result, TrellisError};

use crate::cache::{ArtifactKind, CacheIndex, CacheRecord, StaleReason};
use crate::definitions::{ParcDef, RawPipe};
use crate::invalidation::CachePolicy;
use crate::registry::Catalog;
use crate::state::StateStore;
use crate::templates::{Scope, TemplateSet};

#[derive(Debug, Clone, PartialEq)]
pub enum ArtifactStatus {
    /// Recorded, present and matching current definitions.
    Fresh,
    /// Not on disk.
    Missing,
    Stale(StaleReason),
    /// On disk but without a cache record.
    Untracked,
    /// Input data read as-is (raw recordings, FreeSurfer parcellations).
    Source,
    /// Recomputed on every use and never written.
    Transient,
}

impl ArtifactStatus {
    pub fn needs_compute(&self) -> bool {
        matches!(
            self,
            ArtifactStatus::Missing | ArtifactStatus::Stale(_) | ArtifactStatus::Untracked
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub kind: ArtifactKind,
    pub definition: DefKey,
    pub path: PathBuf,
    pub status: ArtifactStatus,
    /// Every definition the artifact depends on.
    pub fingerprints: BTreeMap<DefKey, Fingerprint>,
    /// Parameter values that located the artifact.
    pub state: BTreeMap<String, String>,
    /// Files the artifact is computed from.
    pub inputs: Vec<PathBuf>,
    /// An input artifact that is itself stale, if any.
    pub stale_input: Option<PathBuf>,
}

impl Resolution {
    /// Whether the caller has to compute the artifact before using it.
    pub fn is_stale(&self) -> bool {
        self.status.needs_compute() || self.stale_input.is_some()
    }

    pub fn is_cached(&self) -> bool {
        !matches!(
            self.status,
            ArtifactStatus::Source | ArtifactStatus::Transient
        )
    }

    /// Record for this artifact as of now.
    pub fn to_record(&self) -> CacheRecord {
        CacheRecord {
            path: self.path.clone(),
            kind: self.kind,
            definition: self.definition.clone(),
            fingerprints: self.fingerprints.clone(),
            state: self.state.clone(),
            inputs: self.inputs.clone(),
            verified_at: Utc::now(),
            stale: None,
        }
    }

    /// Paths a dependent artifact should record as inputs.
    fn as_inputs(&self) -> Vec<PathBuf> {
        match self.status {
            ArtifactStatus::Transient => self.inputs.clone(),
            _ => vec![self.path.clone()],
        }
    }

    fn stale_path(&self) -> Option<PathBuf> {
        match self.status {
            ArtifactStatus::Stale(_) => Some(self.path.clone()),
            _ => self.stale_input.clone(),
        }
    }
}

/// The artifact produced by definitions of `category`, if any.
pub fn artifact_kind(category: Category) -> Result<ArtifactKind> {
    match category {
        Category::Raw => Ok(ArtifactKind::RawCache),
        Category::Epoch => Ok(ArtifactKind::Epochs),
        Category::Cov => Ok(ArtifactKind::Covariance),
        Category::Test => Ok(ArtifactKind::TestResult),
        Category::Parc => Ok(ArtifactKind::Parcellation),
        Category::Variable | Category::Group => Err(TrellisError::Other(format!(
            "{category} definitions do not produce artifacts"
        ))),
    }
}

pub struct Resolver<'a> {
    pub catalog: &'a Catalog,
    pub templates: &'a TemplateSet,
    pub state: &'a StateStore,
    pub index: &'a CacheIndex,
    pub subjects: &'a [String],
    pub policy: CachePolicy,
}

type Overrides = BTreeMap<String, String>;

impl Resolver<'_> {
    /// `base` plus `pairs`, each checked against its parameter's domain.
    fn with(&self, base: &Overrides, pairs: &[(&str, &str)]) -> Result<Overrides> {
        let mut out = base.clone();
        for (k, v) in pairs {
            if self.state.is_declared(k) {
                self.state.validate(k, v)?;
            }
            out.insert(k.to_string(), v.to_string());
        }
        Ok(out)
    }

    /// Resolve `kind` for definition `name`. Under the `off` policy a stale
    /// artifact is an error.
    pub fn resolve(&self, kind: ArtifactKind, name: &str) -> Result<Resolution> {
        let resolution = self.resolve_with(kind, name, &Overrides::new())?;
        if self.policy == CachePolicy::Off {
            if let ArtifactStatus::Stale(reason) = &resolution.status {
                return Err(TrellisError::StaleCacheConflict {
                    path: resolution.path.clone(),
                    reason: reason.to_string(),
                });
            }
            if let Some(upstream) = &resolution.stale_input {
                return Err(TrellisError::StaleCacheConflict {
                    path: resolution.path.clone(),
                    reason: format!("input {} is stale", upstream.display()),
                });
            }
        }
        Ok(resolution)
    }

    fn resolve_with(&self, kind: ArtifactKind, name: &str, base: &Overrides) -> Result<Resolution> {
        let category = kind.category();
        let key = DefKey::new(category, name);
        if !self.catalog.contains(&key) {
            return Err(TrellisError::UnknownDefinition {
                category,
                name: name.into(),
            });
        }
        match kind {
            ArtifactKind::RawCache => self.raw(name, base),
            ArtifactKind::Ica => self.ica(name, base),
            ArtifactKind::Epochs => self.epochs(name, base),
            ArtifactKind::Covariance => self.cov(name, base),
            ArtifactKind::TestResult => self.test(name, base),
            ArtifactKind::Parcellation => self.parc(name, base),
        }
    }

    /// Current value of a parameter, honouring overrides.
    fn current(&self, parameter: &str, overrides: &Overrides) -> Result<String> {
        match overrides.get(parameter) {
            Some(value) => Ok(value.clone()),
            None => self.state.require(parameter).map(str::to_string),
        }
    }

    fn closure_of(&self, keys: &[DefKey]) -> Result<BTreeMap<DefKey, Fingerprint>> {
        let mut out = BTreeMap::new();
        for key in keys {
            out.extend(self.catalog.closure(key)?);
        }
        Ok(out)
    }

    fn raw(&self, name: &str, base: &Overrides) -> Result<Resolution> {
        let overrides = self.with(base, &[("raw", name)])?;
        let pipe = self.catalog.raw(name)?;
        let key = DefKey::new(Category::Raw, name);
        let fingerprints = self.catalog.closure(&key)?;

        if pipe.is_source() {
            let scope = Scope::new(self.templates, self.state, overrides);
            let path = PathBuf::from(scope.expand_named("raw-file")?);
            if !path.exists() {
                return Err(TrellisError::MissingInput { path });
            }
            return Ok(Resolution {
                kind: ArtifactKind::RawCache,
                definition: key,
                path,
                status: ArtifactStatus::Source,
                fingerprints,
                state: scope.used(),
                inputs: Vec::new(),
                stale_input: None,
            });
        }

        let mut upstream = Vec::new();
        if let Some(source) = pipe.source_name() {
            upstream.push(self.raw(source, base)?);
        }
        if let RawPipe::Ica { .. } = pipe {
            upstream.push(self.ica(name, base)?);
        }
        let transient = !pipe.is_cached();
        self.finish(ArtifactKind::RawCache, key, overrides, fingerprints, &upstream, transient)
    }

    /// The hand-curated ICA decomposition of an ICA pipe, fitted on the
    /// pipe's sessions.
    fn ica(&self, name: &str, base: &Overrides) -> Result<Resolution> {
        let RawPipe::Ica { source, sessions, .. } = self.catalog.raw(name)? else {
            return Err(TrellisError::InvalidDefinition {
                category: Category::Raw,
                name: name.into(),
                message: "not an ICA pipe".into(),
            });
        };
        let key = DefKey::new(Category::Raw, name);
        let fingerprints = self.catalog.closure(&key)?;
        let mut upstream = Vec::with_capacity(sessions.len());
        for session in sessions {
            upstream.push(self.raw(source, &self.with(base, &[("session", session)])?)?);
        }
        let overrides = self.with(base, &[("raw", name)])?;
        self.finish(ArtifactKind::Ica, key, overrides, fingerprints, &upstream, false)
    }

    fn epochs(&self, name: &str, base: &Overrides) -> Result<Resolution> {
        let raw = self.current("raw", base)?;
        let key = DefKey::new(Category::Epoch, name);
        let fingerprints = self.closure_of(&[key.clone(), DefKey::new(Category::Raw, &raw)])?;
        let mut upstream = Vec::new();
        for session in self.catalog.epoch_sessions(name)? {
            upstream.push(self.raw(&raw, &self.with(base, &[("session", &session)])?)?);
        }
        let overrides = self.with(base, &[("epoch", name)])?;
        self.finish(ArtifactKind::Epochs, key, overrides, fingerprints, &upstream, false)
    }

    fn cov(&self, name: &str, base: &Overrides) -> Result<Resolution> {
        let raw = self.current("raw", base)?;
        let key = DefKey::new(Category::Cov, name);
        let fingerprints = self.closure_of(&[key.clone(), DefKey::new(Category::Raw, &raw)])?;
        let epoch = self.catalog.cov(name)?.epoch_name().to_string();
        let upstream = vec![self.epochs(&epoch, base)?];
        let overrides = self.with(base, &[("cov", name)])?;
        self.finish(ArtifactKind::Covariance, key, overrides, fingerprints, &upstream, false)
    }

    fn test(&self, name: &str, base: &Overrides) -> Result<Resolution> {
        let raw = self.current("raw", base)?;
        let epoch = self.current("epoch", base)?;
        let group = self.current("group", base)?;
        let key = DefKey::new(Category::Test, name);
        let fingerprints = self.closure_of(&[
            key.clone(),
            DefKey::new(Category::Epoch, &epoch),
            DefKey::new(Category::Raw, &raw),
            DefKey::new(Category::Group, &group),
        ])?;
        let mut upstream = Vec::new();
        for subject in self.catalog.group_members(&group, self.subjects)? {
            upstream.push(self.epochs(&epoch, &self.with(base, &[("subject", &subject)])?)?);
        }
        let overrides = self.with(base, &[("test", name)])?;
        self.finish(ArtifactKind::TestResult, key, overrides, fingerprints, &upstream, false)
    }

    fn parc(&self, name: &str, base: &Overrides) -> Result<Resolution> {
        let key = DefKey::new(Category::Parc, name);
        let fingerprints = self.catalog.closure(&key)?;
        let overrides = self.with(base, &[("parc", name)])?;
        let def = self.catalog.parc(name)?;
        if !def.is_derived() {
            let scope = Scope::new(self.templates, self.state, overrides);
            let path = PathBuf::from(scope.expand_named(ArtifactKind::Parcellation.template())?);
            if !path.exists() {
                return Err(TrellisError::MissingInput { path });
            }
            return Ok(Resolution {
                kind: ArtifactKind::Parcellation,
                definition: key,
                path,
                status: ArtifactStatus::Source,
                fingerprints,
                state: scope.used(),
                inputs: Vec::new(),
                stale_input: None,
            });
        }
        let upstream = match def {
            ParcDef::Combination { base: parc_base, .. } => vec![self.parc(parc_base, base)?],
            ParcDef::Seeded { mask: Some(mask), .. } => vec![self.parc(mask, base)?],
            _ => Vec::new(),
        };
        self.finish(ArtifactKind::Parcellation, key, overrides, fingerprints, &upstream, false)
    }

    fn finish(
        &self,
        kind: ArtifactKind,
        key: DefKey,
        overrides: Overrides,
        fingerprints: BTreeMap<DefKey, Fingerprint>,
        upstream: &[Resolution],
        transient: bool,
    ) -> Result<Resolution> {
        let scope = Scope::new(self.templates, self.state, overrides);
        let path = PathBuf::from(scope.expand_named(kind.template())?);
        let inputs: Vec<PathBuf> = upstream.iter().flat_map(Resolution::as_inputs).collect();
        let stale_input = upstream.iter().find_map(Resolution::stale_path);

        let status = if transient {
            ArtifactStatus::Transient
        } else {
            self.status(&path, &fingerprints)
        };
        tracing::debug!(
            kind = %kind,
            definition = %key,
            path = %path.display(),
            status = ?status,
            "resolved artifact"
        );
        Ok(Resolution {
            kind,
            definition: key,
            path,
            status,
            fingerprints,
            state: scope.used(),
            inputs,
            stale_input,
        })
    }

    fn status(&self, path: &Path, fingerprints: &BTreeMap<DefKey, Fingerprint>) -> ArtifactStatus {
        let Some(record) = self.index.record(path) else {
            return if path.exists() {
                ArtifactStatus::Untracked
            } else {
                ArtifactStatus::Missing
            };
        };
        if !path.exists() {
            return ArtifactStatus::Missing;
        }
        let current = |k: &DefKey| self.catalog.fingerprint(k).ok().cloned();
        let reason = record.staleness(&current).or_else(|| {
            // dependencies the record does not know about yet
            fingerprints
                .keys()
                .find(|k| !record.fingerprints.contains_key(*k))
                .map(|k| StaleReason::DefinitionChanged { definition: k.clone() })
        });
        match reason {
            Some(reason) => ArtifactStatus::Stale(reason),
            None => ArtifactStatus::Fresh,
        }
    }
}
