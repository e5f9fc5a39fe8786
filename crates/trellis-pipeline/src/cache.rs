//! Cache records and the on-disk cache index.
//!
//! Every artifact the pipeline writes gets a [`CacheRecord`] binding its path
//! to the fingerprints of the definitions that produced it. Records live in
//! one JSON index at `<cache-dir>/cache-index.json` together with a snapshot
//! of all definitions, used to report what changed between runs.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use trellis_types::{Category, DefKey, Fingerprint, Result};

use crate::registry::DefinitionSnapshot;

pub const INDEX_FILE: &str = "cache-index.json";
pub const INDEX_VERSION: u32 = 1;

/// What a cached file contains. Each kind is located by one named template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    RawCache,
    Ica,
    Epochs,
    Covariance,
    TestResult,
    Parcellation,
}

impl ArtifactKind {
    pub fn category(&self) -> Category {
        match self {
            ArtifactKind::RawCache | ArtifactKind::Ica => Category::Raw,
            ArtifactKind::Epochs => Category::Epoch,
            ArtifactKind::Covariance => Category::Cov,
            ArtifactKind::TestResult => Category::Test,
            ArtifactKind::Parcellation => Category::Parc,
        }
    }

    pub fn template(&self) -> &'static str {
        match self {
            ArtifactKind::RawCache => "cached-raw-file",
            ArtifactKind::Ica => "ica-file",
            ArtifactKind::Epochs => "epoch-file",
            ArtifactKind::Covariance => "cov-file",
            ArtifactKind::TestResult => "test-file",
            ArtifactKind::Parcellation => "parc-file",
        }
    }

    /// Artifacts edited by hand; never deleted automatically.
    pub fn is_user_curated(&self) -> bool {
        matches!(self, ArtifactKind::Ica)
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ArtifactKind::RawCache => "raw cache",
            ArtifactKind::Ica => "ICA",
            ArtifactKind::Epochs => "epochs",
            ArtifactKind::Covariance => "covariance",
            ArtifactKind::TestResult => "test result",
            ArtifactKind::Parcellation => "parcellation",
        };
        f.write_str(s)
    }
}

/// Why a record no longer matches the current definitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StaleReason {
    DefinitionChanged { definition: DefKey },
    /// The definition is gone, so no current fingerprint exists.
    DefinitionRemoved { definition: DefKey },
    InputModified { input: PathBuf },
    UpstreamStale { upstream: PathBuf },
}

impl fmt::Display for StaleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StaleReason::DefinitionChanged { definition } => write!(f, "{definition} changed"),
            StaleReason::DefinitionRemoved { definition } => write!(f, "{definition} was removed"),
            StaleReason::InputModified { input } => {
                write!(f, "input {} was modified", input.display())
            }
            StaleReason::UpstreamStale { upstream } => {
                write!(f, "upstream {} is stale", upstream.display())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub path: PathBuf,
    pub kind: ArtifactKind,
    /// The definition that produced the artifact.
    pub definition: DefKey,
    /// Fingerprints of every definition the artifact depends on.
    pub fingerprints: BTreeMap<DefKey, Fingerprint>,
    /// State values identifying the artifact (subject, session, ...).
    pub state: BTreeMap<String, String>,
    /// Files read to produce the artifact.
    #[serde(default)]
    pub inputs: Vec<PathBuf>,
    pub verified_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stale: Option<StaleReason>,
}

impl CacheRecord {
    /// First fingerprint mismatch against `current`, in key order.
    pub fn compare(&self, current: &dyn Fn(&DefKey) -> Option<Fingerprint>) -> Option<StaleReason> {
        for (key, recorded) in &self.fingerprints {
            match current(key) {
                None => {
                    return Some(StaleReason::DefinitionRemoved {
                        definition: key.clone(),
                    })
                }
                Some(fp) if &fp != recorded => {
                    return Some(StaleReason::DefinitionChanged {
                        definition: key.clone(),
                    })
                }
                Some(_) => {}
            }
        }
        None
    }

    /// Why the record no longer holds, judged against `current`. Definition
    /// staleness is recomputed on every call so a reverted change makes the
    /// record valid again; only a flagged input modification is sticky.
    pub fn staleness(&self, current: &dyn Fn(&DefKey) -> Option<Fingerprint>) -> Option<StaleReason> {
        self.compare(current)
            .or_else(|| {
                self.stale
                    .clone()
                    .filter(|r| matches!(r, StaleReason::InputModified { .. }))
            })
            .or_else(|| {
                self.modified_input().map(|input| StaleReason::InputModified {
                    input: input.to_path_buf(),
                })
            })
    }

    /// An input whose modification time is later than the last verification.
    pub fn modified_input(&self) -> Option<&Path> {
        self.inputs
            .iter()
            .find(|input| match modified_at(input) {
                Some(mtime) => mtime > self.verified_at,
                None => false,
            })
            .map(PathBuf::as_path)
    }
}

pub(crate) fn modified_at(path: &Path) -> Option<DateTime<Utc>> {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}

// ---------------------------------------------------------------------------
// CacheIndex
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheIndex {
    pub version: u32,
    #[serde(default)]
    pub definitions: BTreeMap<DefKey, DefinitionSnapshot>,
    /// Records keyed by artifact path, in the order they were committed.
    #[serde(default)]
    pub records: IndexMap<String, CacheRecord>,
}

impl Default for CacheIndex {
    fn default() -> Self {
        Self {
            version: INDEX_VERSION,
            definitions: BTreeMap::new(),
            records: IndexMap::new(),
        }
    }
}

fn record_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

impl CacheIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(cache_dir: &Path) -> PathBuf {
        cache_dir.join(INDEX_FILE)
    }

    /// Load the index from `cache_dir`. A missing file, or one written with
    /// another index version, yields an empty index; files it tracked become
    /// untracked and are left alone.
    pub fn load(cache_dir: &Path) -> Result<Self> {
        let path = Self::path(cache_dir);
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No cache index, starting empty");
            return Ok(Self::new());
        }
        let json = std::fs::read_to_string(&path)?;
        let index: CacheIndex = serde_json::from_str(&json)?;
        if index.version != INDEX_VERSION {
            tracing::warn!(
                path = %path.display(),
                found = index.version,
                expected = INDEX_VERSION,
                "Cache index version mismatch, ignoring existing records"
            );
            return Ok(Self::new());
        }
        tracing::debug!(path = %path.display(), records = index.records.len(), "Cache index loaded");
        Ok(index)
    }

    pub fn save(&self, cache_dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(cache_dir)?;
        let path = Self::path(cache_dir);
        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        tracing::debug!(path = %path.display(), records = self.records.len(), "Cache index saved");
        Ok(path)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn record(&self, path: &Path) -> Option<&CacheRecord> {
        self.records.get(&record_key(path))
    }

    pub fn record_mut(&mut self, path: &Path) -> Option<&mut CacheRecord> {
        self.records.get_mut(&record_key(path))
    }

    /// Insert or replace the record for its path.
    pub fn insert(&mut self, record: CacheRecord) {
        self.records.insert(record_key(&record.path), record);
    }

    pub fn remove(&mut self, path: &Path) -> Option<CacheRecord> {
        self.records.shift_remove(&record_key(path))
    }

    pub fn records(&self) -> impl Iterator<Item = &CacheRecord> {
        self.records.values()
    }

    /// Records that list `path` among their inputs.
    pub fn dependents(&self, path: &Path) -> Vec<&CacheRecord> {
        self.records
            .values()
            .filter(|r| r.inputs.iter().any(|i| i == path))
            .collect()
    }
}
