//! Cache invalidation: find records that no longer match the current
//! definitions or inputs, then delete, re-stamp or flag them.
//!
//! Planning is pure; [`apply_invalidation`] performs the chosen
//! [`Decision`]; [`run_invalidation`] picks the decision from the
//! [`CachePolicy`], asking an [`Interviewer`] under `ask`.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use trellis_types::{DefKey, Result, TrellisError};

use crate::cache::{CacheIndex, StaleReason};
use crate::interviewer::{Interviewer, Question};
use crate::registry::Catalog;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// What to do with stale cache records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CachePolicy {
    /// Delete stale artifacts.
    #[default]
    Auto,
    /// Ask an interviewer before deleting.
    Ask,
    /// Leave everything in place and flag records as stale.
    Off,
}

impl CachePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CachePolicy::Auto => "auto",
            CachePolicy::Ask => "ask",
            CachePolicy::Off => "off",
        }
    }
}

impl fmt::Display for CachePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CachePolicy {
    type Err = TrellisError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(CachePolicy::Auto),
            "ask" => Ok(CachePolicy::Ask),
            "off" => Ok(CachePolicy::Off),
            other => Err(TrellisError::Validation(format!(
                "unknown cache policy '{other}' (expected auto, ask or off)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheSettings {
    #[serde(default)]
    pub policy: CachePolicy,
    /// Log each invalidation reason instead of a summary.
    #[serde(default)]
    pub verbose: bool,
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefinitionStatus {
    New,
    Removed,
    Changed,
    Good,
}

/// A declared parameter whose value differs from the one cached with the
/// definitions snapshot. `None` marks a parameter that was added or removed.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamChange {
    pub definition: DefKey,
    pub parameter: String,
    pub old: Option<Value>,
    pub new: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StaleEntry {
    pub path: PathBuf,
    pub reason: StaleReason,
}

#[derive(Debug, Clone, Default)]
pub struct InvalidationPlan {
    /// Stale records in index order.
    pub stale: Vec<StaleEntry>,
    /// Records whose artifact no longer exists.
    pub missing: Vec<PathBuf>,
    /// Status of every definition, current and previously recorded.
    pub definitions: BTreeMap<DefKey, DefinitionStatus>,
    /// Parameter differences of changed definitions.
    pub parameters: Vec<ParamChange>,
}

impl InvalidationPlan {
    pub fn is_empty(&self) -> bool {
        self.stale.is_empty()
    }

    pub fn changed_definitions(&self) -> impl Iterator<Item = (&DefKey, DefinitionStatus)> {
        self.definitions
            .iter()
            .filter(|(_, s)| **s != DefinitionStatus::Good)
            .map(|(k, s)| (k, *s))
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.stale.iter().any(|e| e.path == path)
    }
}

/// Compare the definitions snapshot stored in the index with the catalog.
pub fn definition_changes(index: &CacheIndex, catalog: &Catalog) -> BTreeMap<DefKey, DefinitionStatus> {
    let current = catalog.snapshot();
    let mut out = BTreeMap::new();
    for (key, snapshot) in &current {
        let status = match index.definitions.get(key) {
            None => DefinitionStatus::New,
            Some(old) if old.fingerprint != snapshot.fingerprint => DefinitionStatus::Changed,
            Some(_) => DefinitionStatus::Good,
        };
        out.insert(key.clone(), status);
    }
    for key in index.definitions.keys() {
        if !current.contains_key(key) {
            out.insert(key.clone(), DefinitionStatus::Removed);
        }
    }
    out
}

fn diff_params(definition: &DefKey, old: &Value, new: &Value, out: &mut Vec<ParamChange>) {
    let (Value::Object(old), Value::Object(new)) = (old, new) else {
        if old != new {
            out.push(ParamChange {
                definition: definition.clone(),
                parameter: "params".into(),
                old: Some(old.clone()),
                new: Some(new.clone()),
            });
        }
        return;
    };
    let keys: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
    for key in keys {
        let (before, after) = (old.get(key), new.get(key));
        if before != after {
            out.push(ParamChange {
                definition: definition.clone(),
                parameter: key.clone(),
                old: before.cloned(),
                new: after.cloned(),
            });
        }
    }
}

/// Parameter differences between the snapshot stored in the index and the
/// catalog, for definitions present in both. A definition whose fingerprint
/// changed only through its dependencies has none.
pub fn parameter_changes(index: &CacheIndex, catalog: &Catalog) -> Vec<ParamChange> {
    let mut out = Vec::new();
    for (key, current) in catalog.snapshot() {
        let Some(old) = index.definitions.get(&key) else {
            continue;
        };
        if old.fingerprint == current.fingerprint {
            continue;
        }
        diff_params(&key, &old.params, &current.params, &mut out);
    }
    out
}

/// Work out which records are stale. Does not touch the file system except
/// to read artifact existence and input modification times.
pub fn plan_invalidation(index: &CacheIndex, catalog: &Catalog) -> InvalidationPlan {
    let mut plan = InvalidationPlan {
        definitions: definition_changes(index, catalog),
        parameters: parameter_changes(index, catalog),
        ..Default::default()
    };
    let current = |key: &DefKey| catalog.fingerprint(key).ok().cloned();

    let mut stale_paths: HashSet<PathBuf> = HashSet::new();
    for record in index.records() {
        if !record.path.exists() {
            plan.missing.push(record.path.clone());
            continue;
        }
        if let Some(reason) = record.staleness(&current) {
            stale_paths.insert(record.path.clone());
            plan.stale.push(StaleEntry {
                path: record.path.clone(),
                reason,
            });
        }
    }

    // Forward propagation through recorded inputs until nothing changes.
    let mut frontier: Vec<PathBuf> = stale_paths.iter().cloned().collect();
    frontier.sort();
    while let Some(upstream) = frontier.pop() {
        for dependent in index.dependents(&upstream) {
            if !dependent.path.exists() || stale_paths.contains(&dependent.path) {
                continue;
            }
            stale_paths.insert(dependent.path.clone());
            frontier.push(dependent.path.clone());
            plan.stale.push(StaleEntry {
                path: dependent.path.clone(),
                reason: StaleReason::UpstreamStale {
                    upstream: upstream.clone(),
                },
            });
        }
    }

    // Report in index order regardless of discovery order.
    let order: BTreeMap<String, usize> = index
        .records
        .keys()
        .enumerate()
        .map(|(i, k)| (k.clone(), i))
        .collect();
    plan.stale.sort_by_key(|e| {
        order
            .get(e.path.to_string_lossy().as_ref())
            .copied()
            .unwrap_or(usize::MAX)
    });
    plan
}

// ---------------------------------------------------------------------------
// Apply
// ---------------------------------------------------------------------------

/// How to handle the stale records of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Delete stale artifacts and their records.
    Delete,
    /// Accept the artifacts as they are: re-stamp records with current
    /// fingerprints.
    Ignore,
    /// Leave artifacts in place and flag their records as stale.
    Keep,
    /// Change nothing and fail with `InvalidationAborted`.
    Abort,
}

impl FromStr for Decision {
    type Err = TrellisError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "delete" => Ok(Decision::Delete),
            "ignore" => Ok(Decision::Ignore),
            "keep" => Ok(Decision::Keep),
            "abort" => Ok(Decision::Abort),
            other => Err(TrellisError::Other(format!("unknown invalidation decision '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvalidationOutcome {
    pub deleted: Vec<PathBuf>,
    pub restamped: Vec<PathBuf>,
    pub flagged: Vec<PathBuf>,
    /// Records dropped because their artifact no longer exists.
    pub pruned: Vec<PathBuf>,
}

/// Carry out `decision` on `plan`. Records of missing artifacts are always
/// pruned and the definitions snapshot is brought up to date. Hand-curated
/// artifacts are flagged instead of deleted.
pub fn apply_invalidation(
    index: &mut CacheIndex,
    plan: &InvalidationPlan,
    catalog: &Catalog,
    decision: Decision,
) -> Result<InvalidationOutcome> {
    if decision == Decision::Abort && !plan.is_empty() {
        return Err(TrellisError::InvalidationAborted);
    }

    let mut outcome = InvalidationOutcome::default();
    for path in &plan.missing {
        if index.remove(path).is_some() {
            outcome.pruned.push(path.clone());
        }
    }

    // Flags that no longer hold are cleared before the stale ones are handled.
    for record in index.records.values_mut() {
        if record.stale.is_some() && !plan.contains(&record.path) {
            tracing::debug!(path = %record.path.display(), "Cache record is valid again");
            record.stale = None;
        }
    }

    for entry in &plan.stale {
        let Some(record) = index.record_mut(&entry.path) else {
            continue;
        };
        match decision {
            Decision::Delete if !record.kind.is_user_curated() => {
                match std::fs::remove_file(&entry.path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                index.remove(&entry.path);
                tracing::debug!(path = %entry.path.display(), "Deleted stale artifact");
                outcome.deleted.push(entry.path.clone());
            }
            Decision::Ignore => {
                record.fingerprints = record
                    .fingerprints
                    .keys()
                    .filter_map(|k| catalog.fingerprint(k).ok().map(|fp| (k.clone(), fp.clone())))
                    .collect();
                record.verified_at = Utc::now();
                record.stale = None;
                outcome.restamped.push(entry.path.clone());
            }
            Decision::Delete | Decision::Keep | Decision::Abort => {
                if record.kind.is_user_curated() && decision == Decision::Delete {
                    tracing::warn!(
                        path = %entry.path.display(),
                        reason = %entry.reason,
                        "Hand-curated artifact is outdated; delete it manually to recompute"
                    );
                }
                record.stale = Some(entry.reason.clone());
                outcome.flagged.push(entry.path.clone());
            }
        }
    }

    index.definitions = catalog.snapshot();
    Ok(outcome)
}

fn show(value: &Option<Value>) -> String {
    value.as_ref().map_or_else(|| "-".to_string(), Value::to_string)
}

fn report(plan: &InvalidationPlan, verbose: bool) {
    if verbose {
        for (key, status) in plan.changed_definitions() {
            tracing::info!(definition = %key, status = ?status, "Definition status");
        }
        for change in &plan.parameters {
            tracing::info!(
                definition = %change.definition,
                parameter = %change.parameter,
                old = %show(&change.old),
                new = %show(&change.new),
                "Definition parameter changed"
            );
        }
        for entry in &plan.stale {
            tracing::info!(path = %entry.path.display(), reason = %entry.reason, "Outdated cache");
        }
    } else if !plan.is_empty() {
        tracing::debug!(
            stale = plan.stale.len(),
            changed = plan.changed_definitions().count(),
            "Outdated cache records"
        );
    }
}

/// Plan and apply according to `settings`. Under `ask` without an
/// interviewer fails with `ConfirmationRequired` and changes nothing.
pub fn run_invalidation(
    index: &mut CacheIndex,
    catalog: &Catalog,
    settings: &CacheSettings,
    interviewer: Option<&dyn Interviewer>,
) -> Result<InvalidationOutcome> {
    let plan = plan_invalidation(index, catalog);
    report(&plan, settings.verbose);

    let decision = if plan.is_empty() {
        Decision::Delete
    } else {
        match settings.policy {
            CachePolicy::Auto => Decision::Delete,
            CachePolicy::Off => {
                tracing::warn!(
                    count = plan.stale.len(),
                    "Cache records are outdated; leaving them in place because the cache policy is off"
                );
                Decision::Keep
            }
            CachePolicy::Ask => {
                let Some(interviewer) = interviewer else {
                    return Err(TrellisError::ConfirmationRequired {
                        count: plan.stale.len(),
                    });
                };
                let answer = interviewer.ask(&confirmation_question(&plan))?;
                match answer.choice.parse::<Decision>() {
                    Ok(Decision::Keep) | Err(_) => Decision::Abort,
                    Ok(decision) => decision,
                }
            }
        }
    };

    let outcome = apply_invalidation(index, &plan, catalog, decision)?;
    if !outcome.deleted.is_empty() || !outcome.flagged.is_empty() {
        tracing::info!(
            deleted = outcome.deleted.len(),
            flagged = outcome.flagged.len(),
            restamped = outcome.restamped.len(),
            "Cache invalidated"
        );
    }
    Ok(outcome)
}

pub fn confirmation_question(plan: &InvalidationPlan) -> Question {
    let mut prompt = format!(
        "{} cached file{} no longer match the current definitions:",
        plan.stale.len(),
        if plan.stale.len() == 1 { "" } else { "s" }
    );
    for entry in &plan.stale {
        prompt.push_str(&format!("\n  {} ({})", entry.path.display(), entry.reason));
    }
    prompt.push_str("\nabort: stop; delete: remove outdated files; ignore: keep files and accept them as current");
    Question {
        prompt,
        choices: vec!["abort".into(), "delete".into(), "ignore".into()],
        default: Some("delete".into()),
    }
}
