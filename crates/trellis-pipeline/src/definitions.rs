//! Typed user definitions for every category.
//!
//! Each category is a tagged enum (`{"type": "filter", ...}`) whose variants
//! are either roots, have one upstream of the same category, or several.
//! The [`Definition`] trait exposes that shape plus cross-category
//! references so one chain algorithm and one fingerprint routine serve all
//! categories.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use trellis_types::{Category, DefKey, Result};

// ---------------------------------------------------------------------------
// Definition trait
// ---------------------------------------------------------------------------

/// Same-category inputs of a definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upstream<'a> {
    Root,
    Single(&'a str),
    Multi(Vec<&'a str>),
}

impl<'a> Upstream<'a> {
    pub fn names(&self) -> Vec<&'a str> {
        match self {
            Upstream::Root => Vec::new(),
            Upstream::Single(name) => vec![*name],
            Upstream::Multi(names) => names.clone(),
        }
    }
}

/// A reference to a definition that is not a same-category upstream.
/// Required references must exist; optional ones only count when they do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub key: DefKey,
    pub required: bool,
}

impl Reference {
    pub fn required(category: Category, name: &str) -> Self {
        Self {
            key: DefKey::new(category, name),
            required: true,
        }
    }

    pub fn soft(category: Category, name: &str) -> Self {
        Self {
            key: DefKey::new(category, name),
            required: false,
        }
    }
}

pub trait Definition: Serialize {
    const CATEGORY: Category;

    fn kind(&self) -> &'static str;

    fn upstream(&self) -> Upstream<'_>;

    fn references(&self) -> Vec<Reference> {
        Vec::new()
    }

    /// Declared construction parameters. The definition's own name is not
    /// part of them.
    fn params(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Identifiers used in a selection or model expression, ignoring quoted
/// string literals.
pub fn expression_identifiers(expression: &str) -> Vec<String> {
    static QUOTED: OnceLock<Regex> = OnceLock::new();
    static IDENT: OnceLock<Regex> = OnceLock::new();
    let quoted = QUOTED.get_or_init(|| Regex::new(r#"'[^']*'|"[^"]*""#).expect("static regex"));
    let ident = IDENT
        .get_or_init(|| Regex::new(r"[A-Za-z_][A-Za-z0-9_]*").expect("static regex"));
    let stripped = quoted.replace_all(expression, " ");
    let mut out: Vec<String> = Vec::new();
    for m in ident.find_iter(&stripped) {
        if !out.iter().any(|s| s == m.as_str()) {
            out.push(m.as_str().to_string());
        }
    }
    out
}

fn variable_refs<'a>(expressions: impl IntoIterator<Item = &'a str>) -> Vec<Reference> {
    let mut refs: Vec<Reference> = Vec::new();
    for expression in expressions {
        for ident in expression_identifiers(expression) {
            let r = Reference::soft(Category::Variable, &ident);
            if !refs.contains(&r) {
                refs.push(r);
            }
        }
    }
    refs
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Raw pipes
// ---------------------------------------------------------------------------

fn default_raw_filename() -> String {
    "{subject}_{session}-raw.fif".to_string()
}

fn default_reference() -> String {
    "average".to_string()
}

/// One preprocessing step on continuous data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum RawPipe {
    /// Input recordings; the root of every raw chain.
    Source {
        #[serde(default = "default_raw_filename")]
        filename: String,
        #[serde(default)]
        reader: Option<String>,
        #[serde(default)]
        sysname: Option<String>,
        #[serde(default)]
        montage: Option<String>,
        #[serde(default)]
        rename_channels: BTreeMap<String, String>,
        #[serde(default)]
        options: BTreeMap<String, Value>,
    },
    Filter {
        source: String,
        #[serde(default)]
        l_freq: Option<f64>,
        #[serde(default)]
        h_freq: Option<f64>,
        #[serde(default)]
        options: BTreeMap<String, Value>,
        #[serde(default = "default_true")]
        cache: bool,
    },
    FilterElliptic {
        source: String,
        #[serde(default)]
        low_stop: Option<f64>,
        #[serde(default)]
        low_pass: Option<f64>,
        #[serde(default)]
        high_pass: Option<f64>,
        #[serde(default)]
        high_stop: Option<f64>,
        gpass: f64,
        gstop: f64,
        #[serde(default = "default_true")]
        cache: bool,
    },
    /// Applies a user-curated ICA decomposition fitted on `sessions`.
    Ica {
        source: String,
        sessions: Vec<String>,
        #[serde(default)]
        options: BTreeMap<String, Value>,
        #[serde(default = "default_true")]
        cache: bool,
    },
    Maxwell {
        source: String,
        #[serde(default)]
        options: BTreeMap<String, Value>,
        #[serde(default = "default_true")]
        cache: bool,
    },
    /// Always recomputed on load.
    ReReference {
        source: String,
        #[serde(default = "default_reference")]
        reference: String,
    },
}

impl RawPipe {
    pub fn source() -> Self {
        RawPipe::Source {
            filename: default_raw_filename(),
            reader: None,
            sysname: None,
            montage: None,
            rename_channels: BTreeMap::new(),
            options: BTreeMap::new(),
        }
    }

    pub fn filter(source: &str, l_freq: Option<f64>, h_freq: Option<f64>) -> Self {
        RawPipe::Filter {
            source: source.into(),
            l_freq,
            h_freq,
            options: BTreeMap::new(),
            cache: true,
        }
    }

    pub fn is_source(&self) -> bool {
        matches!(self, RawPipe::Source { .. })
    }

    /// Whether the step's output is written to the cache.
    pub fn is_cached(&self) -> bool {
        match self {
            RawPipe::Source { .. } | RawPipe::ReReference { .. } => false,
            RawPipe::Filter { cache, .. }
            | RawPipe::FilterElliptic { cache, .. }
            | RawPipe::Ica { cache, .. }
            | RawPipe::Maxwell { cache, .. } => *cache,
        }
    }

    pub fn source_name(&self) -> Option<&str> {
        match self {
            RawPipe::Source { .. } => None,
            RawPipe::Filter { source, .. }
            | RawPipe::FilterElliptic { source, .. }
            | RawPipe::Ica { source, .. }
            | RawPipe::Maxwell { source, .. }
            | RawPipe::ReReference { source, .. } => Some(source),
        }
    }
}

impl Definition for RawPipe {
    const CATEGORY: Category = Category::Raw;

    fn kind(&self) -> &'static str {
        match self {
            RawPipe::Source { .. } => "source",
            RawPipe::Filter { .. } => "filter",
            RawPipe::FilterElliptic { .. } => "filter_elliptic",
            RawPipe::Ica { .. } => "ica",
            RawPipe::Maxwell { .. } => "maxwell",
            RawPipe::ReReference { .. } => "re_reference",
        }
    }

    fn upstream(&self) -> Upstream<'_> {
        match self.source_name() {
            Some(source) => Upstream::Single(source),
            None => Upstream::Root,
        }
    }
}

// ---------------------------------------------------------------------------
// Variables
// ---------------------------------------------------------------------------

/// Event variables: columns added to the event table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum VariableDef {
    /// Map codes of `source` (usually `trigger`) to labels.
    Label {
        #[serde(default = "default_label_source")]
        source: String,
        codes: BTreeMap<String, String>,
    },
    Eval { expression: String },
    /// Label each subject by the first listed group containing it.
    Group { groups: Vec<String> },
}

fn default_label_source() -> String {
    "trigger".to_string()
}

impl Definition for VariableDef {
    const CATEGORY: Category = Category::Variable;

    fn kind(&self) -> &'static str {
        match self {
            VariableDef::Label { .. } => "label",
            VariableDef::Eval { .. } => "eval",
            VariableDef::Group { .. } => "group",
        }
    }

    fn upstream(&self) -> Upstream<'_> {
        Upstream::Root
    }

    fn references(&self) -> Vec<Reference> {
        match self {
            VariableDef::Label { source, .. } => variable_refs([source.as_str()]),
            VariableDef::Eval { expression } => variable_refs([expression.as_str()]),
            VariableDef::Group { groups } => groups
                .iter()
                .map(|g| Reference::required(Category::Group, g))
                .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Epochs
// ---------------------------------------------------------------------------

/// Time-locked data segments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum EpochDef {
    /// Extracted directly from one session.
    Primary {
        session: String,
        #[serde(default)]
        sel: Option<String>,
        #[serde(default)]
        tmin: Option<f64>,
        #[serde(default)]
        tmax: Option<f64>,
        #[serde(default)]
        samplingrate: Option<u32>,
        #[serde(default)]
        options: BTreeMap<String, Value>,
    },
    /// Inherits everything from `base` except what it overrides.
    Secondary {
        base: String,
        #[serde(default)]
        sel: Option<String>,
        #[serde(default)]
        tmin: Option<f64>,
        #[serde(default)]
        tmax: Option<f64>,
        #[serde(default)]
        samplingrate: Option<u32>,
        #[serde(default)]
        options: BTreeMap<String, Value>,
    },
    /// Concatenation of several epochs.
    Super {
        sub_epochs: Vec<String>,
        #[serde(default)]
        options: BTreeMap<String, Value>,
    },
}

impl EpochDef {
    pub fn primary(session: &str, sel: Option<&str>) -> Self {
        EpochDef::Primary {
            session: session.into(),
            sel: sel.map(Into::into),
            tmin: None,
            tmax: None,
            samplingrate: None,
            options: BTreeMap::new(),
        }
    }

    pub fn secondary(base: &str, sel: Option<&str>) -> Self {
        EpochDef::Secondary {
            base: base.into(),
            sel: sel.map(Into::into),
            tmin: None,
            tmax: None,
            samplingrate: None,
            options: BTreeMap::new(),
        }
    }

    pub fn selection(&self) -> Option<&str> {
        match self {
            EpochDef::Primary { sel, .. } | EpochDef::Secondary { sel, .. } => sel.as_deref(),
            EpochDef::Super { .. } => None,
        }
    }
}

impl Definition for EpochDef {
    const CATEGORY: Category = Category::Epoch;

    fn kind(&self) -> &'static str {
        match self {
            EpochDef::Primary { .. } => "primary",
            EpochDef::Secondary { .. } => "secondary",
            EpochDef::Super { .. } => "super",
        }
    }

    fn upstream(&self) -> Upstream<'_> {
        match self {
            EpochDef::Primary { .. } => Upstream::Root,
            EpochDef::Secondary { base, .. } => Upstream::Single(base),
            EpochDef::Super { sub_epochs, .. } => {
                Upstream::Multi(sub_epochs.iter().map(String::as_str).collect())
            }
        }
    }

    fn references(&self) -> Vec<Reference> {
        variable_refs(self.selection())
    }
}

// ---------------------------------------------------------------------------
// Statistical tests
// ---------------------------------------------------------------------------

fn default_tail() -> i8 {
    0
}

/// Statistical test specifications. Only their identity matters here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum TestDef {
    OneSample {
        #[serde(default)]
        model: Option<String>,
        #[serde(default = "default_tail")]
        tail: i8,
    },
    Related {
        model: String,
        c1: String,
        c0: String,
        #[serde(default = "default_tail")]
        tail: i8,
    },
    Independent {
        model: String,
        c1: String,
        c0: String,
        #[serde(default = "default_tail")]
        tail: i8,
    },
    Anova { x: String },
}

impl Definition for TestDef {
    const CATEGORY: Category = Category::Test;

    fn kind(&self) -> &'static str {
        match self {
            TestDef::OneSample { .. } => "one_sample",
            TestDef::Related { .. } => "related",
            TestDef::Independent { .. } => "independent",
            TestDef::Anova { .. } => "anova",
        }
    }

    fn upstream(&self) -> Upstream<'_> {
        Upstream::Root
    }

    fn references(&self) -> Vec<Reference> {
        match self {
            TestDef::OneSample { model, .. } => variable_refs(model.as_deref()),
            TestDef::Related { model, .. } | TestDef::Independent { model, .. } => {
                variable_refs([model.as_str()])
            }
            TestDef::Anova { x } => variable_refs([x.as_str()]),
        }
    }
}

// ---------------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------------

/// Subject groups. `all` is always available.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum GroupDef {
    /// Every known subject.
    All {},
    Subjects { subjects: Vec<String> },
    Exclude { base: String, exclude: Vec<String> },
    Union { groups: Vec<String> },
}

impl Definition for GroupDef {
    const CATEGORY: Category = Category::Group;

    fn kind(&self) -> &'static str {
        match self {
            GroupDef::All {} => "all",
            GroupDef::Subjects { .. } => "subjects",
            GroupDef::Exclude { .. } => "exclude",
            GroupDef::Union { .. } => "union",
        }
    }

    fn upstream(&self) -> Upstream<'_> {
        match self {
            GroupDef::All {} | GroupDef::Subjects { .. } => Upstream::Root,
            GroupDef::Exclude { base, .. } => Upstream::Single(base),
            GroupDef::Union { groups } => Upstream::Multi(groups.iter().map(String::as_str).collect()),
        }
    }
}

// ---------------------------------------------------------------------------
// Parcellations
// ---------------------------------------------------------------------------

/// Parcellations shipped with FreeSurfer, registered unless redefined.
pub const FREESURFER_PARCS: &[&str] = &["aparc", "aparc.a2009s", "PALS_B12_Brodmann"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum ParcDef {
    Freesurfer {
        #[serde(default)]
        views: Option<String>,
    },
    /// New labels built from label expressions over `base`.
    Combination {
        base: String,
        labels: IndexMap<String, String>,
        #[serde(default)]
        views: Option<String>,
    },
    /// Labels grown around seed coordinates, optionally masked by another parc.
    Seeded {
        seeds: IndexMap<String, Vec<f64>>,
        #[serde(default)]
        mask: Option<String>,
        #[serde(default)]
        surface: Option<String>,
    },
}

impl ParcDef {
    pub fn freesurfer() -> Self {
        ParcDef::Freesurfer { views: None }
    }

    /// Whether the parcellation is produced by the pipeline rather than read.
    pub fn is_derived(&self) -> bool {
        !matches!(self, ParcDef::Freesurfer { .. })
    }
}

impl Definition for ParcDef {
    const CATEGORY: Category = Category::Parc;

    fn kind(&self) -> &'static str {
        match self {
            ParcDef::Freesurfer { .. } => "freesurfer",
            ParcDef::Combination { .. } => "combination",
            ParcDef::Seeded { .. } => "seeded",
        }
    }

    fn upstream(&self) -> Upstream<'_> {
        match self {
            ParcDef::Freesurfer { .. } => Upstream::Root,
            ParcDef::Combination { base, .. } => Upstream::Single(base),
            ParcDef::Seeded { mask: Some(mask), .. } => Upstream::Single(mask),
            ParcDef::Seeded { mask: None, .. } => Upstream::Root,
        }
    }
}

// ---------------------------------------------------------------------------
// Covariances
// ---------------------------------------------------------------------------

fn default_cov_epoch() -> String {
    "cov".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum CovDef {
    /// Noise covariance estimated from an epoch.
    Epoch {
        #[serde(default = "default_cov_epoch")]
        epoch: String,
        #[serde(default)]
        reg: Option<Value>,
        #[serde(default)]
        method: Option<String>,
    },
}

impl CovDef {
    pub fn epoch_name(&self) -> &str {
        match self {
            CovDef::Epoch { epoch, .. } => epoch,
        }
    }
}

impl Definition for CovDef {
    const CATEGORY: Category = Category::Cov;

    fn kind(&self) -> &'static str {
        match self {
            CovDef::Epoch { .. } => "epoch",
        }
    }

    fn upstream(&self) -> Upstream<'_> {
        Upstream::Root
    }

    fn references(&self) -> Vec<Reference> {
        vec![Reference::required(Category::Epoch, self.epoch_name())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn raw_pipe_deserializes_tagged() {
        let pipe: RawPipe =
            serde_json::from_value(json!({"type": "filter", "source": "tsss", "l_freq": 1.0, "h_freq": 40.0}))
                .unwrap();
        assert_eq!(pipe.kind(), "filter");
        assert_eq!(pipe.upstream(), Upstream::Single("tsss"));
        assert!(pipe.is_cached());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = serde_json::from_value::<RawPipe>(
            json!({"type": "filter", "source": "raw", "lfreq": 1.0}),
        );
        assert!(err.is_err());
        let err = serde_json::from_value::<RawPipe>(json!({"type": "bandpass", "source": "raw"}));
        assert!(err.is_err());
    }

    #[test]
    fn re_reference_is_never_cached() {
        let pipe: RawPipe =
            serde_json::from_value(json!({"type": "re_reference", "source": "1-40"})).unwrap();
        assert!(!pipe.is_cached());
        let RawPipe::ReReference { reference, .. } = pipe else {
            panic!("wrong variant");
        };
        assert_eq!(reference, "average");
    }

    #[test]
    fn params_exclude_name_and_include_kind() {
        let pipe = RawPipe::filter("raw", Some(1.0), Some(40.0));
        let params = pipe.params().unwrap();
        assert_eq!(params["type"], "filter");
        assert_eq!(params["source"], "raw");
        assert!(params.get("name").is_none());
    }

    #[test]
    fn super_epoch_has_multi_upstream() {
        let epoch: EpochDef =
            serde_json::from_value(json!({"type": "super", "sub_epochs": ["prime", "target"]}))
                .unwrap();
        assert_eq!(epoch.upstream().names(), vec!["prime", "target"]);
    }

    #[test]
    fn selection_identifiers_skip_string_literals() {
        let ids = expression_identifiers("stimulus.isin(('prime', 'target')) & (trial == \"x\")");
        assert_eq!(ids, vec!["stimulus", "isin", "trial"]);
    }

    #[test]
    fn epoch_references_are_soft_variables() {
        let epoch = EpochDef::primary("words", Some("stimulus == 'prime'"));
        let refs = epoch.references();
        assert_eq!(refs, vec![Reference::soft(Category::Variable, "stimulus")]);
    }

    #[test]
    fn cov_requires_its_epoch() {
        let cov: CovDef = serde_json::from_value(json!({"type": "epoch"})).unwrap();
        assert_eq!(
            cov.references(),
            vec![Reference::required(Category::Epoch, "cov")]
        );
    }

    #[test]
    fn group_variable_requires_groups() {
        let var: VariableDef =
            serde_json::from_value(json!({"type": "group", "groups": ["young", "old"]})).unwrap();
        assert!(var.references().iter().all(|r| r.required));
    }

    #[test]
    fn seeded_parc_mask_is_upstream() {
        let parc: ParcDef = serde_json::from_value(json!({
            "type": "seeded",
            "seeds": {"LO": [-40.0, -80.0, 0.0]},
            "mask": "aparc"
        }))
        .unwrap();
        assert_eq!(parc.upstream(), Upstream::Single("aparc"));
        assert!(parc.is_derived());
    }

    #[test]
    fn all_group_has_no_fields() {
        let group: GroupDef = serde_json::from_value(json!({"type": "all"})).unwrap();
        assert_eq!(group, GroupDef::All {});
    }
}
