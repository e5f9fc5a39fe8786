//! State store, definition registry, fingerprinting and cache invalidation.
//!
//! This crate implements the Trellis controller: named-parameter state with
//! cascades and scoped changes, per-category definition chains, stable
//! definition fingerprints, the on-disk cache index with forward staleness
//! propagation, and artifact resolution through named path templates.

pub mod cache;
pub mod chain;
pub mod config;
pub mod controller;
pub mod definitions;
pub mod hashing;
pub mod interviewer;
pub mod invalidation;
pub mod registry;
pub mod resolver;
pub mod state;
pub mod templates;
pub mod validation;

pub use cache::{ArtifactKind, CacheIndex, CacheRecord, StaleReason, INDEX_FILE};
pub use chain::ChainGraph;
pub use config::{
    CascadeRule, ControllerConfig, ParameterSpec, SubjectsConfig, ENV_CACHE_POLICY,
    ENV_CACHE_VERBOSE,
};
pub use controller::{diagnose, Controller, ControllerBuilder};
pub use definitions::{
    CovDef, Definition, EpochDef, GroupDef, ParcDef, RawPipe, Reference, TestDef, Upstream,
    VariableDef,
};
pub use hashing::{fingerprint_value, to_canonical_json};
pub use interviewer::{
    Answer, AutoApproveInterviewer, ConsoleInterviewer, Interviewer, Question,
    RecordingInterviewer,
};
pub use invalidation::{
    apply_invalidation, parameter_changes, plan_invalidation, run_invalidation, CachePolicy,
    CacheSettings, Decision, DefinitionStatus, InvalidationOutcome, InvalidationPlan,
    ParamChange, StaleEntry,
};
pub use registry::{AnyDefinition, Catalog, DefinitionSnapshot, Registry};
pub use resolver::{ArtifactStatus, Resolution, Resolver};
pub use state::{CascadeTable, Change, Domain, Parameter, Scoped, StateHolder, StateStore};
pub use templates::{Scope, TemplateSet, DEFAULT_TEMPLATES};
pub use validation::{validate, validate_or_raise, Diagnostic, LintContext, LintRule, Severity};
