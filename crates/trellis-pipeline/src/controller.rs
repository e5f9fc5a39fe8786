//! The experiment controller: one interactive session over a configuration.
//!
//! Construction links the definitions, declares the state parameters,
//! validates the configuration and brings the cache up to date. Afterwards
//! the controller is the single entry point for state changes, path
//! expansion and artifact resolution.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use regex::Regex;
use trellis_template::Template;
use trellis_types::{Category, Result, TrellisError};

use crate::cache::{ArtifactKind, CacheIndex};
use crate::config::ControllerConfig;
use crate::definitions::RawPipe;
use crate::interviewer::Interviewer;
use crate::invalidation::{
    apply_invalidation, plan_invalidation, run_invalidation, CacheSettings, Decision,
    InvalidationOutcome, InvalidationPlan,
};
use crate::registry::Catalog;
use crate::resolver::{artifact_kind, Resolution, Resolver};
use crate::state::{Change, Domain, Scoped, StateHolder, StateStore};
use crate::templates::{Scope, TemplateSet};
use crate::validation::{validate, validate_or_raise, Diagnostic, LintContext, Severity};

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct ControllerBuilder {
    config: ControllerConfig,
    interviewer: Option<Box<dyn Interviewer>>,
    refresh: bool,
}

impl ControllerBuilder {
    pub fn new(config: ControllerConfig) -> Self {
        Self {
            config,
            interviewer: None,
            refresh: true,
        }
    }

    /// Asked to confirm invalidation under the `ask` policy.
    pub fn interviewer(mut self, interviewer: Box<dyn Interviewer>) -> Self {
        self.interviewer = Some(interviewer);
        self
    }

    /// Skip cache invalidation at construction.
    pub fn skip_refresh(mut self, skip: bool) -> Self {
        self.refresh = !skip;
        self
    }

    pub fn build(self) -> Result<Controller> {
        let mut controller =
            Controller::assemble(self.config, self.interviewer.as_deref(), self.refresh)?;
        controller.interviewer = self.interviewer;
        Ok(controller)
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct Controller {
    config: ControllerConfig,
    catalog: Catalog,
    templates: TemplateSet,
    state: StateStore,
    subjects: Vec<String>,
    cache_dir: PathBuf,
    index: CacheIndex,
    interviewer: Option<Box<dyn Interviewer>>,
}

impl StateHolder for Controller {
    fn state_mut(&mut self) -> &mut StateStore {
        &mut self.state
    }
}

fn root_string(root: &Path) -> String {
    root.to_string_lossy().into_owned()
}

/// Subject directories under the configured directory whose names match
/// the pattern, sorted.
fn discover_subjects(config: &ControllerConfig) -> Result<Vec<String>> {
    if let Some(list) = &config.subjects.list {
        return Ok(list.clone());
    }
    let pattern = Regex::new(&config.subjects.pattern).map_err(|e| {
        TrellisError::Validation(format!(
            "invalid subject pattern '{}': {e}",
            config.subjects.pattern
        ))
    })?;
    let vars: BTreeMap<String, String> =
        [("root".to_string(), root_string(&config.root))].into_iter().collect();
    let dir = PathBuf::from(config.subjects.dir.expand(&vars)?);
    if !dir.is_dir() {
        tracing::warn!(dir = %dir.display(), "Subject directory does not exist");
        return Ok(Vec::new());
    }

    let mut subjects = Vec::new();
    for entry in std::fs::read_dir(&dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if pattern.is_match(&name) {
            subjects.push(name);
        }
    }
    subjects.sort();
    tracing::debug!(dir = %dir.display(), count = subjects.len(), "Discovered subjects");
    Ok(subjects)
}

fn build_templates(config: &ControllerConfig, catalog: &Catalog) -> Result<TemplateSet> {
    let mut templates = TemplateSet::with_defaults()?;
    if let RawPipe::Source { filename, .. } = catalog.raw("raw")? {
        let default_file = templates.get("raw-file").map(|t| t.source().to_string());
        let from_source = format!("{{raw-dir}}/{filename}");
        if default_file.as_deref() != Some(from_source.as_str()) {
            templates.insert("raw-file", Template::parse(&from_source)?);
        }
    }
    for (name, template) in &config.templates {
        templates.insert(name, template.clone());
    }
    Ok(templates)
}

fn declare_state(
    config: &ControllerConfig,
    catalog: &Catalog,
    subjects: &[String],
) -> Result<StateStore> {
    fn first(values: &[String]) -> Option<&str> {
        values.first().map(String::as_str)
    }
    fn names(catalog: &Catalog, category: Category) -> Vec<String> {
        catalog.names(category).into_iter().map(str::to_string).collect()
    }

    let mut state = StateStore::new();
    state.declare("root", Domain::Any, Some(root_string(&config.root).as_str()))?;
    state.declare("subject", Domain::Options(subjects.to_vec()), first(subjects))?;
    state.declare(
        "session",
        Domain::Options(config.sessions.clone()),
        first(&config.sessions),
    )?;
    state.declare("raw", Domain::Options(names(catalog, Category::Raw)), Some("raw"))?;
    state.declare("group", Domain::Options(names(catalog, Category::Group)), Some("all"))?;
    for category in [Category::Epoch, Category::Test, Category::Cov, Category::Parc] {
        let options = names(catalog, category);
        let default = first(&options).map(str::to_string);
        let parameter = category.as_str();
        state.declare(parameter, Domain::Options(options), default.as_deref())?;
    }

    for (name, spec) in &config.parameters {
        let domain = match (&spec.options, &spec.pattern) {
            (Some(_), Some(_)) => {
                return Err(TrellisError::Validation(format!(
                    "parameter '{name}' sets both options and pattern"
                )))
            }
            (Some(options), None) => Domain::Options(options.clone()),
            (None, Some(pattern)) => Domain::pattern(pattern)?,
            (None, None) => Domain::Any,
        };
        state.declare(name, domain, spec.default.as_deref())?;
    }

    // epochs on undeclared sessions are reported by the lint rules
    for epoch in catalog.names(Category::Epoch) {
        match catalog.epoch_session(epoch)? {
            Some(session) if config.sessions.contains(&session) => {
                state
                    .cascades_mut()
                    .add("epoch", epoch, [("session".to_string(), session)]);
            }
            _ => {}
        }
    }
    for rule in &config.cascades {
        for target in std::iter::once(&rule.parameter).chain(rule.set.keys()) {
            state.parameter(target)?;
        }
        state.cascades_mut().add(
            rule.parameter.as_str(),
            rule.value.as_str(),
            rule.set.iter().map(|(k, v)| (k.clone(), v.clone())),
        );
    }

    // Bring cascaded parameters in line with the epoch default; configured
    // defaults are explicit and win.
    let mut initial: IndexMap<String, String> = IndexMap::new();
    if let Some(epoch) = state.get("epoch")? {
        initial.insert("epoch".to_string(), epoch.to_string());
    }
    initial.extend(config.defaults.iter().map(|(k, v)| (k.clone(), v.clone())));
    state.set_many(initial, true)?;
    Ok(state)
}

/// Lint `config` without building a controller. Fails only on problems
/// that prevent linking, such as cycles or unknown upstreams.
pub fn diagnose(config: &ControllerConfig) -> Result<Vec<Diagnostic>> {
    let subjects = discover_subjects(config)?;
    let catalog = config.registry()?.link()?;
    let templates = build_templates(config, &catalog)?;
    let state = declare_state(config, &catalog, &subjects)?;
    Ok(validate(&LintContext {
        catalog: &catalog,
        sessions: &config.sessions,
        subjects: &subjects,
        templates: &templates,
        state: &state,
    }))
}

impl Controller {
    pub fn new(config: ControllerConfig) -> Result<Self> {
        ControllerBuilder::new(config).build()
    }

    pub fn builder(config: ControllerConfig) -> ControllerBuilder {
        ControllerBuilder::new(config)
    }

    fn assemble(
        config: ControllerConfig,
        interviewer: Option<&dyn Interviewer>,
        refresh: bool,
    ) -> Result<Self> {
        let subjects = discover_subjects(&config)?;
        let catalog = config.registry()?.link()?;
        let templates = build_templates(&config, &catalog)?;
        let state = declare_state(&config, &catalog, &subjects)?;

        let diagnostics = validate_or_raise(&LintContext {
            catalog: &catalog,
            sessions: &config.sessions,
            subjects: &subjects,
            templates: &templates,
            state: &state,
        })?;
        for d in &diagnostics {
            match d.severity {
                Severity::Warning => tracing::warn!(rule = %d.rule, "{}", d.message),
                _ => tracing::debug!(rule = %d.rule, "{}", d.message),
            }
        }

        let cache_dir =
            PathBuf::from(Scope::new(&templates, &state, BTreeMap::new()).expand_named("cache-dir")?);
        let mut index = CacheIndex::load(&cache_dir)?;
        if refresh {
            run_invalidation(&mut index, &catalog, &config.cache, interviewer)?;
            index.save(&cache_dir)?;
        }

        tracing::info!(
            root = %config.root.display(),
            subjects = subjects.len(),
            definitions = catalog.keys().count(),
            records = index.len(),
            "Controller ready"
        );

        Ok(Self {
            config,
            catalog,
            templates,
            state,
            subjects,
            cache_dir,
            index,
            interviewer: None,
        })
    }

    /// Rebuild from `config`, keeping every current value that is still
    /// legal.
    pub fn reload(&mut self, config: ControllerConfig) -> Result<()> {
        let previous = self.state.values();
        let mut next = Self::assemble(config, self.interviewer.as_deref(), true)?;
        next.interviewer = self.interviewer.take();
        for (name, value) in previous {
            if !next.state.is_declared(&name) {
                continue;
            }
            if let Err(e) = next.state.set(&name, &value, false) {
                tracing::debug!(parameter = %name, error = %e, "Dropped state value on reload");
            }
        }
        *self = next;
        Ok(())
    }

    // -- state --------------------------------------------------------------

    /// A parameter's value, or the expansion of a named template.
    pub fn get(&self, name: &str) -> Result<String> {
        if self.state.is_declared(name) {
            return self.state.require(name).map(str::to_string);
        }
        if self.templates.contains(name) {
            return self.scope().expand_named(name);
        }
        Err(TrellisError::UnknownParameter { name: name.into() })
    }

    /// Set one parameter, applying cascades.
    pub fn set(&mut self, name: &str, value: &str) -> Result<Vec<Change>> {
        self.state.set(name, value, true)
    }

    /// Set one parameter, with or without its cascades.
    pub fn set_with(&mut self, name: &str, value: &str, cascade: bool) -> Result<Vec<Change>> {
        self.state.set(name, value, cascade)
    }

    pub fn set_many<I, K, V>(&mut self, pairs: I) -> Result<Vec<Change>>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.state.set_many(pairs, true)
    }

    /// Every parameter with its current value, in declaration order.
    pub fn state(&self) -> IndexMap<String, Option<String>> {
        self.state.snapshot()
    }

    pub fn state_store(&self) -> &StateStore {
        &self.state
    }

    /// Apply `pairs` until the returned guard is dropped.
    pub fn scoped<I, K, V>(&mut self, pairs: I) -> Result<Scoped<'_, Controller>>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Scoped::enter(self, pairs)
    }

    /// Run `f` with `pairs` applied; the previous values come back whether
    /// `f` succeeds, fails or panics.
    pub fn with_state<I, K, V, R>(&mut self, pairs: I, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut guard = self.scoped(pairs)?;
        f(&mut *guard)
    }

    // -- subjects -----------------------------------------------------------

    pub fn subjects(&self) -> &[String] {
        &self.subjects
    }

    pub fn group_members(&self, group: &str) -> Result<Vec<String>> {
        self.catalog.group_members(group, &self.subjects)
    }

    /// Advance `subject` to the next member of the current group, wrapping
    /// around. Only `subject` changes. Members that are not known subjects
    /// are skipped. `None` when no member is left.
    pub fn next_subject(&mut self) -> Result<Option<(Option<String>, String)>> {
        let group = self.state.require("group")?.to_string();
        let mut members = self.group_members(&group)?;
        members.retain(|m| {
            let known = self.subjects.contains(m);
            if !known {
                tracing::warn!(group = %group, subject = %m, "Group member is not a known subject; skipping");
            }
            known
        });
        if members.is_empty() {
            return Ok(None);
        }
        let previous = self.state.get("subject")?.map(str::to_string);
        let next = match previous
            .as_ref()
            .and_then(|p| members.iter().position(|m| m == p))
        {
            Some(pos) => members[(pos + 1) % members.len()].clone(),
            None => members[0].clone(),
        };
        self.state.set("subject", &next, false)?;
        Ok(Some((previous, next)))
    }

    /// Call `f` once per member of the current group with `subject` set.
    /// Stops early at a member that is not a known subject. `subject` is
    /// restored afterwards.
    pub fn for_each_subject(&mut self, mut f: impl FnMut(&mut Self, &str) -> Result<()>) -> Result<()> {
        let group = self.state.require("group")?.to_string();
        let members = self.group_members(&group)?;
        let previous = self.state.get("subject")?.map(str::to_string);

        let mut result = Ok(());
        for member in &members {
            if !self.subjects.contains(member) {
                tracing::warn!(group = %group, subject = %member, "Group member is not a known subject; stopping");
                break;
            }
            if let Err(e) = self.state.set("subject", member, false) {
                result = Err(e);
                break;
            }
            if let Err(e) = f(self, member) {
                result = Err(e);
                break;
            }
        }
        self.state.restore(&[("subject".to_string(), previous)]);
        result
    }

    // -- templates ----------------------------------------------------------

    fn scope(&self) -> Scope<'_> {
        Scope::new(&self.templates, &self.state, BTreeMap::new())
    }

    /// Expand a template string under the current state.
    pub fn expand(&self, template: &str) -> Result<String> {
        self.scope().expand(&Template::parse(template)?)
    }

    /// Expand the named template `name` as a path.
    pub fn path(&self, name: &str) -> Result<PathBuf> {
        self.scope().expand_named(name).map(PathBuf::from)
    }

    // -- artifacts ----------------------------------------------------------

    fn resolver(&self) -> Resolver<'_> {
        Resolver {
            catalog: &self.catalog,
            templates: &self.templates,
            state: &self.state,
            index: &self.index,
            subjects: &self.subjects,
            policy: self.config.cache.policy,
        }
    }

    /// Locate the artifact of definition `name` under the current state and
    /// report whether it must be computed.
    pub fn resolve(&self, category: Category, name: &str) -> Result<Resolution> {
        self.resolver().resolve(artifact_kind(category)?, name)
    }

    /// Like [`resolve`](Self::resolve) for the definition currently selected
    /// by the category's parameter.
    pub fn resolve_current(&self, category: Category) -> Result<Resolution> {
        let parameter = category.parameter().ok_or_else(|| {
            TrellisError::Other(format!("{category} definitions are not selected by a parameter"))
        })?;
        let name = self.state.require(parameter)?.to_string();
        self.resolve(category, &name)
    }

    /// The hand-curated ICA decomposition of ICA pipe `name`.
    pub fn resolve_ica(&self, name: &str) -> Result<Resolution> {
        self.resolver().resolve(ArtifactKind::Ica, name)
    }

    /// Record that the caller has (re)computed the artifact at
    /// `resolution.path`.
    pub fn commit(&mut self, resolution: &Resolution) -> Result<()> {
        if !resolution.is_cached() {
            return Err(TrellisError::Other(format!(
                "{} is not a cached artifact",
                resolution.path.display()
            )));
        }
        if !resolution.path.exists() {
            return Err(TrellisError::Other(format!(
                "cannot record {}: file does not exist",
                resolution.path.display()
            )));
        }
        self.index.insert(resolution.to_record());
        self.index.save(&self.cache_dir)?;
        tracing::debug!(path = %resolution.path.display(), kind = %resolution.kind, "Committed artifact");
        Ok(())
    }

    // -- cache --------------------------------------------------------------

    /// Re-run invalidation against the current definitions.
    pub fn refresh(&mut self) -> Result<InvalidationOutcome> {
        let outcome = run_invalidation(
            &mut self.index,
            &self.catalog,
            &self.config.cache,
            self.interviewer.as_deref(),
        )?;
        self.index.save(&self.cache_dir)?;
        Ok(outcome)
    }

    pub fn plan_invalidation(&self) -> InvalidationPlan {
        plan_invalidation(&self.index, &self.catalog)
    }

    pub fn apply_invalidation(&mut self, plan: &InvalidationPlan, decision: Decision) -> Result<InvalidationOutcome> {
        let outcome = apply_invalidation(&mut self.index, plan, &self.catalog, decision)?;
        self.index.save(&self.cache_dir)?;
        Ok(outcome)
    }

    // -- accessors ----------------------------------------------------------

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn sessions(&self) -> &[String] {
        &self.config.sessions
    }

    pub fn templates(&self) -> &TemplateSet {
        &self.templates
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.config.cache
    }

    pub fn cache_index(&self) -> &CacheIndex {
        &self.index
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SubjectsConfig;
    use crate::definitions::{EpochDef, GroupDef};

    fn config(root: &Path) -> ControllerConfig {
        let mut config = ControllerConfig::new(root);
        config.sessions = vec!["words".into(), "pictures".into()];
        config.subjects = SubjectsConfig {
            list: Some(vec!["R0001".into(), "R0002".into(), "R0003".into()]),
            ..Default::default()
        };
        config
            .raw
            .insert("1-40".into(), RawPipe::filter("raw", Some(1.0), Some(40.0)));
        config
            .epochs
            .insert("word".into(), EpochDef::primary("words", None));
        config
            .epochs
            .insert("picture".into(), EpochDef::primary("pictures", None));
        config
    }

    #[test]
    fn defaults_and_cascade() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = Controller::new(config(dir.path())).unwrap();
        assert_eq!(c.get("subject").unwrap(), "R0001");
        assert_eq!(c.get("epoch").unwrap(), "word");
        assert_eq!(c.get("session").unwrap(), "words");
        assert_eq!(c.get("group").unwrap(), "all");

        c.set("epoch", "picture").unwrap();
        assert_eq!(c.get("session").unwrap(), "pictures");
        c.set_with("epoch", "word", false).unwrap();
        assert_eq!(c.get("session").unwrap(), "pictures");
        assert!(c.set("raw", "2-8").is_err());
        assert!(matches!(
            c.get("nonexistent"),
            Err(TrellisError::UnknownParameter { .. })
        ));
    }

    #[test]
    fn get_expands_named_templates() {
        let dir = tempfile::tempdir().unwrap();
        let c = Controller::new(config(dir.path())).unwrap();
        let expected = format!("{}/meg/R0001/R0001_words-raw.fif", dir.path().display());
        assert_eq!(c.get("raw-file").unwrap(), expected);
        assert_eq!(c.cache_dir(), dir.path().join("cache"));
    }

    #[test]
    fn next_subject_wraps() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = Controller::new(config(dir.path())).unwrap();
        assert_eq!(
            c.next_subject().unwrap(),
            Some((Some("R0001".into()), "R0002".into()))
        );
        c.next_subject().unwrap();
        assert_eq!(
            c.next_subject().unwrap(),
            Some((Some("R0003".into()), "R0001".into()))
        );
    }

    #[test]
    fn next_subject_skips_unknown_members() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.groups.insert(
            "pilot".into(),
            GroupDef::Subjects {
                subjects: vec!["R0001".into(), "R0099".into()],
            },
        );
        cfg.groups.insert(
            "ghosts".into(),
            GroupDef::Subjects {
                subjects: vec!["R0099".into()],
            },
        );
        let mut c = Controller::new(cfg).unwrap();
        c.set("group", "pilot").unwrap();
        assert_eq!(
            c.next_subject().unwrap(),
            Some((Some("R0001".into()), "R0001".into()))
        );
        assert_eq!(c.get("subject").unwrap(), "R0001");

        c.set("group", "ghosts").unwrap();
        assert_eq!(c.next_subject().unwrap(), None);
        assert_eq!(c.get("subject").unwrap(), "R0001");
    }

    #[test]
    fn for_each_subject_stops_at_unknown_member() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.groups.insert(
            "pilot".into(),
            GroupDef::Subjects {
                subjects: vec!["R0002".into(), "R0099".into(), "R0003".into()],
            },
        );
        let mut c = Controller::new(cfg).unwrap();
        c.set("group", "pilot").unwrap();
        let mut seen = Vec::new();
        c.for_each_subject(|c, s| {
            assert_eq!(c.get("subject").unwrap(), s);
            seen.push(s.to_string());
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec!["R0002"]);
        assert_eq!(c.get("subject").unwrap(), "R0001");
    }

    #[test]
    fn with_state_restores_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = Controller::new(config(dir.path())).unwrap();
        let result: Result<()> = c.with_state([("raw", "1-40"), ("epoch", "picture")], |c| {
            assert_eq!(c.get("session").unwrap(), "pictures");
            Err(TrellisError::Other("boom".into()))
        });
        assert!(result.is_err());
        assert_eq!(c.get("raw").unwrap(), "raw");
        assert_eq!(c.get("epoch").unwrap(), "word");
        assert_eq!(c.get("session").unwrap(), "words");
    }

    #[test]
    fn user_parameters_and_cascade_rules() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.parameters.insert(
            "rej".into(),
            crate::config::ParameterSpec {
                options: Some(vec!["man".into(), "auto".into()]),
                pattern: None,
                default: Some("man".into()),
            },
        );
        cfg.cascades.push(crate::config::CascadeRule {
            parameter: "raw".into(),
            value: "1-40".into(),
            set: [("rej".to_string(), "auto".to_string())].into_iter().collect(),
        });
        let mut c = Controller::new(cfg).unwrap();
        assert_eq!(c.get("rej").unwrap(), "man");
        c.set("raw", "1-40").unwrap();
        assert_eq!(c.get("rej").unwrap(), "auto");
    }

    #[test]
    fn discovers_subject_directories() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["R0002", "R0001", "notes", "x"] {
            std::fs::create_dir_all(dir.path().join("meg").join(name)).unwrap();
        }
        std::fs::write(dir.path().join("meg").join("R0003"), b"file").unwrap();
        let mut cfg = config(dir.path());
        cfg.subjects = SubjectsConfig::default();
        let c = Controller::new(cfg).unwrap();
        assert_eq!(c.subjects(), ["R0001", "R0002"]);
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.epochs
            .insert("noun".into(), EpochDef::primary("nouns", None));
        let err = Controller::new(cfg).err().unwrap();
        assert!(matches!(err, TrellisError::Validation(m) if m.contains("nouns")));
    }

    #[test]
    fn diagnose_reports_without_failing() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.epochs
            .insert("noun".into(), EpochDef::primary("nouns", None));
        let diags = diagnose(&cfg).unwrap();
        assert!(diags
            .iter()
            .any(|d| d.rule == "epoch_session_exists" && d.severity == Severity::Error));
    }

    #[test]
    fn reload_keeps_legal_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = Controller::new(config(dir.path())).unwrap();
        c.set("raw", "1-40").unwrap();
        c.set("subject", "R0002").unwrap();

        let mut cfg = config(dir.path());
        cfg.raw.shift_remove("1-40");
        c.reload(cfg).unwrap();
        assert_eq!(c.get("subject").unwrap(), "R0002");
        assert_eq!(c.get("raw").unwrap(), "raw");
    }
}
