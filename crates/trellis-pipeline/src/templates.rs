//! Named path templates and the expansion scope that resolves their slots.

use std::cell::RefCell;
use std::collections::BTreeMap;

use indexmap::IndexMap;
use trellis_template::{SlotSource, Template};
use trellis_types::{Result, TrellisError};

use crate::state::StateStore;

/// Built-in templates; a configuration may override any of them.
pub const DEFAULT_TEMPLATES: &[(&str, &str)] = &[
    ("raw-dir", "{root}/meg/{subject}"),
    ("raw-file", "{raw-dir}/{subject}_{session}-raw.fif"),
    ("cache-dir", "{root}/cache"),
    ("cached-raw-file", "{cache-dir}/raw/{subject}/{subject} {session} {raw}-raw.fif"),
    ("ica-file", "{raw-dir}/{subject} {raw}-ica.fif"),
    ("epoch-file", "{cache-dir}/epochs/{subject}/{raw} {epoch}-epo.pickled"),
    ("cov-file", "{cache-dir}/cov/{subject}/{raw} {cov}-cov.fif"),
    ("test-file", "{cache-dir}/test/{group}/{raw} {epoch} {test}.pickled"),
    ("parc-file", "{root}/mri/{subject}/label/{parc}.annot"),
];

#[derive(Debug, Clone, Default)]
pub struct TemplateSet {
    templates: IndexMap<String, Template>,
}

impl TemplateSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Result<Self> {
        let mut set = Self::new();
        for (name, source) in DEFAULT_TEMPLATES {
            set.insert(name, Template::parse(source)?);
        }
        Ok(set)
    }

    /// Add or replace a template.
    pub fn insert(&mut self, name: &str, template: Template) {
        self.templates.insert(name.to_string(), template);
    }

    pub fn get(&self, name: &str) -> Option<&Template> {
        self.templates.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Template)> {
        self.templates.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

/// Resolves slots from, in order: explicit overrides, state parameters,
/// then named templates (expanded recursively). Remembers every parameter
/// value it handed out.
pub struct Scope<'a> {
    templates: &'a TemplateSet,
    state: &'a StateStore,
    overrides: BTreeMap<String, String>,
    stack: RefCell<Vec<String>>,
    used: RefCell<BTreeMap<String, String>>,
}

impl<'a> Scope<'a> {
    pub fn new(
        templates: &'a TemplateSet,
        state: &'a StateStore,
        overrides: BTreeMap<String, String>,
    ) -> Self {
        Self {
            templates,
            state,
            overrides,
            stack: RefCell::new(Vec::new()),
            used: RefCell::new(BTreeMap::new()),
        }
    }

    /// Expand the named template `name`.
    pub fn expand_named(&self, name: &str) -> Result<String> {
        match self.lookup(name)? {
            Some(value) => Ok(value),
            None => Err(TrellisError::MissingSlot {
                slot: name.into(),
                template: format!("{{{name}}}"),
            }),
        }
    }

    pub fn expand(&self, template: &Template) -> Result<String> {
        template.expand(self)
    }

    /// Parameter values used so far, sorted by name.
    pub fn used(&self) -> BTreeMap<String, String> {
        self.used.borrow().clone()
    }

    fn remember(&self, slot: &str, value: &str) {
        self.used
            .borrow_mut()
            .insert(slot.to_string(), value.to_string());
    }
}

impl SlotSource for Scope<'_> {
    fn lookup(&self, slot: &str) -> Result<Option<String>> {
        if let Some(value) = self.overrides.get(slot) {
            self.remember(slot, value);
            return Ok(Some(value.clone()));
        }
        if self.state.is_declared(slot) {
            let value = self.state.get(slot)?.map(str::to_string);
            if let Some(v) = &value {
                self.remember(slot, v);
            }
            return Ok(value);
        }
        let Some(template) = self.templates.get(slot) else {
            return Ok(None);
        };
        {
            let mut stack = self.stack.borrow_mut();
            if let Some(pos) = stack.iter().position(|s| s == slot) {
                let mut cycle: Vec<String> = stack[pos..].to_vec();
                cycle.push(slot.to_string());
                return Err(TrellisError::Validation(format!(
                    "template cycle: {}",
                    cycle.join(" -> ")
                )));
            }
            stack.push(slot.to_string());
        }
        let expanded = template.expand(self);
        self.stack.borrow_mut().pop();
        expanded.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Domain;

    fn state() -> StateStore {
        let mut s = StateStore::new();
        s.declare("root", Domain::Any, Some("/data")).unwrap();
        s.declare("subject", Domain::Any, Some("R0001")).unwrap();
        s.declare("session", Domain::Any, None).unwrap();
        s.declare("raw", Domain::Any, Some("1-40")).unwrap();
        s
    }

    #[test]
    fn nested_templates_expand() {
        let templates = TemplateSet::with_defaults().unwrap();
        let s = state();
        let scope = Scope::new(&templates, &s, BTreeMap::new());
        assert_eq!(scope.expand_named("raw-dir").unwrap(), "/data/meg/R0001");
        assert_eq!(scope.used().get("root").map(String::as_str), Some("/data"));
    }

    #[test]
    fn unset_parameter_is_missing_slot() {
        let templates = TemplateSet::with_defaults().unwrap();
        let s = state();
        let scope = Scope::new(&templates, &s, BTreeMap::new());
        let err = scope.expand_named("raw-file").unwrap_err();
        assert!(matches!(err, TrellisError::MissingSlot { slot, .. } if slot == "session"));
    }

    #[test]
    fn overrides_win() {
        let templates = TemplateSet::with_defaults().unwrap();
        let s = state();
        let overrides: BTreeMap<String, String> = [
            ("session".to_string(), "words".to_string()),
            ("raw".to_string(), "ica".to_string()),
        ]
        .into_iter()
        .collect();
        let scope = Scope::new(&templates, &s, overrides);
        assert_eq!(
            scope.expand_named("cached-raw-file").unwrap(),
            "/data/cache/raw/R0001/R0001 words ica-raw.fif"
        );
        let used = scope.used();
        assert_eq!(used["raw"], "ica");
        assert_eq!(used.len(), 4);
    }

    #[test]
    fn template_cycle_is_reported() {
        let mut templates = TemplateSet::new();
        templates.insert("a", Template::parse("{b}/x").unwrap());
        templates.insert("b", Template::parse("{a}/y").unwrap());
        let s = state();
        let scope = Scope::new(&templates, &s, BTreeMap::new());
        let err = scope.expand_named("a").unwrap_err();
        assert!(err.to_string().contains("a -> b -> a"));
    }

    #[test]
    fn unknown_name_is_missing_slot() {
        let templates = TemplateSet::new();
        let s = state();
        let scope = Scope::new(&templates, &s, BTreeMap::new());
        assert!(matches!(
            scope.expand_named("nope"),
            Err(TrellisError::MissingSlot { .. })
        ));
    }
}
