//! Named-parameter state with validated values, cascades and scoped changes.
//!
//! Every parameter has a [`Domain`] and an optional default. A [`StateStore`]
//! only ever holds legal values or an explicit unset. Side effects of setting
//! a value live in an explicit [`CascadeTable`] and are applied breadth-first;
//! values given explicitly in the same call always win over cascaded ones.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::ops::{Deref, DerefMut};

use indexmap::IndexMap;
use regex::Regex;
use trellis_template::SlotSource;
use trellis_types::{Result, TrellisError};

// ---------------------------------------------------------------------------
// Domains and parameters
// ---------------------------------------------------------------------------

/// The set of values a parameter accepts.
#[derive(Debug, Clone)]
pub enum Domain {
    /// Any string.
    Any,
    /// A finite enumeration, in declaration order.
    Options(Vec<String>),
    /// Strings fully matching the expression.
    Pattern(Regex),
}

impl Domain {
    pub fn options<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Domain::Options(values.into_iter().map(Into::into).collect())
    }

    /// Compile `pattern` anchored at both ends.
    pub fn pattern(pattern: &str) -> Result<Self> {
        Regex::new(&format!("^(?:{pattern})$"))
            .map(Domain::Pattern)
            .map_err(|e| TrellisError::Other(format!("invalid parameter pattern '{pattern}': {e}")))
    }

    fn check(&self, value: &str) -> std::result::Result<(), String> {
        match self {
            Domain::Any => Ok(()),
            Domain::Options(options) => {
                if options.iter().any(|o| o == value) {
                    Ok(())
                } else if options.is_empty() {
                    Err("no values are available".to_string())
                } else {
                    Err(format!("expected one of: {}", options.join(", ")))
                }
            }
            Domain::Pattern(re) => {
                if re.is_match(value) {
                    Ok(())
                } else {
                    Err(format!("does not match {}", re.as_str()))
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Parameter {
    pub name: String,
    pub domain: Domain,
    pub default: Option<String>,
}

/// One assignment performed by a set. `previous == value` for assignments
/// that did not change anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub name: String,
    pub previous: Option<String>,
    pub value: Option<String>,
}

impl Change {
    pub fn is_noop(&self) -> bool {
        self.previous == self.value
    }
}

// ---------------------------------------------------------------------------
// Cascades
// ---------------------------------------------------------------------------

/// `(parameter, value) -> [(parameter, value)]`: setting the key also sets
/// each listed pair.
#[derive(Debug, Clone, Default)]
pub struct CascadeTable {
    rules: IndexMap<(String, String), Vec<(String, String)>>,
}

impl CascadeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        parameter: impl Into<String>,
        value: impl Into<String>,
        effects: impl IntoIterator<Item = (String, String)>,
    ) {
        self.rules
            .entry((parameter.into(), value.into()))
            .or_default()
            .extend(effects);
    }

    pub fn effects(&self, parameter: &str, value: &str) -> &[(String, String)] {
        self.rules
            .get(&(parameter.to_string(), value.to_string()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct StateStore {
    params: IndexMap<String, Parameter>,
    values: IndexMap<String, Option<String>>,
    cascades: CascadeTable,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(&mut self, name: &str, domain: Domain, default: Option<&str>) -> Result<()> {
        if self.params.contains_key(name) {
            return Err(TrellisError::DuplicateParameter { name: name.into() });
        }
        if let Some(value) = default {
            domain.check(value).map_err(|reason| TrellisError::InvalidValue {
                parameter: name.into(),
                value: value.into(),
                reason,
            })?;
        }
        self.params.insert(
            name.to_string(),
            Parameter {
                name: name.to_string(),
                domain,
                default: default.map(str::to_string),
            },
        );
        self.values
            .insert(name.to_string(), default.map(str::to_string));
        Ok(())
    }

    pub fn is_declared(&self, name: &str) -> bool {
        self.params.contains_key(name)
    }

    pub fn parameter(&self, name: &str) -> Result<&Parameter> {
        self.params
            .get(name)
            .ok_or_else(|| TrellisError::UnknownParameter { name: name.into() })
    }

    pub fn parameters(&self) -> impl Iterator<Item = &Parameter> {
        self.params.values()
    }

    pub fn cascades(&self) -> &CascadeTable {
        &self.cascades
    }

    pub fn cascades_mut(&mut self) -> &mut CascadeTable {
        &mut self.cascades
    }

    /// Current value; the default if never set, `None` if unset.
    pub fn get(&self, name: &str) -> Result<Option<&str>> {
        match self.values.get(name) {
            Some(value) => Ok(value.as_deref()),
            None => Err(TrellisError::UnknownParameter { name: name.into() }),
        }
    }

    /// Like [`get`](Self::get) but an unset value is an error.
    pub fn require(&self, name: &str) -> Result<&str> {
        self.get(name)?
            .ok_or_else(|| TrellisError::UnsetParameter { name: name.into() })
    }

    /// Check `value` against the domain of `name` without setting it.
    pub fn validate(&self, name: &str, value: &str) -> Result<()> {
        let param = self.parameter(name)?;
        param
            .domain
            .check(value)
            .map_err(|reason| TrellisError::InvalidValue {
                parameter: name.into(),
                value: value.into(),
                reason,
            })
    }

    pub fn set(&mut self, name: &str, value: &str, cascade: bool) -> Result<Vec<Change>> {
        self.set_many([(name.to_string(), value.to_string())], cascade)
    }

    /// Validate and apply a batch atomically: if any explicit or cascaded
    /// value is illegal nothing changes. Returns every assignment made,
    /// explicit ones first.
    pub fn set_many<I, K, V>(&mut self, pairs: I, cascade: bool) -> Result<Vec<Change>>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut plan: IndexMap<String, String> = IndexMap::new();
        for (name, value) in pairs {
            let (name, value) = (name.into(), value.into());
            self.validate(&name, &value)?;
            plan.insert(name, value);
        }

        if cascade {
            let explicit: HashSet<String> = plan.keys().cloned().collect();
            let mut seen: HashSet<(String, String)> = HashSet::new();
            let mut queue: VecDeque<(String, String)> =
                plan.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            while let Some((name, value)) = queue.pop_front() {
                if !seen.insert((name.clone(), value.clone())) {
                    continue;
                }
                for (target, target_value) in self.cascades.effects(&name, &value) {
                    if explicit.contains(target) || plan.contains_key(target) {
                        continue;
                    }
                    self.validate(target, target_value)?;
                    plan.insert(target.clone(), target_value.clone());
                    queue.push_back((target.clone(), target_value.clone()));
                }
            }
        }

        let mut changes = Vec::with_capacity(plan.len());
        for (name, value) in plan {
            let slot = self
                .values
                .get_mut(&name)
                .ok_or_else(|| TrellisError::UnknownParameter { name: name.clone() })?;
            let previous = slot.replace(value.clone());
            if previous.as_deref() != Some(value.as_str()) {
                tracing::trace!(parameter = %name, value = %value, "state changed");
            }
            changes.push(Change {
                name,
                previous,
                value: Some(value),
            });
        }
        Ok(changes)
    }

    pub fn unset(&mut self, name: &str) -> Result<Change> {
        let slot = self
            .values
            .get_mut(name)
            .ok_or_else(|| TrellisError::UnknownParameter { name: name.into() })?;
        let previous = slot.take();
        Ok(Change {
            name: name.into(),
            previous,
            value: None,
        })
    }

    /// Put back values captured from earlier [`Change`]s, without validation
    /// or cascades.
    pub fn restore(&mut self, saved: &[(String, Option<String>)]) {
        for (name, value) in saved.iter().rev() {
            if let Some(slot) = self.values.get_mut(name) {
                *slot = value.clone();
            }
        }
    }

    /// All parameters with their current value, in declaration order.
    pub fn snapshot(&self) -> IndexMap<String, Option<String>> {
        self.values.clone()
    }

    /// The set values only, sorted by name.
    pub fn values(&self) -> BTreeMap<String, String> {
        self.values
            .iter()
            .filter_map(|(k, v)| v.as_ref().map(|v| (k.clone(), v.clone())))
            .collect()
    }

    pub fn scoped<I, K, V>(&mut self, pairs: I) -> Result<Scoped<'_, StateStore>>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Scoped::enter(self, pairs)
    }
}

impl SlotSource for StateStore {
    fn lookup(&self, slot: &str) -> Result<Option<String>> {
        Ok(self
            .values
            .get(slot)
            .and_then(|v| v.as_ref().map(String::clone)))
    }
}

// ---------------------------------------------------------------------------
// Scoped changes
// ---------------------------------------------------------------------------

/// Anything that owns a [`StateStore`] and can therefore be scoped.
pub trait StateHolder {
    fn state_mut(&mut self) -> &mut StateStore;
}

impl StateHolder for StateStore {
    fn state_mut(&mut self) -> &mut StateStore {
        self
    }
}

/// Guard returned by a scoped set. Dereferences to the owner; on drop
/// (including unwinding) restores every name the batch assigned, cascaded
/// ones included.
pub struct Scoped<'a, T: StateHolder> {
    owner: &'a mut T,
    saved: Vec<(String, Option<String>)>,
}

impl<'a, T: StateHolder> Scoped<'a, T> {
    pub fn enter<I, K, V>(owner: &'a mut T, pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let changes = owner.state_mut().set_many(pairs, true)?;
        let saved = changes
            .into_iter()
            .map(|c| (c.name, c.previous))
            .collect();
        Ok(Self { owner, saved })
    }

    /// Names that will be restored on exit.
    pub fn restored_names(&self) -> impl Iterator<Item = &str> {
        self.saved.iter().map(|(name, _)| name.as_str())
    }
}

impl<T: StateHolder> Deref for Scoped<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.owner
    }
}

impl<T: StateHolder> DerefMut for Scoped<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.owner
    }
}

impl<T: StateHolder> Drop for Scoped<'_, T> {
    fn drop(&mut self) {
        self.owner.state_mut().restore(&self.saved);
    }
}
