//! Definition registry, catalog linking and fingerprinting.
//!
//! A [`Registry`] collects user definitions. [`Registry::link`] adds the
//! implicit ones (`raw` source, `all` group, FreeSurfer parcellations),
//! checks every chain and reference, and produces an immutable [`Catalog`]
//! with memoised chains and fingerprints.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use trellis_types::{Category, DefKey, Fingerprint, Result, TrellisError};

use crate::chain::ChainGraph;
use crate::definitions::{
    CovDef, Definition, EpochDef, GroupDef, ParcDef, RawPipe, Reference, TestDef, VariableDef,
    FREESURFER_PARCS,
};
use crate::hashing::{fingerprint_value, FINGERPRINT_VERSION};

// ---------------------------------------------------------------------------
// AnyDefinition
// ---------------------------------------------------------------------------

/// A definition of any category.
#[derive(Debug, Clone, PartialEq)]
pub enum AnyDefinition {
    Raw(RawPipe),
    Variable(VariableDef),
    Epoch(EpochDef),
    Test(TestDef),
    Group(GroupDef),
    Parc(ParcDef),
    Cov(CovDef),
}

impl AnyDefinition {
    pub fn category(&self) -> Category {
        match self {
            AnyDefinition::Raw(_) => Category::Raw,
            AnyDefinition::Variable(_) => Category::Variable,
            AnyDefinition::Epoch(_) => Category::Epoch,
            AnyDefinition::Test(_) => Category::Test,
            AnyDefinition::Group(_) => Category::Group,
            AnyDefinition::Parc(_) => Category::Parc,
            AnyDefinition::Cov(_) => Category::Cov,
        }
    }
}

macro_rules! any_definition_from {
    ($($variant:ident($ty:ty)),* $(,)?) => {
        $(impl From<$ty> for AnyDefinition {
            fn from(def: $ty) -> Self {
                AnyDefinition::$variant(def)
            }
        })*
    };
}

any_definition_from!(
    Raw(RawPipe),
    Variable(VariableDef),
    Epoch(EpochDef),
    Test(TestDef),
    Group(GroupDef),
    Parc(ParcDef),
    Cov(CovDef),
);

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct Registry {
    raw: IndexMap<String, RawPipe>,
    variables: IndexMap<String, VariableDef>,
    epochs: IndexMap<String, EpochDef>,
    tests: IndexMap<String, TestDef>,
    groups: IndexMap<String, GroupDef>,
    parcs: IndexMap<String, ParcDef>,
    covs: IndexMap<String, CovDef>,
}

fn insert_unique<T>(map: &mut IndexMap<String, T>, category: Category, name: &str, def: T) -> Result<()> {
    if map.contains_key(name) {
        return Err(TrellisError::DuplicateDefinition {
            category,
            name: name.into(),
        });
    }
    map.insert(name.to_string(), def);
    Ok(())
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a definition; its category follows from its type.
    pub fn register(&mut self, name: &str, definition: impl Into<AnyDefinition>) -> Result<()> {
        let definition = definition.into();
        let category = definition.category();
        match definition {
            AnyDefinition::Raw(d) => insert_unique(&mut self.raw, category, name, d),
            AnyDefinition::Variable(d) => insert_unique(&mut self.variables, category, name, d),
            AnyDefinition::Epoch(d) => insert_unique(&mut self.epochs, category, name, d),
            AnyDefinition::Test(d) => insert_unique(&mut self.tests, category, name, d),
            AnyDefinition::Group(d) => insert_unique(&mut self.groups, category, name, d),
            AnyDefinition::Parc(d) => insert_unique(&mut self.parcs, category, name, d),
            AnyDefinition::Cov(d) => insert_unique(&mut self.covs, category, name, d),
        }
    }

    pub fn len(&self) -> usize {
        self.raw.len()
            + self.variables.len()
            + self.epochs.len()
            + self.tests.len()
            + self.groups.len()
            + self.parcs.len()
            + self.covs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy with the implicit definitions added where the user did not
    /// define the same name. Implicit ones come first in declaration order.
    fn with_builtins(&self) -> Registry {
        fn prepend<T: Clone>(builtins: Vec<(&str, T)>, user: &IndexMap<String, T>) -> IndexMap<String, T> {
            let mut out = IndexMap::new();
            for (name, def) in builtins {
                if !user.contains_key(name) {
                    out.insert(name.to_string(), def);
                }
            }
            out.extend(user.iter().map(|(k, v)| (k.clone(), v.clone())));
            out
        }

        Registry {
            raw: prepend(vec![("raw", RawPipe::source())], &self.raw),
            variables: self.variables.clone(),
            epochs: self.epochs.clone(),
            tests: self.tests.clone(),
            groups: prepend(vec![("all", GroupDef::All {})], &self.groups),
            parcs: prepend(
                FREESURFER_PARCS
                    .iter()
                    .map(|&p| (p, ParcDef::freesurfer()))
                    .collect(),
                &self.parcs,
            ),
            covs: self.covs.clone(),
        }
    }

    /// Validate all chains and references and compute fingerprints.
    pub fn link(&self) -> Result<Catalog> {
        let full = self.with_builtins();
        let mut nodes: IndexMap<DefKey, Node> = IndexMap::new();
        let mut graphs: HashMap<Category, ChainGraph> = HashMap::new();
        let mut chains: HashMap<DefKey, Vec<String>> = HashMap::new();

        fn collect<T: Definition>(
            defs: &IndexMap<String, T>,
            nodes: &mut IndexMap<DefKey, Node>,
            graphs: &mut HashMap<Category, ChainGraph>,
            chains: &mut HashMap<DefKey, Vec<String>>,
        ) -> Result<()> {
            let graph = ChainGraph::from_definitions(defs);
            for (name, chain) in graph.resolve_all()? {
                chains.insert(DefKey::new(T::CATEGORY, name), chain);
            }
            for (name, def) in defs {
                nodes.insert(
                    DefKey::new(T::CATEGORY, name.as_str()),
                    Node {
                        kind: def.kind(),
                        params: def.params()?,
                        upstream: def
                            .upstream()
                            .names()
                            .into_iter()
                            .map(|u| DefKey::new(T::CATEGORY, u))
                            .collect(),
                        references: def
                            .references()
                            .into_iter()
                            .filter(|r| !(r.key.category == T::CATEGORY && r.key.name == *name))
                            .collect(),
                    },
                );
            }
            graphs.insert(T::CATEGORY, graph);
            Ok(())
        }

        collect(&full.raw, &mut nodes, &mut graphs, &mut chains)?;
        collect(&full.variables, &mut nodes, &mut graphs, &mut chains)?;
        collect(&full.epochs, &mut nodes, &mut graphs, &mut chains)?;
        collect(&full.tests, &mut nodes, &mut graphs, &mut chains)?;
        collect(&full.groups, &mut nodes, &mut graphs, &mut chains)?;
        collect(&full.parcs, &mut nodes, &mut graphs, &mut chains)?;
        collect(&full.covs, &mut nodes, &mut graphs, &mut chains)?;

        // Cross-category references: required ones must exist, soft ones
        // are dropped when they do not.
        let known: BTreeSet<DefKey> = nodes.keys().cloned().collect();
        for (key, node) in nodes.iter_mut() {
            let mut kept: Vec<Reference> = Vec::with_capacity(node.references.len());
            for r in node.references.drain(..) {
                if known.contains(&r.key) {
                    kept.push(r);
                } else if r.required {
                    return Err(TrellisError::UnknownUpstream {
                        category: key.category,
                        name: key.name.clone(),
                        target: r.key,
                    });
                }
            }
            node.references = kept;
        }

        let mut fingerprints: HashMap<DefKey, Fingerprint> = HashMap::with_capacity(nodes.len());
        let mut in_progress: Vec<DefKey> = Vec::new();
        for key in nodes.keys() {
            compute_fingerprint(key, &nodes, &mut fingerprints, &mut in_progress)?;
        }

        tracing::debug!(definitions = nodes.len(), "linked definition catalog");

        Ok(Catalog {
            raw: full.raw,
            variables: full.variables,
            epochs: full.epochs,
            tests: full.tests,
            groups: full.groups,
            parcs: full.parcs,
            covs: full.covs,
            nodes,
            graphs,
            chains,
            fingerprints,
        })
    }
}

/// Uniform view of a definition used for linking and fingerprints.
#[derive(Debug, Clone)]
struct Node {
    kind: &'static str,
    params: Value,
    upstream: Vec<DefKey>,
    references: Vec<Reference>,
}

impl Node {
    fn dependencies(&self) -> impl Iterator<Item = &DefKey> {
        self.upstream
            .iter()
            .chain(self.references.iter().map(|r| &r.key))
    }
}

fn compute_fingerprint(
    key: &DefKey,
    nodes: &IndexMap<DefKey, Node>,
    memo: &mut HashMap<DefKey, Fingerprint>,
    in_progress: &mut Vec<DefKey>,
) -> Result<Fingerprint> {
    if let Some(fp) = memo.get(key) {
        return Ok(fp.clone());
    }
    if let Some(pos) = in_progress.iter().position(|k| k == key) {
        let mut cycle: Vec<String> = in_progress[pos..].iter().map(ToString::to_string).collect();
        cycle.push(key.to_string());
        return Err(TrellisError::Cycle {
            category: key.category,
            cycle,
        });
    }
    let node = nodes.get(key).ok_or_else(|| TrellisError::UnknownDefinition {
        category: key.category,
        name: key.name.clone(),
    })?;

    in_progress.push(key.clone());
    let mut dependencies = serde_json::Map::new();
    for dep in node.dependencies() {
        let fp = compute_fingerprint(dep, nodes, memo, in_progress)?;
        dependencies.insert(dep.to_string(), Value::String(fp.to_string()));
    }
    in_progress.pop();

    let fp = fingerprint_value(&json!({
        "version": FINGERPRINT_VERSION,
        "category": key.category,
        "kind": node.kind,
        "params": node.params,
        "dependencies": dependencies,
    }));
    memo.insert(key.clone(), fp.clone());
    Ok(fp)
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// Recorded state of one definition, stored with the cache index so later
/// runs can report what changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefinitionSnapshot {
    pub kind: String,
    pub params: Value,
    pub fingerprint: Fingerprint,
}

/// Linked, immutable set of definitions.
#[derive(Debug, Clone)]
pub struct Catalog {
    raw: IndexMap<String, RawPipe>,
    variables: IndexMap<String, VariableDef>,
    epochs: IndexMap<String, EpochDef>,
    tests: IndexMap<String, TestDef>,
    groups: IndexMap<String, GroupDef>,
    parcs: IndexMap<String, ParcDef>,
    covs: IndexMap<String, CovDef>,
    nodes: IndexMap<DefKey, Node>,
    graphs: HashMap<Category, ChainGraph>,
    chains: HashMap<DefKey, Vec<String>>,
    fingerprints: HashMap<DefKey, Fingerprint>,
}

fn lookup<'a, T>(map: &'a IndexMap<String, T>, category: Category, name: &str) -> Result<&'a T> {
    map.get(name).ok_or_else(|| TrellisError::UnknownDefinition {
        category,
        name: name.into(),
    })
}

impl Catalog {
    pub fn contains(&self, key: &DefKey) -> bool {
        self.nodes.contains_key(key)
    }

    /// Names of one category in declaration order.
    pub fn names(&self, category: Category) -> Vec<&str> {
        self.nodes
            .keys()
            .filter(|k| k.category == category)
            .map(|k| k.name.as_str())
            .collect()
    }

    pub fn keys(&self) -> impl Iterator<Item = &DefKey> {
        self.nodes.keys()
    }

    pub fn kind(&self, key: &DefKey) -> Result<&'static str> {
        self.node(key).map(|n| n.kind)
    }

    fn node(&self, key: &DefKey) -> Result<&Node> {
        self.nodes.get(key).ok_or_else(|| TrellisError::UnknownDefinition {
            category: key.category,
            name: key.name.clone(),
        })
    }

    pub fn fingerprint(&self, key: &DefKey) -> Result<&Fingerprint> {
        self.fingerprints
            .get(key)
            .ok_or_else(|| TrellisError::UnknownDefinition {
                category: key.category,
                name: key.name.clone(),
            })
    }

    pub fn fingerprint_of(&self, category: Category, name: &str) -> Result<&Fingerprint> {
        self.fingerprint(&DefKey::new(category, name))
    }

    /// Same-category chain from root to `name`.
    pub fn chain(&self, category: Category, name: &str) -> Result<&[String]> {
        self.chains
            .get(&DefKey::new(category, name))
            .map(Vec::as_slice)
            .ok_or_else(|| TrellisError::UnknownDefinition {
                category,
                name: name.into(),
            })
    }

    pub fn graph(&self, category: Category) -> Option<&ChainGraph> {
        self.graphs.get(&category)
    }

    /// Direct dependencies: same-category upstreams first, then references.
    pub fn dependencies(&self, key: &DefKey) -> Result<Vec<DefKey>> {
        Ok(self.node(key)?.dependencies().cloned().collect())
    }

    /// `key` and everything it transitively depends on, with current
    /// fingerprints.
    pub fn closure(&self, key: &DefKey) -> Result<BTreeMap<DefKey, Fingerprint>> {
        let mut out = BTreeMap::new();
        let mut stack = vec![key.clone()];
        while let Some(current) = stack.pop() {
            if out.contains_key(&current) {
                continue;
            }
            let fp = self.fingerprint(&current)?.clone();
            stack.extend(self.node(&current)?.dependencies().cloned());
            out.insert(current, fp);
        }
        Ok(out)
    }

    pub fn snapshot(&self) -> BTreeMap<DefKey, DefinitionSnapshot> {
        self.nodes
            .iter()
            .filter_map(|(key, node)| {
                self.fingerprints.get(key).map(|fp| {
                    (
                        key.clone(),
                        DefinitionSnapshot {
                            kind: node.kind.to_string(),
                            params: node.params.clone(),
                            fingerprint: fp.clone(),
                        },
                    )
                })
            })
            .collect()
    }

    pub fn raw(&self, name: &str) -> Result<&RawPipe> {
        lookup(&self.raw, Category::Raw, name)
    }

    pub fn raw_pipes(&self) -> &IndexMap<String, RawPipe> {
        &self.raw
    }

    pub fn variable(&self, name: &str) -> Result<&VariableDef> {
        lookup(&self.variables, Category::Variable, name)
    }

    pub fn epoch(&self, name: &str) -> Result<&EpochDef> {
        lookup(&self.epochs, Category::Epoch, name)
    }

    pub fn epochs(&self) -> &IndexMap<String, EpochDef> {
        &self.epochs
    }

    pub fn test(&self, name: &str) -> Result<&TestDef> {
        lookup(&self.tests, Category::Test, name)
    }

    pub fn group(&self, name: &str) -> Result<&GroupDef> {
        lookup(&self.groups, Category::Group, name)
    }

    pub fn groups(&self) -> &IndexMap<String, GroupDef> {
        &self.groups
    }

    pub fn parc(&self, name: &str) -> Result<&ParcDef> {
        lookup(&self.parcs, Category::Parc, name)
    }

    pub fn cov(&self, name: &str) -> Result<&CovDef> {
        lookup(&self.covs, Category::Cov, name)
    }

    /// Session an epoch is extracted from. Secondary epochs inherit their
    /// base's; a super epoch has one only if all of its parts agree.
    pub fn epoch_session(&self, name: &str) -> Result<Option<String>> {
        Ok(self.epoch_sessions(name)?.into_iter().fold(None, |acc, s| match acc {
            None => Some(Some(s)),
            Some(Some(prev)) if prev == s => Some(Some(prev)),
            Some(_) => Some(None),
        }).flatten())
    }

    /// Every session contributing data to an epoch, in chain order.
    pub fn epoch_sessions(&self, name: &str) -> Result<Vec<String>> {
        let mut sessions: Vec<String> = Vec::new();
        for member in self.chain(Category::Epoch, name)? {
            if let EpochDef::Primary { session, .. } = self.epoch(member)? {
                if !sessions.contains(session) {
                    sessions.push(session.clone());
                }
            }
        }
        Ok(sessions)
    }

    /// Members of a group, in the order they were declared or discovered.
    pub fn group_members(&self, name: &str, subjects: &[String]) -> Result<Vec<String>> {
        match self.group(name)? {
            GroupDef::All {} => Ok(subjects.to_vec()),
            GroupDef::Subjects { subjects: listed } => Ok(listed.clone()),
            GroupDef::Exclude { base, exclude } => Ok(self
                .group_members(base, subjects)?
                .into_iter()
                .filter(|s| !exclude.contains(s))
                .collect()),
            GroupDef::Union { groups } => {
                let mut members: Vec<String> = Vec::new();
                for group in groups {
                    for s in self.group_members(group, subjects)? {
                        if !members.contains(&s) {
                            members.push(s);
                        }
                    }
                }
                Ok(members)
            }
        }
    }

    /// Raw pipes in the chain of `name` that are cached, in chain order.
    pub fn cached_raw_chain(&self, name: &str) -> Result<Vec<&str>> {
        let mut out = Vec::new();
        for member in self.chain(Category::Raw, name)? {
            if self.raw(member)?.is_cached() {
                out.push(member.as_str());
            }
        }
        Ok(out)
    }
}
