//! Per-category dependency graphs and chain resolution.

use std::collections::{BTreeSet, HashMap, HashSet};

use indexmap::IndexMap;
use trellis_types::{Category, DefKey, Result, TrellisError};

use crate::definitions::Definition;

/// The same-category upstream graph of one category, in declaration order.
#[derive(Debug, Clone)]
pub struct ChainGraph {
    category: Category,
    nodes: IndexMap<String, Vec<String>>,
}

impl ChainGraph {
    pub fn new(category: Category) -> Self {
        Self {
            category,
            nodes: IndexMap::new(),
        }
    }

    pub fn from_definitions<T: Definition>(definitions: &IndexMap<String, T>) -> Self {
        let mut graph = Self::new(T::CATEGORY);
        for (name, def) in definitions {
            graph.add(
                name,
                def.upstream().names().into_iter().map(str::to_string).collect(),
            );
        }
        graph
    }

    pub fn add(&mut self, name: &str, upstream: Vec<String>) {
        self.nodes.insert(name.to_string(), upstream);
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn upstream(&self, name: &str) -> &[String] {
        self.nodes.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Ordered sequence of every definition `name` depends on, roots first
    /// and `name` last. Where several orders are valid, earlier-declared
    /// definitions come first.
    pub fn resolve_chain(&self, name: &str) -> Result<Vec<String>> {
        if !self.nodes.contains_key(name) {
            return Err(TrellisError::UnknownDefinition {
                category: self.category,
                name: name.into(),
            });
        }

        let mut ancestors: BTreeSet<usize> = BTreeSet::new();
        let mut path: Vec<&str> = Vec::new();
        self.visit(name, &mut path, &mut ancestors)?;

        // Kahn's algorithm restricted to the ancestor set; the ready set is
        // keyed by declaration index.
        let members: Vec<&str> = ancestors
            .iter()
            .filter_map(|&i| self.nodes.get_index(i).map(|(k, _)| k.as_str()))
            .collect();
        let mut pending: HashMap<&str, usize> = members
            .iter()
            .map(|&m| (m, self.upstream(m).len()))
            .collect();
        let mut ready: BTreeSet<usize> = members
            .iter()
            .filter(|&&m| pending[m] == 0)
            .filter_map(|&m| self.nodes.get_index_of(m))
            .collect();
        let mut order = Vec::with_capacity(members.len());
        while let Some(index) = ready.pop_first() {
            let Some((current, _)) = self.nodes.get_index(index) else {
                break;
            };
            order.push(current.clone());
            for &m in &members {
                let hits = self.upstream(m).iter().filter(|u| *u == current).count();
                if hits == 0 {
                    continue;
                }
                if let Some(count) = pending.get_mut(m) {
                    *count -= hits;
                    if *count == 0 {
                        if let Some(i) = self.nodes.get_index_of(m) {
                            ready.insert(i);
                        }
                    }
                }
            }
        }
        Ok(order)
    }

    fn visit<'a>(
        &'a self,
        name: &'a str,
        path: &mut Vec<&'a str>,
        done: &mut BTreeSet<usize>,
    ) -> Result<()> {
        let Some(index) = self.nodes.get_index_of(name) else {
            return Ok(());
        };
        if let Some(pos) = path.iter().position(|p| *p == name) {
            let mut cycle: Vec<String> = path[pos..].iter().map(|s| s.to_string()).collect();
            cycle.push(name.to_string());
            return Err(TrellisError::Cycle {
                category: self.category,
                cycle,
            });
        }
        if done.contains(&index) {
            return Ok(());
        }
        path.push(name);
        for up in self.upstream(name) {
            if !self.nodes.contains_key(up.as_str()) {
                return Err(TrellisError::UnknownUpstream {
                    category: self.category,
                    name: name.into(),
                    target: DefKey::new(self.category, up.as_str()),
                });
            }
            self.visit(up, path, done)?;
        }
        path.pop();
        done.insert(index);
        Ok(())
    }

    /// Resolve every chain, failing on the first cycle or unknown upstream.
    pub fn resolve_all(&self) -> Result<HashMap<String, Vec<String>>> {
        let mut chains = HashMap::with_capacity(self.nodes.len());
        for name in self.nodes.keys() {
            chains.insert(name.clone(), self.resolve_chain(name)?);
        }
        Ok(chains)
    }

    /// Names that list `name` as an upstream, directly or transitively.
    pub fn descendants(&self, name: &str) -> Vec<String> {
        let mut found: HashSet<&str> = HashSet::new();
        let mut frontier = vec![name];
        while let Some(current) = frontier.pop() {
            for (candidate, ups) in &self.nodes {
                if ups.iter().any(|u| u == current) && found.insert(candidate.as_str()) {
                    frontier.push(candidate.as_str());
                }
            }
        }
        self.nodes
            .keys()
            .filter(|k| found.contains(k.as_str()))
            .cloned()
            .collect()
    }
}
