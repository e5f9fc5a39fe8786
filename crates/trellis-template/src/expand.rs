use std::collections::{BTreeMap, HashMap};
use std::hash::BuildHasher;

use trellis_types::{Result, TrellisError};

use crate::ast::{Segment, Template};

/// Anything that can supply values for template slots.
///
/// `Ok(None)` means the slot has no value; an `Err` aborts expansion (for
/// example when the slot names a parameter that was never declared).
pub trait SlotSource {
    fn lookup(&self, slot: &str) -> Result<Option<String>>;
}

impl<S: BuildHasher> SlotSource for HashMap<String, String, S> {
    fn lookup(&self, slot: &str) -> Result<Option<String>> {
        Ok(self.get(slot).cloned())
    }
}

impl SlotSource for BTreeMap<String, String> {
    fn lookup(&self, slot: &str) -> Result<Option<String>> {
        Ok(self.get(slot).cloned())
    }
}

impl<T: SlotSource + ?Sized> SlotSource for &T {
    fn lookup(&self, slot: &str) -> Result<Option<String>> {
        (**self).lookup(slot)
    }
}

/// Values in `overrides` shadow those of `base`.
pub struct Overlay<'a> {
    pub overrides: &'a BTreeMap<String, String>,
    pub base: &'a dyn SlotSource,
}

impl SlotSource for Overlay<'_> {
    fn lookup(&self, slot: &str) -> Result<Option<String>> {
        match self.overrides.get(slot) {
            Some(value) => Ok(Some(value.clone())),
            None => self.base.lookup(slot),
        }
    }
}

impl Template {
    /// Substitute every slot. Fails with `MissingSlot` on the first slot (in
    /// template order) that the source cannot fill.
    pub fn expand(&self, vars: &dyn SlotSource) -> Result<String> {
        let mut out = String::with_capacity(self.source().len());
        for segment in self.segments() {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Slot(name) => match vars.lookup(name)? {
                    Some(value) => out.push_str(&value),
                    None => {
                        return Err(TrellisError::MissingSlot {
                            slot: name.clone(),
                            template: self.source().to_string(),
                        })
                    }
                },
            }
        }
        tracing::trace!(template = %self.source(), expanded = %out, "expanded template");
        Ok(out)
    }
}

/// Parse and expand in one step.
pub fn expand(template: &str, vars: &dyn SlotSource) -> Result<String> {
    Template::parse(template)?.expand(vars)
}
