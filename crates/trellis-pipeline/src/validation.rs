//! Configuration lint rules and diagnostics.
//!
//! Rules run over a linked [`Catalog`] together with the controller's
//! sessions, subjects, templates and parameters. Call [`validate`] for
//! advisory diagnostics or [`validate_or_raise`] to fail on any `Error`.

use trellis_types::{Category, DefKey, TrellisError};

use crate::definitions::{EpochDef, GroupDef, RawPipe};
use crate::registry::Catalog;
use crate::state::StateStore;
use crate::templates::TemplateSet;

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub definition: Option<DefKey>,
    pub fix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// Everything the rules look at.
pub struct LintContext<'a> {
    pub catalog: &'a Catalog,
    pub sessions: &'a [String],
    pub subjects: &'a [String],
    pub templates: &'a TemplateSet,
    pub state: &'a StateStore,
}

// ---------------------------------------------------------------------------
// LintRule trait
// ---------------------------------------------------------------------------

pub trait LintRule {
    fn name(&self) -> &str;
    fn apply(&self, ctx: &LintContext<'_>) -> Vec<Diagnostic>;
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

struct RawSourceRule;
impl LintRule for RawSourceRule {
    fn name(&self) -> &str { "raw_source" }
    fn apply(&self, ctx: &LintContext<'_>) -> Vec<Diagnostic> {
        let sources: Vec<&str> = ctx
            .catalog
            .raw_pipes()
            .iter()
            .filter(|(_, pipe)| pipe.is_source())
            .map(|(name, _)| name.as_str())
            .collect();
        match sources.as_slice() {
            ["raw"] => vec![],
            [] => vec![Diagnostic {
                rule: self.name().into(),
                severity: Severity::Error,
                message: "No raw source definition".into(),
                definition: None,
                fix: Some("Remove the definition that replaced the 'raw' source".into()),
            }],
            _ => sources
                .iter()
                .filter(|name| **name != "raw")
                .map(|name| Diagnostic {
                    rule: self.name().into(),
                    severity: Severity::Error,
                    message: format!("Raw source must be named 'raw', found source '{name}'"),
                    definition: Some(DefKey::new(Category::Raw, *name)),
                    fix: Some("Configure the recordings on the 'raw' entry instead".into()),
                })
                .collect(),
        }
    }
}

struct SessionsDeclaredRule;
impl LintRule for SessionsDeclaredRule {
    fn name(&self) -> &str { "sessions_declared" }
    fn apply(&self, ctx: &LintContext<'_>) -> Vec<Diagnostic> {
        if ctx.sessions.is_empty() {
            return vec![Diagnostic {
                rule: self.name().into(),
                severity: Severity::Error,
                message: "No sessions declared".into(),
                definition: None,
                fix: Some("List the recording sessions under 'sessions'".into()),
            }];
        }
        let mut diags = Vec::new();
        for (i, session) in ctx.sessions.iter().enumerate() {
            if ctx.sessions[..i].contains(session) {
                diags.push(Diagnostic {
                    rule: self.name().into(),
                    severity: Severity::Error,
                    message: format!("Session '{session}' is declared more than once"),
                    definition: None,
                    fix: None,
                });
            }
        }
        diags
    }
}

struct IcaSessionsExistRule;
impl LintRule for IcaSessionsExistRule {
    fn name(&self) -> &str { "ica_sessions_exist" }
    fn apply(&self, ctx: &LintContext<'_>) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for (name, pipe) in ctx.catalog.raw_pipes() {
            let RawPipe::Ica { sessions, .. } = pipe else {
                continue;
            };
            if sessions.is_empty() {
                diags.push(Diagnostic {
                    rule: self.name().into(),
                    severity: Severity::Error,
                    message: format!("ICA pipe '{name}' lists no sessions to fit on"),
                    definition: Some(DefKey::new(Category::Raw, name.as_str())),
                    fix: None,
                });
            }
            for session in sessions.iter().filter(|s| !ctx.sessions.contains(s)) {
                diags.push(Diagnostic {
                    rule: self.name().into(),
                    severity: Severity::Error,
                    message: format!("ICA pipe '{name}' uses unknown session '{session}'"),
                    definition: Some(DefKey::new(Category::Raw, name.as_str())),
                    fix: Some(format!("Add '{session}' to 'sessions' or remove it from the pipe")),
                });
            }
        }
        diags
    }
}

struct EpochSessionExistsRule;
impl LintRule for EpochSessionExistsRule {
    fn name(&self) -> &str { "epoch_session_exists" }
    fn apply(&self, ctx: &LintContext<'_>) -> Vec<Diagnostic> {
        ctx.catalog
            .epochs()
            .iter()
            .filter_map(|(name, epoch)| match epoch {
                EpochDef::Primary { session, .. } if !ctx.sessions.contains(session) => {
                    Some(Diagnostic {
                        rule: self.name().into(),
                        severity: Severity::Error,
                        message: format!("Epoch '{name}' is extracted from unknown session '{session}'"),
                        definition: Some(DefKey::new(Category::Epoch, name.as_str())),
                        fix: Some(format!("Add '{session}' to 'sessions'")),
                    })
                }
                _ => None,
            })
            .collect()
    }
}

struct TemplateSlotsKnownRule;
impl LintRule for TemplateSlotsKnownRule {
    fn name(&self) -> &str { "template_slots_known" }
    fn apply(&self, ctx: &LintContext<'_>) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for (name, template) in ctx.templates.iter() {
            for slot in template.slots() {
                if !ctx.state.is_declared(slot) && !ctx.templates.contains(slot) {
                    diags.push(Diagnostic {
                        rule: self.name().into(),
                        severity: Severity::Error,
                        message: format!(
                            "Template '{name}' uses '{{{slot}}}', which is neither a parameter nor a template"
                        ),
                        definition: None,
                        fix: Some(format!("Declare a parameter or template named '{slot}'")),
                    });
                }
            }
        }
        diags
    }
}

struct GroupMembersKnownRule;
impl LintRule for GroupMembersKnownRule {
    fn name(&self) -> &str { "group_members_known" }
    fn apply(&self, ctx: &LintContext<'_>) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for (name, group) in ctx.catalog.groups() {
            let listed = match group {
                GroupDef::Subjects { subjects } => subjects,
                GroupDef::Exclude { exclude, .. } => exclude,
                GroupDef::All {} | GroupDef::Union { .. } => continue,
            };
            for subject in listed.iter().filter(|s| !ctx.subjects.contains(s)) {
                diags.push(Diagnostic {
                    rule: self.name().into(),
                    severity: Severity::Warning,
                    message: format!("Group '{name}' names unknown subject '{subject}'"),
                    definition: Some(DefKey::new(Category::Group, name.as_str())),
                    fix: None,
                });
            }
        }
        diags
    }
}

struct EmptyGroupRule;
impl LintRule for EmptyGroupRule {
    fn name(&self) -> &str { "empty_group" }
    fn apply(&self, ctx: &LintContext<'_>) -> Vec<Diagnostic> {
        ctx.catalog
            .groups()
            .keys()
            .filter(|name| {
                ctx.catalog
                    .group_members(name, ctx.subjects)
                    .map(|m| m.is_empty())
                    .unwrap_or(false)
            })
            .map(|name| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Warning,
                message: format!("Group '{name}' has no members"),
                definition: Some(DefKey::new(Category::Group, name.as_str())),
                fix: None,
            })
            .collect()
    }
}

struct UncachedLeafRule;
impl LintRule for UncachedLeafRule {
    fn name(&self) -> &str { "uncached_leaf" }
    fn apply(&self, ctx: &LintContext<'_>) -> Vec<Diagnostic> {
        let Some(graph) = ctx.catalog.graph(Category::Raw) else {
            return vec![];
        };
        let pipes = ctx.catalog.raw_pipes();
        pipes
            .iter()
            .filter(|(_, pipe)| !pipe.is_source() && !pipe.is_cached())
            .filter(|(name, _)| {
                !graph
                    .descendants(name)
                    .iter()
                    .any(|d| pipes.get(d).is_some_and(RawPipe::is_cached))
            })
            .map(|(name, _)| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Info,
                message: format!("Raw pipe '{name}' is not cached and has no cached dependents; it is recomputed on every load"),
                definition: Some(DefKey::new(Category::Raw, name.as_str())),
                fix: None,
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Run all built-in lint rules and return collected diagnostics.
pub fn validate(ctx: &LintContext<'_>) -> Vec<Diagnostic> {
    let rules: Vec<Box<dyn LintRule>> = vec![
        Box::new(RawSourceRule),
        Box::new(SessionsDeclaredRule),
        Box::new(IcaSessionsExistRule),
        Box::new(EpochSessionExistsRule),
        Box::new(TemplateSlotsKnownRule),
        Box::new(GroupMembersKnownRule),
        Box::new(EmptyGroupRule),
        Box::new(UncachedLeafRule),
    ];

    let mut diagnostics = Vec::new();
    for rule in &rules {
        diagnostics.extend(rule.apply(ctx));
    }
    diagnostics
}

/// Run all lint rules; return `Err` if any `Error`-severity diagnostic found.
pub fn validate_or_raise(ctx: &LintContext<'_>) -> trellis_types::Result<Vec<Diagnostic>> {
    let diagnostics = validate(ctx);
    let errors: Vec<_> = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .collect();
    if !errors.is_empty() {
        let messages: Vec<_> = errors.iter().map(|d| d.message.clone()).collect();
        return Err(TrellisError::Validation(messages.join("; ")));
    }
    Ok(diagnostics)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
