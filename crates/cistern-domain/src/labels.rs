//! Label parsing and resolution of include/exclude lists into entity groups.

use std::collections::HashSet;

use indexmap::IndexSet;

use crate::registry::{EntityGroup, EntityRegistry};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum LabelError {
    #[error("unknown application label '{label}'")]
    UnknownApplication { label: String },
    #[error("unknown entity label '{label}'")]
    UnknownEntity { label: String },
    #[error("application label '{label}' matches {count} registered applications")]
    AmbiguousApplication { label: String, count: usize },
    #[error("entity label '{label}' matches {count} registered entity groups")]
    AmbiguousEntity { label: String, count: usize },
    #[error("label '{label}' is malformed: expected 'app' or 'app.entity'")]
    Malformed { label: String },
    #[error("exclude label '{label}' must be fully qualified as 'app.entity'")]
    UnqualifiedExclude { label: String },
}

impl LabelError {
    /// True for the "does not exist" family, as opposed to syntax errors.
    #[must_use]
    pub fn is_unknown(&self) -> bool {
        matches!(
            self,
            Self::UnknownApplication { .. } | Self::UnknownEntity { .. }
        )
    }
}

/// Parsed form of an `app` or `app.entity` label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Label<'a> {
    Application(&'a str),
    Entity { application: &'a str, name: &'a str },
}

impl<'a> Label<'a> {
    /// Classifies a label.
    ///
    /// Empty labels, labels with a leading or trailing dot and labels with
    /// more than one dot are rejected; deeper namespaces are unsupported.
    pub fn parse(label: &'a str) -> Result<Self, LabelError> {
        let malformed = || LabelError::Malformed {
            label: label.to_string(),
        };
        let mut parts = label.split('.');
        let head = parts.next().unwrap_or_default();
        match (parts.next(), parts.next()) {
            (None, _) if !head.is_empty() => Ok(Self::Application(head)),
            (Some(name), None) if !head.is_empty() && !name.is_empty() => Ok(Self::Entity {
                application: head,
                name,
            }),
            _ => Err(malformed()),
        }
    }

    #[must_use]
    pub fn application(&self) -> &'a str {
        match *self {
            Self::Application(app) | Self::Entity { application: app, .. } => app,
        }
    }
}

/// Labels that do not exist in the registry, split by kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnknownLabels {
    pub applications: Vec<String>,
    pub entities: Vec<String>,
}

impl UnknownLabels {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.applications.is_empty() && self.entities.is_empty()
    }
}

/// Turns label lists into ordered entity group selections.
#[derive(Debug, Clone, Copy)]
pub struct LabelResolver<'r> {
    registry: &'r EntityRegistry,
}

impl<'r> LabelResolver<'r> {
    #[must_use]
    pub fn new(registry: &'r EntityRegistry) -> Self {
        Self { registry }
    }

    #[must_use]
    pub fn registry(&self) -> &'r EntityRegistry {
        self.registry
    }

    /// Entity groups selected by `labels`, minus those named in `excludes`,
    /// in registry order.
    pub fn resolve_inclusions<L, E>(
        &self,
        labels: &[L],
        excludes: &[E],
    ) -> Result<Vec<&'r EntityGroup>, LabelError>
    where
        L: AsRef<str>,
        E: AsRef<str>,
    {
        let excluded: HashSet<&str> = excludes.iter().map(AsRef::as_ref).collect();
        let mut seen = HashSet::new();
        let mut selected = Vec::new();
        for raw in labels {
            let raw = raw.as_ref();
            let candidates: Vec<&'r EntityGroup> = match Label::parse(raw)? {
                Label::Application(app) => {
                    self.registry.lookup_application(app)?.entities().iter().collect()
                }
                Label::Entity { .. } => vec![self.registry.lookup_entity(raw)?],
            };
            for entity in candidates {
                if excluded.contains(entity.label()) {
                    continue;
                }
                if seen.insert(entity.sequence()) {
                    selected.push(entity);
                }
            }
        }
        selected.sort_by_key(|entity| entity.sequence());
        Ok(selected)
    }

    /// Entity groups of every application touched by `labels` or `excludes`
    /// that [`Self::resolve_inclusions`] does not select, in registry order.
    ///
    /// Applications referenced by neither list are left out.
    pub fn resolve_exclusions<L, E>(
        &self,
        labels: &[L],
        excludes: &[E],
    ) -> Result<Vec<&'r EntityGroup>, LabelError>
    where
        L: AsRef<str>,
        E: AsRef<str>,
    {
        let included: HashSet<u64> = self
            .resolve_inclusions(labels, excludes)?
            .into_iter()
            .map(EntityGroup::sequence)
            .collect();

        let mut touched = IndexSet::new();
        for raw in labels
            .iter()
            .map(AsRef::as_ref)
            .chain(excludes.iter().map(AsRef::as_ref))
        {
            touched.insert(Label::parse(raw)?.application());
        }

        let mut remainder = Vec::new();
        for app in touched {
            for entity in self.registry.lookup_application(app)?.entities() {
                if !included.contains(&entity.sequence()) {
                    remainder.push(entity);
                }
            }
        }
        remainder.sort_by_key(|entity| entity.sequence());
        Ok(remainder)
    }

    /// Reports labels absent from the registry without failing.
    ///
    /// Malformed labels are ignored here; [`malformed_labels`] reports them.
    #[must_use]
    pub fn check_unknown_labels<L: AsRef<str>>(&self, labels: &[L]) -> UnknownLabels {
        let mut unknown = UnknownLabels::default();
        for raw in labels {
            let raw = raw.as_ref();
            match Label::parse(raw) {
                Ok(Label::Application(app)) => {
                    if let Err(err) = self.registry.lookup_application(app) {
                        if err.is_unknown() && !unknown.applications.iter().any(|a| a == app) {
                            unknown.applications.push(app.to_string());
                        }
                    }
                }
                Ok(Label::Entity { .. }) => {
                    if let Err(err) = self.registry.lookup_entity(raw) {
                        if err.is_unknown() && !unknown.entities.iter().any(|e| e == raw) {
                            unknown.entities.push(raw.to_string());
                        }
                    }
                }
                Err(_) => {}
            }
        }
        unknown
    }
}

/// Labels from `labels` that fail [`Label::parse`], in input order.
#[must_use]
pub fn malformed_labels<L: AsRef<str>>(labels: &[L]) -> Vec<String> {
    labels
        .iter()
        .map(AsRef::as_ref)
        .filter(|raw| Label::parse(raw).is_err())
        .map(ToString::to_string)
        .collect()
}

/// Renders entity groups as their labels.
#[must_use]
pub fn labels_of(entities: &[&EntityGroup]) -> Vec<String> {
    entities
        .iter()
        .map(|entity| entity.label().to_string())
        .collect()
}
