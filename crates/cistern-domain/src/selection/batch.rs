use std::collections::{HashMap, HashSet};

use indexmap::{IndexMap, IndexSet};
use serde::Serialize;

use super::{
    ConfigurationError, DataFormat, DefinitionIssue, DefinitionOptions, SelectionDefinition,
};
use crate::labels::{LabelError, LabelResolver};
use crate::registry::EntityRegistry;

#[derive(Debug, thiserror::Error)]
pub enum SelectionError {
    #[error("definition name '{name}' is declared more than once")]
    DuplicateName { name: String },
    #[error(transparent)]
    Invalid(#[from] ValidationErrors),
    #[error("definition '{name}' failed to resolve: {source}")]
    Resolution {
        name: String,
        #[source]
        source: LabelError,
    },
    #[error("failed to parse definition declarations: {0}")]
    Declarations(#[from] serde_json::Error),
}

/// Every invalid definition of a batch, keyed by definition name.
#[derive(Debug, Clone, Default, PartialEq, Eq, thiserror::Error)]
#[error("{} invalid definition(s): {}", .errors.len(), render(.errors))]
pub struct ValidationErrors {
    errors: IndexMap<String, ConfigurationError>,
}

fn render(errors: &IndexMap<String, ConfigurationError>) -> String {
    errors
        .values()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" | ")
}

impl ValidationErrors {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ConfigurationError> {
        self.errors.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ConfigurationError)> {
        self.errors.iter().map(|(name, err)| (name.as_str(), err))
    }

    /// `name -> message` pairs in batch order.
    #[must_use]
    pub fn messages(&self) -> IndexMap<String, String> {
        self.errors
            .iter()
            .map(|(name, err)| (name.clone(), err.to_string()))
            .collect()
    }
}

/// A definition with its final entity selection, ready to be serialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedDefinition {
    pub name: String,
    pub filename: String,
    pub format: DataFormat,
    pub entity_labels: Vec<String>,
    pub exclude_labels: Vec<String>,
    pub natural_foreign: bool,
    pub natural_primary: bool,
    pub comment: Option<String>,
    pub is_drain: bool,
}

impl ResolvedDefinition {
    /// Equivalent host dump command, for scripts and audit logs.
    ///
    /// Drains list no positional labels since they take everything not
    /// excluded.
    #[must_use]
    pub fn command_line(&self, output: &str) -> String {
        let mut parts = vec!["dumpdata".to_string()];
        if !self.is_drain {
            parts.extend(self.entity_labels.iter().cloned());
        }
        if self.natural_foreign {
            parts.push("--natural-foreign".to_string());
        }
        if self.natural_primary {
            parts.push("--natural-primary".to_string());
        }
        parts.extend(
            self.exclude_labels
                .iter()
                .map(|label| format!("--exclude={label}")),
        );
        parts.push(format!("--format={}", self.format));
        parts.push(format!("--output={output}"));
        parts.join(" ")
    }
}

/// The ordered set of definitions of one build.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DefinitionBatch {
    definitions: Vec<SelectionDefinition>,
}

impl DefinitionBatch {
    /// Builds the batch from `(name, options)` pairs, rejecting duplicate names.
    pub fn new<I, S>(declarations: I) -> Result<Self, SelectionError>
    where
        I: IntoIterator<Item = (S, DefinitionOptions)>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let mut definitions = Vec::new();
        for (name, options) in declarations {
            let name = name.into();
            if !seen.insert(name.clone()) {
                return Err(SelectionError::DuplicateName { name });
            }
            definitions.push(SelectionDefinition::new(name, options));
        }
        Ok(Self { definitions })
    }

    /// Parses a JSON array of `[name, options]` pairs.
    pub fn from_json(contents: &str) -> Result<Self, SelectionError> {
        let declarations: Vec<(String, DefinitionOptions)> = serde_json::from_str(contents)?;
        Self::new(declarations)
    }

    #[must_use]
    pub fn definitions(&self) -> &[SelectionDefinition] {
        &self.definitions
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Non-drain definitions first, then drains, each group in batch order.
    pub fn ordered(&self) -> impl Iterator<Item = &SelectionDefinition> {
        self.definitions
            .iter()
            .filter(|definition| !definition.is_drain())
            .chain(
                self.definitions
                    .iter()
                    .filter(|definition| definition.is_drain()),
            )
    }

    pub fn validate(&self, registry: &EntityRegistry) -> Result<(), ValidationErrors> {
        let resolver = LabelResolver::new(registry);
        let mut errors = ValidationErrors::default();
        let mut filenames: HashMap<&str, &str> = HashMap::new();
        for definition in &self.definitions {
            let mut issues = match definition.validate(&resolver) {
                Ok(()) => Vec::new(),
                Err(err) => err.issues,
            };
            match filenames.get(definition.filename()) {
                Some(other) => issues.push(DefinitionIssue::DuplicateFilename {
                    filename: definition.filename().to_string(),
                    other: (*other).to_string(),
                }),
                None => {
                    filenames.insert(definition.filename(), definition.name());
                }
            }
            if !issues.is_empty() {
                let err = ConfigurationError {
                    name: definition.name().to_string(),
                    issues,
                };
                tracing::debug!(definition = %definition.name(), %err, "definition rejected");
                errors.errors.insert(definition.name().to_string(), err);
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Entity labels `drain` must leave alone, in merge order.
    ///
    /// Each non-drain definition contributes its retention when the drain
    /// accepts exclusions, or its whole resolved footprint otherwise. The
    /// drain's own excludes come last.
    pub fn drain_excludes(
        &self,
        drain: &SelectionDefinition,
        resolver: &LabelResolver<'_>,
    ) -> Result<Vec<String>, SelectionError> {
        let mut merged: IndexSet<String> = IndexSet::new();
        for definition in self.definitions.iter().filter(|d| !d.is_drain()) {
            let wrap = |source| SelectionError::Resolution {
                name: definition.name().to_string(),
                source,
            };
            let protected = if drain.drain_accepts_exclusions() {
                definition.retention(resolver).map_err(wrap)?
            } else {
                let mut footprint = definition.resolved_includes(resolver).map_err(wrap)?;
                footprint.extend(definition.resolved_excludes(resolver).map_err(wrap)?);
                footprint
            };
            merged.extend(protected.into_iter().map(|e| e.label().to_string()));
        }
        merged.extend(drain.excludes().iter().cloned());
        Ok(merged.into_iter().collect())
    }

    /// Validates the batch then resolves every definition in build order.
    pub fn resolve(
        &self,
        registry: &EntityRegistry,
    ) -> Result<Vec<ResolvedDefinition>, SelectionError> {
        self.validate(registry)?;
        let resolver = LabelResolver::new(registry);

        let mut resolved = Vec::with_capacity(self.definitions.len());
        for definition in self.ordered() {
            let (entity_labels, exclude_labels) = if definition.is_drain() {
                let excludes = self.drain_excludes(definition, &resolver)?;
                let skip: HashSet<&str> = excludes.iter().map(String::as_str).collect();
                let entities = registry
                    .entities()
                    .filter(|entity| !skip.contains(entity.label()))
                    .map(|entity| entity.label().to_string())
                    .collect();
                (entities, excludes)
            } else {
                let entities = definition
                    .resolved_includes(&resolver)
                    .map_err(|source| SelectionError::Resolution {
                        name: definition.name().to_string(),
                        source,
                    })?
                    .into_iter()
                    .map(|entity| entity.label().to_string())
                    .collect();
                let excludes: IndexSet<String> = definition.excludes().iter().cloned().collect();
                (entities, excludes.into_iter().collect())
            };

            let Some(format) = definition.format() else {
                // validate() rejects unsupported extensions.
                continue;
            };
            tracing::debug!(
                definition = %definition.name(),
                entities = ?entity_labels,
                excludes = ?exclude_labels,
                "definition resolved"
            );
            resolved.push(ResolvedDefinition {
                name: definition.name().to_string(),
                filename: definition.filename().to_string(),
                format,
                entity_labels,
                exclude_labels,
                natural_foreign: definition.natural_foreign(),
                natural_primary: definition.natural_primary(),
                comment: definition.comment().map(ToString::to_string),
                is_drain: definition.is_drain(),
            });
        }
        Ok(resolved)
    }
}
