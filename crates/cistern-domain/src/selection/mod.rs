//! Selection definitions: one named unit of data to dump, and its validation.

mod batch;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::labels::{malformed_labels, Label, LabelError, LabelResolver};
use crate::registry::EntityGroup;

pub use batch::{DefinitionBatch, ResolvedDefinition, SelectionError, ValidationErrors};

/// Serialization dialect selected by the output filename extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataFormat {
    Json,
    Jsonl,
    Xml,
    Yaml,
}

impl DataFormat {
    pub const ALL: [DataFormat; 4] = [Self::Json, Self::Jsonl, Self::Xml, Self::Yaml];

    #[must_use]
    pub fn from_filename(filename: &str) -> Option<Self> {
        let (_, extension) = filename.rsplit_once('.')?;
        Self::ALL
            .into_iter()
            .find(|format| format.as_str() == extension)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Jsonl => "jsonl",
            Self::Xml => "xml",
            Self::Yaml => "yaml",
        }
    }
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User declared options of a definition, before validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefinitionOptions {
    pub includes: Vec<String>,
    pub excludes: Vec<String>,
    /// Output filename; defaults to `<name>.json` when empty.
    pub filename: String,
    pub natural_foreign: bool,
    pub natural_primary: bool,
    pub comment: Option<String>,
    pub is_drain: bool,
    /// Let drains take this definition's excluded entities. Ignored for drains.
    pub allow_drain: bool,
    /// Drain only: honor `allow_drain` of the other definitions.
    pub drain_accepts_exclusions: bool,
}

/// A single problem found while validating a definition.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum DefinitionIssue {
    #[error("name must not be empty")]
    EmptyName,
    #[error("includes must not be empty unless the definition is a drain")]
    MissingIncludes,
    #[error("output filename '{filename}' must end with one of: json, jsonl, xml, yaml")]
    UnsupportedFormat { filename: String },
    #[error("output filename '{filename}' must be a bare file name")]
    NestedFilename { filename: String },
    #[error("output filename '{filename}' is already used by definition '{other}'")]
    DuplicateFilename { filename: String, other: String },
    #[error("exclude labels must be fully qualified 'app.entity': {}", .labels.join(", "))]
    UnqualifiedExcludes { labels: Vec<String> },
    #[error("malformed labels: {}", .labels.join(", "))]
    MalformedLabels { labels: Vec<String> },
    #[error("unknown applications: {}", .labels.join(", "))]
    UnknownApplications { labels: Vec<String> },
    #[error("unknown entities: {}", .labels.join(", "))]
    UnknownEntities { labels: Vec<String> },
    #[error(transparent)]
    Label(#[from] LabelError),
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("definition '{name}' is invalid: {}", render_issues(.issues))]
pub struct ConfigurationError {
    pub name: String,
    pub issues: Vec<DefinitionIssue>,
}

fn render_issues(issues: &[DefinitionIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelectionDefinition {
    name: String,
    includes: Vec<String>,
    excludes: Vec<String>,
    filename: String,
    natural_foreign: bool,
    natural_primary: bool,
    comment: Option<String>,
    is_drain: bool,
    allow_drain: bool,
    drain_accepts_exclusions: bool,
}

impl SelectionDefinition {
    #[must_use]
    pub fn new(name: impl Into<String>, options: DefinitionOptions) -> Self {
        let name = name.into();
        let filename = if options.filename.is_empty() {
            format!("{name}.json")
        } else {
            options.filename
        };
        let includes = if options.is_drain {
            if !options.includes.is_empty() {
                tracing::debug!(definition = %name, "ignoring includes declared on a drain");
            }
            Vec::new()
        } else {
            options.includes
        };
        Self {
            name,
            includes,
            excludes: options.excludes,
            filename,
            natural_foreign: options.natural_foreign,
            natural_primary: options.natural_primary,
            comment: options.comment,
            is_drain: options.is_drain,
            allow_drain: options.allow_drain && !options.is_drain,
            drain_accepts_exclusions: options.drain_accepts_exclusions && options.is_drain,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn includes(&self) -> &[String] {
        &self.includes
    }

    #[must_use]
    pub fn excludes(&self) -> &[String] {
        &self.excludes
    }

    #[must_use]
    pub fn filename(&self) -> &str {
        &self.filename
    }

    #[must_use]
    pub fn format(&self) -> Option<DataFormat> {
        DataFormat::from_filename(&self.filename)
    }

    #[must_use]
    pub fn natural_foreign(&self) -> bool {
        self.natural_foreign
    }

    #[must_use]
    pub fn natural_primary(&self) -> bool {
        self.natural_primary
    }

    #[must_use]
    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    #[must_use]
    pub fn is_drain(&self) -> bool {
        self.is_drain
    }

    #[must_use]
    pub fn allow_drain(&self) -> bool {
        self.allow_drain
    }

    #[must_use]
    pub fn drain_accepts_exclusions(&self) -> bool {
        self.drain_accepts_exclusions
    }

    /// Checks every invariant and reports all problems at once.
    pub fn validate(&self, resolver: &LabelResolver<'_>) -> Result<(), ConfigurationError> {
        let mut issues = Vec::new();

        if self.name.trim().is_empty() {
            issues.push(DefinitionIssue::EmptyName);
        }
        if self.format().is_none() {
            issues.push(DefinitionIssue::UnsupportedFormat {
                filename: self.filename.clone(),
            });
        }
        if self.filename.contains(['/', '\\']) {
            issues.push(DefinitionIssue::NestedFilename {
                filename: self.filename.clone(),
            });
        }
        if !self.is_drain && self.includes.is_empty() {
            issues.push(DefinitionIssue::MissingIncludes);
        }

        let unqualified: Vec<String> = self
            .excludes
            .iter()
            .filter(|label| matches!(Label::parse(label), Ok(Label::Application(_))))
            .cloned()
            .collect();
        if !unqualified.is_empty() {
            issues.push(DefinitionIssue::UnqualifiedExcludes {
                labels: unqualified,
            });
        }

        let all_labels: Vec<&String> = self.includes.iter().chain(&self.excludes).collect();
        let malformed = malformed_labels(&all_labels);
        if !malformed.is_empty() {
            issues.push(DefinitionIssue::MalformedLabels { labels: malformed });
        }

        let unknown = resolver.check_unknown_labels(&all_labels);
        if !unknown.applications.is_empty() {
            issues.push(DefinitionIssue::UnknownApplications {
                labels: unknown.applications,
            });
        }
        if !unknown.entities.is_empty() {
            issues.push(DefinitionIssue::UnknownEntities {
                labels: unknown.entities,
            });
        }

        // Ambiguity only surfaces through a full resolution.
        if issues.is_empty() && !self.is_drain {
            if let Err(err) = resolver.resolve_exclusions(&self.includes, &self.excludes) {
                issues.push(err.into());
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ConfigurationError {
                name: self.name.clone(),
                issues,
            })
        }
    }

    /// Entities selected by the explicit includes. Always empty for drains,
    /// whose selection depends on the rest of the batch.
    pub fn resolved_includes<'r>(
        &self,
        resolver: &LabelResolver<'r>,
    ) -> Result<Vec<&'r EntityGroup>, LabelError> {
        resolver.resolve_inclusions(&self.includes, &self.excludes)
    }

    pub fn resolved_excludes<'r>(
        &self,
        resolver: &LabelResolver<'r>,
    ) -> Result<Vec<&'r EntityGroup>, LabelError> {
        resolver.resolve_exclusions(&self.includes, &self.excludes)
    }

    /// Entities a drain may never take from this definition.
    pub fn retention<'r>(
        &self,
        resolver: &LabelResolver<'r>,
    ) -> Result<Vec<&'r EntityGroup>, LabelError> {
        let mut retained = self.resolved_includes(resolver)?;
        if !self.allow_drain {
            retained.extend(self.resolved_excludes(resolver)?);
        }
        Ok(retained)
    }
}
