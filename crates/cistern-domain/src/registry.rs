//! In-memory index of the host's applications and their entity groups.
//!
//! The registry is built once from the host's application listing and then
//! shared by reference with the resolver, the selection definitions and the
//! archive builder. It never reflects changes made to the host after
//! construction.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::labels::LabelError;

/// Upper bound (exclusive) on the number of entity groups per application,
/// so `app_index * ENTITY_SLOTS + entity_index` stays a total order.
pub const ENTITY_SLOTS: u64 = 10_000;

const SORT_KEY_WIDTH: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("application label '{label}' is invalid: labels must be non-empty and contain no dot")]
    InvalidApplicationLabel { label: String },
    #[error("entity name '{name}' in application '{application}' is invalid: names must be non-empty and contain no dot")]
    InvalidEntityName { application: String, name: String },
    #[error("application '{application}' declares {count} entity groups, the registry supports at most {max}")]
    TooManyEntities {
        application: String,
        count: usize,
        max: u64,
    },
    #[error("failed to parse application descriptor: {0}")]
    Descriptor(#[from] serde_json::Error),
}

/// One serializable unit of host data (typically a table).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct EntityGroup {
    application: String,
    name: String,
    label: String,
    sequence: u64,
}

impl EntityGroup {
    #[must_use]
    pub fn application(&self) -> &str {
        &self.application
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fully qualified `app.entity` label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Zero-padded rendering of [`Self::sequence`]; sorts lexically in registry order.
    #[must_use]
    pub fn sort_key(&self) -> String {
        format!("{:0width$}", self.sequence, width = SORT_KEY_WIDTH)
    }
}

/// Host-provided description of one application, as exported by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationSpec {
    pub label: String,
    #[serde(default)]
    pub verbose_name: Option<String>,
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub entities: Vec<String>,
}

impl ApplicationSpec {
    pub fn new<I, S>(label: impl Into<String>, entities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            label: label.into(),
            verbose_name: None,
            source_id: None,
            entities: entities.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ApplicationEntry {
    label: String,
    verbose_name: String,
    source_id: String,
    entities: Vec<EntityGroup>,
}

impl ApplicationEntry {
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub fn verbose_name(&self) -> &str {
        &self.verbose_name
    }

    #[must_use]
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Entity groups of this application in registry order.
    #[must_use]
    pub fn entities(&self) -> &[EntityGroup] {
        &self.entities
    }
}

/// Ordered snapshot of every application and entity group known to the host.
#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
    applications: Vec<ApplicationEntry>,
    by_application: HashMap<String, Vec<usize>>,
    by_entity: HashMap<String, Vec<(usize, usize)>>,
}

impl EntityRegistry {
    /// Builds the registry, assigning sequence keys in declaration order.
    pub fn new<I>(specs: I) -> Result<Self, RegistryError>
    where
        I: IntoIterator<Item = ApplicationSpec>,
    {
        let mut registry = Self::default();
        for (app_index, spec) in specs.into_iter().enumerate() {
            if !is_label_segment(&spec.label) {
                return Err(RegistryError::InvalidApplicationLabel { label: spec.label });
            }
            if spec.entities.len() as u64 >= ENTITY_SLOTS {
                return Err(RegistryError::TooManyEntities {
                    application: spec.label,
                    count: spec.entities.len(),
                    max: ENTITY_SLOTS - 1,
                });
            }

            let mut entities = Vec::with_capacity(spec.entities.len());
            for (entity_index, name) in spec.entities.into_iter().enumerate() {
                if !is_label_segment(&name) {
                    return Err(RegistryError::InvalidEntityName {
                        application: spec.label,
                        name,
                    });
                }
                let label = format!("{}.{name}", spec.label);
                registry
                    .by_entity
                    .entry(label.clone())
                    .or_default()
                    .push((app_index, entity_index));
                entities.push(EntityGroup {
                    application: spec.label.clone(),
                    name,
                    label,
                    sequence: app_index as u64 * ENTITY_SLOTS + entity_index as u64,
                });
            }

            registry
                .by_application
                .entry(spec.label.clone())
                .or_default()
                .push(app_index);
            registry.applications.push(ApplicationEntry {
                verbose_name: spec.verbose_name.unwrap_or_else(|| spec.label.clone()),
                source_id: spec.source_id.unwrap_or_else(|| spec.label.clone()),
                label: spec.label,
                entities,
            });
        }

        tracing::debug!(
            applications = registry.applications.len(),
            entities = registry.by_entity.len(),
            "entity registry built"
        );
        Ok(registry)
    }

    /// Builds the registry from a JSON array of [`ApplicationSpec`] objects.
    pub fn from_json(contents: &str) -> Result<Self, RegistryError> {
        let specs: Vec<ApplicationSpec> = serde_json::from_str(contents)?;
        Self::new(specs)
    }

    pub fn applications(&self) -> impl Iterator<Item = &ApplicationEntry> {
        self.applications.iter()
    }

    pub fn lookup_application(&self, label: &str) -> Result<&ApplicationEntry, LabelError> {
        match self.by_application.get(label).map(Vec::as_slice) {
            None | Some([]) => Err(LabelError::UnknownApplication {
                label: label.to_string(),
            }),
            Some([index]) => Ok(&self.applications[*index]),
            Some(many) => Err(LabelError::AmbiguousApplication {
                label: label.to_string(),
                count: many.len(),
            }),
        }
    }

    pub fn lookup_entity(&self, label: &str) -> Result<&EntityGroup, LabelError> {
        match self.by_entity.get(label).map(Vec::as_slice) {
            None | Some([]) => Err(LabelError::UnknownEntity {
                label: label.to_string(),
            }),
            Some([(app, entity)]) => Ok(&self.applications[*app].entities[*entity]),
            Some(many) => Err(LabelError::AmbiguousEntity {
                label: label.to_string(),
                count: many.len(),
            }),
        }
    }

    /// Every entity group in registry order.
    pub fn entities(&self) -> impl Iterator<Item = &EntityGroup> {
        self.applications
            .iter()
            .flat_map(|app| app.entities.iter())
    }

    #[must_use]
    pub fn all_entity_labels(&self) -> Vec<String> {
        self.entities().map(|entity| entity.label.clone()).collect()
    }

    pub fn entity_labels_of(&self, application: &str) -> Result<Vec<String>, LabelError> {
        Ok(self
            .lookup_application(application)?
            .entities
            .iter()
            .map(|entity| entity.label.clone())
            .collect())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.applications.is_empty()
    }
}

fn is_label_segment(value: &str) -> bool {
    !value.is_empty() && !value.contains('.')
}
