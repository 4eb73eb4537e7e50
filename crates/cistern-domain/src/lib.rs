#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]

//! Entity registry, label resolution and selection definitions.

pub mod labels;
pub mod registry;
pub mod selection;

pub use labels::{labels_of, malformed_labels, Label, LabelError, LabelResolver, UnknownLabels};
pub use registry::{ApplicationEntry, ApplicationSpec, EntityGroup, EntityRegistry, RegistryError};
pub use selection::{
    ConfigurationError, DataFormat, DefinitionBatch, DefinitionIssue, DefinitionOptions,
    ResolvedDefinition, SelectionDefinition, SelectionError, ValidationErrors,
};
