//! Seam to the host's own record dump and load primitives.

use std::path::Path;

use cistern_domain::{DataFormat, ResolvedDefinition};

/// Inputs of one dump call.
#[derive(Debug, Clone, Copy)]
pub struct DumpRequest<'a> {
    pub name: &'a str,
    pub entity_labels: &'a [String],
    pub exclude_labels: &'a [String],
    pub natural_foreign: bool,
    pub natural_primary: bool,
    pub format: DataFormat,
    pub output: &'a Path,
}

impl<'a> DumpRequest<'a> {
    #[must_use]
    pub fn for_definition(definition: &'a ResolvedDefinition, output: &'a Path) -> Self {
        Self {
            name: &definition.name,
            entity_labels: &definition.entity_labels,
            exclude_labels: &definition.exclude_labels,
            natural_foreign: definition.natural_foreign,
            natural_primary: definition.natural_primary,
            format: definition.format,
            output,
        }
    }
}

/// What a dump call produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DumpPayload {
    /// The serializer wrote `DumpRequest::output` itself.
    Written,
    /// The serializer returned the content; the caller writes it out.
    Bytes(Vec<u8>),
}

/// Inputs of one load call.
#[derive(Debug, Clone, Copy)]
pub struct LoadRequest<'a> {
    pub path: &'a Path,
    pub format: Option<DataFormat>,
    pub exclude_labels: &'a [String],
    /// Tolerate fields and entities the host schema no longer knows.
    pub ignore_unknown: bool,
}

pub trait DataSerializer {
    fn serialize(&self, request: &DumpRequest<'_>) -> anyhow::Result<DumpPayload>;

    /// Loads one data file and returns the host's summary output.
    fn deserialize(&self, request: &LoadRequest<'_>) -> anyhow::Result<String>;
}

/// Equivalent host load command for a data file, for scripts and audit logs.
#[must_use]
pub fn load_command_line(request: &LoadRequest<'_>) -> String {
    let mut parts = vec!["loaddata".to_string()];
    if request.ignore_unknown {
        parts.push("--ignorenonexistent".to_string());
    }
    parts.extend(
        request
            .exclude_labels
            .iter()
            .map(|label| format!("--exclude={label}")),
    );
    parts.push(request.path.display().to_string());
    parts.join(" ")
}
