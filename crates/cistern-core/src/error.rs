use std::io;
use std::path::{Path, PathBuf};

use cistern_domain::SelectionError;

use crate::walker::StorageIssues;

/// Failed integrity checks on an archive or its payload.
#[derive(Debug, thiserror::Error)]
pub enum IntegrityError {
    #[error("archive checksum mismatch (expected {expected}, got {actual}): archive probably corrupted")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("archive has no manifest at {}", .path.display())]
    ManifestMissing { path: PathBuf },
    #[error("archive manifest {} is not valid JSON: {reason}", .path.display())]
    ManifestUnreadable { path: PathBuf, reason: String },
    #[error("archive manifest is missing the required '{field}' field")]
    ManifestField { field: &'static str },
    #[error("archive manifest entry '{entry}' must be a relative path inside the archive")]
    UnsafeEntry { entry: String },
    #[error("{kind} source missing from archive payload: '{entry}'")]
    SourceMissing { kind: &'static str, entry: String },
}

impl IntegrityError {
    /// Short identifier of the check that failed.
    #[must_use]
    pub fn check(&self) -> &'static str {
        match self {
            Self::ChecksumMismatch { .. } => "checksum",
            Self::ManifestMissing { .. } => "manifest_missing",
            Self::ManifestUnreadable { .. } => "manifest_unreadable",
            Self::ManifestField { .. } => "manifest_field",
            Self::UnsafeEntry { .. } => "manifest_entry",
            Self::SourceMissing { .. } => "payload_source",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error(transparent)]
    Selection(#[from] SelectionError),
    #[error(transparent)]
    Storages(#[from] StorageIssues),
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("serializer failed for '{name}': {source}")]
    Serializer {
        name: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to acquire archive '{reference}': {source}")]
    Acquire {
        reference: String,
        #[source]
        source: anyhow::Error,
    },
}

impl ArchiveError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn at(action: &str, path: &Path) -> impl FnOnce(io::Error) -> Self {
        let context = format!("failed to {action} {}", path.display());
        move |source| Self::Io { context, source }
    }
}

pub type Result<T, E = ArchiveError> = std::result::Result<T, E>;
