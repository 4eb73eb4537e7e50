#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions
)]

//! Archive build and deploy pipeline.
//!
//! [`ArchiveBuilder`] serializes a validated [`DefinitionBatch`] and a set of
//! storage trees into one gzip tar with a `manifest.json` at its root.
//! [`ArchiveDeployer`] restores such an archive using only that manifest.

pub mod builder;
pub mod config;
pub mod deployer;
pub mod error;
pub mod fsutil;
pub mod manifest;
pub mod reporter;
pub mod serializer;
pub mod walker;

pub use builder::{ArchiveBuilder, BuildPlan, BuildRequest, BuiltArchive};
pub use config::Config;
pub use deployer::{
    ArchiveDeployer, DeployReport, DeployRequest, DeployedStorage, LoadedData, SkippedData,
};
pub use error::{ArchiveError, IntegrityError, Result};
pub use fsutil::expand_features;
pub use manifest::{Manifest, DATA_DIRNAME, MANIFEST_FILENAME};
pub use reporter::{Reporter, TracingReporter};
pub use serializer::{load_command_line, DataSerializer, DumpPayload, DumpRequest, LoadRequest};
pub use walker::{validate_storages, StorageFile, StorageIssue, StorageIssues, StorageWalker};

pub use cistern_domain::{
    DataFormat, DefinitionBatch, DefinitionOptions, EntityRegistry, ResolvedDefinition,
};
