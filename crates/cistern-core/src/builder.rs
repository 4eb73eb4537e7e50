//! Packs selected records and storage trees into one checksummed archive.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use cistern_domain::{DefinitionBatch, EntityRegistry, ResolvedDefinition};
use cistern_store::HashingWriter;
use flate2::{write::GzEncoder, Compression};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{ArchiveError, Result};
use crate::fsutil::{expand_features, move_path, set_mode};
use crate::manifest::{Manifest, DATA_DIRNAME, MANIFEST_FILENAME};
use crate::reporter::{Reporter, TRACING_REPORTER};
use crate::serializer::{DataSerializer, DumpPayload, DumpRequest};
use crate::walker::{archive_name, validate_storages, StorageWalker};

const PARTIAL_ARCHIVE: &str = "archive.partial";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    /// Directory the finished archive is published into.
    pub destination: PathBuf,
    /// Archive filename pattern; `{features}` is expanded.
    pub filename: String,
    pub with_data: bool,
    pub with_storages: bool,
    /// Storage roots; relative entries are taken from `storage_base`.
    pub storages: Vec<PathBuf>,
    pub storage_base: PathBuf,
    pub storage_excludes: Vec<String>,
    pub apply_storage_excludes: bool,
    pub dir_mode: Option<u32>,
    pub file_mode: Option<u32>,
    /// Parent of the private build workspace; system temp when unset.
    pub work_dir: Option<PathBuf>,
}

impl BuildRequest {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            destination: config.archive_dir.clone(),
            filename: config.archive_filename.clone(),
            with_data: true,
            with_storages: true,
            storages: Vec::new(),
            storage_base: config.storage_base.clone(),
            storage_excludes: config.storage_excludes.clone(),
            apply_storage_excludes: true,
            dir_mode: config.dir_mode,
            file_mode: config.file_mode,
            work_dir: None,
        }
    }

    #[must_use]
    pub fn archive_filename(&self) -> String {
        expand_features(&self.filename, self.with_data, self.with_storages)
    }

    fn storage_roots(&self) -> Vec<PathBuf> {
        self.storages
            .iter()
            .map(|root| self.storage_base.join(root))
            .collect()
    }
}

/// What a build would do, computed without writing anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildPlan {
    pub archive: PathBuf,
    pub definitions: Vec<ResolvedDefinition>,
    pub commands: Vec<String>,
    pub storages: Vec<String>,
    pub storage_files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuiltArchive {
    pub path: PathBuf,
    /// Hex sha256 of the archive bytes.
    pub checksum: String,
    pub size: u64,
    pub manifest: Manifest,
}

/// Validated inputs of one build.
struct Prepared {
    definitions: Vec<ResolvedDefinition>,
    roots: Vec<PathBuf>,
    walker: StorageWalker,
}

pub struct ArchiveBuilder<'a> {
    registry: &'a EntityRegistry,
    serializer: &'a dyn DataSerializer,
    reporter: &'a dyn Reporter,
}

impl<'a> ArchiveBuilder<'a> {
    pub fn new(registry: &'a EntityRegistry, serializer: &'a dyn DataSerializer) -> Self {
        Self {
            registry,
            serializer,
            reporter: &TRACING_REPORTER,
        }
    }

    #[must_use]
    pub fn with_reporter(mut self, reporter: &'a dyn Reporter) -> Self {
        self.reporter = reporter;
        self
    }

    /// Validates the batch and storages and lists what a build would pack.
    pub fn plan(&self, batch: &DefinitionBatch, request: &BuildRequest) -> Result<BuildPlan> {
        let prepared = self
            .prepare(batch, request)
            .map_err(|err| self.reporter.critical(err))?;
        let commands = prepared
            .definitions
            .iter()
            .map(|definition| definition.command_line(&data_member(&definition.filename)))
            .collect();
        let storage_files = if request.with_storages {
            prepared
                .walker
                .iterate(&prepared.roots, &request.storage_base)
                .map(|file| file.map(|file| file.archive_name()))
                .collect::<Result<Vec<_>>>()
                .map_err(|err| self.reporter.critical(err))?
        } else {
            Vec::new()
        };
        Ok(BuildPlan {
            archive: request.destination.join(request.archive_filename()),
            definitions: prepared.definitions,
            commands,
            storages: storage_entries(&prepared.roots, &request.storage_base),
            storage_files,
        })
    }

    pub fn build(&self, batch: &DefinitionBatch, request: &BuildRequest) -> Result<BuiltArchive> {
        self.build_archive(batch, request)
            .map_err(|err| self.reporter.critical(err))
    }

    fn build_archive(&self, batch: &DefinitionBatch, request: &BuildRequest) -> Result<BuiltArchive> {
        let prepared = self.prepare(batch, request)?;

        let mut workspace = tempfile::Builder::new();
        workspace.prefix("cistern-build-");
        let workspace = match &request.work_dir {
            Some(dir) => workspace.tempdir_in(dir),
            None => workspace.tempdir(),
        }
        .map_err(|err| ArchiveError::io("failed to create build workspace", err))?;
        tracing::debug!(workspace = %workspace.path().display(), "build workspace created");

        let outcome = self.build_in(workspace.path(), &prepared, request);
        let cleanup = workspace.close();
        match (outcome, cleanup) {
            (Ok(built), Ok(())) => Ok(built),
            (Ok(_), Err(err)) => Err(ArchiveError::io("failed to remove build workspace", err)),
            (Err(err), Err(cleanup_err)) => {
                tracing::warn!(error = %cleanup_err, "failed to remove build workspace");
                Err(err)
            }
            (Err(err), Ok(())) => Err(err),
        }
    }

    fn prepare(&self, batch: &DefinitionBatch, request: &BuildRequest) -> Result<Prepared> {
        if !request.with_data && !request.with_storages {
            return Err(ArchiveError::Configuration(
                "nothing to build: data and storages are both disabled".into(),
            ));
        }
        let definitions = if request.with_data {
            batch.resolve(self.registry)?
        } else {
            Vec::new()
        };
        let roots = if request.with_storages {
            let roots = request.storage_roots();
            validate_storages(&roots, &request.storage_base)?;
            roots
        } else {
            Vec::new()
        };
        let walker = if request.apply_storage_excludes {
            StorageWalker::new(request.storage_excludes.iter().cloned())?
        } else {
            StorageWalker::without_excludes()
        };
        Ok(Prepared {
            definitions,
            roots,
            walker,
        })
    }

    fn build_in(
        &self,
        workspace: &Path,
        prepared: &Prepared,
        request: &BuildRequest,
    ) -> Result<BuiltArchive> {
        let datas = if request.with_data {
            Some(self.serialize_data(workspace, &prepared.definitions)?)
        } else {
            None
        };
        let storages = request
            .with_storages
            .then(|| storage_entries(&prepared.roots, &request.storage_base));

        let manifest = Manifest::new(datas, storages)?;
        let manifest_path = manifest.write(workspace)?;

        let partial = workspace.join(PARTIAL_ARCHIVE);
        let (checksum, size) = self.package(&partial, workspace, &manifest_path, prepared, request)?;

        let path = self.publish(&partial, request)?;
        self.reporter.info(&format!(
            "archive written to {} ({size} bytes, sha256 {checksum})",
            path.display()
        ));
        Ok(BuiltArchive {
            path,
            checksum,
            size,
            manifest,
        })
    }

    fn serialize_data(
        &self,
        workspace: &Path,
        definitions: &[ResolvedDefinition],
    ) -> Result<Vec<String>> {
        let data_dir = workspace.join(DATA_DIRNAME);
        fs::create_dir_all(&data_dir).map_err(ArchiveError::at("create", &data_dir))?;

        let mut produced = Vec::with_capacity(definitions.len());
        for definition in definitions {
            let output = data_dir.join(&definition.filename);
            self.reporter.info(&format!(
                "dumping '{}' into {}",
                definition.name, definition.filename
            ));
            self.reporter
                .debug(&definition.command_line(&data_member(&definition.filename)));

            let serializer_error = |source| ArchiveError::Serializer {
                name: definition.name.clone(),
                source,
            };
            let payload = self
                .serializer
                .serialize(&DumpRequest::for_definition(definition, &output))
                .map_err(serializer_error)?;
            match payload {
                DumpPayload::Bytes(bytes) => {
                    fs::write(&output, bytes).map_err(ArchiveError::at("write", &output))?;
                }
                DumpPayload::Written if output.is_file() => {}
                DumpPayload::Written => {
                    return Err(serializer_error(anyhow::anyhow!(
                        "no output was written to {}",
                        output.display()
                    )));
                }
            }
            produced.push(definition.filename.clone());
        }
        Ok(produced)
    }

    /// Streams data files, storage trees and the manifest into a gzip tar.
    fn package(
        &self,
        partial: &Path,
        workspace: &Path,
        manifest_path: &Path,
        prepared: &Prepared,
        request: &BuildRequest,
    ) -> Result<(String, u64)> {
        let file = File::create(partial).map_err(ArchiveError::at("create", partial))?;
        let encoder = GzEncoder::new(HashingWriter::new(file), Compression::default());
        let mut tar = tar::Builder::new(encoder);
        tar.follow_symlinks(false);
        let packing = |err| ArchiveError::io(format!("failed to pack {}", partial.display()), err);

        for definition in &prepared.definitions {
            let source = workspace.join(DATA_DIRNAME).join(&definition.filename);
            tar.append_path_with_name(&source, data_member(&definition.filename))
                .map_err(packing)?;
        }

        let mut packed = 0usize;
        if request.with_storages {
            for root in &prepared.roots {
                let relative = root.strip_prefix(&request.storage_base).unwrap_or(root.as_path());
                tar.append_dir(archive_name(relative), root).map_err(packing)?;
            }
            for file in prepared.walker.iterate(&prepared.roots, &request.storage_base) {
                let file = file?;
                tar.append_path_with_name(&file.path, file.archive_name())
                    .map_err(packing)?;
                packed += 1;
            }
        }
        tar.append_path_with_name(manifest_path, MANIFEST_FILENAME)
            .map_err(packing)?;

        let encoder = tar.into_inner().map_err(packing)?;
        let writer = encoder.finish().map_err(packing)?;
        let (file, checksum, size) = writer.finish();
        file.sync_all().map_err(packing)?;
        tracing::debug!(
            archive = %partial.display(),
            storage_files = packed,
            bytes = size,
            "archive packed"
        );
        Ok((checksum, size))
    }

    fn publish(&self, partial: &Path, request: &BuildRequest) -> Result<PathBuf> {
        let destination = &request.destination;
        if !destination.is_dir() {
            fs::create_dir_all(destination).map_err(ArchiveError::at("create", destination))?;
            set_mode(destination, request.dir_mode)
                .map_err(ArchiveError::at("set permissions on", destination))?;
        }
        let target = destination.join(request.archive_filename());
        move_path(partial, &target).map_err(ArchiveError::at("publish archive to", &target))?;
        set_mode(&target, request.file_mode)
            .map_err(ArchiveError::at("set permissions on", &target))?;
        Ok(target)
    }
}

fn data_member(filename: &str) -> String {
    format!("{DATA_DIRNAME}/{filename}")
}

fn storage_entries(roots: &[PathBuf], base: &Path) -> Vec<String> {
    roots
        .iter()
        .map(|root| archive_name(root.strip_prefix(base).unwrap_or(root.as_path())))
        .collect()
}
