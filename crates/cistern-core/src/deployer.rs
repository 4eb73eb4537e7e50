//! Restores an archive's storage trees and data using only its manifest.

use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};

use cistern_domain::DataFormat;
use cistern_store::{compute_sha256, download_archive, ArchiveLocation};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};

use crate::config::{Config, DEFAULT_MIN_DATA_SIZE};
use crate::error::{ArchiveError, IntegrityError, Result};
use crate::fsutil::{move_path, remove_existing};
use crate::manifest::{Manifest, DATA_DIRNAME};
use crate::reporter::{Reporter, TRACING_REPORTER};
use crate::serializer::{load_command_line, DataSerializer, LoadRequest};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployRequest {
    /// Local path, `file://` URL or `http(s)://` URL of the archive.
    pub archive: String,
    /// Expected hex sha256; a mismatch aborts before extraction.
    pub checksum: Option<String>,
    pub verify_checksum: bool,
    /// Keep the archive after a successful extraction instead of deleting it.
    pub keep_archive: bool,
    pub download_dir: PathBuf,
    pub with_data: bool,
    pub with_storages: bool,
    /// Storage trees are restored relative to this directory.
    pub storage_base: PathBuf,
    /// Data filenames to skip.
    pub data_excludes: Vec<String>,
    /// Entity labels the deserializer should skip.
    pub entity_excludes: Vec<String>,
    /// Data files at or under this many bytes are skipped.
    pub min_data_size: u64,
    pub ignore_unknown: bool,
    /// Parent of the private extraction directory; system temp when unset.
    pub work_dir: Option<PathBuf>,
}

impl DeployRequest {
    #[must_use]
    pub fn new(archive: impl Into<String>, config: &Config) -> Self {
        Self {
            archive: archive.into(),
            checksum: None,
            verify_checksum: config.verify_checksum,
            keep_archive: false,
            download_dir: config.download_dir.clone(),
            with_data: true,
            with_storages: true,
            storage_base: config.storage_base.clone(),
            data_excludes: Vec::new(),
            entity_excludes: Vec::new(),
            min_data_size: config.min_data_size,
            ignore_unknown: false,
            work_dir: None,
        }
    }
}

impl Default for DeployRequest {
    fn default() -> Self {
        Self {
            archive: String::new(),
            checksum: None,
            verify_checksum: true,
            keep_archive: false,
            download_dir: std::env::temp_dir(),
            with_data: true,
            with_storages: true,
            storage_base: PathBuf::from("."),
            data_excludes: Vec::new(),
            entity_excludes: Vec::new(),
            min_data_size: DEFAULT_MIN_DATA_SIZE,
            ignore_unknown: false,
            work_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeployedStorage {
    pub source: String,
    pub destination: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadedData {
    pub filename: String,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedData {
    pub filename: String,
    pub reason: String,
}

/// Outcome of a deploy, for caller-side audit logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeployReport {
    pub checksum: Option<String>,
    pub manifest: Manifest,
    pub storages: Vec<DeployedStorage>,
    pub data: Vec<LoadedData>,
    pub skipped: Vec<SkippedData>,
}

/// An archive on local disk, and whether this deploy downloaded it.
struct Acquired {
    path: PathBuf,
    downloaded: bool,
}

pub struct ArchiveDeployer<'a> {
    serializer: &'a dyn DataSerializer,
    reporter: &'a dyn Reporter,
}

impl<'a> ArchiveDeployer<'a> {
    pub fn new(serializer: &'a dyn DataSerializer) -> Self {
        Self {
            serializer,
            reporter: &TRACING_REPORTER,
        }
    }

    #[must_use]
    pub fn with_reporter(mut self, reporter: &'a dyn Reporter) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn deploy(&self, request: &DeployRequest) -> Result<DeployReport> {
        self.deploy_archive(request)
            .map_err(|err| self.reporter.critical(err))
    }

    fn deploy_archive(&self, request: &DeployRequest) -> Result<DeployReport> {
        let archive = self.acquire(request)?;
        let checksum = match self.verify(&archive.path, request) {
            Ok(checksum) => checksum,
            Err(err) => {
                self.discard_download(&archive, request);
                return Err(err);
            }
        };

        let mut workspace = tempfile::Builder::new();
        workspace.prefix("cistern-deploy-");
        let workspace = match &request.work_dir {
            Some(dir) => workspace.tempdir_in(dir),
            None => workspace.tempdir(),
        }
        .map_err(|err| ArchiveError::io("failed to create extraction directory", err));
        let workspace = match workspace {
            Ok(workspace) => workspace,
            Err(err) => {
                self.discard_download(&archive, request);
                return Err(err);
            }
        };

        let extracted = extract(&archive.path, workspace.path());
        if extracted.is_ok() {
            self.dispose(&archive, request);
        } else {
            self.discard_download(&archive, request);
        }
        let outcome = extracted.and_then(|()| self.deploy_from(workspace.path(), checksum, request));
        let cleanup = workspace.close();
        match (outcome, cleanup) {
            (Ok(report), Ok(())) => Ok(report),
            (Ok(_), Err(err)) => Err(ArchiveError::io("failed to remove extraction directory", err)),
            (Err(err), Err(cleanup_err)) => {
                tracing::warn!(error = %cleanup_err, "failed to remove extraction directory");
                Err(err)
            }
            (Err(err), Ok(())) => Err(err),
        }
    }

    fn acquire(&self, request: &DeployRequest) -> Result<Acquired> {
        match ArchiveLocation::parse(&request.archive) {
            ArchiveLocation::Local(path) => {
                if !path.is_file() {
                    return Err(ArchiveError::io(
                        format!("archive {} not found", path.display()),
                        std::io::ErrorKind::NotFound.into(),
                    ));
                }
                Ok(Acquired {
                    path,
                    downloaded: false,
                })
            }
            ArchiveLocation::Remote(url) => {
                self.reporter.info(&format!("downloading archive from {url}"));
                let downloaded =
                    download_archive(&url, &request.download_dir).map_err(|source| {
                        ArchiveError::Acquire {
                            reference: request.archive.clone(),
                            source,
                        }
                    })?;
                self.reporter.debug(&format!(
                    "downloaded {} bytes to {}",
                    downloaded.size,
                    downloaded.path.display()
                ));
                Ok(Acquired {
                    path: downloaded.path,
                    downloaded: true,
                })
            }
        }
    }

    /// Hashes the archive before anything is extracted from it.
    fn verify(&self, archive: &Path, request: &DeployRequest) -> Result<Option<String>> {
        if !request.verify_checksum {
            return Ok(None);
        }
        let actual = compute_sha256(archive).map_err(|source| ArchiveError::Acquire {
            reference: request.archive.clone(),
            source,
        })?;
        if let Some(expected) = &request.checksum {
            if !expected.eq_ignore_ascii_case(&actual) {
                return Err(IntegrityError::ChecksumMismatch {
                    expected: expected.clone(),
                    actual,
                }
                .into());
            }
            self.reporter.info(&format!("archive checksum verified ({actual})"));
        } else {
            self.reporter.info(&format!("archive checksum is {actual}"));
        }
        Ok(Some(actual))
    }

    /// Deletes the archive once it has been extracted, unless asked to keep it.
    fn dispose(&self, archive: &Acquired, request: &DeployRequest) {
        if request.keep_archive {
            return;
        }
        if let Err(err) = fs::remove_file(&archive.path) {
            self.reporter.warning(&format!(
                "failed to remove archive {}: {err}",
                archive.path.display()
            ));
        } else {
            self.reporter
                .debug(&format!("removed archive {}", archive.path.display()));
        }
    }

    /// A deploy that never got past extraction leaves local archives alone.
    fn discard_download(&self, archive: &Acquired, request: &DeployRequest) {
        if archive.downloaded {
            self.dispose(archive, request);
        }
    }

    fn deploy_from(
        &self,
        extracted: &Path,
        checksum: Option<String>,
        request: &DeployRequest,
    ) -> Result<DeployReport> {
        let manifest = Manifest::load(extracted)?;
        self.reporter.debug(&format!(
            "manifest version {} created {}",
            manifest.version, manifest.creation
        ));

        let storages = if request.with_storages {
            self.deploy_storages(extracted, &manifest, request)?
        } else {
            Vec::new()
        };
        let (data, skipped) = if request.with_data {
            self.deploy_data(extracted, &manifest, request)?
        } else {
            (Vec::new(), Vec::new())
        };
        Ok(DeployReport {
            checksum,
            manifest,
            storages,
            data,
            skipped,
        })
    }

    fn deploy_storages(
        &self,
        extracted: &Path,
        manifest: &Manifest,
        request: &DeployRequest,
    ) -> Result<Vec<DeployedStorage>> {
        let entries = manifest.storages.as_deref().unwrap_or_default();
        let mut deployed = Vec::with_capacity(entries.len());
        for entry in entries {
            let source = extracted.join(entry);
            if !source.exists() {
                return Err(IntegrityError::SourceMissing {
                    kind: "storage",
                    entry: entry.clone(),
                }
                .into());
            }
            let destination = request.storage_base.join(entry);
            remove_existing(&destination).map_err(ArchiveError::at("remove", &destination))?;
            move_path(&source, &destination)
                .map_err(ArchiveError::at("deploy storage to", &destination))?;
            self.reporter
                .info(&format!("storage '{entry}' deployed to {}", destination.display()));
            deployed.push(DeployedStorage {
                source: entry.clone(),
                destination,
            });
        }
        Ok(deployed)
    }

    fn deploy_data(
        &self,
        extracted: &Path,
        manifest: &Manifest,
        request: &DeployRequest,
    ) -> Result<(Vec<LoadedData>, Vec<SkippedData>)> {
        let data_dir = extracted.join(DATA_DIRNAME);
        let mut loaded = Vec::new();
        let mut skipped = Vec::new();
        for filename in manifest.datas.as_deref().unwrap_or_default() {
            let path = data_dir.join(filename);
            if request.data_excludes.iter().any(|excluded| excluded == filename) {
                self.skip(&mut skipped, filename, "excluded by filename".into());
                continue;
            }
            let size = match fs::metadata(&path) {
                Ok(meta) => meta.len(),
                Err(_) => {
                    return Err(IntegrityError::SourceMissing {
                        kind: "data",
                        entry: filename.clone(),
                    }
                    .into());
                }
            };
            if size <= request.min_data_size {
                self.skip(
                    &mut skipped,
                    filename,
                    format!(
                        "{size} bytes is at or under the {} byte minimum",
                        request.min_data_size
                    ),
                );
                continue;
            }

            let load = LoadRequest {
                path: &path,
                format: DataFormat::from_filename(filename),
                exclude_labels: &request.entity_excludes,
                ignore_unknown: request.ignore_unknown,
            };
            self.reporter.debug(&load_command_line(&load));
            let output = self
                .serializer
                .deserialize(&load)
                .map_err(|source| ArchiveError::Serializer {
                    name: filename.clone(),
                    source,
                })?;
            self.reporter.info(&format!("loaded {filename}: {output}"));
            loaded.push(LoadedData {
                filename: filename.clone(),
                output,
            });
        }
        Ok((loaded, skipped))
    }

    fn skip(&self, skipped: &mut Vec<SkippedData>, filename: &str, reason: String) {
        self.reporter
            .warning(&format!("skipping data file {filename}: {reason}"));
        skipped.push(SkippedData {
            filename: filename.to_string(),
            reason,
        });
    }
}

fn extract(archive: &Path, dest: &Path) -> Result<()> {
    let file = File::open(archive).map_err(ArchiveError::at("open", archive))?;
    let mut tar = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
    tar.set_preserve_permissions(true);
    tar.unpack(dest)
        .map_err(ArchiveError::at("extract", archive))?;
    tracing::debug!(archive = %archive.display(), dest = %dest.display(), "archive extracted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::io::Write;

    use flate2::{write::GzEncoder, Compression};

    use super::*;
    use crate::reporter::tests::RecordingReporter;
    use crate::serializer::{DumpPayload, DumpRequest};

    #[derive(Default)]
    struct Loader {
        loaded: RefCell<Vec<(String, Vec<String>, bool)>>,
    }

    impl DataSerializer for Loader {
        fn serialize(&self, _request: &DumpRequest<'_>) -> anyhow::Result<DumpPayload> {
            Ok(DumpPayload::Bytes(Vec::new()))
        }

        fn deserialize(&self, request: &LoadRequest<'_>) -> anyhow::Result<String> {
            let name = request
                .path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            self.loaded.borrow_mut().push((
                name,
                request.exclude_labels.to_vec(),
                request.ignore_unknown,
            ));
            Ok("Installed 1 object(s) from 1 fixture(s)".into())
        }
    }

    /// Writes a gzip tar holding `files` (name, content) and the given manifest.
    fn archive(dir: &Path, manifest: &str, files: &[(&str, &[u8])]) -> anyhow::Result<PathBuf> {
        let path = dir.join("fixture.tar.gz");
        let encoder = GzEncoder::new(File::create(&path)?, Compression::default());
        let mut tar = tar::Builder::new(encoder);
        let mut append = |name: &str, body: &[u8]| -> std::io::Result<()> {
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            tar.append_data(&mut header, name, body)
        };
        for (name, body) in files {
            append(name, body)?;
        }
        append("manifest.json", manifest.as_bytes())?;
        tar.into_inner()?.finish()?.flush()?;
        Ok(path)
    }

    fn request(dir: &Path, archive: &Path) -> DeployRequest {
        DeployRequest {
            archive: archive.display().to_string(),
            storage_base: dir.join("site"),
            work_dir: Some(dir.join("work")),
            ..DeployRequest::default()
        }
    }

    fn fixture() -> anyhow::Result<(tempfile::TempDir, PathBuf)> {
        let temp = tempfile::tempdir()?;
        fs::create_dir_all(temp.path().join("work"))?;
        let path = archive(
            temp.path(),
            r#"{"version": "0.1.0", "creation": "2026-01-01T00:00:00Z",
                "datas": ["users.json", "empty.json", "rest.json"],
                "storages": ["media"]}"#,
            &[
                ("data/users.json", br#"["auth.User"]"#.as_slice()),
                ("data/empty.json", b"[]".as_slice()),
                ("data/rest.json", br#"["blog.Post"]"#.as_slice()),
                ("media/avatars/a.png", b"png".as_slice()),
            ],
        )?;
        Ok((temp, path))
    }

    #[test]
    fn deploys_storages_and_data_in_manifest_order() -> anyhow::Result<()> {
        let (temp, path) = fixture()?;
        fs::create_dir_all(temp.path().join("site/media/stale"))?;
        fs::write(temp.path().join("site/media/stale/old.txt"), b"old")?;
        let loader = Loader::default();
        let reporter = RecordingReporter::default();
        let mut req = request(temp.path(), &path);
        req.entity_excludes = vec!["auth.Group".into()];
        req.ignore_unknown = true;
        let checksum = compute_sha256(&path)?;

        let report = ArchiveDeployer::new(&loader)
            .with_reporter(&reporter)
            .deploy(&req)?;

        assert_eq!(report.checksum, Some(checksum));
        assert_eq!(report.storages.len(), 1);
        assert_eq!(report.storages[0].destination, temp.path().join("site/media"));
        assert_eq!(fs::read(temp.path().join("site/media/avatars/a.png"))?, b"png");
        assert!(!temp.path().join("site/media/stale").exists());

        let loaded: Vec<_> = report.data.iter().map(|d| d.filename.as_str()).collect();
        assert_eq!(loaded, vec!["users.json", "rest.json"]);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].filename, "empty.json");
        assert_eq!(
            *loader.loaded.borrow(),
            vec![
                ("users.json".to_string(), vec!["auth.Group".to_string()], true),
                ("rest.json".to_string(), vec!["auth.Group".to_string()], true),
            ]
        );
        assert_eq!(reporter.at("warning").len(), 1);
        assert!(!path.exists(), "extracted archives are removed");
        assert!(fs::read_dir(temp.path().join("work"))?.next().is_none());
        Ok(())
    }

    #[test]
    fn skips_excluded_filenames() -> anyhow::Result<()> {
        let (temp, path) = fixture()?;
        let loader = Loader::default();
        let mut req = request(temp.path(), &path);
        req.data_excludes = vec!["rest.json".into()];
        req.with_storages = false;

        let report = ArchiveDeployer::new(&loader).deploy(&req)?;
        let skipped: Vec<_> = report.skipped.iter().map(|s| s.filename.as_str()).collect();
        assert_eq!(skipped, vec!["empty.json", "rest.json"]);
        assert_eq!(report.skipped[1].reason, "excluded by filename");
        assert!(report.storages.is_empty());
        assert!(!temp.path().join("site/media").exists());
        Ok(())
    }

    #[test]
    fn checksum_mismatch_stops_before_extraction() -> anyhow::Result<()> {
        let (temp, path) = fixture()?;
        let loader = Loader::default();
        let mut req = request(temp.path(), &path);
        req.checksum = Some("0".repeat(64));

        let err = ArchiveDeployer::new(&loader).deploy(&req).unwrap_err();
        match err {
            ArchiveError::Integrity(issue) => {
                assert_eq!(issue.check(), "checksum");
                assert!(issue.to_string().contains("archive probably corrupted"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(fs::read_dir(temp.path().join("work"))?.next().is_none());
        assert!(path.exists());
        assert!(loader.loaded.borrow().is_empty());
        Ok(())
    }

    #[test]
    fn keep_archive_retains_local_archive() -> anyhow::Result<()> {
        let (temp, path) = fixture()?;
        let loader = Loader::default();
        let mut req = request(temp.path(), &path);
        req.keep_archive = true;

        ArchiveDeployer::new(&loader).deploy(&req)?;
        assert!(path.exists());
        assert_eq!(fs::read(temp.path().join("site/media/avatars/a.png"))?, b"png");
        Ok(())
    }

    #[test]
    fn extraction_failure_removes_extraction_directory() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        fs::create_dir_all(temp.path().join("work"))?;
        let path = temp.path().join("broken.tar.gz");
        fs::write(&path, b"this is not a gzip stream")?;
        let loader = Loader::default();
        let mut req = request(temp.path(), &path);
        req.verify_checksum = false;

        let err = ArchiveDeployer::new(&loader).deploy(&req).unwrap_err();
        assert!(matches!(err, ArchiveError::Io { ref context, .. } if context.contains("extract")));
        assert!(fs::read_dir(temp.path().join("work"))?.next().is_none());
        assert!(path.exists(), "unextracted local archives are kept");
        assert!(!temp.path().join("site").exists());
        assert!(loader.loaded.borrow().is_empty());
        Ok(())
    }

    #[test]
    fn disabled_verification_reports_no_checksum() -> anyhow::Result<()> {
        let (temp, path) = fixture()?;
        let loader = Loader::default();
        let mut req = request(temp.path(), &path);
        req.checksum = Some("not-checked".into());
        req.verify_checksum = false;

        let report = ArchiveDeployer::new(&loader).deploy(&req)?;
        assert_eq!(report.checksum, None);
        Ok(())
    }

    #[test]
    fn missing_storage_source_is_an_error() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        fs::create_dir_all(temp.path().join("work"))?;
        let path = archive(
            temp.path(),
            r#"{"datas": [], "storages": ["dumps/alpha"]}"#,
            &[],
        )?;
        let loader = Loader::default();

        let err = ArchiveDeployer::new(&loader)
            .deploy(&request(temp.path(), &path))
            .unwrap_err();
        assert!(err.to_string().contains("source missing"));
        assert!(err.to_string().contains("dumps/alpha"));
        assert!(fs::read_dir(temp.path().join("work"))?.next().is_none());
        Ok(())
    }

    #[test]
    fn missing_local_archive_is_an_error() {
        let loader = Loader::default();
        let req = DeployRequest {
            archive: "/nonexistent/cistern.tar.gz".into(),
            ..DeployRequest::default()
        };
        let err = ArchiveDeployer::new(&loader).deploy(&req).unwrap_err();
        assert!(matches!(err, ArchiveError::Io { ref context, .. } if context.contains("not found")));
    }

    #[test]
    fn manifest_without_storages_key_is_rejected() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        fs::create_dir_all(temp.path().join("work"))?;
        let path = archive(temp.path(), r#"{"datas": []}"#, &[])?;
        let loader = Loader::default();

        let err = ArchiveDeployer::new(&loader)
            .deploy(&request(temp.path(), &path))
            .unwrap_err();
        assert!(matches!(
            err,
            ArchiveError::Integrity(IntegrityError::ManifestField { field: "storages" })
        ));
        Ok(())
    }
}
