mod common;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use cistern_core::{
    ArchiveBuilder, ArchiveDeployer, ArchiveError, BuildRequest, DefinitionBatch,
    DefinitionOptions, DeployRequest, IntegrityError,
};
use common::{registry, snapshot, write, FakeHost};
use httptest::{matchers::request, responders::status_code, Expectation, Server};
use pretty_assertions::assert_eq;

fn batch() -> DefinitionBatch {
    DefinitionBatch::new([
        (
            "users",
            DefinitionOptions {
                includes: vec!["auth".into()],
                natural_foreign: true,
                ..DefinitionOptions::default()
            },
        ),
        (
            "content",
            DefinitionOptions {
                includes: vec!["blog".into()],
                excludes: vec!["blog.Comment".into()],
                filename: "content.jsonl".into(),
                ..DefinitionOptions::default()
            },
        ),
        (
            "rest",
            DefinitionOptions {
                is_drain: true,
                ..DefinitionOptions::default()
            },
        ),
    ])
    .expect("batch")
}

fn build_request(root: &Path) -> BuildRequest {
    BuildRequest {
        destination: root.join("archives"),
        filename: "site{features}.tar.gz".into(),
        with_data: true,
        with_storages: true,
        storages: vec![PathBuf::from("media"), PathBuf::from("static")],
        storage_base: root.join("source"),
        storage_excludes: vec!["**/*.log".into()],
        apply_storage_excludes: true,
        dir_mode: None,
        file_mode: None,
        work_dir: Some(root.join("work")),
    }
}

fn source_site(root: &Path) -> Result<()> {
    let source = root.join("source");
    write(&source, "media/avatars/ada.png", "ada")?;
    write(&source, "media/uploads/2024/report.pdf", "report")?;
    write(&source, "media/uploads/debug.log", "noise")?;
    write(&source, "static/site.css", "body {}")?;
    fs::create_dir_all(root.join("work"))?;
    Ok(())
}

fn is_empty_dir(path: &Path) -> Result<bool> {
    Ok(fs::read_dir(path)?.next().is_none())
}

#[test]
fn build_then_deploy_reproduces_data_and_storages() -> Result<()> {
    let temp = tempfile::tempdir()?;
    source_site(temp.path())?;
    let registry = registry();
    let source_host = FakeHost::seeded();

    let built = ArchiveBuilder::new(&registry, &source_host).build(&batch(), &build_request(temp.path()))?;
    assert_eq!(*source_host.dumps.borrow(), vec!["users", "content", "rest"]);
    assert_eq!(
        built.manifest.datas,
        Some(vec![
            "users.json".to_string(),
            "content.jsonl".to_string(),
            "rest.json".to_string()
        ])
    );

    let target_host = FakeHost::default();
    let deploy = DeployRequest {
        archive: built.path.display().to_string(),
        checksum: Some(built.checksum.clone()),
        storage_base: temp.path().join("target"),
        min_data_size: 2,
        work_dir: Some(temp.path().join("work")),
        ..DeployRequest::default()
    };
    let report = ArchiveDeployer::new(&target_host).deploy(&deploy)?;

    assert_eq!(report.checksum.as_deref(), Some(built.checksum.as_str()));
    assert_eq!(report.manifest, built.manifest);
    let loaded: Vec<_> = report.data.iter().map(|d| d.filename.clone()).collect();
    assert_eq!(loaded, vec!["users.json", "content.jsonl", "rest.json"]);
    // blog.Comment is excluded by "content" and therefore retained from the drain.
    let mut selected = source_host.tables.borrow().clone();
    selected.remove("blog.Comment");
    assert_eq!(*target_host.tables.borrow(), selected);

    let mut expected = snapshot(&temp.path().join("source"))?;
    expected.remove("media/uploads/debug.log");
    assert_eq!(snapshot(&temp.path().join("target"))?, expected);
    assert!(is_empty_dir(&temp.path().join("work"))?);
    assert!(!built.path.exists());
    Ok(())
}

#[test]
fn drain_takes_everything_unclaimed() -> Result<()> {
    let temp = tempfile::tempdir()?;
    source_site(temp.path())?;
    let registry = registry();
    let host = FakeHost::seeded();

    let plan = ArchiveBuilder::new(&registry, &host).plan(&batch(), &build_request(temp.path()))?;
    let drain = plan
        .definitions
        .iter()
        .find(|definition| definition.is_drain)
        .expect("drain definition");
    assert_eq!(
        drain.exclude_labels,
        vec![
            "auth.Group",
            "auth.User",
            "blog.Category",
            "blog.Post",
            "blog.Comment"
        ]
    );
    assert_eq!(drain.entity_labels, vec!["sites.Site", "sessions.Session"]);
    assert!(host.dumps.borrow().is_empty());
    Ok(())
}

#[test]
fn duplicate_names_are_rejected_before_serializing() {
    let err = DefinitionBatch::new([
        ("users", DefinitionOptions::default()),
        ("users", DefinitionOptions::default()),
    ])
    .unwrap_err();
    assert!(err.to_string().contains("users"));
}

#[test]
fn storage_globs_match_relative_to_their_root() -> Result<()> {
    let temp = tempfile::tempdir()?;
    write(&temp.path().join("source"), "storage-1/foo/bar.txt", "bar")?;
    write(&temp.path().join("source"), "storage-1/top.txt", "top")?;
    let registry = registry();
    let host = FakeHost::default();
    let empty = DefinitionBatch::default();

    let mut request = build_request(temp.path());
    request.with_data = false;
    request.storages = vec![PathBuf::from("storage-1")];

    request.storage_excludes = vec!["foo/*.txt".into()];
    let plan = ArchiveBuilder::new(&registry, &host).plan(&empty, &request)?;
    assert_eq!(plan.storage_files, vec!["storage-1/top.txt"]);

    request.storage_excludes = vec!["*.txt".into()];
    let plan = ArchiveBuilder::new(&registry, &host).plan(&empty, &request)?;
    assert_eq!(plan.storage_files, vec!["storage-1/foo/bar.txt"]);
    Ok(())
}

#[test]
fn both_parts_disabled_fails_without_a_workspace() -> Result<()> {
    let temp = tempfile::tempdir()?;
    source_site(temp.path())?;
    let registry = registry();
    let host = FakeHost::seeded();
    let mut request = build_request(temp.path());
    request.with_data = false;
    request.with_storages = false;

    let err = ArchiveBuilder::new(&registry, &host)
        .build(&batch(), &request)
        .unwrap_err();
    assert!(matches!(err, ArchiveError::Configuration(_)));
    assert!(is_empty_dir(&temp.path().join("work"))?);
    assert!(!temp.path().join("archives").exists());
    assert!(host.dumps.borrow().is_empty());
    Ok(())
}

#[test]
fn storage_only_archive_skips_data_on_deploy() -> Result<()> {
    let temp = tempfile::tempdir()?;
    source_site(temp.path())?;
    let registry = registry();
    let host = FakeHost::seeded();
    let mut request = build_request(temp.path());
    request.with_data = false;

    let built = ArchiveBuilder::new(&registry, &host).build(&batch(), &request)?;
    assert!(built.path.ends_with("site_storages.tar.gz"));
    assert_eq!(built.manifest.datas, None);

    let target_host = FakeHost::default();
    let report = ArchiveDeployer::new(&target_host).deploy(&DeployRequest {
        archive: built.path.display().to_string(),
        storage_base: temp.path().join("target"),
        ..DeployRequest::default()
    })?;
    assert!(report.data.is_empty());
    assert_eq!(report.storages.len(), 2);
    assert!(target_host.tables.borrow().is_empty());
    Ok(())
}

#[test]
fn tampered_archive_is_never_extracted() -> Result<()> {
    let temp = tempfile::tempdir()?;
    source_site(temp.path())?;
    let registry = registry();
    let host = FakeHost::seeded();
    let built = ArchiveBuilder::new(&registry, &host).build(&batch(), &build_request(temp.path()))?;

    let mut bytes = fs::read(&built.path)?;
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    fs::write(&built.path, bytes)?;

    let target_host = FakeHost::default();
    let err = ArchiveDeployer::new(&target_host)
        .deploy(&DeployRequest {
            archive: built.path.display().to_string(),
            checksum: Some(built.checksum.clone()),
            storage_base: temp.path().join("target"),
            work_dir: Some(temp.path().join("work")),
            ..DeployRequest::default()
        })
        .unwrap_err();
    assert!(matches!(
        err,
        ArchiveError::Integrity(IntegrityError::ChecksumMismatch { .. })
    ));
    assert!(is_empty_dir(&temp.path().join("work"))?);
    assert!(built.path.exists());
    assert!(!temp.path().join("target").exists());
    assert!(target_host.tables.borrow().is_empty());
    Ok(())
}

#[test]
fn deploys_downloaded_archive_and_discards_it() -> Result<()> {
    let temp = tempfile::tempdir()?;
    source_site(temp.path())?;
    let registry = registry();
    let host = FakeHost::seeded();
    let built = ArchiveBuilder::new(&registry, &host).build(&batch(), &build_request(temp.path()))?;

    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("GET", "/backups/site.tar.gz"))
            .respond_with(status_code(200).body(fs::read(&built.path)?)),
    );

    let downloads = temp.path().join("downloads");
    let target_host = FakeHost::default();
    let report = ArchiveDeployer::new(&target_host).deploy(&DeployRequest {
        archive: server.url_str("/backups/site.tar.gz"),
        checksum: Some(built.checksum.clone()),
        download_dir: downloads.clone(),
        storage_base: temp.path().join("target"),
        ..DeployRequest::default()
    })?;

    assert_eq!(report.checksum.as_deref(), Some(built.checksum.as_str()));
    assert_eq!(report.data.len(), 3);
    assert!(is_empty_dir(&downloads)?);
    assert!(built.path.exists());
    Ok(())
}
