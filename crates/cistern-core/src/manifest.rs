//! The `manifest.json` index stored at the archive root.

use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::error::{ArchiveError, IntegrityError, Result};
use crate::fsutil::features_suffix;

pub const MANIFEST_FILENAME: &str = "manifest.json";
pub const DATA_DIRNAME: &str = "data";

/// Archive content index. `None` lists mean the part was disabled at build
/// time; an empty list means it was enabled but produced nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub creation: String,
    pub datas: Option<Vec<String>>,
    pub storages: Option<Vec<String>>,
}

impl Manifest {
    pub fn new(datas: Option<Vec<String>>, storages: Option<Vec<String>>) -> Result<Self> {
        let creation = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .map_err(|err| ArchiveError::Configuration(format!("invalid timestamp: {err}")))?;
        Ok(Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            creation,
            datas,
            storages,
        })
    }

    /// Short summary of what the archive carries, e.g. `_data_storages`.
    #[must_use]
    pub fn features(&self) -> &'static str {
        features_suffix(self.datas.is_some(), self.storages.is_some())
    }

    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(MANIFEST_FILENAME);
        let mut contents = serde_json::to_vec_pretty(self).map_err(|err| {
            ArchiveError::io("failed to encode archive manifest", err.into())
        })?;
        contents.push(b'\n');
        fs::write(&path, contents).map_err(ArchiveError::at("write", &path))?;
        Ok(path)
    }

    /// Reads the manifest of an extracted archive rooted at `dir`.
    ///
    /// Missing file, unparsable content and missing required keys are
    /// reported as distinct integrity failures.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILENAME);
        if !path.is_file() {
            return Err(IntegrityError::ManifestMissing { path }.into());
        }
        let contents = fs::read_to_string(&path).map_err(ArchiveError::at("read", &path))?;
        let value: Value =
            serde_json::from_str(&contents).map_err(|err| IntegrityError::ManifestUnreadable {
                path: path.clone(),
                reason: err.to_string(),
            })?;
        let Some(object) = value.as_object() else {
            return Err(IntegrityError::ManifestUnreadable {
                path,
                reason: "expected a JSON object".into(),
            }
            .into());
        };
        for field in ["datas", "storages"] {
            if !object.contains_key(field) {
                return Err(IntegrityError::ManifestField { field }.into());
            }
        }
        let manifest: Self =
            serde_json::from_value(value).map_err(|err| IntegrityError::ManifestUnreadable {
                path: path.clone(),
                reason: err.to_string(),
            })?;

        for entry in manifest.entries() {
            if !is_safe_entry(entry) {
                return Err(IntegrityError::UnsafeEntry {
                    entry: entry.clone(),
                }
                .into());
            }
        }
        Ok(manifest)
    }

    fn entries(&self) -> impl Iterator<Item = &String> {
        self.datas
            .iter()
            .flatten()
            .chain(self.storages.iter().flatten())
    }
}

/// A non-empty relative path that stays inside the archive.
fn is_safe_entry(entry: &str) -> bool {
    let path = Path::new(entry);
    !entry.is_empty()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}
