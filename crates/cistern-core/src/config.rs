use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{ArchiveError, Result};

pub const DEFAULT_ARCHIVE_FILENAME: &str = "cistern{features}.tar.gz";
pub const DEFAULT_MIN_DATA_SIZE: u64 = 2;

#[derive(Debug, Clone)]
pub(crate) struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    pub(crate) fn capture() -> Self {
        Self {
            vars: env::vars().collect(),
        }
    }

    pub(crate) fn var(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    /// Enabled unless explicitly switched off.
    pub(crate) fn flag_or_default(&self, key: &str, default: bool) -> bool {
        match self.var(key) {
            Some(value) => {
                let lowered = value.to_ascii_lowercase();
                !matches!(lowered.as_str(), "0" | "false" | "no" | "off")
            }
            None => default,
        }
    }

    #[cfg(test)]
    pub(crate) fn testing(pairs: &[(&str, &str)]) -> Self {
        let vars = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Self { vars }
    }
}

/// Process-level defaults for builds and deploys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub archive_dir: PathBuf,
    pub archive_filename: String,
    pub storage_base: PathBuf,
    pub storage_excludes: Vec<String>,
    pub dir_mode: Option<u32>,
    pub file_mode: Option<u32>,
    pub min_data_size: u64,
    pub verify_checksum: bool,
    pub download_dir: PathBuf,
}

impl Config {
    /// Reads the `CISTERN_*` variables of the current process environment.
    ///
    /// # Errors
    /// Returns a configuration error for malformed numeric values, or an io
    /// error when the current directory cannot be determined.
    pub fn from_env() -> Result<Self> {
        let snapshot = EnvSnapshot::capture();
        let cwd = env::current_dir()
            .map_err(|err| ArchiveError::io("failed to read current directory", err))?;
        Self::from_snapshot(&snapshot, cwd)
    }

    pub(crate) fn from_snapshot(snapshot: &EnvSnapshot, cwd: PathBuf) -> Result<Self> {
        let path_or_cwd = |key: &str| snapshot.var(key).map_or_else(|| cwd.clone(), PathBuf::from);
        Ok(Self {
            archive_dir: path_or_cwd("CISTERN_ARCHIVE_DIR"),
            archive_filename: snapshot
                .var("CISTERN_ARCHIVE_FILENAME")
                .unwrap_or(DEFAULT_ARCHIVE_FILENAME)
                .to_string(),
            storage_base: path_or_cwd("CISTERN_STORAGE_BASE"),
            storage_excludes: snapshot
                .var("CISTERN_STORAGE_EXCLUDES")
                .map(|value| {
                    value
                        .split(':')
                        .filter(|pattern| !pattern.is_empty())
                        .map(ToOwned::to_owned)
                        .collect()
                })
                .unwrap_or_default(),
            dir_mode: parse_mode(snapshot, "CISTERN_DIR_MODE")?,
            file_mode: parse_mode(snapshot, "CISTERN_FILE_MODE")?,
            min_data_size: match snapshot.var("CISTERN_MIN_DATA_SIZE") {
                Some(value) => value.parse().map_err(|_| {
                    ArchiveError::Configuration(format!(
                        "CISTERN_MIN_DATA_SIZE must be a byte count, got '{value}'"
                    ))
                })?,
                None => DEFAULT_MIN_DATA_SIZE,
            },
            verify_checksum: snapshot.flag_or_default("CISTERN_VERIFY_CHECKSUM", true),
            download_dir: snapshot
                .var("CISTERN_DOWNLOAD_DIR")
                .map_or_else(env::temp_dir, PathBuf::from),
        })
    }
}

fn parse_mode(snapshot: &EnvSnapshot, key: &str) -> Result<Option<u32>> {
    let Some(value) = snapshot.var(key) else {
        return Ok(None);
    };
    let digits = value.trim_start_matches("0o");
    u32::from_str_radix(digits, 8)
        .ok()
        .filter(|mode| *mode <= 0o7777)
        .map(Some)
        .ok_or_else(|| {
            ArchiveError::Configuration(format!("{key} must be an octal mode, got '{value}'"))
        })
}
