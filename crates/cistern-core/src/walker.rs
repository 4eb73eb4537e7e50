use std::collections::HashSet;
use std::fmt;
use std::io;
use std::path::{Component, Path, PathBuf};

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use walkdir::WalkDir;

use crate::error::{ArchiveError, Result};
use crate::manifest::{DATA_DIRNAME, MANIFEST_FILENAME};

/// A storage file found under one of the declared roots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageFile {
    /// Location on disk.
    pub path: PathBuf,
    /// Location relative to the storage base path; also its archive member name.
    pub relative: PathBuf,
}

impl StorageFile {
    #[must_use]
    pub fn archive_name(&self) -> String {
        archive_name(&self.relative)
    }
}

/// Enumerates storage files, honouring shell-style exclusion globs.
///
/// Patterns match the path relative to the storage root being walked. `*`
/// never crosses a `/`; use `**` to match across directories.
#[derive(Debug, Clone, Default)]
pub struct StorageWalker {
    patterns: Vec<String>,
    excludes: Option<GlobSet>,
}

impl StorageWalker {
    pub fn new<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let patterns: Vec<String> = patterns.into_iter().map(Into::into).collect();
        if patterns.is_empty() {
            return Ok(Self::without_excludes());
        }
        let mut builder = GlobSetBuilder::new();
        for pattern in &patterns {
            let glob = GlobBuilder::new(pattern)
                .literal_separator(true)
                .build()
                .map_err(|err| {
                    ArchiveError::Configuration(format!(
                        "invalid storage exclude pattern '{pattern}': {err}"
                    ))
                })?;
            builder.add(glob);
        }
        let set = builder.build().map_err(|err| {
            ArchiveError::Configuration(format!("invalid storage exclude patterns: {err}"))
        })?;
        Ok(Self {
            patterns,
            excludes: Some(set),
        })
    }

    /// A walker that yields every file.
    #[must_use]
    pub fn without_excludes() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Whether `relative` (relative to its storage root) matches any pattern.
    #[must_use]
    pub fn is_excluded(&self, relative: &Path) -> bool {
        self.excludes
            .as_ref()
            .is_some_and(|set| set.is_match(relative))
    }

    /// Lazily walks `roots` in name order, yielding non-excluded files.
    ///
    /// Directories are never yielded. Roots must live under `base`.
    pub fn iterate<'w>(
        &'w self,
        roots: &'w [PathBuf],
        base: &'w Path,
    ) -> impl Iterator<Item = Result<StorageFile>> + 'w {
        roots.iter().flat_map(move |root| self.walk_root(root, base))
    }

    fn walk_root<'w>(
        &'w self,
        root: &'w Path,
        base: &'w Path,
    ) -> impl Iterator<Item = Result<StorageFile>> + 'w {
        WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_map(move |entry| {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(err) => {
                        let context = match err.path() {
                            Some(path) => format!("failed to walk {}", path.display()),
                            None => format!("failed to walk {}", root.display()),
                        };
                        return Some(Err(ArchiveError::io(context, io::Error::from(err))));
                    }
                };
                if entry.file_type().is_dir() {
                    return None;
                }
                let path = entry.into_path();
                let within_root = path.strip_prefix(root).unwrap_or(path.as_path());
                if self.is_excluded(within_root) {
                    tracing::trace!(path = %path.display(), "storage file excluded");
                    return None;
                }
                let Ok(relative) = path.strip_prefix(base) else {
                    return Some(Err(ArchiveError::Configuration(format!(
                        "storage file {} is outside the storage base path {}",
                        path.display(),
                        base.display()
                    ))));
                };
                let relative = relative.to_path_buf();
                Some(Ok(StorageFile { path, relative }))
            })
    }
}

/// Renders a relative path as a `/`-separated archive member name.
pub(crate) fn archive_name(relative: &Path) -> String {
    relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageIssue {
    Missing { path: PathBuf },
    NotADirectory { path: PathBuf },
    Duplicate { path: PathBuf },
    Nested { path: PathBuf, parent: PathBuf },
    OutsideBase { path: PathBuf, base: PathBuf },
    IsBase { path: PathBuf },
    Reserved { path: PathBuf, name: String },
}

impl fmt::Display for StorageIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing { path } => write!(f, "storage root {} does not exist", path.display()),
            Self::NotADirectory { path } => {
                write!(f, "storage root {} is not a directory", path.display())
            }
            Self::Duplicate { path } => {
                write!(f, "storage root {} is declared more than once", path.display())
            }
            Self::Nested { path, parent } => write!(
                f,
                "storage root {} is nested inside storage root {}",
                path.display(),
                parent.display()
            ),
            Self::OutsideBase { path, base } => write!(
                f,
                "storage root {} is not inside the storage base path {}",
                path.display(),
                base.display()
            ),
            Self::IsBase { path } => write!(
                f,
                "storage root {} is the storage base path itself",
                path.display()
            ),
            Self::Reserved { path, name } => write!(
                f,
                "storage root {} collides with reserved archive member '{name}'",
                path.display()
            ),
        }
    }
}

/// Every problem found with the declared storage roots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageIssues {
    pub issues: Vec<StorageIssue>,
}

impl fmt::Display for StorageIssues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.issues.iter().map(ToString::to_string).collect();
        write!(f, "invalid storage roots: {}", rendered.join("; "))
    }
}

impl std::error::Error for StorageIssues {}

/// Checks every root, reporting all issues rather than the first one.
///
/// Roots are compared lexically against `base` and each other; a `..`
/// component anywhere below `base` counts as leaving it.
pub fn validate_storages(roots: &[PathBuf], base: &Path) -> std::result::Result<(), StorageIssues> {
    let mut issues = Vec::new();
    let mut seen = HashSet::new();
    let mut distinct: Vec<&Path> = Vec::new();
    for root in roots {
        if !seen.insert(root.as_path()) {
            issues.push(StorageIssue::Duplicate { path: root.clone() });
            continue;
        }
        match root.metadata() {
            Err(_) => issues.push(StorageIssue::Missing { path: root.clone() }),
            Ok(meta) if !meta.is_dir() => {
                issues.push(StorageIssue::NotADirectory { path: root.clone() });
            }
            Ok(_) => {}
        }
        let relative = root
            .strip_prefix(base)
            .ok()
            .filter(|relative| {
                !relative
                    .components()
                    .any(|component| matches!(component, Component::ParentDir))
            });
        match relative {
            None => issues.push(StorageIssue::OutsideBase {
                path: root.clone(),
                base: base.to_path_buf(),
            }),
            Some(relative) => match relative.components().next() {
                None => issues.push(StorageIssue::IsBase { path: root.clone() }),
                Some(Component::Normal(first))
                    if first == DATA_DIRNAME || first == MANIFEST_FILENAME =>
                {
                    issues.push(StorageIssue::Reserved {
                        path: root.clone(),
                        name: first.to_string_lossy().into_owned(),
                    });
                }
                Some(_) => distinct.push(root.as_path()),
            },
        }
    }
    for path in &distinct {
        if let Some(parent) = distinct
            .iter()
            .find(|other| *other != path && path.starts_with(other))
        {
            issues.push(StorageIssue::Nested {
                path: path.to_path_buf(),
                parent: parent.to_path_buf(),
            });
        }
    }
    if issues.is_empty() {
        Ok(())
    } else {
        Err(StorageIssues { issues })
    }
}
