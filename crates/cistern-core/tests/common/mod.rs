#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use cistern_core::{DataSerializer, DumpPayload, DumpRequest, LoadRequest};
use cistern_domain::{ApplicationSpec, EntityRegistry};
use serde_json::{json, Value};

/// In-memory stand-in for the host's record store.
#[derive(Debug, Default)]
pub struct FakeHost {
    pub tables: RefCell<BTreeMap<String, Vec<Value>>>,
    pub dumps: RefCell<Vec<String>>,
}

impl FakeHost {
    pub fn seeded() -> Self {
        let host = Self::default();
        {
            let mut tables = host.tables.borrow_mut();
            tables.insert("auth.Group".into(), vec![json!({"name": "admins"})]);
            tables.insert(
                "auth.User".into(),
                vec![json!({"username": "ada"}), json!({"username": "grace"})],
            );
            tables.insert("blog.Category".into(), vec![json!({"slug": "news"})]);
            tables.insert("blog.Post".into(), vec![json!({"title": "Hello"})]);
            tables.insert("blog.Comment".into(), vec![json!({"body": "First"})]);
            tables.insert("sites.Site".into(), vec![json!({"domain": "example.com"})]);
            tables.insert("sessions.Session".into(), Vec::new());
        }
        host
    }
}

impl DataSerializer for FakeHost {
    fn serialize(&self, request: &DumpRequest<'_>) -> Result<DumpPayload> {
        self.dumps.borrow_mut().push(request.name.to_string());
        let tables = self.tables.borrow();
        let rows: Vec<(String, Vec<Value>)> = request
            .entity_labels
            .iter()
            .filter(|label| !request.exclude_labels.contains(label))
            .map(|label| (label.clone(), tables.get(label).cloned().unwrap_or_default()))
            .collect();
        Ok(DumpPayload::Bytes(serde_json::to_vec(&rows)?))
    }

    fn deserialize(&self, request: &LoadRequest<'_>) -> Result<String> {
        let contents = fs::read(request.path)
            .with_context(|| format!("failed to read {}", request.path.display()))?;
        let rows: Vec<(String, Vec<Value>)> = serde_json::from_slice(&contents)?;
        let mut tables = self.tables.borrow_mut();
        let mut count = 0;
        for (label, objects) in rows {
            if request.exclude_labels.contains(&label) {
                continue;
            }
            if !label.contains('.') && !request.ignore_unknown {
                bail!("unknown entity {label}");
            }
            count += objects.len();
            tables.entry(label).or_default().extend(objects);
        }
        Ok(format!("Installed {count} object(s)"))
    }
}

pub fn registry() -> EntityRegistry {
    EntityRegistry::new([
        ApplicationSpec::new("auth", ["Group", "User"]),
        ApplicationSpec::new("blog", ["Category", "Post", "Comment"]),
        ApplicationSpec::new("sites", ["Site"]),
        ApplicationSpec::new("sessions", ["Session"]),
    ])
    .expect("registry")
}

pub fn write(root: &Path, relative: &str, body: &str) -> Result<()> {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, body)?;
    Ok(())
}

/// Every file under `root` as `relative path -> content`.
pub fn snapshot(root: &Path) -> Result<BTreeMap<String, String>> {
    let mut files = BTreeMap::new();
    for entry in walkdir::WalkDir::new(root) {
        let entry = entry?;
        if entry.file_type().is_file() {
            let relative = entry.path().strip_prefix(root)?.display().to_string();
            files.insert(relative, fs::read_to_string(entry.path())?);
        }
    }
    Ok(files)
}
