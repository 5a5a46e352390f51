//! Declaration discovery
//!
//! Declarations of a kind live under `<dir>/<folder>/`, in `*.json` or
//! `*.toml` files holding one mapping or an array of mappings. Files are
//! read in lexical path order so runs are reproducible.

use anyhow::{Context, Result, bail};
use reconcile::KindRegistry;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Raw declarations grouped by kind name
#[derive(Debug, Default)]
pub struct Declarations {
    pub by_kind: BTreeMap<String, Vec<Value>>,
    /// Files that were read, in order
    pub files: Vec<PathBuf>,
    /// Mappings no registered kind claimed
    pub unrouted: usize,
}

impl Declarations {
    pub fn total(&self) -> usize {
        self.by_kind.values().map(Vec::len).sum()
    }
}

/// Read every declaration under `dir` and route it to its kind
pub fn load(dir: &Path, registry: &KindRegistry) -> Result<Declarations> {
    if !dir.is_dir() {
        bail!("{} is not a directory", dir.display());
    }

    let mut declarations = Declarations::default();
    for folder in registry.folders() {
        for path in declaration_files(&dir.join(folder)) {
            for raw in read_file(&path)? {
                match registry.route(folder, &raw) {
                    Some(kind) => declarations
                        .by_kind
                        .entry(kind.kind().to_string())
                        .or_default()
                        .push(raw),
                    None => {
                        log::warn!("{}: no kind in {folder} claims {raw}", path.display());
                        declarations.unrouted += 1;
                    }
                }
            }
            declarations.files.push(path);
        }
    }

    log::debug!(
        "loaded {} declarations from {} files",
        declarations.total(),
        declarations.files.len()
    );
    Ok(declarations)
}

fn declaration_files(folder: &Path) -> Vec<PathBuf> {
    if !folder.is_dir() {
        return Vec::new();
    }
    WalkDir::new(folder)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(walkdir::DirEntry::into_path)
        .filter(|path| matches!(extension(path), Some("json" | "toml")))
        .collect()
}

fn extension(path: &Path) -> Option<&str> {
    path.extension().and_then(|ext| ext.to_str())
}

/// Mappings held by one declaration file
fn read_file(path: &Path) -> Result<Vec<Value>> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Could not read {}", path.display()))?;

    let value: Value = if extension(path) == Some("toml") {
        let parsed: toml::Value = toml::from_str(&content)
            .with_context(|| format!("Invalid TOML in {}", path.display()))?;
        // A TOML document is always a table; `items = [...]` holds several
        match parsed {
            toml::Value::Table(mut table) if table.len() == 1 && table.contains_key("items") => {
                serde_json::to_value(table.remove("items"))?
            }
            other => serde_json::to_value(other)?,
        }
    } else {
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid JSON in {}", path.display()))?
    };

    match value {
        Value::Object(_) => Ok(vec![value]),
        Value::Array(items) => {
            if let Some(pos) = items.iter().position(|item| !item.is_object()) {
                bail!("{}: item {pos} is not a mapping", path.display());
            }
            Ok(items)
        }
        _ => bail!("{}: expected a mapping or an array of mappings", path.display()),
    }
}
