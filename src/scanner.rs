//! Directory-tree scanner (§4's Scanner interface): produces
//! `{relative_path → size}` for a directory tree, grounded on the teacher's
//! `discovery.rs` provider-walk and `original_source/scanner.py`'s
//! ignore-suffix filtering.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// A relative, slash-separated path plus its size in bytes.
pub type Inventory = BTreeMap<String, u64>;

pub struct DirScanner {
    root: PathBuf,
    ignore_suffixes: Vec<String>,
    previous: Inventory,
}

impl DirScanner {
    pub fn new(root: impl Into<PathBuf>, ignore_suffixes: Vec<String>) -> Self {
        Self { root: root.into(), ignore_suffixes, previous: Inventory::new() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ignored(&self, filename: &str) -> bool {
        self.ignore_suffixes.iter().any(|suffix| filename.ends_with(suffix.as_str()))
    }

    /// Walks the root and returns the current `{relative_path -> size}`
    /// inventory plus the set of paths that vanished since the previous
    /// scan (invariant 5: vanished files must not resurface in `list`).
    pub fn scan(&mut self) -> std::io::Result<(Inventory, Vec<String>)> {
        let mut current = Inventory::new();
        if self.root.exists() {
            for entry in WalkDir::new(&self.root).into_iter().filter_map(|e| e.ok()) {
                if !entry.file_type().is_file() {
                    continue;
                }
                let Some(name) = entry.file_name().to_str() else { continue };
                if self.ignored(name) {
                    continue;
                }
                let Ok(rel) = entry.path().strip_prefix(&self.root) else { continue };
                let Some(rel_str) = rel.to_str() else { continue };
                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                current.insert(rel_str.replace('\\', "/"), size);
            }
        }

        let vanished: Vec<String> = self.previous.keys().filter(|p| !current.contains_key(*p)).cloned().collect();
        self.previous = current.clone();
        Ok((current, vanished))
    }
}
