//! Plugin discovery and the in-memory catalog.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::DiscoveryError;

use super::manifest::{MANIFEST_FILE, PluginCategory, PluginManifest};

/// A manifest that failed to parse or validate, kept for operator visibility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidEntry {
    /// Declared id when readable, otherwise the directory name.
    pub id: String,
    pub path: PathBuf,
    pub error: DiscoveryError,
}

/// Discovers plugin manifests under a root directory.
///
/// Each plugin lives in its own directory: `<root>/<id>/plugin.json`.
#[derive(Debug)]
pub struct PluginRegistry {
    root: PathBuf,
    plugins: Vec<PluginManifest>,
    invalid: Vec<InvalidEntry>,
}

impl PluginRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            plugins: Vec::new(),
            invalid: Vec::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Rescan the root directory and rebuild the catalog.
    ///
    /// A malformed manifest never aborts discovery of the rest; it is recorded
    /// as an [`InvalidEntry`]. A missing root yields an empty catalog.
    pub fn discover(&mut self) -> usize {
        self.plugins.clear();
        self.invalid.clear();

        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Plugin directory {} not readable: {}", self.root.display(), e);
                return 0;
            }
        };

        // Sorted so duplicate resolution does not depend on read_dir order.
        let mut dirs: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_dir() && path.join(MANIFEST_FILE).is_file())
            .collect();
        dirs.sort();

        for dir in dirs {
            match PluginManifest::from_dir(&dir) {
                Ok(manifest) => {
                    if let Some(first) = self.get(&manifest.id) {
                        let error = DiscoveryError::DuplicateId {
                            id: manifest.id.clone(),
                            first: first.dir.clone(),
                        };
                        warn!(plugin = %manifest.id, "{}", error);
                        self.invalid.push(InvalidEntry {
                            id: manifest.id,
                            path: dir,
                            error,
                        });
                    } else {
                        debug!(plugin = %manifest.id, version = %manifest.version, "Discovered plugin");
                        self.plugins.push(manifest);
                    }
                }
                Err(error) => {
                    let id = declared_id(&dir).unwrap_or_else(|| dir_name(&dir));
                    warn!(plugin = %id, "Invalid plugin manifest: {}", error);
                    self.invalid.push(InvalidEntry {
                        id,
                        path: dir,
                        error,
                    });
                }
            }
        }

        self.sort();
        self.plugins.len()
    }

    /// Valid manifests, optionally filtered by category, ordered by id.
    pub fn list(&self, category: Option<PluginCategory>) -> Vec<&PluginManifest> {
        self.plugins
            .iter()
            .filter(|m| category.is_none_or(|c| m.category == c))
            .collect()
    }

    /// Catalog records that failed to parse or validate.
    pub fn invalid_entries(&self) -> &[InvalidEntry] {
        &self.invalid
    }

    pub fn get(&self, id: &str) -> Option<&PluginManifest> {
        self.plugins.iter().find(|m| m.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut PluginManifest> {
        self.plugins.iter_mut().find(|m| m.id == id)
    }

    pub fn get_invalid(&self, id: &str) -> Option<&InvalidEntry> {
        self.invalid.iter().find(|e| e.id == id)
    }

    /// Manifests whose capability description satisfies `predicate`.
    pub fn find_by_capability<F>(&self, predicate: F) -> Vec<&PluginManifest>
    where
        F: Fn(&str) -> bool,
    {
        self.plugins
            .iter()
            .filter(|m| predicate(&m.description))
            .collect()
    }

    /// Add a freshly installed manifest to the catalog.
    pub(crate) fn insert(&mut self, manifest: PluginManifest) {
        self.invalid.retain(|e| e.id != manifest.id);
        self.plugins.retain(|m| m.id != manifest.id);
        self.plugins.push(manifest);
        self.sort();
    }

    pub(crate) fn push_invalid(&mut self, entry: InvalidEntry) {
        if self.get_invalid(&entry.id).is_none() {
            self.invalid.push(entry);
            self.invalid.sort_by(|a, b| a.id.cmp(&b.id));
        }
    }

    /// Drop every catalog record (valid or invalid) for `id`.
    pub(crate) fn remove(&mut self, id: &str) {
        self.plugins.retain(|m| m.id != id);
        self.invalid.retain(|e| e.id != id);
    }

    fn sort(&mut self) {
        self.plugins.sort_by(|a, b| a.id.cmp(&b.id));
        self.invalid.sort_by(|a, b| a.id.cmp(&b.id));
    }
}

/// Best-effort id extraction from a manifest that failed validation.
fn declared_id(dir: &Path) -> Option<String> {
    let content = std::fs::read_to_string(dir.join(MANIFEST_FILE)).ok()?;
    let value: serde_json::Value = serde_json::from_str(&content).ok()?;
    value
        .get("id")
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
}

fn dir_name(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| dir.display().to_string())
}
