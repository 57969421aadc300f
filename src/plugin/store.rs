//! Durable per-plugin state records.
//!
//! One JSON file per installed plugin (`<state_dir>/<id>.json`). Writes go to
//! a temporary file in the same directory and are renamed into place, so a
//! crash mid-write leaves either the old or the new record.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::{DiscoveryError, StoreError};

use super::manifest::{PluginCategory, PluginState};
use super::registry::InvalidEntry;

const RECORD_EXTENSION: &str = "json";

/// Persisted state of one installed plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginRecord {
    pub id: String,
    pub category: PluginCategory,
    pub version: Version,
    pub enabled: bool,
    pub state: PluginState,
    pub installed_at: DateTime<Utc>,
    /// Monotonic install order; breaks hook priority ties.
    pub sequence: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Everything read back from the store at startup.
#[derive(Debug, Default)]
pub struct StoreSnapshot {
    pub records: Vec<PluginRecord>,
    pub invalid: Vec<InvalidEntry>,
}

impl StoreSnapshot {
    /// The next free install sequence number.
    pub fn next_sequence(&self) -> u64 {
        self.records.iter().map(|r| r.sequence + 1).max().unwrap_or(1)
    }
}

/// Directory-backed store of [`PluginRecord`]s.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    dir: PathBuf,
}

impl ManifestStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", id, RECORD_EXTENSION))
    }

    /// Read every record. A corrupted record becomes an [`InvalidEntry`]
    /// instead of failing the whole load; leftover temporary files are ignored.
    pub fn load(&self) -> Result<StoreSnapshot, StoreError> {
        let mut snapshot = StoreSnapshot::default();

        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(snapshot),
            Err(source) => {
                return Err(StoreError::ReadDir {
                    path: self.dir.clone(),
                    source,
                });
            }
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.is_file() && path.extension().is_some_and(|ext| ext == RECORD_EXTENSION)
            })
            .collect();
        paths.sort();

        for path in paths {
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();

            let parsed = std::fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|content| {
                    serde_json::from_str::<PluginRecord>(&content).map_err(|e| e.to_string())
                });

            match parsed {
                Ok(record) if record.id == stem => snapshot.records.push(record),
                Ok(record) => {
                    warn!("State record {} declares id '{}'", path.display(), record.id);
                    snapshot.invalid.push(InvalidEntry {
                        id: stem,
                        path,
                        error: DiscoveryError::CorruptRecord(format!(
                            "record declares id '{}'",
                            record.id
                        )),
                    });
                }
                Err(reason) => {
                    warn!("Corrupted state record {}: {}", path.display(), reason);
                    snapshot.invalid.push(InvalidEntry {
                        id: stem,
                        path,
                        error: DiscoveryError::CorruptRecord(reason),
                    });
                }
            }
        }

        debug!(
            "Loaded {} plugin records ({} invalid)",
            snapshot.records.len(),
            snapshot.invalid.len()
        );
        Ok(snapshot)
    }

    /// Atomically persist one record.
    pub fn save(&self, record: &PluginRecord) -> Result<(), StoreError> {
        std::fs::create_dir_all(&self.dir).map_err(|source| StoreError::CreateDir {
            path: self.dir.clone(),
            source,
        })?;

        let data = serde_json::to_vec_pretty(record).map_err(|source| StoreError::Serialize {
            id: record.id.clone(),
            source,
        })?;

        let write_err = |source| StoreError::WriteFailed {
            id: record.id.clone(),
            source,
        };

        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(write_err)?;
        tmp.write_all(&data).map_err(write_err)?;
        tmp.as_file().sync_all().map_err(write_err)?;
        tmp.persist(self.record_path(&record.id))
            .map_err(|e| write_err(e.error))?;

        debug!(plugin = %record.id, state = %record.state, "Saved plugin record");
        Ok(())
    }

    /// Delete a record. Removing an absent record is not an error.
    pub fn remove(&self, id: &str) -> Result<(), StoreError> {
        match std::fs::remove_file(self.record_path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::RemoveFailed {
                id: id.to_string(),
                source,
            }),
        }
    }
}
