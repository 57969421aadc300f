//! Dependency verification against an injectable environment snapshot.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex_lite::Regex;
use semver::{Version, VersionReq};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::DependencyError;

use super::manifest::PluginManifest;
use super::process::run_blocking;

/// Upper bound on `<dependency> --version`.
const VERSION_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Whether a dependency is present in the environment, and at what version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    Missing,
    /// Present; `None` when the version could not be determined.
    Present(Option<Version>),
}

/// Source of truth for what the environment provides.
#[cfg_attr(test, mockall::automock)]
pub trait EnvironmentLookup: Send + Sync {
    fn lookup(&self, name: &str) -> Availability;
}

/// A fixed, in-memory environment.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentSnapshot {
    entries: BTreeMap<String, Option<Version>>,
}

impl EnvironmentSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, version: Option<Version>) -> Self {
        self.insert(name, version);
        self
    }

    pub fn insert(&mut self, name: &str, version: Option<Version>) {
        self.entries.insert(name.to_string(), version);
    }
}

impl EnvironmentLookup for EnvironmentSnapshot {
    fn lookup(&self, name: &str) -> Availability {
        match self.entries.get(name) {
            Some(version) => Availability::Present(version.clone()),
            None => Availability::Missing,
        }
    }
}

static VERSION_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(\d+)\.(\d+)(?:\.(\d+))?").ok());

/// Pull the first `x.y[.z]` version out of free-form `--version` output.
pub fn parse_version_output(output: &str) -> Option<Version> {
    let caps = VERSION_PATTERN.as_ref()?.captures(output)?;
    let part = |i: usize| {
        caps.get(i)
            .and_then(|m| m.as_str().parse::<u64>().ok())
            .unwrap_or(0)
    };
    Some(Version::new(part(1), part(2), part(3)))
}

/// Looks dependencies up as executables on `PATH`, with host-provided
/// entries taking precedence.
#[derive(Debug, Clone)]
pub struct SystemEnvironment {
    provided: EnvironmentSnapshot,
    version_timeout: Duration,
}

impl Default for SystemEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemEnvironment {
    pub fn new() -> Self {
        Self {
            provided: EnvironmentSnapshot::new(),
            version_timeout: VERSION_CHECK_TIMEOUT,
        }
    }

    /// Bound on each `--version` call.
    pub fn version_timeout(mut self, limit: Duration) -> Self {
        self.version_timeout = limit;
        self
    }

    /// Register something the host itself provides (e.g. its own version).
    pub fn provide(mut self, name: &str, version: Version) -> Self {
        self.provided.insert(name, Some(version));
        self
    }
}

impl EnvironmentLookup for SystemEnvironment {
    fn lookup(&self, name: &str) -> Availability {
        if let Availability::Present(v) = self.provided.lookup(name) {
            return Availability::Present(v);
        }

        let path = match which::which(name) {
            Ok(path) => path,
            Err(_) => return Availability::Missing,
        };

        let mut version_check = Command::new(&path);
        version_check.arg("--version");
        let version = run_blocking(version_check, self.version_timeout)
            .inspect_err(|e| debug!("Version check for {} failed: {}", name, e))
            .ok()
            .filter(|output| output.status.success())
            .and_then(|output| {
                let text = format!(
                    "{}{}",
                    String::from_utf8_lossy(&output.stdout),
                    String::from_utf8_lossy(&output.stderr)
                );
                parse_version_output(&text)
            });

        debug!("Resolved dependency {} at {} ({:?})", name, path.display(), version);
        Availability::Present(version)
    }
}

/// Outcome of checking one declared dependency. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyRecord {
    pub name: String,
    pub required: VersionReq,
    pub optional: bool,
    pub satisfied: bool,
    pub installed_version: Option<Version>,
}

/// Result of [`DependencyChecker::verify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyReport {
    pub plugin_id: String,
    pub records: Vec<DependencyRecord>,
}

impl DependencyReport {
    /// Unmet dependencies that block enabling.
    pub fn unmet_required(&self) -> Vec<&DependencyRecord> {
        self.records
            .iter()
            .filter(|r| !r.satisfied && !r.optional)
            .collect()
    }

    /// Unmet optional dependencies, reported as warnings only.
    pub fn warnings(&self) -> Vec<&DependencyRecord> {
        self.records
            .iter()
            .filter(|r| !r.satisfied && r.optional)
            .collect()
    }

    pub fn is_satisfied(&self) -> bool {
        self.unmet_required().is_empty()
    }
}

/// Evaluates declared dependencies. Pure: safe to call repeatedly.
#[derive(Clone)]
pub struct DependencyChecker {
    env: Arc<dyn EnvironmentLookup>,
}

impl DependencyChecker {
    pub fn new(env: Arc<dyn EnvironmentLookup>) -> Self {
        Self { env }
    }

    /// Check every declared dependency against the environment.
    pub fn verify(&self, manifest: &PluginManifest) -> DependencyReport {
        let records = manifest
            .dependencies
            .iter()
            .map(|dep| {
                let (satisfied, installed_version) = match self.env.lookup(&dep.name) {
                    Availability::Missing => (false, None),
                    // Without a version only the wildcard constraint can be proven.
                    Availability::Present(None) => (dep.constraint == VersionReq::STAR, None),
                    Availability::Present(Some(v)) => (dep.constraint.matches(&v), Some(v)),
                };
                DependencyRecord {
                    name: dep.name.clone(),
                    required: dep.constraint.clone(),
                    optional: dep.optional,
                    satisfied,
                    installed_version,
                }
            })
            .collect();

        DependencyReport {
            plugin_id: manifest.id.clone(),
            records,
        }
    }

    /// Verify and fail on any unmet required dependency. Unmet optional
    /// dependencies are logged and returned in the report.
    pub fn require(&self, manifest: &PluginManifest) -> Result<DependencyReport, DependencyError> {
        let report = self.verify(manifest);

        for record in report.warnings() {
            warn!(
                plugin = %manifest.id,
                "Optional dependency {} {} is not available",
                record.name,
                record.required
            );
        }

        let missing: Vec<DependencyRecord> =
            report.unmet_required().into_iter().cloned().collect();
        if !missing.is_empty() {
            return Err(DependencyError::Unmet {
                plugin_id: manifest.id.clone(),
                missing,
            });
        }

        Ok(report)
    }

    /// Static check that the declared dependencies are resolvable in
    /// principle, without consulting the environment.
    pub fn check_static(&self, manifest: &PluginManifest) -> Result<(), DependencyError> {
        let mut seen = HashSet::new();
        for dep in &manifest.dependencies {
            if dep.name == manifest.id {
                return Err(DependencyError::SelfReference(manifest.id.clone()));
            }
            if !seen.insert(dep.name.as_str()) {
                return Err(DependencyError::Conflicting {
                    plugin_id: manifest.id.clone(),
                    name: dep.name.clone(),
                });
            }
        }
        Ok(())
    }
}
