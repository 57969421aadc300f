//! Error types for commit-ai modules using thiserror.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::plugin::{DependencyRecord, HookPhase, PluginState};

/// Errors from parsing or validating a plugin manifest.
///
/// These are recorded against an `InvalidEntry` in the catalog rather than
/// aborting discovery.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("Failed to read manifest {path}: {reason}")]
    Unreadable { path: PathBuf, reason: String },

    #[error("Malformed manifest: {0}")]
    Malformed(String),

    #[error("Missing required field '{0}'")]
    MissingField(&'static str),

    #[error(
        "Unknown category '{0}' (expected ai-provider, template, workflow-hook or integration)"
    )]
    UnknownCategory(String),

    #[error("Invalid version '{value}': {reason}")]
    InvalidVersion { value: String, reason: String },

    #[error("Invalid plugin id '{0}': use lowercase letters, digits, '-' or '_'")]
    InvalidId(String),

    #[error("Invalid dependency '{spec}': {reason}")]
    InvalidDependency { spec: String, reason: String },

    #[error("Invalid entrypoint '{0}': expected 'builtin:<name>' or 'exec:<command>'")]
    InvalidEntrypoint(String),

    #[error("Invalid hooks: {0}")]
    InvalidHooks(String),

    #[error("Duplicate plugin id '{id}' (already declared in {first})")]
    DuplicateId { id: String, first: PathBuf },

    #[error("Installed plugin has no manifest on disk")]
    ManifestMissing,

    #[error("Corrupted state record: {0}")]
    CorruptRecord(String),
}

/// Errors from installing a plugin.
#[derive(Error, Debug)]
pub enum InstallError {
    #[error("Plugin source not found: {0}")]
    SourceNotFound(PathBuf),

    #[error("Unknown bundled plugin '{0}'")]
    UnknownBundled(String),

    #[error("Invalid manifest: {0}")]
    InvalidManifest(#[source] DiscoveryError),

    #[error("Plugin '{0}' is already installed")]
    AlreadyInstalled(String),

    #[error("Failed to copy plugin files: {0}")]
    CopyFailed(#[source] std::io::Error),
}

/// Errors from dependency verification.
#[derive(Error, Debug)]
pub enum DependencyError {
    #[error("Plugin '{plugin_id}' has unmet required dependencies: {}", describe_unmet(.missing))]
    Unmet {
        plugin_id: String,
        missing: Vec<DependencyRecord>,
    },

    #[error("Plugin '{plugin_id}' declares dependency '{name}' more than once")]
    Conflicting { plugin_id: String, name: String },

    #[error("Plugin '{0}' declares a dependency on itself")]
    SelfReference(String),
}

fn describe_unmet(missing: &[DependencyRecord]) -> String {
    missing
        .iter()
        .map(|record| match &record.installed_version {
            Some(found) => format!("{} {} (found {})", record.name, record.required, found),
            None => format!("{} {} (not found)", record.name, record.required),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Why a plugin failed to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadErrorCause {
    /// The entrypoint could not be resolved or constructed.
    ImportFailure,
    /// The loaded object does not implement its category's capability interface.
    ContractViolation,
    /// The plugin targets an incompatible host API or reports a different version.
    VersionMismatch,
}

impl fmt::Display for LoadErrorCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadErrorCause::ImportFailure => write!(f, "import failure"),
            LoadErrorCause::ContractViolation => write!(f, "contract violation"),
            LoadErrorCause::VersionMismatch => write!(f, "version mismatch"),
        }
    }
}

/// Errors from loading a plugin's implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Failed to load plugin '{plugin_id}' ({cause}): {detail}")]
pub struct LoadError {
    pub plugin_id: String,
    pub cause: LoadErrorCause,
    pub detail: String,
}

impl LoadError {
    pub fn import(plugin_id: &str, detail: impl Into<String>) -> Self {
        Self::new(plugin_id, LoadErrorCause::ImportFailure, detail)
    }

    pub fn contract(plugin_id: &str, detail: impl Into<String>) -> Self {
        Self::new(plugin_id, LoadErrorCause::ContractViolation, detail)
    }

    pub fn version(plugin_id: &str, detail: impl Into<String>) -> Self {
        Self::new(plugin_id, LoadErrorCause::VersionMismatch, detail)
    }

    fn new(plugin_id: &str, cause: LoadErrorCause, detail: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            cause,
            detail: detail.into(),
        }
    }
}

/// Errors from invalid lifecycle transitions.
#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("Plugin '{0}' is not installed")]
    NotFound(String),

    #[error("Cannot {action} plugin '{plugin_id}' while it is {state}")]
    InvalidTransition {
        plugin_id: String,
        action: &'static str,
        state: PluginState,
    },

    #[error("Plugin '{plugin_id}' has an invalid manifest: {error}")]
    InvalidManifest {
        plugin_id: String,
        error: DiscoveryError,
    },

    #[error("Failed to remove plugin files for '{plugin_id}': {source}")]
    RemoveFailed {
        plugin_id: String,
        #[source]
        source: std::io::Error,
    },
}

/// An isolated failure of a single hook invocation during dispatch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HookExecutionError {
    #[error("hook failed: {0}")]
    Failed(String),

    #[error("hook reported failure: {0}")]
    Rejected(String),

    #[error("hook timed out after {0:?}")]
    TimedOut(Duration),

    #[error("hook panicked")]
    Panicked,

    #[error("hook instance is not loaded")]
    NotLoaded,
}

/// Errors from the persisted plugin state store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to create state directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read state directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize record for '{id}': {source}")]
    Serialize {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to write record for '{id}': {source}")]
    WriteFailed {
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to remove record for '{id}': {source}")]
    RemoveFailed {
        id: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised by a plugin while exercising its capability interface.
#[derive(Error, Debug)]
pub enum PluginCallError {
    #[error("{0}")]
    Backend(String),

    #[error("{0} not found on PATH")]
    NotInstalled(String),

    #[error("Plugin returned an invalid response: {0}")]
    InvalidResponse(String),

    #[error("Failed to spawn plugin process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("Plugin process exited with code {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },

    #[error("Plugin call timed out after {0:?}")]
    Timeout(Duration),

    #[error("All retry attempts failed: {0}")]
    RetriesExhausted(#[source] Box<PluginCallError>),
}

/// Management-operation errors, surfaced to the host with the offending
/// plugin id and a remediation hint.
#[derive(Error, Debug)]
pub enum PluginError {
    #[error(transparent)]
    Install(#[from] InstallError),

    #[error(transparent)]
    Dependency(#[from] DependencyError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PluginError {
    /// The plugin this error concerns, when known.
    pub fn plugin_id(&self) -> Option<&str> {
        match self {
            PluginError::Install(InstallError::AlreadyInstalled(id)) => Some(id),
            PluginError::Install(_) => None,
            PluginError::Dependency(
                DependencyError::Unmet { plugin_id, .. }
                | DependencyError::Conflicting { plugin_id, .. },
            ) => Some(plugin_id),
            PluginError::Dependency(DependencyError::SelfReference(id)) => Some(id),
            PluginError::Load(e) => Some(&e.plugin_id),
            PluginError::Lifecycle(
                LifecycleError::InvalidTransition { plugin_id, .. }
                | LifecycleError::InvalidManifest { plugin_id, .. }
                | LifecycleError::RemoveFailed { plugin_id, .. },
            ) => Some(plugin_id),
            PluginError::Lifecycle(LifecycleError::NotFound(id)) => Some(id),
            PluginError::Store(
                StoreError::Serialize { id, .. }
                | StoreError::WriteFailed { id, .. }
                | StoreError::RemoveFailed { id, .. },
            ) => Some(id),
            PluginError::Store(_) => None,
        }
    }

    /// A short hint telling the operator how to fix the problem.
    pub fn remediation(&self) -> Option<String> {
        match self {
            PluginError::Dependency(DependencyError::Unmet { missing, .. }) => Some(
                missing
                    .iter()
                    .map(|r| format!("install missing dependency {} ({})", r.name, r.required))
                    .collect::<Vec<_>>()
                    .join("; "),
            ),
            PluginError::Dependency(_) => {
                Some("fix the dependency list in plugin.json and reinstall".to_string())
            }
            PluginError::Load(e) => Some(match e.cause {
                LoadErrorCause::ImportFailure => {
                    "check the manifest entrypoint points at an existing command".to_string()
                }
                LoadErrorCause::ContractViolation => {
                    "implement every operation required by the plugin category".to_string()
                }
                LoadErrorCause::VersionMismatch => {
                    "align the plugin version and host_api requirement with this host".to_string()
                }
            }),
            PluginError::Lifecycle(LifecycleError::InvalidTransition {
                plugin_id,
                state: PluginState::Enabled,
                ..
            }) => Some(format!("run `commit-ai plugins disable {}` first", plugin_id)),
            PluginError::Lifecycle(LifecycleError::InvalidTransition {
                plugin_id,
                state: PluginState::Discovered,
                ..
            }) => Some(format!("run `commit-ai plugins validate {}` first", plugin_id)),
            PluginError::Lifecycle(LifecycleError::NotFound(_)) => {
                Some("run `commit-ai plugins list` to see installed plugins".to_string())
            }
            PluginError::Install(InstallError::AlreadyInstalled(id)) => Some(format!(
                "run `commit-ai plugins uninstall {}` before reinstalling",
                id
            )),
            _ => None,
        }
    }
}

/// Errors from commit message generation operations.
#[derive(Error, Debug)]
pub enum CommitError {
    #[error("No staged changes to commit. Stage files with `git add` first")]
    NoChanges,

    #[error("Failed to collect diff: {0}")]
    DiffFailed(#[source] git2::Error),

    #[error("Failed to create commit: {0}")]
    CommitFailed(#[source] git2::Error),

    #[error("Git config error (missing user.name or user.email): {0}")]
    ConfigError(#[source] git2::Error),
}

/// Errors from the end-to-end commit workflow.
#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error(transparent)]
    Commit(#[from] CommitError),

    #[error("{phase} hooks failed ({}); commit aborted", .plugins.join(", "))]
    PhaseFailed {
        phase: HookPhase,
        plugins: Vec<String>,
    },

    #[error(
        "AI provider '{0}' is not enabled. Run: commit-ai plugins enable {0} (or install builtin:claude-cli --enable)"
    )]
    ProviderNotEnabled(String),

    #[error("Template '{0}' is not enabled. Run: commit-ai plugins enable {0}")]
    TemplateNotEnabled(String),

    #[error("AI provider '{0}' is enabled but its backend is not available")]
    ProviderUnavailable(String),

    #[error("AI provider '{provider}' failed: {source}")]
    Generation {
        provider: String,
        #[source]
        source: PluginCallError,
    },

    #[error("AI provider '{0}' returned an empty message")]
    EmptyMessage(String),

    #[error("Template '{template}' failed: {source}")]
    Render {
        template: String,
        #[source]
        source: PluginCallError,
    },

    #[error("Commit cancelled")]
    Cancelled,
}

/// Errors from configuration loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Could not determine home directory; set COMMIT_AI_HOME")]
    NoHomeDirectory,

    #[error("Failed to read config {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {reason}")]
    ParseFailed { path: PathBuf, reason: String },

    #[error("Invalid value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },
}

/// Errors from scaffolding a new plugin.
#[derive(Error, Debug)]
pub enum ScaffoldError {
    #[error("Invalid plugin name '{0}': use lowercase letters, digits, '-' or '_'")]
    InvalidName(String),

    #[error("Plugin directory already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("Failed to write plugin files: {0}")]
    WriteFailed(#[source] std::io::Error),

    #[error("Failed to serialize manifest: {0}")]
    Serialize(#[source] serde_json::Error),
}
