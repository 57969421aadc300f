//! commit-ai - AI-generated commit messages, extended through plugins.
//!
//! # Overview
//!
//! Plugins are directories holding a `plugin.json` manifest. They are
//! discovered, validated against their declared dependencies, enabled, and
//! then take part in the commit workflow as AI providers, message templates,
//! workflow hooks run at commit phases, or integrations notified of results.
//! Lifecycle state survives restarts through one JSON record per plugin.

pub mod builtin;
pub mod commit;
pub mod config;
pub mod error;
pub mod llm;
pub mod plugin;

// Re-export commonly used types
pub use config::Config;
pub use error::{
    CommitError, ConfigError, DependencyError, DiscoveryError, HookExecutionError, InstallError,
    LifecycleError, LoadError, LoadErrorCause, PluginCallError, PluginError, ScaffoldError,
    StoreError, WorkflowError,
};
pub use plugin::{
    HookContext, HookPhase, InstallSource, PluginCategory, PluginManager, PluginManifest,
    PluginState,
};
