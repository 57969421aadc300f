//! Plugin discovery, lifecycle and hook dispatch.

pub mod capability;
pub mod dependency;
pub mod hooks;
pub mod lifecycle;
pub mod loader;
pub mod manifest;
pub mod process;
pub mod registry;
pub mod scaffold;
pub mod store;

pub use capability::{
    AiProvider, CommitContext, GenerateOptions, HookContext, HookOutcome, HookPhase, HookStatus,
    Integration, IntegrationEvent, PluginInstance, Template, WorkflowHook,
};
pub use dependency::{
    Availability, DependencyChecker, DependencyRecord, DependencyReport, EnvironmentLookup,
    EnvironmentSnapshot, SystemEnvironment,
};
pub use hooks::{HookDispatcher, HookRegistration, OutcomeStatus, PerPluginOutcome, PhaseReport};
pub use lifecycle::{
    InstallSource, ManagerOptions, PluginDetail, PluginFilter, PluginManager, PluginTestReport,
    TestCheck,
};
pub use loader::{PLUGIN_API_VERSION, PluginFactories, PluginLoader};
pub use manifest::{DeclaredDependency, Entrypoint, HookSpec, PluginCategory, PluginManifest, PluginState};
pub use registry::{InvalidEntry, PluginRegistry};
pub use scaffold::{ScaffoldRequest, scaffold_plugin};
pub use store::{ManifestStore, PluginRecord};
