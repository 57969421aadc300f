//! Shared test utilities for integration tests.
//!
//! Not all functions are used by every test file, but they're shared across tests.
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use git2::{Oid, Repository, Signature};
use serde_json::{Value, json};

use commit_ai::PluginCallError;
use commit_ai::plugin::{
    AiProvider, CommitContext, EnvironmentSnapshot, GenerateOptions, HookContext, HookOutcome,
    HookPhase, Integration, IntegrationEvent, ManagerOptions, PluginFactories, PluginInstance,
    PluginManager, Template, WorkflowHook,
};

/// A scratch plugin home: `plugins/` and `state/` under one temp dir.
pub struct TestHome {
    pub dir: tempfile::TempDir,
}

impl TestHome {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("Failed to create temp directory"),
        }
    }

    pub fn plugins_dir(&self) -> PathBuf {
        self.dir.path().join("plugins")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.dir.path().join("state")
    }

    /// A directory outside the plugins dir to install from.
    pub fn source_dir(&self) -> PathBuf {
        self.dir.path().join("sources")
    }

    pub fn options(&self) -> ManagerOptions {
        ManagerOptions {
            plugins_dir: self.plugins_dir(),
            state_dir: self.state_dir(),
            hook_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(10),
        }
    }

    pub fn open(&self, factories: PluginFactories, env: EnvironmentSnapshot) -> PluginManager {
        PluginManager::open(self.options(), factories, Arc::new(env))
            .expect("Failed to open plugin manager")
    }
}

/// Write `plugin.json` into `<parent>/<id>/` and return the plugin dir.
pub fn write_manifest(parent: &Path, manifest: &Value) -> PathBuf {
    let id = manifest["id"].as_str().expect("manifest needs an id");
    let dir = parent.join(id);
    std::fs::create_dir_all(&dir).expect("Failed to create plugin dir");
    std::fs::write(
        dir.join("plugin.json"),
        serde_json::to_string_pretty(manifest).expect("Failed to serialize manifest"),
    )
    .expect("Failed to write manifest");
    dir
}

/// Manifest for a built-in workflow hook with one hook at `phase`.
pub fn hook_manifest(id: &str, phase: &str, priority: i32, critical: bool) -> Value {
    json!({
        "id": id,
        "category": "workflow-hook",
        "version": "1.0.0",
        "entrypoint": format!("builtin:{}", id),
        "hooks": [{"phase": phase, "priority": priority, "critical": critical}],
    })
}

/// Manifest for a built-in plugin of a non-hook category.
pub fn plugin_manifest(id: &str, category: &str) -> Value {
    json!({
        "id": id,
        "category": category,
        "version": "1.0.0",
        "entrypoint": format!("builtin:{}", id),
    })
}

/// How a fake hook behaves when run.
#[derive(Debug, Clone)]
pub enum Behavior {
    Pass,
    Warn,
    Reject(&'static str),
    Error(&'static str),
    Sleep(Duration),
    Panic,
}

/// Records hook invocations in order across plugins.
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().expect("call log poisoned").push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().expect("call log poisoned").clone()
    }
}

pub struct FakeHook {
    pub id: String,
    pub behavior: Behavior,
    pub log: CallLog,
}

#[async_trait]
impl WorkflowHook for FakeHook {
    async fn run(
        &self,
        phase: HookPhase,
        _context: &HookContext,
    ) -> Result<HookOutcome, PluginCallError> {
        self.log.push(format!("{}@{}", self.id, phase));
        match &self.behavior {
            Behavior::Pass => Ok(HookOutcome::passed("ok")),
            Behavior::Warn => Ok(HookOutcome::warning("careful")),
            Behavior::Reject(reason) => Ok(HookOutcome::failed(*reason)),
            Behavior::Error(reason) => Err(PluginCallError::Backend(reason.to_string())),
            Behavior::Sleep(d) => {
                tokio::time::sleep(*d).await;
                Ok(HookOutcome::passed("slept"))
            }
            Behavior::Panic => panic!("hook {} blew up", self.id),
        }
    }
}

/// Provider that returns a fixed message and counts calls.
pub struct FakeProvider {
    pub message: String,
    pub calls: Arc<AtomicUsize>,
    pub available: bool,
}

#[async_trait]
impl AiProvider for FakeProvider {
    async fn generate(
        &self,
        diff: &str,
        _options: &GenerateOptions,
    ) -> Result<String, PluginCallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if diff.is_empty() {
            return Err(PluginCallError::InvalidResponse("empty diff".to_string()));
        }
        Ok(self.message.clone())
    }

    fn is_available(&self) -> bool {
        self.available
    }
}

/// Template that brackets the description so rendering is visible.
pub struct BracketTemplate;

#[async_trait]
impl Template for BracketTemplate {
    async fn render(&self, context: &CommitContext) -> Result<String, PluginCallError> {
        Ok(format!("{}: [{}]", context.commit_type, context.description))
    }
}

/// Integration that records every event it receives.
pub struct RecordingIntegration {
    pub events: Arc<Mutex<Vec<IntegrationEvent>>>,
}

#[async_trait]
impl Integration for RecordingIntegration {
    async fn notify(&self, event: &IntegrationEvent) -> Result<HookOutcome, PluginCallError> {
        self.events
            .lock()
            .expect("event log poisoned")
            .push(event.clone());
        Ok(HookOutcome::passed("recorded"))
    }
}

/// Register a fake hook constructor under `id`.
pub fn register_hook(factories: &mut PluginFactories, id: &str, behavior: Behavior, log: &CallLog) {
    let hook_id = id.to_string();
    let log = log.clone();
    factories.register(id, move |_| {
        Ok(PluginInstance::WorkflowHook(Arc::new(FakeHook {
            id: hook_id.clone(),
            behavior: behavior.clone(),
            log: log.clone(),
        })))
    });
}

pub fn register_provider(factories: &mut PluginFactories, id: &str, message: &str) -> Arc<AtomicUsize> {
    register_provider_with(factories, id, message, true)
}

/// Like [`register_provider`], but the provider reports whether its backend
/// is reachable.
pub fn register_provider_with(
    factories: &mut PluginFactories,
    id: &str,
    message: &str,
    available: bool,
) -> Arc<AtomicUsize> {
    let calls = Arc::new(AtomicUsize::new(0));
    let message = message.to_string();
    let counter = Arc::clone(&calls);
    factories.register(id, move |_| {
        Ok(PluginInstance::AiProvider(Arc::new(FakeProvider {
            message: message.clone(),
            calls: Arc::clone(&counter),
            available,
        })))
    });
    calls
}

pub fn register_template(factories: &mut PluginFactories, id: &str) {
    factories.register(id, |_| Ok(PluginInstance::Template(Arc::new(BracketTemplate))));
}

pub fn register_integration(
    factories: &mut PluginFactories,
    id: &str,
) -> Arc<Mutex<Vec<IntegrationEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let shared = Arc::clone(&events);
    factories.register(id, move |_| {
        Ok(PluginInstance::Integration(Arc::new(RecordingIntegration {
            events: Arc::clone(&shared),
        })))
    });
    events
}

/// Install from `source_dir`, validate and enable. Panics on failure.
pub fn install_enabled(manager: &PluginManager, source: &Path, manifest: &Value) {
    let dir = write_manifest(source, manifest);
    let installed = manager
        .install(&commit_ai::InstallSource::Path(dir))
        .expect("install failed");
    manager.validate(&installed.id).expect("validate failed");
    manager.enable(&installed.id).expect("enable failed");
}

/// A test git repository builder for integration tests.
pub struct TestRepo {
    pub dir: tempfile::TempDir,
    pub repo: Repository,
}

impl TestRepo {
    /// Create a new empty git repository with a committer identity.
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp directory");
        let repo = Repository::init(dir.path()).expect("Failed to init git repo");
        {
            let mut config = repo.config().expect("Failed to open repo config");
            config
                .set_str("user.name", "Test User")
                .expect("Failed to set user.name");
            config
                .set_str("user.email", "test@example.com")
                .expect("Failed to set user.email");
        }
        Self { dir, repo }
    }

    /// Write a file and add it to the index.
    pub fn stage(&self, path: &str, content: &str) {
        let full = self.dir.path().join(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create parent dir");
        }
        std::fs::write(&full, content).expect("Failed to write file");
        let mut index = self.repo.index().expect("Failed to get index");
        index.add_path(Path::new(path)).expect("Failed to add file");
        index.write().expect("Failed to write index");
    }

    /// Stage a file and commit it directly.
    pub fn commit(&self, path: &str, content: &str, message: &str) -> Oid {
        self.stage(path, content);
        let sig = Signature::now("Test User", "test@example.com").expect("Failed to create signature");
        let mut index = self.repo.index().expect("Failed to get index");
        let tree_id = index.write_tree().expect("Failed to write tree");
        let tree = self.repo.find_tree(tree_id).expect("Failed to find tree");
        let parent = self.repo.head().ok().and_then(|h| h.peel_to_commit().ok());
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        self.repo
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
            .expect("Failed to create commit")
    }

    pub fn head_message(&self) -> Option<String> {
        let commit = self.repo.head().ok()?.peel_to_commit().ok()?;
        commit.message().map(String::from)
    }
}
