//! The plugin state machine and the context object hosts hold.
//!
//! `Discovered -> Validated -> Enabled <-> Disabled`, with uninstall allowed
//! from any state except Enabled. Each plugin id has its own lock so
//! operations on distinct plugins never wait on each other.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::{DiscoveryError, InstallError, LifecycleError, PluginCallError, PluginError};

use super::capability::{
    AiProvider, CommitContext, GenerateOptions, HookContext, HookOutcome, HookPhase, HookStatus,
    Integration, IntegrationEvent, PluginInstance, Template,
};
use super::dependency::{DependencyChecker, DependencyReport, EnvironmentLookup};
use super::hooks::{HookDispatcher, HookRegistration, PhaseReport};
use super::loader::{PluginFactories, PluginLoader};
use super::manifest::{MANIFEST_FILE, PluginCategory, PluginManifest, PluginState};
use super::registry::{InvalidEntry, PluginRegistry};
use super::store::{ManifestStore, PluginRecord, StoreSnapshot};

const SAMPLE_DIFF: &str = "diff --git a/src/lib.rs b/src/lib.rs
--- a/src/lib.rs
+++ b/src/lib.rs
@@ -1,3 +1,4 @@
+/// Adds two numbers.
 pub fn add(a: i32, b: i32) -> i32 {
     a + b
 }
";

/// Where the manager keeps plugins and their state.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub plugins_dir: PathBuf,
    pub state_dir: PathBuf,
    /// Default per-hook timeout.
    pub hook_timeout: Duration,
    /// Timeout for each external-process plugin call.
    pub call_timeout: Duration,
}

/// Where to install a plugin from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallSource {
    /// A plugin directory, or a `plugin.json` inside one.
    Path(PathBuf),
    /// A plugin shipped with the host.
    Bundled(String),
}

impl InstallSource {
    /// `builtin:<name>` selects a bundled plugin; anything else is a path.
    pub fn parse(source: &str) -> Self {
        match source.strip_prefix("builtin:") {
            Some(name) => InstallSource::Bundled(name.trim().to_string()),
            None => InstallSource::Path(PathBuf::from(source)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PluginFilter {
    pub category: Option<PluginCategory>,
    pub state: Option<PluginState>,
    pub enabled_only: bool,
}

/// Everything known about one installed plugin.
#[derive(Debug, Clone)]
pub struct PluginDetail {
    pub manifest: PluginManifest,
    pub record: Option<PluginRecord>,
    pub dependencies: DependencyReport,
    pub hooks: Vec<HookRegistration>,
    pub loaded: bool,
    /// Backend availability of a loaded AI provider.
    pub available: Option<bool>,
    /// Models a loaded AI provider accepts.
    pub models: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCheck {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

/// Result of exercising a plugin with canned input.
#[derive(Debug, Clone)]
pub struct PluginTestReport {
    pub plugin_id: String,
    pub dependencies: DependencyReport,
    pub checks: Vec<TestCheck>,
}

impl PluginTestReport {
    pub fn is_success(&self) -> bool {
        self.dependencies.is_satisfied() && self.checks.iter().all(|c| c.passed)
    }
}

/// Owns every plugin's state, loaded instance and registrations.
pub struct PluginManager {
    plugins_dir: PathBuf,
    store: ManifestStore,
    registry: RwLock<PluginRegistry>,
    records: RwLock<BTreeMap<String, PluginRecord>>,
    checker: DependencyChecker,
    loader: PluginLoader,
    hooks: HookDispatcher,
    slots: RwLock<BTreeMap<PluginCategory, BTreeSet<String>>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    next_sequence: AtomicU64,
}

impl PluginManager {
    /// Rebuild the manager from disk.
    ///
    /// Plugins recorded as Enabled are loaded again. One that can no longer
    /// be enabled is demoted to Disabled with the reason kept in its record.
    pub fn open(
        options: ManagerOptions,
        factories: PluginFactories,
        env: Arc<dyn EnvironmentLookup>,
    ) -> Result<Self, PluginError> {
        let store = ManifestStore::new(&options.state_dir);
        let snapshot = store.load()?;

        let mut registry = PluginRegistry::new(&options.plugins_dir);
        let discovered = registry.discover();
        debug!(
            "Discovered {} plugins in {}",
            discovered,
            options.plugins_dir.display()
        );

        let manager = Self {
            plugins_dir: options.plugins_dir,
            store,
            registry: RwLock::new(registry),
            records: RwLock::new(BTreeMap::new()),
            checker: DependencyChecker::new(env),
            loader: PluginLoader::new(factories, options.call_timeout),
            hooks: HookDispatcher::new(options.hook_timeout),
            slots: RwLock::new(BTreeMap::new()),
            locks: Mutex::new(HashMap::new()),
            next_sequence: AtomicU64::new(snapshot.next_sequence()),
        };
        manager.reconstruct(snapshot);
        Ok(manager)
    }

    fn reconstruct(&self, snapshot: StoreSnapshot) {
        {
            let mut registry = self.write_registry();
            let mut records = self.write_records();

            for entry in snapshot.invalid {
                // An unreadable record hides the manifest until an operator
                // repairs or uninstalls it, so its state is never guessed.
                if matches!(entry.error, DiscoveryError::CorruptRecord(_)) {
                    warn!(plugin = %entry.id, "Plugin record is unreadable: {}", entry.error);
                    registry.remove(&entry.id);
                }
                registry.push_invalid(entry);
            }

            for record in snapshot.records {
                if let Some(manifest) = registry.get_mut(&record.id) {
                    manifest.state = record.state;
                    manifest.enabled = record.enabled;
                } else if registry.get_invalid(&record.id).is_none() {
                    warn!(plugin = %record.id, "Installed plugin has no manifest on disk");
                    registry.push_invalid(InvalidEntry {
                        id: record.id.clone(),
                        path: self.plugins_dir.join(&record.id),
                        error: DiscoveryError::ManifestMissing,
                    });
                }
                records.insert(record.id.clone(), record);
            }

            // Manifests placed in the plugins directory by hand.
            let unrecorded: Vec<PluginManifest> = registry
                .list(None)
                .into_iter()
                .filter(|m| !records.contains_key(&m.id))
                .cloned()
                .collect();
            for manifest in unrecorded {
                let record = new_record(&manifest, self.allocate_sequence());
                match self.store.save(&record) {
                    Ok(()) => info!(plugin = %manifest.id, "Adopted plugin found on disk"),
                    Err(e) => warn!(plugin = %manifest.id, "Failed to record adopted plugin: {}", e),
                }
                records.insert(record.id.clone(), record);
            }
        }

        let enabled: Vec<String> = self
            .read_records()
            .values()
            .filter(|r| r.state == PluginState::Enabled)
            .map(|r| r.id.clone())
            .collect();

        for id in enabled {
            let result = self.manifest(&id).map_err(PluginError::from).and_then(|m| {
                self.activate(&m)?;
                Ok(())
            });

            match result {
                Ok(()) => debug!(plugin = %id, "Restored enabled plugin"),
                Err(e) => {
                    warn!(plugin = %id, "Could not re-enable plugin, disabling it: {}", e);
                    let demoted = self.read_records().get(&id).cloned().map(|mut record| {
                        record.state = PluginState::Disabled;
                        record.enabled = false;
                        record.last_error = Some(e.to_string());
                        record
                    });
                    if let Some(record) = demoted {
                        if let Err(save_err) = self.store.save(&record) {
                            warn!(plugin = %id, "Failed to persist demotion: {}", save_err);
                        }
                        self.apply(record);
                    }
                }
            }
        }
    }

    pub fn plugins_dir(&self) -> &Path {
        &self.plugins_dir
    }

    pub fn loader(&self) -> &PluginLoader {
        &self.loader
    }

    pub fn hooks(&self) -> &HookDispatcher {
        &self.hooks
    }

    /// Valid plugins matching `filter`, ordered by id.
    pub fn list(&self, filter: &PluginFilter) -> Vec<PluginManifest> {
        self.read_registry()
            .list(filter.category)
            .into_iter()
            .filter(|m| filter.state.is_none_or(|s| m.state == s))
            .filter(|m| !filter.enabled_only || m.enabled)
            .cloned()
            .collect()
    }

    pub fn invalid_entries(&self) -> Vec<InvalidEntry> {
        self.read_registry().invalid_entries().to_vec()
    }

    pub fn find_by_capability<F>(&self, predicate: F) -> Vec<PluginManifest>
    where
        F: Fn(&str) -> bool,
    {
        self.read_registry()
            .find_by_capability(predicate)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn show(&self, id: &str) -> Result<PluginDetail, PluginError> {
        let manifest = self.manifest(id)?;
        let provider = self.loader.instance(id).and_then(|i| i.as_ai_provider());
        Ok(PluginDetail {
            dependencies: self.checker.verify(&manifest),
            record: self.read_records().get(id).cloned(),
            hooks: self.hooks.registrations_for(id),
            loaded: self.loader.is_loaded(id),
            available: provider.as_ref().map(|p| p.is_available()),
            models: provider.map(|p| p.supported_models()).unwrap_or_default(),
            manifest,
        })
    }

    /// Install a plugin as Discovered.
    pub fn install(&self, source: &InstallSource) -> Result<PluginManifest, PluginError> {
        let (mut manifest, origin) = self.read_source(source)?;

        let lock = self.lock_for(&manifest.id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        if self.read_registry().get(&manifest.id).is_some()
            || self.read_records().contains_key(&manifest.id)
        {
            return Err(InstallError::AlreadyInstalled(manifest.id).into());
        }

        let dest = self.plugins_dir.join(&manifest.id);
        let in_place = match &origin {
            Some(src) => same_path(src, &dest),
            None => false,
        };
        if !in_place && dest.exists() {
            return Err(InstallError::AlreadyInstalled(manifest.id).into());
        }

        match &origin {
            Some(_) if in_place => {}
            Some(src) => copy_dir(src, &dest).map_err(InstallError::CopyFailed)?,
            None => write_bundled(&dest, source, self.loader.factories())
                .map_err(InstallError::CopyFailed)?,
        }
        manifest.dir = dest.clone();

        let record = new_record(&manifest, self.allocate_sequence());

        if let Err(e) = self.store.save(&record) {
            if !in_place {
                let _ = std::fs::remove_dir_all(&dest);
            }
            return Err(e.into());
        }

        self.write_records().insert(record.id.clone(), record);
        self.write_registry().insert(manifest.clone());

        info!(plugin = %manifest.id, version = %manifest.version, "Plugin installed");
        Ok(manifest)
    }

    fn read_source(
        &self,
        source: &InstallSource,
    ) -> Result<(PluginManifest, Option<PathBuf>), InstallError> {
        match source {
            InstallSource::Bundled(name) => {
                let json = self
                    .loader
                    .factories()
                    .bundled_manifest(name)
                    .ok_or_else(|| InstallError::UnknownBundled(name.clone()))?;
                let manifest = PluginManifest::from_json(json, &self.plugins_dir)
                    .map_err(InstallError::InvalidManifest)?;
                Ok((manifest, None))
            }
            InstallSource::Path(path) => {
                let dir = if path.is_file() && path.file_name().is_some_and(|n| n == MANIFEST_FILE)
                {
                    path.parent().map(Path::to_path_buf).unwrap_or_default()
                } else {
                    path.clone()
                };
                if !dir.join(MANIFEST_FILE).is_file() {
                    return Err(InstallError::SourceNotFound(path.clone()));
                }
                let manifest =
                    PluginManifest::from_dir(&dir).map_err(InstallError::InvalidManifest)?;
                Ok((manifest, Some(dir)))
            }
        }
    }

    /// Discovered -> Validated after a static dependency check.
    ///
    /// The returned report reflects the current environment but does not
    /// block validation.
    pub fn validate(&self, id: &str) -> Result<DependencyReport, PluginError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let manifest = self.manifest(id)?;
        if manifest.state != PluginState::Discovered {
            return Err(invalid_transition(&manifest, "validate").into());
        }

        self.checker.check_static(&manifest)?;
        self.transition(&manifest, PluginState::Validated)?;

        info!(plugin = %id, "Plugin validated");
        Ok(self.checker.verify(&manifest))
    }

    /// Validated | Disabled -> Enabled.
    ///
    /// Fails without any state change when a required dependency is unmet
    /// or the implementation cannot be loaded.
    pub fn enable(&self, id: &str) -> Result<DependencyReport, PluginError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let manifest = self.manifest(id)?;
        if !matches!(
            manifest.state,
            PluginState::Validated | PluginState::Disabled
        ) {
            return Err(invalid_transition(&manifest, "enable").into());
        }

        let report = self.activate(&manifest)?;

        if let Err(e) = self.transition(&manifest, PluginState::Enabled) {
            self.deactivate(&manifest);
            return Err(e);
        }

        info!(plugin = %id, category = %manifest.category, "Plugin enabled");
        Ok(report)
    }

    /// Enabled -> Disabled, releasing the loaded instance.
    pub fn disable(&self, id: &str) -> Result<(), PluginError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let manifest = self.manifest(id)?;
        if manifest.state != PluginState::Enabled {
            return Err(invalid_transition(&manifest, "disable").into());
        }

        self.transition(&manifest, PluginState::Disabled)?;
        self.deactivate(&manifest);

        info!(plugin = %id, "Plugin disabled");
        Ok(())
    }

    /// Remove a plugin's files, record and catalog entry. Rejected while
    /// the plugin is Enabled.
    pub fn uninstall(&self, id: &str) -> Result<(), PluginError> {
        let lock = self.lock_for(id);
        let result = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.remove_installed(id)
        };
        if result.is_ok() {
            self.release_lock(id, lock);
        }
        result
    }

    fn remove_installed(&self, id: &str) -> Result<(), PluginError> {
        let (dir, known) = {
            let registry = self.read_registry();
            match (registry.get(id), registry.get_invalid(id)) {
                (Some(manifest), _) if manifest.state == PluginState::Enabled => {
                    return Err(invalid_transition(manifest, "uninstall").into());
                }
                (Some(manifest), _) => (Some(manifest.dir.clone()), true),
                (None, Some(entry)) => match entry.error {
                    DiscoveryError::CorruptRecord(_) => (Some(self.plugins_dir.join(id)), true),
                    _ => (Some(entry.path.clone()), true),
                },
                (None, None) => (None, self.read_records().contains_key(id)),
            }
        };
        if !known {
            return Err(LifecycleError::NotFound(id.to_string()).into());
        }

        // Only files the manager owns are deleted.
        if let Some(dir) = dir.filter(|d| d.is_dir() && d.starts_with(&self.plugins_dir)) {
            std::fs::remove_dir_all(&dir).map_err(|source| LifecycleError::RemoveFailed {
                plugin_id: id.to_string(),
                source,
            })?;
        }

        self.store.remove(id)?;
        self.write_records().remove(id);
        self.write_registry().remove(id);

        info!(plugin = %id, state = %PluginState::Uninstalled, "Plugin uninstalled");
        Ok(())
    }

    /// Run every hook registered for `phase`.
    pub async fn dispatch(&self, phase: HookPhase, context: &HookContext) -> PhaseReport {
        self.hooks
            .dispatch(phase, context, |id| {
                self.loader.instance(id).and_then(|i| i.as_workflow_hook())
            })
            .await
    }

    /// Ids of Enabled plugins of one category.
    pub fn enabled_ids(&self, category: PluginCategory) -> Vec<String> {
        self.read_slots()
            .get(&category)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn providers(&self) -> Vec<String> {
        self.enabled_ids(PluginCategory::AiProvider)
    }

    pub fn templates(&self) -> Vec<String> {
        self.enabled_ids(PluginCategory::Template)
    }

    /// Resolve an Enabled AI provider by id.
    pub fn ai_provider(&self, id: &str) -> Option<Arc<dyn AiProvider>> {
        self.slot_instance(PluginCategory::AiProvider, id)
            .and_then(|i| i.as_ai_provider())
    }

    /// Resolve an Enabled template by id.
    pub fn template(&self, id: &str) -> Option<Arc<dyn Template>> {
        self.slot_instance(PluginCategory::Template, id)
            .and_then(|i| i.as_template())
    }

    /// Every Enabled integration, ordered by id.
    pub fn integrations(&self) -> Vec<(String, Arc<dyn Integration>)> {
        self.enabled_ids(PluginCategory::Integration)
            .into_iter()
            .filter_map(|id| {
                let integration = self.loader.instance(&id)?.as_integration()?;
                Some((id, integration))
            })
            .collect()
    }

    /// Load a plugin (transiently unless already Enabled) and exercise its
    /// capability with canned input.
    pub async fn test(&self, id: &str) -> Result<PluginTestReport, PluginError> {
        let manifest = self.manifest(id)?;
        let dependencies = self.checker.verify(&manifest);

        let (instance, transient) = match self.loader.instance(id) {
            Some(instance) => (instance, false),
            None => (self.loader.construct(&manifest)?, true),
        };

        let mut checks = vec![TestCheck {
            name: "load".to_string(),
            passed: true,
            detail: format!("{} implements its capability", manifest.category),
        }];

        if transient {
            let result = instance.initialize().map(|()| (true, "ok".to_string()));
            let initialized = result.is_ok();
            checks.push(check("initialize", result));
            if !initialized {
                return Ok(PluginTestReport {
                    plugin_id: manifest.id,
                    dependencies,
                    checks,
                });
            }
        }

        match &instance {
            PluginInstance::AiProvider(provider) => {
                let available = provider.is_available();
                let models = provider.supported_models();
                checks.push(TestCheck {
                    name: "available".to_string(),
                    passed: available,
                    detail: if models.is_empty() {
                        "no models listed".to_string()
                    } else {
                        format!("models: {}", models.join(", "))
                    },
                });
                let result = provider.generate(SAMPLE_DIFF, &GenerateOptions::new()).await;
                checks.push(check("generate", result.map(text_outcome)));
            }
            PluginInstance::Template(template) => {
                let context = CommitContext {
                    commit_type: "feat".to_string(),
                    scope: Some("core".to_string()),
                    description: "add sample feature".to_string(),
                    body: None,
                    breaking: false,
                };
                checks.push(check("render", template.render(&context).await.map(text_outcome)));
            }
            PluginInstance::WorkflowHook(hook) => {
                let context = HookContext {
                    diff: Some(SAMPLE_DIFF.to_string()),
                    files: vec!["src/lib.rs".to_string()],
                    ..HookContext::default()
                };
                for spec in &manifest.hooks {
                    let result = hook.run(spec.phase, &context).await;
                    checks.push(check(&format!("run {}", spec.phase), result.map(hook_outcome)));
                }
            }
            PluginInstance::Integration(integration) => {
                let result = integration.notify(&IntegrationEvent::Test).await;
                checks.push(check("notify", result.map(hook_outcome)));
            }
        }

        if transient {
            instance.shutdown();
        }

        Ok(PluginTestReport {
            plugin_id: manifest.id,
            dependencies,
            checks,
        })
    }

    /// Shut down every loaded instance when the host exits. Persisted
    /// states are left as they are so Enabled plugins come back next time.
    pub fn shutdown(&self) {
        self.loader.unload_all();
    }

    /// Check dependencies, load, and register with the dispatcher or slot.
    fn activate(&self, manifest: &PluginManifest) -> Result<DependencyReport, PluginError> {
        let report = self.checker.require(manifest)?;
        self.loader.load(manifest)?;

        let sequence = self
            .read_records()
            .get(&manifest.id)
            .map(|r| r.sequence)
            .unwrap_or_default();

        if manifest.category == PluginCategory::WorkflowHook {
            for spec in &manifest.hooks {
                self.hooks.register(HookRegistration {
                    phase: spec.phase,
                    plugin_id: manifest.id.clone(),
                    priority: spec.priority,
                    critical: spec.critical,
                    sequence,
                    timeout: spec.timeout_secs.map(Duration::from_secs),
                });
            }
        } else {
            self.write_slots()
                .entry(manifest.category)
                .or_default()
                .insert(manifest.id.clone());
        }

        Ok(report)
    }

    fn deactivate(&self, manifest: &PluginManifest) {
        self.hooks.unregister_all(&manifest.id);
        for ids in self.write_slots().values_mut() {
            ids.remove(&manifest.id);
        }
        self.loader.unload(&manifest.id);
    }

    /// Persist a new state, then apply it in memory.
    fn transition(&self, manifest: &PluginManifest, state: PluginState) -> Result<(), PluginError> {
        let mut record = match self.read_records().get(&manifest.id) {
            Some(record) => record.clone(),
            None => new_record(manifest, 0),
        };
        record.state = state;
        record.enabled = state == PluginState::Enabled;
        record.version = manifest.version.clone();
        record.last_error = None;

        self.store.save(&record)?;
        self.apply(record);
        Ok(())
    }

    fn apply(&self, record: PluginRecord) {
        if let Some(manifest) = self.write_registry().get_mut(&record.id) {
            manifest.state = record.state;
            manifest.enabled = record.enabled;
        }
        self.write_records().insert(record.id.clone(), record);
    }

    fn manifest(&self, id: &str) -> Result<PluginManifest, LifecycleError> {
        let registry = self.read_registry();
        if let Some(manifest) = registry.get(id) {
            return Ok(manifest.clone());
        }
        match registry.get_invalid(id) {
            Some(entry) => Err(LifecycleError::InvalidManifest {
                plugin_id: id.to_string(),
                error: entry.error.clone(),
            }),
            None => Err(LifecycleError::NotFound(id.to_string())),
        }
    }

    fn slot_instance(&self, category: PluginCategory, id: &str) -> Option<PluginInstance> {
        let enabled = self
            .read_slots()
            .get(&category)
            .is_some_and(|ids| ids.contains(id));
        if enabled { self.loader.instance(id) } else { None }
    }

    fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(id.to_string()).or_default())
    }

    /// Drop the id's lock entry once nobody else holds or waits on it.
    ///
    /// Clones are only handed out under the map lock, so a count of one
    /// seen under that lock cannot grow behind our back.
    fn release_lock(&self, id: &str, lock: Arc<Mutex<()>>) {
        drop(lock);
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks.get(id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(id);
        }
    }

    fn allocate_sequence(&self) -> u64 {
        self.next_sequence.fetch_add(1, Ordering::SeqCst)
    }

    fn read_registry(&self) -> RwLockReadGuard<'_, PluginRegistry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_registry(&self) -> RwLockWriteGuard<'_, PluginRegistry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_records(&self) -> RwLockReadGuard<'_, BTreeMap<String, PluginRecord>> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_records(&self) -> RwLockWriteGuard<'_, BTreeMap<String, PluginRecord>> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_slots(&self) -> RwLockReadGuard<'_, BTreeMap<PluginCategory, BTreeSet<String>>> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_slots(&self) -> RwLockWriteGuard<'_, BTreeMap<PluginCategory, BTreeSet<String>>> {
        self.slots.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn new_record(manifest: &PluginManifest, sequence: u64) -> PluginRecord {
    PluginRecord {
        id: manifest.id.clone(),
        category: manifest.category,
        version: manifest.version.clone(),
        enabled: false,
        state: PluginState::Discovered,
        installed_at: Utc::now(),
        sequence,
        last_error: None,
    }
}

fn invalid_transition(manifest: &PluginManifest, action: &'static str) -> LifecycleError {
    LifecycleError::InvalidTransition {
        plugin_id: manifest.id.clone(),
        action,
        state: manifest.state,
    }
}

fn check(name: &str, result: Result<(bool, String), PluginCallError>) -> TestCheck {
    let (passed, detail) = result.unwrap_or_else(|e| (false, e.to_string()));
    TestCheck {
        name: name.to_string(),
        passed,
        detail,
    }
}

fn text_outcome(output: String) -> (bool, String) {
    let output = output.trim();
    if output.is_empty() {
        (false, "empty output".to_string())
    } else {
        (true, output.to_string())
    }
}

fn hook_outcome(outcome: HookOutcome) -> (bool, String) {
    (
        outcome.status != HookStatus::Failed,
        format!("{:?}: {}", outcome.status, outcome.detail),
    )
}

fn same_path(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn copy_dir(src: &Path, dest: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn write_bundled(
    dest: &Path,
    source: &InstallSource,
    factories: &PluginFactories,
) -> std::io::Result<()> {
    let json = match source {
        InstallSource::Bundled(name) => factories.bundled_manifest(name).unwrap_or_default(),
        InstallSource::Path(_) => return Ok(()),
    };
    std::fs::create_dir_all(dest)?;
    std::fs::write(dest.join(MANIFEST_FILE), json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::dependency::EnvironmentSnapshot;

    fn manager(root: &Path) -> PluginManager {
        manager_bundling(root, &["notes"])
    }

    fn manager_bundling(root: &Path, names: &[&str]) -> PluginManager {
        let mut factories = PluginFactories::new();
        for name in names {
            factories.bundle(
                name,
                format!(
                    r#"{{"id": "{name}", "category": "integration", "version": "0.1.0", "entrypoint": "builtin:{name}"}}"#
                ),
            );
        }
        PluginManager::open(
            ManagerOptions {
                plugins_dir: root.join("plugins"),
                state_dir: root.join("state"),
                hook_timeout: Duration::from_secs(5),
                call_timeout: Duration::from_secs(5),
            },
            factories,
            Arc::new(EnvironmentSnapshot::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_install_source_parse() {
        assert_eq!(
            InstallSource::parse("builtin:claude-cli"),
            InstallSource::Bundled("claude-cli".to_string())
        );
        assert_eq!(
            InstallSource::parse("./my-plugin"),
            InstallSource::Path(PathBuf::from("./my-plugin"))
        );
    }

    #[test]
    fn test_install_bundled_writes_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());

        let manifest = manager
            .install(&InstallSource::Bundled("notes".to_string()))
            .unwrap();

        assert_eq!(manifest.state, PluginState::Discovered);
        assert!(dir.path().join("plugins/notes/plugin.json").is_file());
        assert!(dir.path().join("state/notes.json").is_file());
    }

    #[test]
    fn test_install_unknown_bundled() {
        let dir = tempfile::tempdir().unwrap();
        let err = manager(dir.path())
            .install(&InstallSource::Bundled("nope".to_string()))
            .unwrap_err();
        assert!(matches!(
            err,
            PluginError::Install(InstallError::UnknownBundled(_))
        ));
    }

    #[test]
    fn test_validate_requires_discovered() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        manager
            .install(&InstallSource::Bundled("notes".to_string()))
            .unwrap();

        manager.validate("notes").unwrap();
        let err = manager.validate("notes").unwrap_err();
        assert!(matches!(
            err,
            PluginError::Lifecycle(LifecycleError::InvalidTransition {
                state: PluginState::Validated,
                ..
            })
        ));
    }

    #[test]
    fn test_enable_load_failure_leaves_state() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        manager
            .install(&InstallSource::Bundled("notes".to_string()))
            .unwrap();
        manager.validate("notes").unwrap();

        // No constructor is registered for builtin:notes.
        let err = manager.enable("notes").unwrap_err();
        assert!(matches!(err, PluginError::Load(_)));
        assert_eq!(
            manager.show("notes").unwrap().manifest.state,
            PluginState::Validated
        );
        assert!(!manager.loader().is_loaded("notes"));
        assert!(manager.integrations().is_empty());
    }

    #[test]
    fn test_unknown_plugin_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        assert!(matches!(
            manager.enable("ghost"),
            Err(PluginError::Lifecycle(LifecycleError::NotFound(_)))
        ));
        assert!(matches!(
            manager.uninstall("ghost"),
            Err(PluginError::Lifecycle(LifecycleError::NotFound(_)))
        ));
    }

    #[test]
    fn test_uninstall_keeps_lock_while_others_hold_it() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        manager
            .install(&InstallSource::Bundled("notes".to_string()))
            .unwrap();

        let waiting = manager.lock_for("notes");
        manager.uninstall("notes").unwrap();

        // A caller that cloned the lock before the uninstall must share it
        // with every later caller.
        assert!(Arc::ptr_eq(&waiting, &manager.lock_for("notes")));

        drop(waiting);
        manager
            .install(&InstallSource::Bundled("notes".to_string()))
            .unwrap();
        manager.uninstall("notes").unwrap();
        assert!(!manager.locks.lock().unwrap().contains_key("notes"));
    }

    #[test]
    fn test_concurrent_installs_of_one_id_are_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());

        let results: Vec<Result<PluginManifest, PluginError>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| manager.install(&InstallSource::Bundled("notes".to_string())))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        for err in results.into_iter().filter_map(Result::err) {
            assert!(matches!(
                err,
                PluginError::Install(InstallError::AlreadyInstalled(_))
            ));
        }
        assert_eq!(manager.list(&PluginFilter::default()).len(), 1);
    }

    #[test]
    fn test_concurrent_installs_get_distinct_sequences() {
        let dir = tempfile::tempdir().unwrap();
        let names = ["alpha", "bravo", "charlie", "delta", "echo", "foxtrot"];
        let manager = manager_bundling(dir.path(), &names);

        std::thread::scope(|scope| {
            for name in names {
                let manager = &manager;
                scope.spawn(move || {
                    manager
                        .install(&InstallSource::Bundled(name.to_string()))
                        .unwrap()
                });
            }
        });

        let sequences: BTreeSet<u64> = names
            .iter()
            .map(|name| manager.show(name).unwrap().record.unwrap().sequence)
            .collect();
        assert_eq!(sequences.len(), names.len());
    }

    #[test]
    fn test_open_continues_sequence_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let first = manager_bundling(dir.path(), &["alpha", "bravo"]);
        first
            .install(&InstallSource::Bundled("alpha".to_string()))
            .unwrap();
        let alpha = first.show("alpha").unwrap().record.unwrap().sequence;
        drop(first);

        let second = manager_bundling(dir.path(), &["alpha", "bravo"]);
        second
            .install(&InstallSource::Bundled("bravo".to_string()))
            .unwrap();
        let bravo = second.show("bravo").unwrap().record.unwrap().sequence;
        assert!(bravo > alpha);
    }
}
