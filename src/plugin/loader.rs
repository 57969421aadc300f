//! Entrypoint resolution, construction and capability-contract checks.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use semver::Version;
use tracing::{debug, info};

use crate::error::LoadError;

use super::capability::PluginInstance;
use super::manifest::{Entrypoint, PluginManifest};
use super::process;

/// Version of the plugin API this host implements. Manifests declare a
/// `host_api` requirement that must match it.
pub const PLUGIN_API_VERSION: Version = Version::new(1, 0, 0);

/// Constructor for a built-in plugin entrypoint.
pub type PluginConstructor =
    Arc<dyn Fn(&PluginManifest) -> Result<PluginInstance, String> + Send + Sync>;

/// Host-registered constructors addressed by `builtin:<name>` entrypoints,
/// plus the manifests of plugins shipped with the host.
#[derive(Clone, Default)]
pub struct PluginFactories {
    constructors: BTreeMap<String, PluginConstructor>,
    bundled: BTreeMap<String, String>,
}

impl PluginFactories {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: &str, constructor: F)
    where
        F: Fn(&PluginManifest) -> Result<PluginInstance, String> + Send + Sync + 'static,
    {
        self.constructors
            .insert(name.to_string(), Arc::new(constructor));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }

    /// Ship a manifest installable as `builtin:<name>`.
    pub fn bundle(&mut self, name: &str, manifest_json: impl Into<String>) {
        self.bundled.insert(name.to_string(), manifest_json.into());
    }

    pub fn bundled_manifest(&self, name: &str) -> Option<&str> {
        self.bundled.get(name).map(String::as_str)
    }

    pub fn bundled_names(&self) -> Vec<&str> {
        self.bundled.keys().map(String::as_str).collect()
    }

    fn get(&self, name: &str) -> Option<&PluginConstructor> {
        self.constructors.get(name)
    }
}

/// Loads plugin implementations and caches one instance per plugin id.
pub struct PluginLoader {
    factories: PluginFactories,
    instances: RwLock<HashMap<String, PluginInstance>>,
    call_timeout: Duration,
}

impl PluginLoader {
    /// `call_timeout` bounds each external-process plugin invocation.
    pub fn new(factories: PluginFactories, call_timeout: Duration) -> Self {
        Self {
            factories,
            instances: RwLock::new(HashMap::new()),
            call_timeout,
        }
    }

    pub fn factories(&self) -> &PluginFactories {
        &self.factories
    }

    /// Load and initialize a plugin, returning the cached instance if
    /// already loaded.
    ///
    /// Nothing is cached unless construction, every contract check and
    /// `initialize` succeed.
    pub fn load(&self, manifest: &PluginManifest) -> Result<PluginInstance, LoadError> {
        if let Some(existing) = self.instance(&manifest.id) {
            debug!(plugin = %manifest.id, "Reusing loaded instance");
            return Ok(existing);
        }

        let instance = self.construct(manifest)?;
        instance.initialize().map_err(|e| {
            LoadError::import(&manifest.id, format!("initialize failed: {}", e))
        })?;

        let mut instances = self
            .instances
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = instances.get(&manifest.id) {
            instance.shutdown();
            return Ok(existing.clone());
        }
        instances.insert(manifest.id.clone(), instance.clone());
        info!(plugin = %manifest.id, category = %manifest.category, "Plugin loaded");
        Ok(instance)
    }

    /// Resolve and construct an instance without caching it.
    pub fn construct(&self, manifest: &PluginManifest) -> Result<PluginInstance, LoadError> {
        if !manifest.host_api.matches(&PLUGIN_API_VERSION) {
            return Err(LoadError::version(
                &manifest.id,
                format!(
                    "plugin requires host API {} but this host provides {}",
                    manifest.host_api, PLUGIN_API_VERSION
                ),
            ));
        }

        let instance = match &manifest.entrypoint {
            Entrypoint::Builtin(name) => {
                let constructor = self.factories.get(name).ok_or_else(|| {
                    LoadError::import(&manifest.id, format!("no built-in plugin named '{}'", name))
                })?;
                constructor(manifest).map_err(|e| LoadError::import(&manifest.id, e))?
            }
            Entrypoint::Exec(command) => process::load(manifest, command, self.call_timeout)?,
        };

        if instance.category() != manifest.category {
            return Err(LoadError::contract(
                &manifest.id,
                format!(
                    "entrypoint provides a {} but the manifest declares {}",
                    instance.category(),
                    manifest.category
                ),
            ));
        }

        Ok(instance)
    }

    /// Shut down and release a loaded instance. Returns it if one was loaded.
    pub fn unload(&self, id: &str) -> Option<PluginInstance> {
        let removed = self
            .instances
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        if let Some(instance) = &removed {
            instance.shutdown();
            info!(plugin = %id, "Plugin unloaded");
        }
        removed
    }

    /// Shut down every loaded instance.
    pub fn unload_all(&self) {
        let drained: Vec<(String, PluginInstance)> = self
            .instances
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (id, instance) in drained {
            instance.shutdown();
            debug!(plugin = %id, "Plugin shut down");
        }
    }

    pub fn instance(&self, id: &str) -> Option<PluginInstance> {
        self.instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn is_loaded(&self, id: &str) -> bool {
        self.instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }
}
