//! Plugin manifest parsing and schema validation.
//!
//! Manifests are plain JSON (`plugin.json`) and are parsed without executing
//! any plugin-supplied code.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;

use regex_lite::Regex;
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};

use crate::error::DiscoveryError;

use super::capability::HookPhase;

/// File name of a plugin manifest inside its plugin directory.
pub const MANIFEST_FILE: &str = "plugin.json";

/// Host API requirement assumed when a manifest does not declare one.
const DEFAULT_HOST_API: &str = "^1";

static ID_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9_-]*$").ok());

/// `name` followed by an optional constraint, e.g. `libX>=2.0`.
static SHORT_DEPENDENCY_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^([A-Za-z0-9._-]+)\s*(.*)$").ok());

/// The capability category a plugin provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PluginCategory {
    AiProvider,
    Template,
    WorkflowHook,
    Integration,
}

impl PluginCategory {
    pub const ALL: [PluginCategory; 4] = [
        PluginCategory::AiProvider,
        PluginCategory::Template,
        PluginCategory::WorkflowHook,
        PluginCategory::Integration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PluginCategory::AiProvider => "ai-provider",
            PluginCategory::Template => "template",
            PluginCategory::WorkflowHook => "workflow-hook",
            PluginCategory::Integration => "integration",
        }
    }

    /// Operations a plugin of this category must expose.
    pub fn required_operations(&self) -> &'static [&'static str] {
        match self {
            PluginCategory::AiProvider => &["generate"],
            PluginCategory::Template => &["render"],
            PluginCategory::WorkflowHook => &["run"],
            PluginCategory::Integration => &["notify"],
        }
    }
}

impl fmt::Display for PluginCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PluginCategory {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "ai-provider" | "aiprovider" | "provider" => Ok(Self::AiProvider),
            "template" => Ok(Self::Template),
            "workflow-hook" | "workflowhook" | "workflow" | "hook" => Ok(Self::WorkflowHook),
            "integration" => Ok(Self::Integration),
            _ => Err(DiscoveryError::UnknownCategory(s.to_string())),
        }
    }
}

/// Lifecycle state of an installed plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PluginState {
    Discovered,
    Validated,
    Enabled,
    Disabled,
    Uninstalled,
}

impl PluginState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginState::Discovered => "discovered",
            PluginState::Validated => "validated",
            PluginState::Enabled => "enabled",
            PluginState::Disabled => "disabled",
            PluginState::Uninstalled => "uninstalled",
        }
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PluginState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "discovered" => Ok(Self::Discovered),
            "validated" => Ok(Self::Validated),
            "enabled" => Ok(Self::Enabled),
            "disabled" => Ok(Self::Disabled),
            "uninstalled" => Ok(Self::Uninstalled),
            _ => Err(format!("Unknown plugin state: {}", s)),
        }
    }
}

/// Where a plugin's implementation comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entrypoint {
    /// A constructor registered by the host under this name.
    Builtin(String),
    /// An external command speaking the JSON process protocol.
    Exec(String),
}

impl fmt::Display for Entrypoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entrypoint::Builtin(name) => write!(f, "builtin:{}", name),
            Entrypoint::Exec(command) => write!(f, "exec:{}", command),
        }
    }
}

impl FromStr for Entrypoint {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DiscoveryError::InvalidEntrypoint(s.to_string());
        let (kind, target) = s.split_once(':').ok_or_else(invalid)?;
        let target = target.trim();
        if target.is_empty() {
            return Err(invalid());
        }
        match kind.trim() {
            "builtin" => Ok(Entrypoint::Builtin(target.to_string())),
            "exec" => Ok(Entrypoint::Exec(target.to_string())),
            _ => Err(invalid()),
        }
    }
}

/// A dependency declared by a plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredDependency {
    pub name: String,
    pub constraint: VersionReq,
    pub optional: bool,
}

impl DeclaredDependency {
    /// Parse the short form `name<constraint>`, e.g. `libX>=2.0` or `git`.
    pub fn parse_short(spec: &str) -> Result<Self, DiscoveryError> {
        let spec = spec.trim();
        let caps = SHORT_DEPENDENCY_PATTERN
            .as_ref()
            .and_then(|re| re.captures(spec));
        let name = caps.as_ref().and_then(|c| c.get(1)).map_or("", |m| m.as_str());
        let constraint = caps.as_ref().and_then(|c| c.get(2)).map(|m| m.as_str());
        Self::build(spec, name, constraint, false)
    }

    fn build(
        spec: &str,
        name: &str,
        constraint: Option<&str>,
        optional: bool,
    ) -> Result<Self, DiscoveryError> {
        if name.is_empty() {
            return Err(DiscoveryError::InvalidDependency {
                spec: spec.to_string(),
                reason: "missing dependency name".to_string(),
            });
        }
        let constraint = match constraint.map(str::trim) {
            None | Some("") => VersionReq::STAR,
            Some(c) => VersionReq::parse(c).map_err(|e| DiscoveryError::InvalidDependency {
                spec: spec.to_string(),
                reason: e.to_string(),
            })?,
        };
        Ok(Self {
            name: name.to_string(),
            constraint,
            optional,
        })
    }
}

/// Hook registration declared by a workflow-hook plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookSpec {
    pub phase: HookPhase,
    pub priority: i32,
    pub critical: bool,
    pub timeout_secs: Option<u64>,
}

/// Static description of a plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginManifest {
    pub id: String,
    pub category: PluginCategory,
    pub version: Version,
    pub entrypoint: Entrypoint,
    pub dependencies: Vec<DeclaredDependency>,
    pub description: String,
    pub author: Option<String>,
    pub hooks: Vec<HookSpec>,
    pub host_api: VersionReq,
    pub enabled: bool,
    pub state: PluginState,
    /// Directory the manifest was read from.
    pub dir: PathBuf,
}

#[derive(Deserialize)]
struct RawManifest {
    id: Option<String>,
    category: Option<String>,
    version: Option<String>,
    entrypoint: Option<String>,
    #[serde(default, alias = "capability_description")]
    description: String,
    author: Option<String>,
    #[serde(default)]
    dependencies: Vec<RawDependency>,
    #[serde(default)]
    hooks: Vec<RawHook>,
    host_api: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDependency {
    Short(String),
    Full {
        name: String,
        #[serde(default)]
        version: Option<String>,
        #[serde(default)]
        optional: bool,
    },
}

#[derive(Deserialize)]
struct RawHook {
    phase: String,
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    critical: bool,
    timeout_secs: Option<u64>,
}

impl PluginManifest {
    /// Read and validate `plugin.json` from a plugin directory.
    pub fn from_dir(dir: &Path) -> Result<Self, DiscoveryError> {
        let path = dir.join(MANIFEST_FILE);
        let content =
            std::fs::read_to_string(&path).map_err(|e| DiscoveryError::Unreadable {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        Self::from_json(&content, dir)
    }

    /// Parse and validate manifest JSON. `dir` anchors relative entrypoints.
    pub fn from_json(content: &str, dir: &Path) -> Result<Self, DiscoveryError> {
        let raw: RawManifest =
            serde_json::from_str(content).map_err(|e| DiscoveryError::Malformed(e.to_string()))?;

        let id = required(raw.id, "id")?;
        if !is_valid_id(&id) {
            return Err(DiscoveryError::InvalidId(id));
        }

        let category: PluginCategory = required(raw.category, "category")?.parse()?;

        let version_str = required(raw.version, "version")?;
        let version =
            Version::parse(version_str.trim()).map_err(|e| DiscoveryError::InvalidVersion {
                value: version_str.clone(),
                reason: e.to_string(),
            })?;

        let entrypoint: Entrypoint = required(raw.entrypoint, "entrypoint")?.parse()?;

        let dependencies = raw
            .dependencies
            .into_iter()
            .map(|dep| match dep {
                RawDependency::Short(spec) => DeclaredDependency::parse_short(&spec),
                RawDependency::Full {
                    name,
                    version,
                    optional,
                } => DeclaredDependency::build(&name, name.trim(), version.as_deref(), optional),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let hooks = raw
            .hooks
            .into_iter()
            .map(|hook| {
                Ok(HookSpec {
                    phase: hook.phase.parse().map_err(DiscoveryError::InvalidHooks)?,
                    priority: hook.priority,
                    critical: hook.critical,
                    timeout_secs: hook.timeout_secs,
                })
            })
            .collect::<Result<Vec<_>, DiscoveryError>>()?;

        // The dispatcher keeps one registration per plugin and phase.
        for (i, hook) in hooks.iter().enumerate() {
            if hooks[..i].iter().any(|h| h.phase == hook.phase) {
                return Err(DiscoveryError::InvalidHooks(format!(
                    "duplicate hook phase '{}'",
                    hook.phase
                )));
            }
        }

        match category {
            PluginCategory::WorkflowHook if hooks.is_empty() => {
                return Err(DiscoveryError::InvalidHooks(
                    "a workflow-hook plugin must declare at least one hook".to_string(),
                ));
            }
            PluginCategory::WorkflowHook => {}
            _ if !hooks.is_empty() => {
                return Err(DiscoveryError::InvalidHooks(format!(
                    "only workflow-hook plugins may declare hooks (category is {})",
                    category
                )));
            }
            _ => {}
        }

        let host_api_str = raw.host_api.unwrap_or_else(|| DEFAULT_HOST_API.to_string());
        let host_api =
            VersionReq::parse(&host_api_str).map_err(|e| DiscoveryError::InvalidVersion {
                value: host_api_str.clone(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            id,
            category,
            version,
            entrypoint,
            dependencies,
            description: raw.description,
            author: raw.author,
            hooks,
            host_api,
            enabled: false,
            state: PluginState::Discovered,
            dir: dir.to_path_buf(),
        })
    }

    /// Required (non-optional) dependencies.
    pub fn required_dependencies(&self) -> impl Iterator<Item = &DeclaredDependency> {
        self.dependencies.iter().filter(|d| !d.optional)
    }
}

fn required(value: Option<String>, field: &'static str) -> Result<String, DiscoveryError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(DiscoveryError::MissingField(field)),
    }
}

/// Plugin ids double as directory and record file names.
pub fn is_valid_id(id: &str) -> bool {
    ID_PATTERN.as_ref().is_some_and(|re| re.is_match(id))
}
