//! Layered configuration: defaults, `<home>/config.toml`, then environment.
//!
//! ```toml
//! [plugins]
//! dir = "/opt/commit-ai/plugins"
//! call_timeout_secs = 30
//!
//! [hooks]
//! timeout_secs = 10
//!
//! [generate]
//! provider = "claude-cli"
//! template = "conventional"
//! model = "sonnet"
//! ```

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use toml_edit::{DocumentMut, Item};
use tracing::{debug, warn};

use crate::builtin::CLAUDE_CLI;
use crate::error::ConfigError;
use crate::plugin::ManagerOptions;

pub const HOME_ENV_VAR: &str = "COMMIT_AI_HOME";
pub const HOOK_TIMEOUT_ENV_VAR: &str = "COMMIT_AI_HOOK_TIMEOUT";
pub const PROVIDER_ENV_VAR: &str = "COMMIT_AI_PROVIDER";

pub const CONFIG_FILE: &str = "config.toml";
const DEFAULT_HOOK_TIMEOUT_SECS: u64 = 10;
const DEFAULT_CALL_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub home: PathBuf,
    pub plugins_dir: PathBuf,
    pub state_dir: PathBuf,
    pub hook_timeout: Duration,
    pub call_timeout: Duration,
    pub provider: String,
    pub template: Option<String>,
    pub model: Option<String>,
}

impl Config {
    /// Defaults rooted at `home`.
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        Self {
            plugins_dir: home.join("plugins"),
            state_dir: home.join("state"),
            home,
            hook_timeout: Duration::from_secs(DEFAULT_HOOK_TIMEOUT_SECS),
            call_timeout: Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS),
            provider: CLAUDE_CLI.to_string(),
            template: None,
            model: None,
        }
    }

    /// Resolve the home directory, read its config file if present, and
    /// apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::with_home(resolve_home()?);
        let path = config.home.join(CONFIG_FILE);
        if path.is_file() {
            let content = fs::read_to_string(&path).map_err(|source| ConfigError::ReadFailed {
                path: path.clone(),
                source,
            })?;
            config.apply_toml(&path, &content)?;
            debug!("Loaded config from {}", path.display());
        }
        config.apply_env();
        Ok(config)
    }

    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            plugins_dir: self.plugins_dir.clone(),
            state_dir: self.state_dir.clone(),
            hook_timeout: self.hook_timeout,
            call_timeout: self.call_timeout,
        }
    }

    fn apply_toml(&mut self, path: &Path, content: &str) -> Result<(), ConfigError> {
        let doc = content
            .parse::<DocumentMut>()
            .map_err(|e| ConfigError::ParseFailed {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        if let Some(dir) = string_value(&doc, "plugins", "dir")? {
            self.plugins_dir = self.home.join(dir);
        }
        if let Some(secs) = secs_value(&doc, "plugins", "call_timeout_secs")? {
            self.call_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = secs_value(&doc, "hooks", "timeout_secs")? {
            self.hook_timeout = Duration::from_secs(secs);
        }
        if let Some(provider) = string_value(&doc, "generate", "provider")? {
            self.provider = provider;
        }
        self.template = string_value(&doc, "generate", "template")?.or(self.template.take());
        self.model = string_value(&doc, "generate", "model")?.or(self.model.take());
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(v) = env::var(HOOK_TIMEOUT_ENV_VAR)
            && !v.is_empty()
        {
            match v.parse::<u64>() {
                Ok(secs) if secs > 0 => self.hook_timeout = Duration::from_secs(secs),
                _ => warn!(
                    "Invalid {} value '{}', using {}s",
                    HOOK_TIMEOUT_ENV_VAR,
                    v,
                    self.hook_timeout.as_secs()
                ),
            }
        }
        if let Ok(v) = env::var(PROVIDER_ENV_VAR)
            && !v.trim().is_empty()
        {
            self.provider = v.trim().to_string();
        }
    }
}

fn resolve_home() -> Result<PathBuf, ConfigError> {
    if let Ok(home) = env::var(HOME_ENV_VAR)
        && !home.is_empty()
    {
        return Ok(PathBuf::from(home));
    }
    env::var("HOME")
        .or_else(|_| env::var("USERPROFILE"))
        .ok()
        .filter(|h| !h.is_empty())
        .map(|h| PathBuf::from(h).join(".commit-ai"))
        .ok_or(ConfigError::NoHomeDirectory)
}

fn lookup<'a>(doc: &'a DocumentMut, table: &str, key: &str) -> Option<&'a Item> {
    doc.get(table)?.as_table_like()?.get(key)
}

fn string_value(doc: &DocumentMut, table: &str, key: &str) -> Result<Option<String>, ConfigError> {
    match lookup(doc, table, key) {
        None => Ok(None),
        Some(item) => item
            .as_str()
            .map(|s| Some(s.to_string()))
            .ok_or_else(|| ConfigError::InvalidValue {
                key: format!("{}.{}", table, key),
                reason: "expected a string".to_string(),
            }),
    }
}

fn secs_value(doc: &DocumentMut, table: &str, key: &str) -> Result<Option<u64>, ConfigError> {
    match lookup(doc, table, key) {
        None => Ok(None),
        Some(item) => match item.as_integer() {
            Some(n) if n > 0 => Ok(Some(n as u64)),
            _ => Err(ConfigError::InvalidValue {
                key: format!("{}.{}", table, key),
                reason: "expected a positive number of seconds".to_string(),
            }),
        },
    }
}
