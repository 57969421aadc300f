//! Capability interfaces implemented by plugins, one per category.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::PluginCallError;

use super::manifest::PluginCategory;

/// A named point in the commit workflow at which hooks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HookPhase {
    PreCommit,
    CommitMessage,
    PostCommit,
}

impl HookPhase {
    pub const ALL: [HookPhase; 3] = [
        HookPhase::PreCommit,
        HookPhase::CommitMessage,
        HookPhase::PostCommit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HookPhase::PreCommit => "pre-commit",
            HookPhase::CommitMessage => "commit-message",
            HookPhase::PostCommit => "post-commit",
        }
    }
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HookPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "pre-commit" | "precommit" => Ok(Self::PreCommit),
            "commit-message" | "commitmessage" | "commit-msg" => Ok(Self::CommitMessage),
            "post-commit" | "postcommit" => Ok(Self::PostCommit),
            _ => Err(format!("Unknown hook phase: {}", s)),
        }
    }
}

/// Data handed to hooks for a single dispatch. Built by the host per call.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HookContext {
    pub diff: Option<String>,
    pub files: Vec<String>,
    pub branch: Option<String>,
    pub message: Option<String>,
    pub commit_id: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

/// Status reported by a hook or integration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookStatus {
    Passed,
    Warning,
    Failed,
}

/// Result of a hook run or integration notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookOutcome {
    pub status: HookStatus,
    #[serde(default)]
    pub detail: String,
}

impl HookOutcome {
    pub fn passed(detail: impl Into<String>) -> Self {
        Self {
            status: HookStatus::Passed,
            detail: detail.into(),
        }
    }

    pub fn warning(detail: impl Into<String>) -> Self {
        Self {
            status: HookStatus::Warning,
            detail: detail.into(),
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            status: HookStatus::Failed,
            detail: detail.into(),
        }
    }
}

/// Free-form options passed to an AI provider (model, template hint, ...).
pub type GenerateOptions = BTreeMap<String, String>;

/// Structured commit data a template renders into a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitContext {
    pub commit_type: String,
    pub scope: Option<String>,
    pub description: String,
    pub body: Option<String>,
    #[serde(default)]
    pub breaking: bool,
}

/// Events delivered to integration plugins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum IntegrationEvent {
    Committed {
        commit_id: String,
        message: String,
        branch: Option<String>,
    },
    PhaseFailed {
        phase: HookPhase,
        plugins: Vec<String>,
    },
    Test,
}

// Every capability carries the same two lifecycle callbacks. `initialize`
// runs once before the instance is registered and an error aborts the
// enable; `shutdown` runs when the instance is released.

/// An alternate AI backend.
#[async_trait]
pub trait AiProvider: Send + Sync {
    async fn generate(
        &self,
        diff: &str,
        options: &GenerateOptions,
    ) -> Result<String, PluginCallError>;

    /// Whether the backend can currently serve requests.
    fn is_available(&self) -> bool {
        true
    }

    fn supported_models(&self) -> Vec<String> {
        Vec::new()
    }

    fn initialize(&self) -> Result<(), PluginCallError> {
        Ok(())
    }

    fn shutdown(&self) {}
}

/// A commit message template.
#[async_trait]
pub trait Template: Send + Sync {
    async fn render(&self, context: &CommitContext) -> Result<String, PluginCallError>;

    fn initialize(&self) -> Result<(), PluginCallError> {
        Ok(())
    }

    fn shutdown(&self) {}
}

/// A workflow hook invoked at commit phases.
#[async_trait]
pub trait WorkflowHook: Send + Sync {
    async fn run(
        &self,
        phase: HookPhase,
        context: &HookContext,
    ) -> Result<HookOutcome, PluginCallError>;

    fn initialize(&self) -> Result<(), PluginCallError> {
        Ok(())
    }

    fn shutdown(&self) {}
}

/// An external integration notified of workflow events.
#[async_trait]
pub trait Integration: Send + Sync {
    async fn notify(&self, event: &IntegrationEvent) -> Result<HookOutcome, PluginCallError>;

    fn initialize(&self) -> Result<(), PluginCallError> {
        Ok(())
    }

    fn shutdown(&self) {}
}

/// A loaded plugin, typed by the capability it implements.
#[derive(Clone)]
pub enum PluginInstance {
    AiProvider(Arc<dyn AiProvider>),
    Template(Arc<dyn Template>),
    WorkflowHook(Arc<dyn WorkflowHook>),
    Integration(Arc<dyn Integration>),
}

/// Evaluate `$body` with `$inner` bound to whichever capability object the
/// instance holds.
macro_rules! with_capability {
    ($instance:expr, $inner:ident => $body:expr) => {
        match $instance {
            PluginInstance::AiProvider($inner) => $body,
            PluginInstance::Template($inner) => $body,
            PluginInstance::WorkflowHook($inner) => $body,
            PluginInstance::Integration($inner) => $body,
        }
    };
}

macro_rules! capability_accessor {
    ($name:ident, $variant:ident, $capability:ident) => {
        pub fn $name(&self) -> Option<Arc<dyn $capability>> {
            match self {
                PluginInstance::$variant(inner) => Some(Arc::clone(inner)),
                _ => None,
            }
        }
    };
}

impl PluginInstance {
    pub fn category(&self) -> PluginCategory {
        match self {
            PluginInstance::AiProvider(_) => PluginCategory::AiProvider,
            PluginInstance::Template(_) => PluginCategory::Template,
            PluginInstance::WorkflowHook(_) => PluginCategory::WorkflowHook,
            PluginInstance::Integration(_) => PluginCategory::Integration,
        }
    }

    capability_accessor!(as_ai_provider, AiProvider, AiProvider);
    capability_accessor!(as_template, Template, Template);
    capability_accessor!(as_workflow_hook, WorkflowHook, WorkflowHook);
    capability_accessor!(as_integration, Integration, Integration);

    pub fn initialize(&self) -> Result<(), PluginCallError> {
        with_capability!(self, inner => inner.initialize())
    }

    pub fn shutdown(&self) {
        with_capability!(self, inner => inner.shutdown())
    }

    /// Whether two handles point at the same loaded object.
    pub fn same_instance(&self, other: &PluginInstance) -> bool {
        self.category() == other.category() && self.object_ptr() == other.object_ptr()
    }

    fn object_ptr(&self) -> *const () {
        with_capability!(self, inner => Arc::as_ptr(inner) as *const ())
    }
}

impl fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PluginInstance({})", self.category())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hook_phase_parse_and_display() {
        for phase in HookPhase::ALL {
            assert_eq!(phase.as_str().parse::<HookPhase>().unwrap(), phase);
        }
        assert_eq!("PRE_COMMIT".parse::<HookPhase>().unwrap(), HookPhase::PreCommit);
        assert!("during-commit".parse::<HookPhase>().is_err());
    }

    #[test]
    fn test_hook_outcome_deserialize_without_detail() {
        let outcome: HookOutcome = serde_json::from_str(r#"{"status": "warning"}"#).unwrap();
        assert_eq!(outcome.status, HookStatus::Warning);
        assert!(outcome.detail.is_empty());
    }

    #[test]
    fn test_integration_event_serialization() {
        let event = IntegrationEvent::Committed {
            commit_id: "abc123".to_string(),
            message: "feat: add thing".to_string(),
            branch: Some("main".to_string()),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "committed");
        assert_eq!(json["commit_id"], "abc123");
    }

    struct Quiet;

    #[async_trait]
    impl Template for Quiet {
        async fn render(&self, context: &CommitContext) -> Result<String, PluginCallError> {
            Ok(context.description.clone())
        }
    }

    #[async_trait]
    impl Integration for Quiet {
        async fn notify(&self, _event: &IntegrationEvent) -> Result<HookOutcome, PluginCallError> {
            Ok(HookOutcome::passed("ok"))
        }
    }

    #[test]
    fn test_instance_accessors_and_identity() {
        let template = PluginInstance::Template(Arc::new(Quiet));
        assert!(template.as_template().is_some());
        assert!(template.as_ai_provider().is_none());
        assert!(template.initialize().is_ok());

        assert!(template.same_instance(&template.clone()));
        assert!(!template.same_instance(&PluginInstance::Template(Arc::new(Quiet))));

        let shared = Arc::new(Quiet);
        let as_template = PluginInstance::Template(shared.clone());
        let as_integration = PluginInstance::Integration(shared);
        assert!(!as_template.same_instance(&as_integration));
    }
}
