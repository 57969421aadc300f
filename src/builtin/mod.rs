//! Plugins shipped with the host, installable as `builtin:<name>`.

pub mod claude;
pub mod conventional;

use std::sync::Arc;

use serde_json::json;

use crate::plugin::{PluginFactories, PluginInstance};

pub use claude::ClaudeProvider;
pub use conventional::ConventionalTemplate;

pub const CLAUDE_CLI: &str = "claude-cli";
pub const CONVENTIONAL: &str = "conventional";

/// Factories for every bundled plugin, with their manifests.
pub fn with_builtins() -> PluginFactories {
    let mut factories = PluginFactories::new();

    factories.register(CLAUDE_CLI, |_| {
        Ok(PluginInstance::AiProvider(Arc::new(ClaudeProvider::new())))
    });
    factories.bundle(
        CLAUDE_CLI,
        json!({
            "id": CLAUDE_CLI,
            "category": "ai-provider",
            "version": env!("CARGO_PKG_VERSION"),
            "entrypoint": format!("builtin:{}", CLAUDE_CLI),
            "description": "Generate commit messages with the Claude Code CLI",
            "author": "commit-ai",
            "dependencies": ["claude"],
        })
        .to_string(),
    );

    factories.register(CONVENTIONAL, |_| {
        Ok(PluginInstance::Template(Arc::new(ConventionalTemplate)))
    });
    factories.bundle(
        CONVENTIONAL,
        json!({
            "id": CONVENTIONAL,
            "category": "template",
            "version": env!("CARGO_PKG_VERSION"),
            "entrypoint": format!("builtin:{}", CONVENTIONAL),
            "description": "Conventional Commits layout: type(scope)!: description",
            "author": "commit-ai",
        })
        .to_string(),
    );

    factories
}
