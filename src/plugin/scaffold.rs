//! Skeletons for new process plugins.

use std::path::{Path, PathBuf};

use serde_json::json;
use tracing::info;

use crate::error::ScaffoldError;

use super::manifest::{MANIFEST_FILE, PluginCategory, is_valid_id};

const SCRIPT_FILE: &str = "plugin.sh";
const INITIAL_VERSION: &str = "0.1.0";

/// What to scaffold.
#[derive(Debug, Clone)]
pub struct ScaffoldRequest {
    pub name: String,
    pub category: PluginCategory,
    pub author: Option<String>,
    pub description: String,
}

/// Create `<parent>/<name>/` with a manifest and an executable `plugin.sh`
/// that already answers the process protocol for its category.
pub fn scaffold_plugin(parent: &Path, request: &ScaffoldRequest) -> Result<PathBuf, ScaffoldError> {
    if !is_valid_id(&request.name) {
        return Err(ScaffoldError::InvalidName(request.name.clone()));
    }

    let dir = parent.join(&request.name);
    if dir.exists() {
        return Err(ScaffoldError::AlreadyExists(dir));
    }

    let mut manifest = json!({
        "id": request.name,
        "category": request.category.as_str(),
        "version": INITIAL_VERSION,
        "entrypoint": format!("exec:./{}", SCRIPT_FILE),
        "description": request.description,
        "host_api": "^1",
        "dependencies": [],
    });
    if let Some(author) = &request.author {
        manifest["author"] = json!(author);
    }
    if request.category == PluginCategory::WorkflowHook {
        manifest["hooks"] = json!([
            {"phase": "pre-commit", "priority": 50, "critical": false}
        ]);
    }
    let manifest = serde_json::to_string_pretty(&manifest).map_err(ScaffoldError::Serialize)?;

    std::fs::create_dir_all(&dir).map_err(ScaffoldError::WriteFailed)?;
    std::fs::write(dir.join(MANIFEST_FILE), format!("{}\n", manifest))
        .map_err(ScaffoldError::WriteFailed)?;

    let script_path = dir.join(SCRIPT_FILE);
    std::fs::write(&script_path, script(request)).map_err(ScaffoldError::WriteFailed)?;
    make_executable(&script_path).map_err(ScaffoldError::WriteFailed)?;

    info!(plugin = %request.name, category = %request.category, "Scaffolded plugin at {}", dir.display());
    Ok(dir)
}

fn script(request: &ScaffoldRequest) -> String {
    let operation = request.category.required_operations().join("\", \"");
    let handler = match request.category {
        PluginCategory::AiProvider => {
            r#"  generate)
    # stdin: {"diff": "...", "options": {...}}
    input=$(cat)
    echo '{"message": "chore: update files"}'
    ;;"#
        }
        PluginCategory::Template => {
            r#"  render)
    # stdin: {"commit_type", "scope", "description", "body", "breaking"}
    input=$(cat)
    echo '{"message": "chore: describe the change"}'
    ;;"#
        }
        PluginCategory::WorkflowHook => {
            r#"  run)
    # stdin: {"phase": "pre-commit", "context": {"diff", "files", "branch", "message", ...}}
    input=$(cat)
    echo '{"status": "passed", "detail": "ok"}'
    ;;"#
        }
        PluginCategory::Integration => {
            r#"  notify)
    # stdin: {"kind": "committed" | "phase-failed" | "test", ...}
    input=$(cat)
    echo '{"status": "passed", "detail": "delivered"}'
    ;;"#
        }
    };

    format!(
        r#"#!/bin/sh
# {name}: {description}
set -eu

case "${{1:-}}" in
  describe)
    echo '{{"version": "{version}", "category": "{category}", "operations": ["{operation}"]}}'
    ;;
{handler}
  *)
    echo "unknown operation: ${{1:-}}" >&2
    exit 2
    ;;
esac
"#,
        name = request.name,
        description = request.description,
        version = INITIAL_VERSION,
        category = request.category,
        operation = operation,
        handler = handler,
    )
}

#[cfg(unix)]
fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
