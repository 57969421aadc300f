//! External-process plugins.
//!
//! An `exec:` entrypoint names a command that speaks a small JSON protocol:
//! `<command> describe` prints `{"version", "category", "operations"}`, and
//! `<command> <operation>` reads one JSON request on stdin and prints one
//! JSON response on stdout. `initialize` and `shutdown` are run only when
//! the description lists them; an AI provider may also list its `models`.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use semver::Version;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{LoadError, PluginCallError};
use crate::llm::extract_json;

use super::capability::{
    AiProvider, CommitContext, GenerateOptions, HookContext, HookOutcome, HookPhase, Integration,
    IntegrationEvent, PluginInstance, Template, WorkflowHook,
};
use super::manifest::{PluginCategory, PluginManifest};

#[derive(Debug, Deserialize)]
struct Description {
    version: String,
    category: String,
    #[serde(default)]
    operations: Vec<String>,
    #[serde(default)]
    models: Vec<String>,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    diff: &'a str,
    options: &'a GenerateOptions,
}

#[derive(Serialize)]
struct RunRequest<'a> {
    phase: HookPhase,
    context: &'a HookContext,
}

#[derive(Deserialize)]
struct MessageResponse {
    message: String,
}

/// A plugin implemented by an external command.
#[derive(Debug, Clone)]
pub struct ProcessPlugin {
    id: String,
    program: PathBuf,
    args: Vec<String>,
    dir: PathBuf,
    timeout: Duration,
    operations: Vec<String>,
    models: Vec<String>,
}

/// Resolve an `exec:` entrypoint, check its self-description against the
/// manifest, and wrap it in the capability matching the manifest category.
pub(crate) fn load(
    manifest: &PluginManifest,
    command: &str,
    call_timeout: Duration,
) -> Result<PluginInstance, LoadError> {
    let mut plugin = ProcessPlugin::resolve(manifest, command, call_timeout)?;
    let description = plugin.check_description(manifest)?;
    plugin.operations = description.operations;
    plugin.models = description.models;

    let plugin = Arc::new(plugin);
    Ok(match manifest.category {
        PluginCategory::AiProvider => PluginInstance::AiProvider(plugin),
        PluginCategory::Template => PluginInstance::Template(plugin),
        PluginCategory::WorkflowHook => PluginInstance::WorkflowHook(plugin),
        PluginCategory::Integration => PluginInstance::Integration(plugin),
    })
}

/// Run `command` to completion from synchronous code, killing it after
/// `limit`.
///
/// Stdout and stderr are drained while the child runs. Inside a
/// multi-threaded runtime the worker is handed over with `block_in_place`;
/// inside a current-thread runtime the call runs on a scoped thread with
/// its own runtime.
pub(crate) fn run_blocking(mut command: Command, limit: Duration) -> Result<Output, PluginCallError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let run = async move {
        let child = command.spawn().map_err(PluginCallError::SpawnFailed)?;
        timeout(limit, child.wait_with_output())
            .await
            .map_err(|_| PluginCallError::Timeout(limit))?
            .map_err(PluginCallError::SpawnFailed)
    };

    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(|| handle.block_on(run))
        }
        Ok(_) => std::thread::scope(|scope| {
            scope
                .spawn(move || block_on_private(run))
                .join()
                .unwrap_or_else(|_| {
                    Err(PluginCallError::Backend("plugin call thread panicked".to_string()))
                })
        }),
        Err(_) => block_on_private(run),
    }
}

fn block_on_private<F>(future: F) -> Result<Output, PluginCallError>
where
    F: Future<Output = Result<Output, PluginCallError>>,
{
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(PluginCallError::SpawnFailed)?
        .block_on(future)
}

fn check_status(output: &Output) -> Result<(), PluginCallError> {
    if output.status.success() {
        return Ok(());
    }
    Err(PluginCallError::NonZeroExit {
        code: output.status.code().unwrap_or(-1),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

impl ProcessPlugin {
    fn resolve(
        manifest: &PluginManifest,
        command: &str,
        call_timeout: Duration,
    ) -> Result<Self, LoadError> {
        let mut parts = command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| LoadError::import(&manifest.id, "empty exec entrypoint"))?;
        let args = parts.map(str::to_string).collect();

        let program = if looks_like_path(program) {
            let path = if Path::new(program).is_absolute() {
                PathBuf::from(program)
            } else {
                manifest.dir.join(program)
            };
            if !path.is_file() {
                return Err(LoadError::import(
                    &manifest.id,
                    format!("entrypoint {} does not exist", path.display()),
                ));
            }
            if !is_executable(&path) {
                return Err(LoadError::import(
                    &manifest.id,
                    format!("entrypoint {} is not executable", path.display()),
                ));
            }
            path
        } else {
            which::which(program).map_err(|e| {
                LoadError::import(&manifest.id, format!("command '{}' not found: {}", program, e))
            })?
        };

        Ok(Self {
            id: manifest.id.clone(),
            program,
            args,
            dir: manifest.dir.clone(),
            timeout: call_timeout,
            operations: Vec::new(),
            models: Vec::new(),
        })
    }

    fn command(&self, operation: &str) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(operation)
            .current_dir(&self.dir);
        command
    }

    /// Run `describe` and compare the answer with the manifest.
    fn check_description(&self, manifest: &PluginManifest) -> Result<Description, LoadError> {
        let stdout = run_blocking(self.command("describe"), self.timeout)
            .and_then(|output| {
                check_status(&output)?;
                Ok(String::from_utf8_lossy(&output.stdout).to_string())
            })
            .map_err(|e| LoadError::import(&self.id, format!("describe failed: {}", e)))?;

        let description: Description = serde_json::from_str(&extract_json(&stdout))
            .map_err(|e| LoadError::contract(&self.id, format!("invalid describe output: {}", e)))?;

        let category: PluginCategory = description
            .category
            .parse()
            .map_err(|e| LoadError::contract(&self.id, format!("{}", e)))?;
        if category != manifest.category {
            return Err(LoadError::contract(
                &self.id,
                format!(
                    "process describes itself as {} but the manifest declares {}",
                    category, manifest.category
                ),
            ));
        }

        let missing: Vec<&str> = manifest
            .category
            .required_operations()
            .iter()
            .copied()
            .filter(|op| !description.operations.iter().any(|o| o == op))
            .collect();
        if !missing.is_empty() {
            return Err(LoadError::contract(
                &self.id,
                format!("missing required operations: {}", missing.join(", ")),
            ));
        }

        let reported = Version::parse(description.version.trim()).map_err(|e| {
            LoadError::version(
                &self.id,
                format!("unparsable version '{}': {}", description.version, e),
            )
        })?;
        if reported != manifest.version {
            return Err(LoadError::version(
                &self.id,
                format!(
                    "process reports version {} but the manifest declares {}",
                    reported, manifest.version
                ),
            ));
        }

        Ok(description)
    }

    fn supports(&self, operation: &str) -> bool {
        self.operations.iter().any(|o| o == operation)
    }

    fn call_initialize(&self) -> Result<(), PluginCallError> {
        if !self.supports("initialize") {
            return Ok(());
        }
        debug!(plugin = %self.id, "Initializing process plugin");
        check_status(&run_blocking(self.command("initialize"), self.timeout)?)
    }

    fn call_shutdown(&self) {
        if !self.supports("shutdown") {
            return;
        }
        let result = run_blocking(self.command("shutdown"), self.timeout)
            .and_then(|output| check_status(&output));
        if let Err(e) = result {
            warn!(plugin = %self.id, "Plugin shutdown failed: {}", e);
        }
    }

    async fn invoke<T, R>(&self, operation: &str, request: &R) -> Result<T, PluginCallError>
    where
        T: DeserializeOwned,
        R: Serialize + ?Sized,
    {
        let input = serde_json::to_vec(request)
            .map_err(|e| PluginCallError::Backend(format!("failed to encode request: {}", e)))?;

        let mut child = self
            .command(operation)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(PluginCallError::SpawnFailed)?;

        debug!(plugin = %self.id, operation, "Invoking process plugin");

        let run = async move {
            if let Some(mut stdin) = child.stdin.take() {
                // A plugin that ignores its input may exit before reading it.
                if let Err(e) = stdin.write_all(&input).await
                    && e.kind() != std::io::ErrorKind::BrokenPipe
                {
                    return Err(PluginCallError::SpawnFailed(e));
                }
            }
            child
                .wait_with_output()
                .await
                .map_err(PluginCallError::SpawnFailed)
        };

        let output = timeout(self.timeout, run)
            .await
            .map_err(|_| PluginCallError::Timeout(self.timeout))??;
        check_status(&output)?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        serde_json::from_str(&extract_json(&stdout))
            .map_err(|e| PluginCallError::InvalidResponse(format!("{} (output: {})", e, stdout.trim())))
    }
}

#[async_trait]
impl AiProvider for ProcessPlugin {
    async fn generate(
        &self,
        diff: &str,
        options: &GenerateOptions,
    ) -> Result<String, PluginCallError> {
        let response: MessageResponse = self
            .invoke("generate", &GenerateRequest { diff, options })
            .await?;
        Ok(response.message)
    }

    fn is_available(&self) -> bool {
        is_executable(&self.program)
    }

    fn supported_models(&self) -> Vec<String> {
        self.models.clone()
    }

    fn initialize(&self) -> Result<(), PluginCallError> {
        self.call_initialize()
    }

    fn shutdown(&self) {
        self.call_shutdown()
    }
}

#[async_trait]
impl Template for ProcessPlugin {
    async fn render(&self, context: &CommitContext) -> Result<String, PluginCallError> {
        let response: MessageResponse = self.invoke("render", context).await?;
        Ok(response.message)
    }

    fn initialize(&self) -> Result<(), PluginCallError> {
        self.call_initialize()
    }

    fn shutdown(&self) {
        self.call_shutdown()
    }
}

#[async_trait]
impl WorkflowHook for ProcessPlugin {
    async fn run(
        &self,
        phase: HookPhase,
        context: &HookContext,
    ) -> Result<HookOutcome, PluginCallError> {
        self.invoke("run", &RunRequest { phase, context }).await
    }

    fn initialize(&self) -> Result<(), PluginCallError> {
        self.call_initialize()
    }

    fn shutdown(&self) {
        self.call_shutdown()
    }
}

#[async_trait]
impl Integration for ProcessPlugin {
    async fn notify(&self, event: &IntegrationEvent) -> Result<HookOutcome, PluginCallError> {
        self.invoke("notify", event).await
    }

    fn initialize(&self) -> Result<(), PluginCallError> {
        self.call_initialize()
    }

    fn shutdown(&self) {
        self.call_shutdown()
    }
}

fn looks_like_path(program: &str) -> bool {
    program.starts_with('.') || program.contains('/') || program.contains('\\')
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::LoadErrorCause;
    use crate::plugin::capability::HookStatus;
    use std::os::unix::fs::PermissionsExt;

    fn write_script(dir: &Path, name: &str, body: &str) {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn manifest(dir: &Path, category: &str, hooks: &str) -> PluginManifest {
        PluginManifest::from_json(
            &format!(
                r#"{{"id": "proc", "category": "{}", "version": "1.0.0", "entrypoint": "exec:./plugin.sh"{}}}"#,
                category, hooks
            ),
            dir,
        )
        .unwrap()
    }

    const HOOK_SCRIPT: &str = r#"case "$1" in
  describe) echo '{"version": "1.0.0", "category": "workflow-hook", "operations": ["run"]}' ;;
  run) cat > /dev/null; echo '{"status": "warning", "detail": "large diff"}' ;;
  *) exit 3 ;;
esac
"#;

    #[tokio::test]
    async fn test_process_hook_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "plugin.sh", HOOK_SCRIPT);
        let m = manifest(dir.path(), "workflow-hook", r#", "hooks": [{"phase": "pre-commit"}]"#);

        let instance = load(&m, "./plugin.sh", Duration::from_secs(10)).unwrap();
        let hook = instance.as_workflow_hook().unwrap();
        let outcome = hook
            .run(HookPhase::PreCommit, &HookContext::default())
            .await
            .unwrap();

        assert_eq!(outcome.status, HookStatus::Warning);
        assert_eq!(outcome.detail, "large diff");
    }

    #[test]
    fn test_missing_entrypoint_is_import_failure() {
        let dir = tempfile::tempdir().unwrap();
        let m = manifest(dir.path(), "template", "");
        let err = load(&m, "./plugin.sh", Duration::from_secs(10)).unwrap_err();
        assert_eq!(err.cause, LoadErrorCause::ImportFailure);
    }

    #[test]
    fn test_missing_operation_is_contract_violation() {
        let dir = tempfile::tempdir().unwrap();
        write_script(
            dir.path(),
            "plugin.sh",
            r#"echo '{"version": "1.0.0", "category": "template", "operations": ["describe"]}'"#,
        );
        let m = manifest(dir.path(), "template", "");
        let err = load(&m, "./plugin.sh", Duration::from_secs(10)).unwrap_err();
        assert_eq!(err.cause, LoadErrorCause::ContractViolation);
        assert!(err.detail.contains("render"));
    }

    #[test]
    fn test_reported_version_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        write_script(
            dir.path(),
            "plugin.sh",
            r#"echo '{"version": "2.0.0", "category": "template", "operations": ["render"]}'"#,
        );
        let m = manifest(dir.path(), "template", "");
        let err = load(&m, "./plugin.sh", Duration::from_secs(10)).unwrap_err();
        assert_eq!(err.cause, LoadErrorCause::VersionMismatch);
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_call_error() {
        let dir = tempfile::tempdir().unwrap();
        write_script(
            dir.path(),
            "plugin.sh",
            r#"case "$1" in
  describe) echo '{"version": "1.0.0", "category": "ai-provider", "operations": ["generate"]}' ;;
  *) echo "backend offline" >&2; exit 4 ;;
esac
"#,
        );
        let m = manifest(dir.path(), "ai-provider", "");
        let provider = load(&m, "./plugin.sh", Duration::from_secs(10))
            .unwrap()
            .as_ai_provider()
            .unwrap();

        let err = provider
            .generate("diff", &GenerateOptions::new())
            .await
            .unwrap_err();
        match err {
            PluginCallError::NonZeroExit { code, stderr } => {
                assert_eq!(code, 4);
                assert_eq!(stderr, "backend offline");
            }
            other => panic!("Expected NonZeroExit, got {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_large_describe_output_does_not_stall() {
        let dir = tempfile::tempdir().unwrap();
        write_script(
            dir.path(),
            "plugin.sh",
            r#"printf '{"version": "1.0.0", "category": "template", "operations": ["render"], "notes": "'
head -c 200000 /dev/zero | tr '\0' a
printf '"}'
"#,
        );
        let m = manifest(dir.path(), "template", "");
        let instance = load(&m, "./plugin.sh", Duration::from_secs(10)).unwrap();
        assert!(instance.as_template().is_some());
    }

    #[test]
    fn test_slow_describe_times_out() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "plugin.sh", "sleep 5\n");
        let m = manifest(dir.path(), "template", "");
        let err = load(&m, "./plugin.sh", Duration::from_millis(200)).unwrap_err();
        assert_eq!(err.cause, LoadErrorCause::ImportFailure);
        assert!(err.detail.contains("200ms"), "{}", err.detail);
    }

    #[tokio::test]
    async fn test_lifecycle_operations_and_models() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("shutdown.log");
        write_script(
            dir.path(),
            "plugin.sh",
            &format!(
                r#"case "$1" in
  describe) echo '{{"version": "1.0.0", "category": "ai-provider", "operations": ["generate", "initialize", "shutdown"], "models": ["local-small", "local-large"]}}' ;;
  initialize) echo "model weights missing" >&2; exit 1 ;;
  shutdown) echo done > {} ;;
esac
"#,
                marker.display()
            ),
        );
        let m = manifest(dir.path(), "ai-provider", "");
        let instance = load(&m, "./plugin.sh", Duration::from_secs(10)).unwrap();
        let provider = instance.as_ai_provider().unwrap();

        assert_eq!(provider.supported_models(), vec!["local-small", "local-large"]);
        assert!(provider.is_available());
        match instance.initialize().unwrap_err() {
            PluginCallError::NonZeroExit { code, stderr } => {
                assert_eq!(code, 1);
                assert_eq!(stderr, "model weights missing");
            }
            other => panic!("Expected NonZeroExit, got {:?}", other),
        }

        instance.shutdown();
        assert!(marker.is_file());
    }

    #[test]
    fn test_unlisted_lifecycle_operations_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_script(
            dir.path(),
            "plugin.sh",
            r#"case "$1" in
  describe) echo '{"version": "1.0.0", "category": "template", "operations": ["render"]}' ;;
  *) exit 9 ;;
esac
"#,
        );
        let m = manifest(dir.path(), "template", "");
        let instance = load(&m, "./plugin.sh", Duration::from_secs(10)).unwrap();
        assert!(instance.initialize().is_ok());
        instance.shutdown();
    }
}
