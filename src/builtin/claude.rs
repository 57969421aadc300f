//! The bundled `claude-cli` AI provider.
//!
//! Shells out to the Claude Code CLI in print mode and reads the JSON
//! envelope it writes to stdout.

use std::env;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::PluginCallError;
use crate::llm::extract_json;
use crate::plugin::{AiProvider, GenerateOptions};

/// Default timeout for one CLI invocation (5 minutes).
const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Environment variable to override the default timeout.
pub const TIMEOUT_ENV_VAR: &str = "COMMIT_AI_CLAUDE_TIMEOUT";

/// Diffs longer than this are cut before being put in the prompt.
const MAX_DIFF_CHARS: usize = 30_000;

const MODELS: [&str; 3] = ["sonnet", "opus", "haiku"];

/// Reads [`TIMEOUT_ENV_VAR`], falling back to the default on a missing,
/// empty, or non-numeric value.
fn get_timeout() -> Duration {
    match env::var(TIMEOUT_ENV_VAR) {
        Ok(v) if !v.is_empty() => match v.parse::<u64>() {
            Ok(secs) => Duration::from_secs(secs),
            Err(_) => {
                warn!(
                    "Invalid {} value '{}', using default {}s",
                    TIMEOUT_ENV_VAR, v, DEFAULT_TIMEOUT_SECS
                );
                Duration::from_secs(DEFAULT_TIMEOUT_SECS)
            }
        },
        _ => Duration::from_secs(DEFAULT_TIMEOUT_SECS),
    }
}

/// One call to the CLI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaudeRequest {
    pub prompt: String,
    pub model: Option<String>,
}

/// Runs the Claude CLI. Mocked in tests.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClaudeExecutor: Send + Sync {
    async fn run(&self, request: &ClaudeRequest) -> Result<String, PluginCallError>;

    /// Whether the CLI can be spawned at all.
    fn is_installed(&self) -> bool;
}

/// Executor that spawns the real `claude` binary.
pub struct DefaultExecutor;

#[async_trait]
impl ClaudeExecutor for DefaultExecutor {
    async fn run(&self, request: &ClaudeRequest) -> Result<String, PluginCallError> {
        if which::which("claude").is_err() {
            return Err(PluginCallError::NotInstalled("claude".to_string()));
        }

        let timeout_duration = get_timeout();
        let mut command = Command::new("claude");
        command
            .arg("-p")
            .arg(&request.prompt)
            .arg("--output-format")
            .arg("json")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(model) = &request.model {
            command.arg("--model").arg(model);
        }

        let output = timeout(timeout_duration, command.output())
            .await
            .map_err(|_| PluginCallError::Timeout(timeout_duration))?
            .map_err(PluginCallError::SpawnFailed)?;

        if !output.status.success() {
            return Err(PluginCallError::NonZeroExit {
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn is_installed(&self) -> bool {
        which::which("claude").is_ok()
    }
}

/// Envelope written by `--output-format json`.
#[derive(Deserialize)]
struct CliEnvelope {
    result: String,
    #[serde(default)]
    is_error: bool,
}

/// Shape the model is asked to answer with.
#[derive(Deserialize)]
struct MessageReply {
    message: String,
}

/// AI provider backed by the Claude CLI.
pub struct ClaudeProvider<E = DefaultExecutor> {
    executor: E,
}

impl ClaudeProvider<DefaultExecutor> {
    pub fn new() -> Self {
        Self {
            executor: DefaultExecutor,
        }
    }
}

impl Default for ClaudeProvider<DefaultExecutor> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: ClaudeExecutor> ClaudeProvider<E> {
    pub fn with_executor(executor: E) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl<E: ClaudeExecutor> AiProvider for ClaudeProvider<E> {
    async fn generate(
        &self,
        diff: &str,
        options: &GenerateOptions,
    ) -> Result<String, PluginCallError> {
        let request = ClaudeRequest {
            prompt: build_prompt(diff, options),
            model: options.get("model").cloned(),
        };
        debug!(
            "Claude prompt: {} chars, model={:?}",
            request.prompt.len(),
            request.model
        );
        let response = self.executor.run(&request).await?;
        parse_response(&response)
    }

    fn is_available(&self) -> bool {
        self.executor.is_installed()
    }

    fn supported_models(&self) -> Vec<String> {
        MODELS.iter().map(|m| m.to_string()).collect()
    }
}

fn build_prompt(diff: &str, options: &GenerateOptions) -> String {
    let mut end = diff.len().min(MAX_DIFF_CHARS);
    while !diff.is_char_boundary(end) {
        end -= 1;
    }
    let truncation_note = if end < diff.len() {
        "\n\nThe diff was truncated. Describe the visible changes."
    } else {
        ""
    };
    let style = options
        .get("style")
        .map(|s| format!("\n- Follow this style hint: {}", s))
        .unwrap_or_default();

    format!(
        r#"Write a Git commit message for the staged changes below.

Rules:
- Subject: `type(scope): description`, type one of feat, fix, build, chore, ci, docs, style, refactor, perf, test
- Imperative mood, no trailing period, subject at most 72 characters
- Add a short body explaining why when the change is not obvious
- Mark breaking changes with `!` after the type{style}

Reply with JSON only: {{"message": "<full commit message>"}}

```diff
{diff}
```{truncation_note}"#,
        style = style,
        diff = &diff[..end],
        truncation_note = truncation_note,
    )
}

/// Unwrap the CLI envelope, then the model's JSON reply. A reply that is
/// not JSON is taken as the message text.
fn parse_response(response: &str) -> Result<String, PluginCallError> {
    let content = match serde_json::from_str::<CliEnvelope>(response) {
        Ok(envelope) if envelope.is_error => return Err(PluginCallError::Backend(envelope.result)),
        Ok(envelope) => envelope.result,
        Err(_) => response.to_string(),
    };

    match serde_json::from_str::<MessageReply>(&extract_json(&content)) {
        Ok(reply) => Ok(reply.message),
        Err(_) if !content.trim().is_empty() => Ok(content.trim().to_string()),
        Err(e) => Err(PluginCallError::InvalidResponse(format!(
            "empty reply from claude: {}",
            e
        ))),
    }
}
