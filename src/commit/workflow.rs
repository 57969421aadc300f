//! The commit workflow: hooks, generation, templating and the commit itself.

use git2::Repository;
use tracing::{debug, info, warn};

use crate::error::{PluginCallError, WorkflowError};
use crate::llm::retry::retry_with_backoff;
use crate::plugin::{
    CommitContext, GenerateOptions, HookContext, HookOutcome, HookPhase, HookStatus,
    IntegrationEvent, PhaseReport, PluginManager,
};

use super::diff::collect_staged_diff;
use super::message::{clean_message, commit_staged, current_branch, parse_subject};

/// Inputs for one run of the workflow.
#[derive(Debug, Clone)]
pub struct WorkflowOptions {
    pub provider: String,
    pub template: Option<String>,
    pub dry_run: bool,
    pub generate: GenerateOptions,
}

/// What a workflow run produced.
#[derive(Debug, Clone)]
pub struct WorkflowOutcome {
    pub message: String,
    /// `None` on a dry run.
    pub commit_id: Option<String>,
    pub reports: Vec<PhaseReport>,
    pub notifications: Vec<(String, HookOutcome)>,
}

/// Generate a message for the staged changes and commit it.
///
/// A critical hook failure in the pre-commit or commit-message phase aborts
/// before anything is written. Post-commit failures are reported but the
/// commit stands. `confirm` sees the final message and may cancel.
pub async fn run_commit_workflow<F>(
    manager: &PluginManager,
    repo: &Repository,
    options: &WorkflowOptions,
    confirm: F,
) -> Result<WorkflowOutcome, WorkflowError>
where
    F: FnOnce(&str) -> bool,
{
    let diff = collect_staged_diff(repo)?;
    debug!(
        "Staged diff: {} files, +{} -{}, truncated={}",
        diff.changed_files.len(),
        diff.additions,
        diff.deletions,
        diff.truncated
    );

    let mut context = HookContext {
        diff: Some(diff.diff_text.clone()),
        files: diff.paths(),
        branch: current_branch(repo),
        ..HookContext::default()
    };
    let mut reports = Vec::new();

    let pre = manager.dispatch(HookPhase::PreCommit, &context).await;
    check_phase(manager, &pre).await?;
    reports.push(pre);

    let provider = manager
        .ai_provider(&options.provider)
        .ok_or_else(|| WorkflowError::ProviderNotEnabled(options.provider.clone()))?;
    if !provider.is_available() {
        return Err(WorkflowError::ProviderUnavailable(options.provider.clone()));
    }

    info!(provider = %options.provider, "Generating commit message");
    let raw = retry_with_backoff(
        || provider.generate(&diff.diff_text, &options.generate),
        |e| PluginCallError::RetriesExhausted(Box::new(e)),
    )
    .await
    .map_err(|source| WorkflowError::Generation {
        provider: options.provider.clone(),
        source,
    })?;

    let mut message = clean_message(&raw);
    if message.is_empty() {
        return Err(WorkflowError::EmptyMessage(options.provider.clone()));
    }

    if let Some(template_id) = &options.template {
        let template = manager
            .template(template_id)
            .ok_or_else(|| WorkflowError::TemplateNotEnabled(template_id.clone()))?;
        let commit_context = parse_subject(&message).unwrap_or_else(|| fallback_context(&message));
        let rendered = template
            .render(&commit_context)
            .await
            .map_err(|source| WorkflowError::Render {
                template: template_id.clone(),
                source,
            })?;
        message = clean_message(&rendered);
        if message.is_empty() {
            return Err(WorkflowError::EmptyMessage(template_id.clone()));
        }
    }

    context.message = Some(message.clone());
    let message_phase = manager.dispatch(HookPhase::CommitMessage, &context).await;
    check_phase(manager, &message_phase).await?;
    reports.push(message_phase);

    if options.dry_run {
        return Ok(WorkflowOutcome {
            message,
            commit_id: None,
            reports,
            notifications: Vec::new(),
        });
    }

    if !confirm(&message) {
        return Err(WorkflowError::Cancelled);
    }

    let oid = commit_staged(repo, &message)?;
    let commit_id = oid.to_string();
    info!(commit = %commit_id, "Created commit");

    context.commit_id = Some(commit_id.clone());
    let post = manager.dispatch(HookPhase::PostCommit, &context).await;
    if !post.is_success() {
        warn!("Post-commit hooks failed; the commit was kept");
    }
    reports.push(post);

    let notifications = notify_all(
        manager,
        &IntegrationEvent::Committed {
            commit_id: commit_id.clone(),
            message: message.clone(),
            branch: context.branch.clone(),
        },
    )
    .await;

    Ok(WorkflowOutcome {
        message,
        commit_id: Some(commit_id),
        reports,
        notifications,
    })
}

/// Abort on a failed phase, telling integrations why.
async fn check_phase(manager: &PluginManager, report: &PhaseReport) -> Result<(), WorkflowError> {
    if report.is_success() {
        return Ok(());
    }

    let plugins: Vec<String> = report
        .failed_critical()
        .iter()
        .map(|o| o.plugin_id.clone())
        .collect();
    notify_all(
        manager,
        &IntegrationEvent::PhaseFailed {
            phase: report.phase,
            plugins: plugins.clone(),
        },
    )
    .await;

    Err(WorkflowError::PhaseFailed {
        phase: report.phase,
        plugins,
    })
}

/// Deliver an event to every enabled integration. Failures are logged and
/// returned, never raised.
pub async fn notify_all(
    manager: &PluginManager,
    event: &IntegrationEvent,
) -> Vec<(String, HookOutcome)> {
    let mut outcomes = Vec::new();
    for (id, integration) in manager.integrations() {
        let outcome = match integration.notify(event).await {
            Ok(outcome) => outcome,
            Err(e) => HookOutcome::failed(e.to_string()),
        };
        if outcome.status == HookStatus::Failed {
            warn!(plugin = %id, "Integration failed: {}", outcome.detail);
        }
        outcomes.push((id, outcome));
    }
    outcomes
}

/// Context for a message that is not a conventional-commit subject.
fn fallback_context(message: &str) -> CommitContext {
    let (subject, body) = match message.split_once('\n') {
        Some((subject, body)) => (subject.trim(), body.trim()),
        None => (message.trim(), ""),
    };
    CommitContext {
        commit_type: "chore".to_string(),
        scope: None,
        description: subject.to_string(),
        body: (!body.is_empty()).then(|| body.to_string()),
        breaking: false,
    }
}
