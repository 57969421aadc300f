//! Staged diff collection using git2.

use std::fmt;

use git2::{Delta, Diff, DiffFormat, ErrorCode, Repository, Tree};
use tracing::warn;

use crate::error::CommitError;

/// Maximum characters of unified diff text handed to providers.
const MAX_DIFF_LENGTH: usize = 30_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileStatus {
    Added,
    Modified,
    Deleted,
    Renamed,
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileStatus::Added => write!(f, "Added"),
            FileStatus::Modified => write!(f, "Modified"),
            FileStatus::Deleted => write!(f, "Deleted"),
            FileStatus::Renamed => write!(f, "Renamed"),
        }
    }
}

/// A file staged for the next commit.
#[derive(Debug, Clone)]
pub struct ChangedFile {
    pub path: String,
    pub status: FileStatus,
    /// Previous path of a renamed file.
    pub old_path: Option<String>,
}

/// The staged changes the commit workflow works from.
#[derive(Debug, Clone)]
pub struct DiffSummary {
    pub diff_text: String,
    pub changed_files: Vec<ChangedFile>,
    pub truncated: bool,
    pub additions: usize,
    pub deletions: usize,
}

impl DiffSummary {
    pub fn paths(&self) -> Vec<String> {
        self.changed_files.iter().map(|f| f.path.clone()).collect()
    }
}

/// HEAD's tree, or `None` in a repository without commits.
pub(crate) fn resolve_head_tree(repo: &Repository) -> Result<Option<Tree<'_>>, CommitError> {
    let head_ref = match repo.head() {
        Ok(r) => r,
        Err(e) if e.code() == ErrorCode::UnbornBranch || e.code() == ErrorCode::NotFound => {
            return Ok(None);
        }
        Err(e) => return Err(CommitError::DiffFailed(e)),
    };

    let tree = head_ref.peel_to_tree().map_err(CommitError::DiffFailed)?;
    Ok(Some(tree))
}

/// Collect the index-vs-HEAD diff. Unstaged and untracked files are not
/// part of the commit and are ignored.
pub fn collect_staged_diff(repo: &Repository) -> Result<DiffSummary, CommitError> {
    let head_tree = resolve_head_tree(repo)?;
    let staged = repo
        .diff_tree_to_index(head_tree.as_ref(), None, None)
        .map_err(CommitError::DiffFailed)?;

    let mut changed_files = collect_files(&staged);
    if changed_files.is_empty() {
        return Err(CommitError::NoChanges);
    }
    changed_files.sort_by(|a, b| a.path.cmp(&b.path));

    let mut summary = DiffSummary {
        diff_text: String::new(),
        changed_files,
        truncated: false,
        additions: 0,
        deletions: 0,
    };
    append_diff_text(&staged, &mut summary);
    Ok(summary)
}

fn collect_files(diff: &Diff<'_>) -> Vec<ChangedFile> {
    diff.deltas()
        .filter_map(|delta| {
            let status = match delta.status() {
                Delta::Added | Delta::Untracked => FileStatus::Added,
                Delta::Deleted => FileStatus::Deleted,
                Delta::Renamed => FileStatus::Renamed,
                _ => FileStatus::Modified,
            };

            let new_path = delta.new_file().path().map(|p| p.to_string_lossy().to_string());
            let old_path = delta.old_file().path().map(|p| p.to_string_lossy().to_string());

            let (path, old_path) = match status {
                FileStatus::Renamed => (new_path.clone().or_else(|| old_path.clone())?, old_path),
                _ => (new_path.or(old_path)?, None),
            };

            Some(ChangedFile {
                path,
                status,
                old_path,
            })
        })
        .filter(|f| !f.path.is_empty())
        .collect()
}

fn append_diff_text(diff: &Diff<'_>, summary: &mut DiffSummary) {
    let result = diff.print(DiffFormat::Patch, |_delta, _hunk, line| {
        match line.origin() {
            '+' => summary.additions += 1,
            '-' => summary.deletions += 1,
            _ => {}
        }

        if summary.truncated {
            return true;
        }

        let content = std::str::from_utf8(line.content()).unwrap_or("");
        if summary.diff_text.len() + content.len() + 2 > MAX_DIFF_LENGTH {
            summary.truncated = true;
            return true;
        }

        let origin = line.origin();
        if matches!(origin, '+' | '-' | ' ') {
            summary.diff_text.push(origin);
        }
        summary.diff_text.push_str(content);
        true
    });

    if let Err(e) = result {
        warn!("Failed to collect diff text: {e}");
        summary.truncated = true;
    }
}
