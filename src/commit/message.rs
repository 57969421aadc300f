//! Conventional-commit subject parsing and commit creation.

use std::sync::LazyLock;

use git2::{Oid, Repository};
use regex_lite::Regex;

use crate::error::CommitError;
use crate::plugin::CommitContext;

/// `type(scope)!: description`, scope and `!` optional.
static SUBJECT_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^(\w+)(?:\(([^)]+)\))?(!)?\s*:\s*(.+)$").ok());

/// Split a generated message into the fields a template renders.
///
/// Returns `None` when the first line is not a conventional-commit subject.
pub fn parse_subject(message: &str) -> Option<CommitContext> {
    let message = message.trim();
    let (subject, rest) = match message.split_once('\n') {
        Some((subject, rest)) => (subject.trim(), rest.trim()),
        None => (message, ""),
    };

    let caps = SUBJECT_PATTERN.as_ref()?.captures(subject)?;
    let breaking_in_footer =
        rest.contains("BREAKING CHANGE:") || rest.contains("BREAKING-CHANGE:");

    Some(CommitContext {
        commit_type: caps.get(1)?.as_str().to_lowercase(),
        scope: caps.get(2).map(|m| m.as_str().trim().to_string()),
        description: caps.get(4)?.as_str().trim().to_string(),
        body: (!rest.is_empty()).then(|| rest.to_string()),
        breaking: caps.get(3).is_some() || breaking_in_footer,
    })
}

/// Strip a surrounding code fence and blank edges from a provider reply.
pub fn clean_message(raw: &str) -> String {
    let trimmed = raw.trim();
    let unfenced = trimmed
        .strip_prefix("```")
        .and_then(|s| s.strip_suffix("```"))
        .map(|s| s.split_once('\n').map_or(s, |(_, body)| body))
        .unwrap_or(trimmed);
    unfenced.trim().to_string()
}

/// Commit whatever is staged, on top of HEAD when HEAD exists.
pub fn commit_staged(repo: &Repository, message: &str) -> Result<Oid, CommitError> {
    let mut index = repo.index().map_err(CommitError::CommitFailed)?;
    let tree_id = index.write_tree().map_err(CommitError::CommitFailed)?;
    let tree = repo.find_tree(tree_id).map_err(CommitError::CommitFailed)?;

    let sig = repo.signature().map_err(CommitError::ConfigError)?;

    let parent = match repo.head() {
        Ok(head) => Some(head.peel_to_commit().map_err(CommitError::CommitFailed)?),
        Err(e)
            if e.code() == git2::ErrorCode::UnbornBranch
                || e.code() == git2::ErrorCode::NotFound =>
        {
            None
        }
        Err(e) => return Err(CommitError::CommitFailed(e)),
    };
    let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();

    repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
        .map_err(CommitError::CommitFailed)
}

/// Current branch name, if HEAD points at one.
pub fn current_branch(repo: &Repository) -> Option<String> {
    let head = repo.head().ok()?;
    head.shorthand().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::Signature;
    use std::path::Path;

    #[test]
    fn test_parse_subject_full() {
        let ctx = parse_subject("feat(auth)!: add login endpoint\n\nReplaces the old flow.").unwrap();
        assert_eq!(ctx.commit_type, "feat");
        assert_eq!(ctx.scope.as_deref(), Some("auth"));
        assert_eq!(ctx.description, "add login endpoint");
        assert_eq!(ctx.body.as_deref(), Some("Replaces the old flow."));
        assert!(ctx.breaking);
    }

    #[test]
    fn test_parse_subject_without_scope() {
        let ctx = parse_subject("fix: handle empty diff").unwrap();
        assert_eq!(ctx.commit_type, "fix");
        assert!(ctx.scope.is_none());
        assert!(ctx.body.is_none());
        assert!(!ctx.breaking);
    }

    #[test]
    fn test_parse_subject_breaking_footer() {
        let ctx = parse_subject("refactor(api): rename fields\n\nBREAKING CHANGE: ids are strings").unwrap();
        assert!(ctx.breaking);
    }

    #[test]
    fn test_parse_subject_rejects_free_text() {
        assert!(parse_subject("Updated some files").is_none());
        assert!(parse_subject("").is_none());
    }

    #[test]
    fn test_clean_message() {
        assert_eq!(clean_message("```\nfeat: x\n```"), "feat: x");
        assert_eq!(clean_message("```text\nfix: y\n```\n"), "fix: y");
        assert_eq!(clean_message("  chore: z \n"), "chore: z");
    }

    fn configured_repo(dir: &Path) -> Repository {
        let repo = Repository::init(dir).unwrap();
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "Test User").unwrap();
        config.set_str("user.email", "test@test.com").unwrap();
        repo
    }

    #[test]
    fn test_commit_staged_on_unborn_head() {
        let dir = tempfile::tempdir().unwrap();
        let repo = configured_repo(dir.path());
        std::fs::write(dir.path().join("a.txt"), "a\n").unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new("a.txt")).unwrap();
        index.write().unwrap();

        let oid = commit_staged(&repo, "feat: first").unwrap();
        let commit = repo.find_commit(oid).unwrap();
        assert_eq!(commit.message(), Some("feat: first"));
        assert_eq!(commit.parent_count(), 0);
    }

    #[test]
    fn test_commit_staged_leaves_unstaged_files() {
        let dir = tempfile::tempdir().unwrap();
        let repo = configured_repo(dir.path());
        let sig = Signature::now("Test User", "test@test.com").unwrap();
        let tree_id = repo.index().unwrap().write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "init", &tree, &[]).unwrap();

        std::fs::write(dir.path().join("staged.txt"), "s\n").unwrap();
        std::fs::write(dir.path().join("loose.txt"), "l\n").unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new("staged.txt")).unwrap();
        index.write().unwrap();

        let oid = commit_staged(&repo, "feat: add staged").unwrap();
        let commit = repo.find_commit(oid).unwrap();
        let tree = commit.tree().unwrap();
        assert!(tree.get_name("staged.txt").is_some());
        assert!(tree.get_name("loose.txt").is_none());
        assert_eq!(commit.parent_count(), 1);
    }
}
