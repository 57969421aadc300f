//! Commit workflow: staged diff, message generation through plugins, commit.

pub mod diff;
pub mod message;
pub mod workflow;

pub use diff::{ChangedFile, DiffSummary, FileStatus, collect_staged_diff};
pub use message::{clean_message, commit_staged, current_branch, parse_subject};
pub use workflow::{WorkflowOptions, WorkflowOutcome, notify_all, run_commit_workflow};
