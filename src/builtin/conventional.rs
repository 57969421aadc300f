//! The bundled `conventional` template: Conventional Commits 1.0 layout.

use async_trait::async_trait;

use crate::error::PluginCallError;
use crate::plugin::{CommitContext, Template};

/// Subjects are cut at this many characters.
const MAX_SUBJECT_CHARS: usize = 72;

#[derive(Debug, Default)]
pub struct ConventionalTemplate;

#[async_trait]
impl Template for ConventionalTemplate {
    async fn render(&self, context: &CommitContext) -> Result<String, PluginCallError> {
        let commit_type = context.commit_type.trim().to_lowercase();
        let description = context.description.trim();
        if commit_type.is_empty() || description.is_empty() {
            return Err(PluginCallError::InvalidResponse(
                "commit type and description are required".to_string(),
            ));
        }

        let mut subject = commit_type;
        if let Some(scope) = context.scope.as_deref().map(str::trim)
            && !scope.is_empty()
        {
            subject.push_str(&format!("({})", scope));
        }
        if context.breaking {
            subject.push('!');
        }
        subject.push_str(": ");
        subject.push_str(description.trim_end_matches('.'));
        if subject.chars().count() > MAX_SUBJECT_CHARS {
            subject = subject.chars().take(MAX_SUBJECT_CHARS).collect();
        }

        match context.body.as_deref().map(str::trim) {
            Some(body) if !body.is_empty() => Ok(format!("{}\n\n{}", subject, body)),
            _ => Ok(subject),
        }
    }
}
