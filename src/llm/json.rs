//! Locating a JSON object inside free-form plugin or model output.
//!
//! Process plugins sometimes print log lines before their response and
//! models like to wrap replies in markdown fences, so responses are not
//! parsed verbatim.

use serde_json::{Deserializer, Value};

/// Pull the first JSON object out of `output`.
///
/// Tries a fenced block (```` ```json ```` or bare ```` ``` ````) first,
/// then the first `{` that starts a complete object, ignoring anything
/// after it. Returns the trimmed input unchanged when there is no object,
/// so the caller's parse error shows what was actually received.
pub fn extract_json(output: &str) -> String {
    let trimmed = output.trim();

    if let Some(inner) = fenced_block(trimmed)
        && inner.starts_with('{')
    {
        return inner.to_string();
    }

    first_object(trimmed).unwrap_or_else(|| trimmed.to_string())
}

fn fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after = &text[start + 3..];
    let after = after.strip_prefix("json").unwrap_or(after);
    let end = after.find("```")?;
    Some(after[..end].trim())
}

fn first_object(text: &str) -> Option<String> {
    text.match_indices('{').find_map(|(idx, _)| {
        let candidate = &text[idx..];
        let mut stream = Deserializer::from_str(candidate).into_iter::<Value>();
        match stream.next() {
            Some(Ok(value)) if value.is_object() => {
                Some(candidate[..stream.byte_offset()].to_string())
            }
            _ => None,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_object_is_returned_as_is() {
        let output = r#"{"status": "passed", "detail": "ok"}"#;
        assert_eq!(extract_json(output), output);
    }

    #[test]
    fn test_log_lines_before_object() {
        let output = "checking 3 files...\nall good\n{\"status\": \"passed\"}\n";
        assert_eq!(extract_json(output), r#"{"status": "passed"}"#);
    }

    #[test]
    fn test_fenced_reply() {
        let output = "Here you go:\n```json\n{\"message\": \"feat: add x\"}\n```";
        assert_eq!(extract_json(output), r#"{"message": "feat: add x"}"#);

        let bare = "```\n{\"message\": \"fix: y\"}\n```";
        assert_eq!(extract_json(bare), r#"{"message": "fix: y"}"#);
    }

    #[test]
    fn test_trailing_chatter_and_braces_in_strings() {
        let output = r#"Result: {"message": "use { and } carefully", "meta": {"n": 1}} done"#;
        let json = extract_json(output);
        let parsed: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["message"], "use { and } carefully");
        assert_eq!(parsed["meta"]["n"], 1);
    }

    #[test]
    fn test_skips_unbalanced_brace_before_object() {
        let output = r#"warning: { unmatched
{"version": "1.0.0", "category": "template", "operations": ["render"]}"#;
        let parsed: Value = serde_json::from_str(&extract_json(output)).unwrap();
        assert_eq!(parsed["category"], "template");
    }

    #[test]
    fn test_no_object_returns_input() {
        assert_eq!(extract_json("  plain text  "), "plain text");
        assert_eq!(extract_json("}}"), "}}");
    }
}
