//! Helpers shared by AI providers: JSON extraction and retry.

pub mod json;
pub mod retry;

pub use json::extract_json;
pub use retry::{MAX_ATTEMPTS, retry_with_backoff};
