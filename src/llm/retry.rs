//! Exponential backoff for provider calls.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use tracing::warn;

/// Total attempts, including the first.
pub const MAX_ATTEMPTS: u32 = 3;
const INITIAL_INTERVAL_SECS: u64 = 1;
const MAX_INTERVAL_SECS: u64 = 30;

/// Run `attempt` until it succeeds or [`MAX_ATTEMPTS`] calls have failed,
/// sleeping with exponential backoff in between.
///
/// The last error is passed through `wrap_exhausted`, which lets the caller
/// mark it as a retries-exhausted failure.
pub async fn retry_with_backoff<T, E, Fut, F, W>(mut attempt: F, wrap_exhausted: W) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    W: FnOnce(E) -> E,
{
    let mut backoff = ExponentialBackoff {
        initial_interval: Duration::from_secs(INITIAL_INTERVAL_SECS),
        max_interval: Duration::from_secs(MAX_INTERVAL_SECS),
        max_elapsed_time: None,
        ..Default::default()
    };

    let mut attempts = 0;
    loop {
        attempts += 1;
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(e) if attempts >= MAX_ATTEMPTS => return Err(wrap_exhausted(e)),
            Err(e) => {
                let wait = backoff
                    .next_backoff()
                    .unwrap_or(Duration::from_secs(MAX_INTERVAL_SECS));
                warn!(
                    "Attempt {}/{} failed: {}; retrying in {:.1}s",
                    attempts,
                    MAX_ATTEMPTS,
                    e,
                    wait.as_secs_f64()
                );
                tokio::time::sleep(wait).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PluginCallError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn exhausted(e: PluginCallError) -> PluginCallError {
        PluginCallError::RetriesExhausted(Box::new(e))
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_attempt_success_does_not_retry() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let result = retry_with_backoff(
            move || {
                c.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, PluginCallError>("feat: x") }
            },
            exhausted,
        )
        .await;

        assert_eq!(result.unwrap(), "feat: x");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let result: Result<String, _> = retry_with_backoff(
            move || {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err(PluginCallError::Timeout(Duration::from_secs(5))) }
            },
            exhausted,
        )
        .await;

        match result {
            Err(PluginCallError::RetriesExhausted(inner)) => {
                assert!(matches!(*inner, PluginCallError::Timeout(d) if d == Duration::from_secs(5)))
            }
            other => panic!("Expected RetriesExhausted, got {:?}", other),
        }
        assert_eq!(count.load(Ordering::SeqCst), MAX_ATTEMPTS);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let result = retry_with_backoff(
            move || {
                let n = c.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(PluginCallError::Backend("busy".to_string()))
                    } else {
                        Ok("fix: y")
                    }
                }
            },
            exhausted,
        )
        .await;

        assert_eq!(result.unwrap(), "fix: y");
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
