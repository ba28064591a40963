//! Retry policy for transient storage errors.
//!
//! Repo writes on the scheduler's hot path retry briefly with exponential
//! jitter before the error propagates; the scheduler then skips the endpoint
//! for one tick and moves on.

use std::future::Future;
use std::time::Duration;

use backoff::{future::retry, ExponentialBackoff};
use tracing::warn;

/// Whether a sqlx error is worth retrying.
pub fn is_transient(e: &sqlx::Error) -> bool {
    matches!(
        e,
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed
    )
}

/// Run `operation` with up to ~3 jittered retries on transient errors.
pub async fn with_retries<T, F, Fut>(op_name: &'static str, operation: F) -> Result<T, sqlx::Error>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let policy = ExponentialBackoff {
        initial_interval: Duration::from_millis(50),
        max_interval: Duration::from_millis(500),
        max_elapsed_time: Some(Duration::from_secs(2)),
        ..Default::default()
    };

    retry(policy, || async {
        match operation().await {
            Ok(value) => Ok(value),
            Err(e) if is_transient(&e) => {
                warn!(op = op_name, error = %e, "transient storage error, retrying");
                Err(backoff::Error::transient(e))
            }
            Err(e) => Err(backoff::Error::permanent(e)),
        }
    })
    .await
}
