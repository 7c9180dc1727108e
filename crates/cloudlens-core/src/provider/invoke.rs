//! Timeout and retry policy for provider calls.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::ProviderError;

/// How long a provider call may take and how long to wait before retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallPolicy {
    pub timeout: Duration,
    pub retry_backoff: Duration,
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            retry_backoff: Duration::from_millis(500),
        }
    }
}

/// Run `call` under `policy`.
///
/// A call that exceeds the timeout becomes a transient [`ProviderError`].
/// A transient failure is retried exactly once after the backoff; a
/// permanent one is returned immediately.
///
/// # Errors
///
/// Returns the error from the last attempt.
pub async fn invoke<T, F, Fut>(
    policy: &CallPolicy,
    operation: &'static str,
    mut call: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    match attempt(policy, operation, &mut call).await {
        Err(e) if e.transient => {
            warn!(
                operation,
                code = %e.code,
                backoff_ms = u64::try_from(policy.retry_backoff.as_millis()).unwrap_or(u64::MAX),
                "transient provider failure, retrying once"
            );
            tokio::time::sleep(policy.retry_backoff).await;
            attempt(policy, operation, &mut call).await
        }
        other => other,
    }
}

async fn attempt<T, F, Fut>(
    policy: &CallPolicy,
    operation: &'static str,
    call: &mut F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    match tokio::time::timeout(policy.timeout, call()).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::timeout(operation, policy.timeout)),
    }
}
