//! Timeout and retry wrapper around provider calls.
//!
//! Every task in a run goes through [`call_with_deadline`]. It never
//! surfaces an error: when the budget is exhausted it degrades to the
//! empty-result sentinel so one bad provider cannot sink the whole run.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use super::types::Generation;
use super::ProviderError;

/// Per-call timeout and retry budget.
#[derive(Debug, Clone)]
pub struct CallPolicy {
    /// Deadline applied to each individual attempt.
    pub timeout: Duration,
    /// Retries after the first attempt, so `max_retries + 1` attempts total.
    pub max_retries: u32,
    /// Linear backoff base; attempt `n` sleeps `base * n` before retrying.
    pub backoff_base: Duration,
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            max_retries: 2,
            backoff_base: Duration::from_secs(1),
        }
    }
}

/// Run `call` under the policy's deadline, retrying on failure.
///
/// Timeouts and errors are both retried; there is no point distinguishing
/// retryable from permanent here since the degraded sentinel is the floor
/// either way and the budget is small. Returns the sentinel with the last
/// error message once attempts are exhausted.
pub async fn call_with_deadline<F, Fut>(policy: &CallPolicy, label: &str, call: F) -> Generation
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<Generation, ProviderError>>,
{
    let attempts = policy.max_retries.saturating_add(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match tokio::time::timeout(policy.timeout, call()).await {
            Ok(Ok(generation)) => return generation,
            Ok(Err(e)) => {
                warn!(
                    task = label,
                    attempt,
                    attempts,
                    code = e.code(),
                    error = %e,
                    "provider call failed"
                );
                last_error = e.to_string();
            }
            Err(_) => {
                let e = ProviderError::Timeout(policy.timeout);
                warn!(task = label, attempt, attempts, code = e.code(), "provider call timed out");
                last_error = e.to_string();
            }
        }
        if attempt < attempts {
            tokio::time::sleep(policy.backoff_base * attempt).await;
        }
    }

    warn!(task = label, attempts, "provider call exhausted retries, degrading");
    Generation::failed(last_error)
}
