//! Per-step retry execution (§4.9, §7): only transient error kinds are
//! eligible for retry; everything else is fatal on the first attempt. A
//! flat `backoff_ms` delay is applied between attempts — the policy has no
//! exponential factor, it is the number of attempts and a single wait.

use std::future::Future;
use std::time::Duration;

use crate::errors::RunnerError;
use crate::protocol::RetryPolicy;

/// Outcome of a retried operation, carrying how many attempts it actually
/// took so callers can populate `StepResult::attempts`.
pub struct RetryOutcome<T> {
    pub result: Result<T, RunnerError>,
    pub attempts: u32,
}

/// Runs `operation` up to `policy.max_attempts` times. Stops early the
/// moment an error is not `is_transient()` — a non-transient failure never
/// gets a second try regardless of how many attempts remain.
pub async fn execute_with_retry<T, F, Fut>(policy: &RetryPolicy, mut operation: F) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, RunnerError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        match operation(attempts).await {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempts,
                }
            }
            Err(err) => {
                let retryable = err.is_transient() && attempts < max_attempts;
                if !retryable {
                    return RetryOutcome {
                        result: Err(err),
                        attempts,
                    };
                }
                if policy.backoff_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(policy.backoff_ms)).await;
                }
                tracing::debug!(attempt = attempts, max_attempts, "retrying after transient error");
            }
        }
    }
}
