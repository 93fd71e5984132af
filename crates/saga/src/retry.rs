use std::future::Future;
use std::time::Duration;

use crate::config::RetryPolicy;
use crate::services::ServiceError;

/// Runs a collaborator call under a per-call deadline, retrying transient
/// failures with the policy's backoff.
///
/// An elapsed deadline counts as a transient failure. The last error is
/// returned once attempts are exhausted; permanent errors return at once.
pub(crate) async fn with_retry<T, F, Fut>(
    step: &'static str,
    policy: &RetryPolicy,
    step_timeout: Duration,
    mut call: F,
) -> Result<T, ServiceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ServiceError>>,
{
    let mut attempt = 1;
    loop {
        let outcome = match tokio::time::timeout(step_timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(ServiceError::Timeout(step_timeout)),
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let backoff = policy.backoff_for(attempt);
                tracing::warn!(
                    step,
                    attempt,
                    error = %e,
                    backoff_ms = backoff.as_millis() as u64,
                    "transient step failure, retrying"
                );
                metrics::counter!("redemption_step_retries_total", "step" => step).increment(1);
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
