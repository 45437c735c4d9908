//! Bounded timeout and retry-with-backoff around external calls.

use std::future::Future;
use std::time::Duration;

use crate::cancellation::CancellationToken;
use crate::config::ResilienceConfig;
use crate::error::{is_transient, PipelineError, Service};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub backoff_multiplier: f32,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based).
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = self
            .backoff_multiplier
            .max(1.0)
            .powi(retry.saturating_sub(1) as i32);
        let millis = (self.initial_backoff.as_millis() as f64 * factor as f64)
            .min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }
}

impl From<&ResilienceConfig> for RetryPolicy {
    fn from(config: &ResilienceConfig) -> Self {
        Self {
            timeout: Duration::from_millis(config.timeout_ms),
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            backoff_multiplier: config.backoff_multiplier,
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&ResilienceConfig::default())
    }
}

enum Failure {
    TimedOut,
    Failed(anyhow::Error),
}

/// Run `op` under the policy's timeout, retrying transient failures with
/// exponential backoff. Cancellation is checked before every attempt.
pub async fn call_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    service: Service,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, PipelineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let max_attempts = policy.max_retries.saturating_add(1);
    let mut attempt = 0u32;

    loop {
        cancel.check()?;
        attempt += 1;

        let failure = match tokio::time::timeout(policy.timeout, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) if !is_transient(&e) => {
                tracing::error!(service = %service, attempt, error = %e, "Collaborator call failed permanently");
                return Err(PipelineError::Collaborator {
                    service,
                    attempts: attempt,
                    message: format!("{:#}", e),
                });
            }
            Ok(Err(e)) => Failure::Failed(e),
            Err(_) => Failure::TimedOut,
        };

        if attempt >= max_attempts {
            tracing::error!(service = %service, attempts = attempt, "Collaborator call exhausted retries");
            return Err(match failure {
                Failure::TimedOut => PipelineError::Timeout {
                    service,
                    attempts: attempt,
                },
                Failure::Failed(e) => PipelineError::Collaborator {
                    service,
                    attempts: attempt,
                    message: format!("{:#}", e),
                },
            });
        }

        let backoff = policy.backoff_for(attempt);
        match &failure {
            Failure::TimedOut => {
                tracing::warn!(service = %service, attempt, "Collaborator call timed out, retrying in {:?}", backoff)
            }
            Failure::Failed(e) => {
                tracing::warn!(service = %service, attempt, error = %e, "Collaborator call failed, retrying in {:?}", backoff)
            }
        }
        tokio::time::sleep(backoff).await;
    }
}
