use crate::config::RetryPolicy;
use crate::error::{classify, ErrorClass, OptimizerError, Result};
use crate::llm::backend::{CredentialProvider, GenerationBackend};
use crate::llm::types::GenerationRequest;
use log::{debug, error, info, warn};
use rand::Rng;
use std::time::Duration;

/// Delays between retries: exponential growth with jitter, capped at the
/// policy maximum and never shorter than the previous delay.
#[derive(Debug, Clone)]
pub struct BackoffSchedule {
    next_ms: f64,
    max_ms: f64,
    multiplier: f64,
    jitter: f64,
    last: Duration,
}

impl BackoffSchedule {
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            next_ms: policy.base_delay_ms as f64,
            max_ms: policy.max_delay_ms as f64,
            multiplier: policy.multiplier.max(1.0),
            jitter: policy.jitter.clamp(0.0, 1.0),
            last: Duration::ZERO,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = self.next_ms.min(self.max_ms);
        let jittered = if self.jitter > 0.0 {
            base * (1.0 + rand::thread_rng().gen_range(0.0..self.jitter))
        } else {
            base
        };
        let delay = Duration::from_millis(jittered.min(self.max_ms).round() as u64).max(self.last);
        self.last = delay;
        self.next_ms = (self.next_ms * self.multiplier).min(self.max_ms);
        delay
    }
}

struct AttemptFailure {
    class: ErrorClass,
    message: String,
}

/// Wraps a generation backend with per-attempt timeouts, failure
/// classification and bounded retries.
pub struct ResilientCaller<B, C> {
    backend: B,
    credentials: C,
    policy: RetryPolicy,
}

impl<B, C> ResilientCaller<B, C>
where
    B: GenerationBackend,
    C: CredentialProvider,
{
    pub fn new(backend: B, credentials: C, policy: RetryPolicy) -> Self {
        Self {
            backend,
            credentials,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Runs the request until it succeeds, hits a non-retryable failure, or
    /// uses up `max_attempts`.
    pub async fn invoke(&self, request: &GenerationRequest) -> Result<String> {
        let mut schedule = BackoffSchedule::new(&self.policy);
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            // A fresh token per attempt; a missing one never gets retried.
            let token = match self.credentials.valid_access_token().await {
                Some(token) => token,
                None => {
                    error!(
                        "{:?} request aborted: no valid access token",
                        request.purpose
                    );
                    return Err(OptimizerError::MissingCredentials);
                }
            };

            let failure = match tokio::time::timeout(
                self.policy.attempt_timeout(),
                self.backend.generate(request, &token),
            )
            .await
            {
                Ok(Ok(text)) => {
                    if attempt == 1 {
                        debug!("{:?} request succeeded on first attempt", request.purpose);
                    } else {
                        info!(
                            "{:?} request recovered after {} retries",
                            request.purpose,
                            attempt - 1
                        );
                    }
                    return Ok(text);
                }
                Ok(Err(err)) => AttemptFailure {
                    class: classify(&err),
                    message: err.to_string(),
                },
                Err(_) => AttemptFailure {
                    class: ErrorClass::Timeout,
                    message: format!(
                        "attempt timed out after {}ms",
                        self.policy.attempt_timeout_ms
                    ),
                },
            };

            if !self.policy.is_retryable(failure.class) {
                error!(
                    "{:?} request failed with non-retryable {} error: {}",
                    request.purpose, failure.class, failure.message
                );
                return Err(OptimizerError::Call {
                    class: failure.class,
                    attempts: attempt,
                    message: failure.message,
                });
            }

            if attempt >= max_attempts {
                error!(
                    "{:?} request gave up after {} attempts, last failure {}: {}",
                    request.purpose, attempt, failure.class, failure.message
                );
                return Err(OptimizerError::RetriesExhausted {
                    last_class: failure.class,
                    attempts: attempt,
                    message: failure.message,
                });
            }

            let delay = schedule.next_delay();
            warn!(
                "{:?} attempt {}/{} failed ({}): {}. Retrying in {:?}",
                request.purpose, attempt, max_attempts, failure.class, failure.message, delay
            );
            tokio::time::sleep(delay).await;
        }
    }
}
