//! Retry loop: run an operation until success, a non-retryable failure, or
//! the retry budget runs out.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::time::Instant;

use super::classify::classify_error;
use super::error::{AttemptOutcome, Completed, FailureReport, OperationAttempt, OperationError};
use super::policy::{Jitter, RandomJitter, RetryDecision, RetryPolicy};
use crate::control::{CancelReason, Cancellation};

/// Per-call overrides of the executor's policy.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ExecOptions {
    /// Overrides `RetryPolicy::max_retries`.
    pub max_retries: Option<u32>,
    /// Overrides the backoff base delay.
    pub base_delay: Option<Duration>,
    /// Critical operations are never retried, whatever the classification.
    pub critical: bool,
}

impl ExecOptions {
    pub fn retries(max_retries: u32) -> Self {
        Self {
            max_retries: Some(max_retries),
            ..Self::default()
        }
    }

    pub fn critical() -> Self {
        Self {
            critical: true,
            ..Self::default()
        }
    }
}

/// Runs operation bodies under the retry policy. Stateless apart from its
/// configuration; every `execute` call owns its own attempt counter.
#[derive(Debug, Clone)]
pub struct OperationExecutor {
    policy: RetryPolicy,
    jitter: Arc<dyn Jitter>,
}

impl Default for OperationExecutor {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl OperationExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            jitter: Arc::new(RandomJitter),
        }
    }

    /// Replace the jitter source (e.g. `FixedJitter` in tests).
    pub fn with_jitter(mut self, jitter: Arc<dyn Jitter>) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn effective_policy(&self, opts: &ExecOptions) -> RetryPolicy {
        let mut policy = self.policy;
        if let Some(n) = opts.max_retries {
            policy.max_retries = n;
        }
        if let Some(base) = opts.base_delay {
            policy.backoff.base_delay = base;
        }
        policy
    }

    /// Run `body` until it succeeds or the policy says stop.
    ///
    /// Retryable failures are absorbed; only the terminal failure (with its
    /// full attempt history) or a cancellation is returned as an error.
    pub async fn execute<T, E, F, Fut>(
        &self,
        operation: &str,
        opts: &ExecOptions,
        cancel: &Cancellation,
        mut body: F,
    ) -> Result<Completed<T>, OperationError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<anyhow::Error>,
    {
        let policy = self.effective_policy(opts);
        let started = Instant::now();
        let mut attempts: Vec<OperationAttempt> = Vec::new();
        let mut attempt = 1u32;

        loop {
            if let Some(reason) = cancel.check() {
                return Err(cancelled(operation, reason, attempts.len() as u32));
            }

            let started_at = SystemTime::now();
            let attempt_start = Instant::now();
            let result = tokio::select! {
                biased;
                reason = cancel.cancelled() => {
                    return Err(cancelled(operation, reason, attempt));
                }
                r = body() => r,
            };
            let duration = attempt_start.elapsed();

            let err: anyhow::Error = match result {
                Ok(value) => {
                    attempts.push(OperationAttempt {
                        index: attempt,
                        started_at,
                        duration,
                        outcome: AttemptOutcome::Success,
                        backoff: None,
                    });
                    if attempt > 1 {
                        tracing::info!(operation, attempt, "operation succeeded after retry");
                    }
                    return Ok(Completed {
                        value,
                        attempts,
                        elapsed: started.elapsed(),
                    });
                }
                Err(e) => e.into(),
            };

            let mut classification = classify_error(&err);
            if opts.critical {
                classification = classification.non_retryable();
            }
            let message = format!("{:#}", err);
            let decision = policy.decide(attempt, &classification, &*self.jitter);

            tracing::debug!(
                operation,
                attempt,
                category = %classification.category,
                retryable = classification.retryable,
                error = %message,
                "attempt failed"
            );

            attempts.push(OperationAttempt {
                index: attempt,
                started_at,
                duration,
                outcome: AttemptOutcome::Failure {
                    classification,
                    message: message.clone(),
                },
                backoff: match decision {
                    RetryDecision::RetryAfter(d) => Some(d),
                    RetryDecision::NoRetry => None,
                },
            });

            match decision {
                RetryDecision::NoRetry => {
                    let report = FailureReport {
                        operation: operation.to_string(),
                        message,
                        classification,
                        critical: opts.critical,
                        attempts,
                        elapsed: started.elapsed(),
                    };
                    tracing::warn!(
                        operation,
                        category = %classification.category,
                        severity = ?classification.severity,
                        attempts = report.attempt_count(),
                        elapsed_ms = report.elapsed.as_millis() as u64,
                        "operation failed: {}",
                        report.message
                    );
                    return Err(OperationError::Failed(Box::new(report)));
                }
                RetryDecision::RetryAfter(delay) => {
                    tracing::info!(
                        operation,
                        attempt,
                        category = %classification.category,
                        delay_ms = delay.as_millis() as u64,
                        "retrying after backoff"
                    );
                    if let Err(reason) = cancel.sleep(delay).await {
                        return Err(cancelled(operation, reason, attempt));
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Like `execute`, but a terminal failure degrades to `None` plus a warning.
    pub async fn execute_suppressed<T, E, F, Fut>(
        &self,
        operation: &str,
        opts: &ExecOptions,
        cancel: &Cancellation,
        body: F,
    ) -> Option<Completed<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<anyhow::Error>,
    {
        match self.execute(operation, opts, cancel, body).await {
            Ok(done) => Some(done),
            Err(e) => {
                tracing::warn!(
                    operation,
                    category = ?e.classification().map(|c| c.category),
                    attempts = e.attempts(),
                    "suppressed failure: {}",
                    e
                );
                None
            }
        }
    }
}

fn cancelled(operation: &str, reason: CancelReason, attempts: u32) -> OperationError {
    tracing::info!(operation, attempts, %reason, "operation stopped");
    OperationError::Cancelled {
        operation: operation.to_string(),
        reason,
        attempts,
    }
}
