//! Attempt history, terminal failure reports, and the executor's error type.

use std::fmt;
use std::time::{Duration, SystemTime};

use serde::Serialize;

use super::classify::ErrorClassification;
use crate::control::CancelReason;

/// Outcome of a single attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum AttemptOutcome {
    Success,
    Failure {
        classification: ErrorClassification,
        message: String,
    },
}

/// One run of an operation body within a single executor invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationAttempt {
    /// 1-based.
    pub index: u32,
    pub started_at: SystemTime,
    pub duration: Duration,
    pub outcome: AttemptOutcome,
    /// Backoff slept after this attempt, if a retry followed.
    pub backoff: Option<Duration>,
}

impl OperationAttempt {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, AttemptOutcome::Success)
    }
}

/// Full account of an operation that ran out of attempts or hit a non-retryable error.
#[derive(Debug, Clone, Serialize)]
pub struct FailureReport {
    pub operation: String,
    /// Text of the last error, including its context chain.
    pub message: String,
    pub classification: ErrorClassification,
    pub critical: bool,
    pub attempts: Vec<OperationAttempt>,
    pub elapsed: Duration,
}

impl FailureReport {
    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed [{} / {:?}] after {} attempt(s) in {:.1}s: {}",
            self.operation,
            self.classification.category,
            self.classification.severity,
            self.attempt_count(),
            self.elapsed.as_secs_f64(),
            self.message
        )
    }
}

/// Terminal error from the executor. Retryable failures never surface here
/// until the retry budget is spent.
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    #[error("{0}")]
    Failed(Box<FailureReport>),
    #[error("{operation} {reason} after {attempts} attempt(s)")]
    Cancelled {
        operation: String,
        reason: CancelReason,
        attempts: u32,
    },
}

impl OperationError {
    /// The failure report, unless the operation was cancelled.
    pub fn report(&self) -> Option<&FailureReport> {
        match self {
            OperationError::Failed(r) => Some(r),
            OperationError::Cancelled { .. } => None,
        }
    }

    pub fn classification(&self) -> Option<ErrorClassification> {
        self.report().map(|r| r.classification)
    }

    pub fn attempts(&self) -> u32 {
        match self {
            OperationError::Failed(r) => r.attempt_count(),
            OperationError::Cancelled { attempts, .. } => *attempts,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, OperationError::Cancelled { .. })
    }
}

/// Successful executor run.
#[derive(Debug, Clone)]
pub struct Completed<T> {
    pub value: T,
    /// Every attempt, ending with the successful one.
    pub attempts: Vec<OperationAttempt>,
    pub elapsed: Duration,
}

impl<T> Completed<T> {
    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Completed<U> {
        Completed {
            value: f(self.value),
            attempts: self.attempts,
            elapsed: self.elapsed,
        }
    }
}
