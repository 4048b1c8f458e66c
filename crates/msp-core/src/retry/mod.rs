//! Retry and backoff policy.
//!
//! This module encapsulates error classification (throttling, timeouts,
//! authorization, ...), exponential backoff with jitter, and the executor
//! that runs remote operations under that policy, so the pool and the batch
//! orchestrator share one consistent retry behaviour.

mod classify;
mod error;
mod policy;
mod run;

pub use classify::{
    classify_error, classify_http_status, classify_message, ErrorCategory, ErrorClassification,
    Severity,
};
pub use error::{AttemptOutcome, Completed, FailureReport, OperationAttempt, OperationError};
pub use policy::{
    Backoff, FixedJitter, Jitter, RandomJitter, RetryDecision, RetryPolicy, JITTER_MAX, JITTER_MIN,
};
pub use run::{ExecOptions, OperationExecutor};
