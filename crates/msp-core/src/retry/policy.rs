use std::fmt;
use std::time::Duration;

use rand::Rng;

use super::classify::{ErrorCategory, ErrorClassification};

/// Lower bound of the jitter factor.
pub const JITTER_MIN: f64 = 0.8;
/// Upper bound of the jitter factor.
pub const JITTER_MAX: f64 = 1.2;

/// Source of the random factor applied to each backoff delay.
///
/// Implementations must return a value in `[JITTER_MIN, JITTER_MAX]`; values
/// outside the range are clamped.
pub trait Jitter: Send + Sync + fmt::Debug {
    fn factor(&self) -> f64;
}

/// Uniform jitter from the thread-local RNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomJitter;

impl Jitter for RandomJitter {
    fn factor(&self) -> f64 {
        rand::thread_rng().gen_range(JITTER_MIN..=JITTER_MAX)
    }
}

/// Constant jitter factor, for tests and reproducible runs.
#[derive(Debug, Clone, Copy)]
pub struct FixedJitter(pub f64);

impl Jitter for FixedJitter {
    fn factor(&self) -> f64 {
        self.0
    }
}

/// Exponential backoff: `base * 2^(attempt-1) * multiplier * jitter`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base_delay: Duration,
    /// Hard ceiling; no delay ever exceeds it.
    pub max_delay: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl Backoff {
    /// Delay before the attempt following failed attempt `attempt` (1-based).
    ///
    /// `throttle_mode` doubles the multiplier; callers set it only for
    /// throttling failures when explicit throttle-retry is enabled.
    pub fn delay(
        &self,
        attempt: u32,
        multiplier: f64,
        throttle_mode: bool,
        jitter: &dyn Jitter,
    ) -> Duration {
        let exp = attempt.max(1).saturating_sub(1).min(30) as i32;
        let mut factor = multiplier.max(1.0) * 2f64.powi(exp);
        if throttle_mode {
            factor *= 2.0;
        }
        factor *= jitter.factor().clamp(JITTER_MIN, JITTER_MAX);

        let ceiling = self.max_delay.as_secs_f64();
        let secs = (self.base_delay.as_secs_f64() * factor).min(ceiling);
        if !secs.is_finite() || secs < 0.0 {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs).min(self.max_delay)
    }
}

/// Decision returned by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Do not retry this error.
    NoRetry,
    /// Retry after the given delay.
    RetryAfter(Duration),
}

/// Retry bounds plus the backoff curve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; 0 means exactly one attempt.
    pub max_retries: u32,
    pub backoff: Backoff,
    /// Explicit throttle-retry mode: throttling failures back off twice as long.
    pub throttle_retry: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Backoff::default(),
            throttle_retry: false,
        }
    }
}

impl RetryPolicy {
    /// Same policy with a different retry bound.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Decide what to do after attempt `attempt` (1-based) failed with `classification`.
    pub fn decide(
        &self,
        attempt: u32,
        classification: &ErrorClassification,
        jitter: &dyn Jitter,
    ) -> RetryDecision {
        if !classification.retryable || attempt > self.max_retries {
            return RetryDecision::NoRetry;
        }
        let throttle_mode =
            self.throttle_retry && classification.category == ErrorCategory::Throttling;
        RetryDecision::RetryAfter(self.backoff.delay(
            attempt,
            classification.backoff_multiplier,
            throttle_mode,
            jitter,
        ))
    }
}
