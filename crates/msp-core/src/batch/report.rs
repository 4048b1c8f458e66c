//! Per-item outcomes and the aggregated batch report.

use std::time::Duration;

use serde::Serialize;

use crate::control::CancelReason;
use crate::retry::{ErrorClassification, OperationError};

/// Terminal state of one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemOutcome {
    Succeeded,
    /// Target already existed; terminal but not a failure.
    AlreadyExists,
    Failed,
    /// Stopped by cancellation while running.
    Cancelled,
    /// Never started (fail-fast abort or cancellation).
    Skipped,
}

impl ItemOutcome {
    pub fn is_failure(self) -> bool {
        self == ItemOutcome::Failed
    }
}

/// Result for one item, stored in the slot matching its input position.
#[derive(Debug, Clone, Serialize)]
pub struct ItemReport<T> {
    pub index: usize,
    pub key: String,
    pub outcome: ItemOutcome,
    /// Attempts of the operation body, or of the connect when acquiring failed.
    pub attempts: u32,
    pub elapsed: Duration,
    pub value: Option<T>,
    pub classification: Option<ErrorClassification>,
    pub error: Option<String>,
}

impl<T> ItemReport<T> {
    pub(super) fn succeeded(index: usize, key: String, value: T, attempts: u32, elapsed: Duration) -> Self {
        Self {
            index,
            key,
            outcome: ItemOutcome::Succeeded,
            attempts,
            elapsed,
            value: Some(value),
            classification: None,
            error: None,
        }
    }

    pub(super) fn from_error(
        index: usize,
        key: String,
        err: &OperationError,
        outcome: ItemOutcome,
        elapsed: Duration,
    ) -> Self {
        Self {
            index,
            key,
            outcome,
            attempts: err.attempts(),
            elapsed,
            value: None,
            classification: err.classification(),
            error: Some(match err.report() {
                Some(r) => r.message.clone(),
                None => err.to_string(),
            }),
        }
    }

    pub(super) fn failed(index: usize, key: String, error: String, elapsed: Duration) -> Self {
        Self {
            index,
            key,
            outcome: ItemOutcome::Failed,
            attempts: 1,
            elapsed,
            value: None,
            classification: None,
            error: Some(error),
        }
    }

    pub(super) fn skipped(index: usize, key: String) -> Self {
        Self {
            index,
            key,
            outcome: ItemOutcome::Skipped,
            attempts: 0,
            elapsed: Duration::ZERO,
            value: None,
            classification: None,
            error: None,
        }
    }
}

/// Outcome of a batch run, in input order. Immutable once returned.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport<T> {
    pub items: Vec<ItemReport<T>>,
    pub total: usize,
    pub succeeded: usize,
    pub already_existed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub skipped: usize,
    /// Items that needed more than one attempt.
    pub retried: usize,
    pub duration: Duration,
}

impl<T> BatchReport<T> {
    /// Build from pre-allocated slots; empty slots become `Skipped`.
    pub(super) fn assemble(keys: Vec<String>, slots: Vec<Option<ItemReport<T>>>, duration: Duration) -> Self {
        let items: Vec<ItemReport<T>> = keys
            .into_iter()
            .zip(slots)
            .enumerate()
            .map(|(index, (key, slot))| slot.unwrap_or_else(|| ItemReport::skipped(index, key)))
            .collect();
        let count = |o: ItemOutcome| items.iter().filter(|i| i.outcome == o).count();
        Self {
            total: items.len(),
            succeeded: count(ItemOutcome::Succeeded),
            already_existed: count(ItemOutcome::AlreadyExists),
            failed: count(ItemOutcome::Failed),
            cancelled: count(ItemOutcome::Cancelled),
            skipped: count(ItemOutcome::Skipped),
            retried: items.iter().filter(|i| i.attempts > 1).count(),
            duration,
            items,
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &ItemReport<T>> {
        self.items.iter().filter(|i| i.outcome.is_failure())
    }

    pub fn successes(&self) -> impl Iterator<Item = &ItemReport<T>> {
        self.items
            .iter()
            .filter(|i| matches!(i.outcome, ItemOutcome::Succeeded | ItemOutcome::AlreadyExists))
    }

    /// Items that reached a terminal outcome other than cancelled.
    pub fn finished(&self) -> usize {
        self.total - self.skipped - self.cancelled
    }

    /// Every item succeeded or already existed.
    pub fn all_succeeded(&self) -> bool {
        self.succeeded + self.already_existed == self.total
    }
}

impl<T: Serialize> BatchReport<T> {
    /// Pretty JSON for the calling layer to persist or print.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// A batch that did not run to completion. Always carries the partial report.
#[derive(Debug, thiserror::Error)]
pub enum BatchError<T> {
    /// Fail-fast: the first hard failure stopped new items from starting.
    #[error(
        "batch aborted after '{key}' failed ({} succeeded, {} skipped): {message}",
        .report.succeeded,
        .report.skipped
    )]
    Aborted {
        key: String,
        message: String,
        report: BatchReport<T>,
    },
    #[error("batch {reason} ({} of {} items finished)", .report.finished(), .report.total)]
    Cancelled {
        reason: CancelReason,
        report: BatchReport<T>,
    },
}

impl<T> BatchError<T> {
    pub fn report(&self) -> &BatchReport<T> {
        match self {
            BatchError::Aborted { report, .. } | BatchError::Cancelled { report, .. } => report,
        }
    }

    pub fn into_report(self) -> BatchReport<T> {
        match self {
            BatchError::Aborted { report, .. } | BatchError::Cancelled { report, .. } => report,
        }
    }
}
