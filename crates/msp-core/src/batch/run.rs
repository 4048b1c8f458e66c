//! Bounded worker pool over a shared work queue.
//!
//! `min(limit, items)` workers pull the next unclaimed item, acquire a pooled
//! connection for it, and run its body through the executor. Results come
//! back over one channel to a single collector, which writes each into the
//! slot reserved for the item's input position.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::task::AbortOnDropHandle;

use crate::control::Cancellation;
use crate::pool::{ConnectionPool, Connector};
use crate::retry::{ErrorCategory, ExecOptions, OperationError, OperationExecutor};

use super::item::{BatchItem, BatchOptions};
use super::progress::BatchProgress;
use super::report::{BatchError, BatchReport, ItemOutcome, ItemReport};

type WorkQueue<S, T> = Arc<Mutex<VecDeque<(usize, BatchItem<S, T>)>>>;

fn pop<S, T>(work: &WorkQueue<S, T>) -> Option<(usize, BatchItem<S, T>)> {
    work.lock().unwrap_or_else(PoisonError::into_inner).pop_front()
}

/// Runs batches of items against a shared connection pool.
pub struct BatchOrchestrator<C: Connector> {
    pool: Arc<ConnectionPool<C>>,
    executor: OperationExecutor,
}

impl<C: Connector> Clone for BatchOrchestrator<C> {
    fn clone(&self) -> Self {
        Self {
            pool: Arc::clone(&self.pool),
            executor: self.executor.clone(),
        }
    }
}

impl<C: Connector> BatchOrchestrator<C> {
    pub fn new(pool: Arc<ConnectionPool<C>>, executor: OperationExecutor) -> Self {
        Self { pool, executor }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool<C>> {
        &self.pool
    }

    /// Run every item with at most `options.mode.limit()` in flight.
    ///
    /// With `continue_on_error`, all items run and failures are only counted.
    /// Otherwise the first hard failure stops new items from starting and
    /// the partial report comes back inside `BatchError::Aborted`. Cancelling
    /// `cancel` stops in-flight items and prevents new ones.
    pub async fn run<T>(
        &self,
        items: Vec<BatchItem<C::Session, T>>,
        options: &BatchOptions,
        cancel: &Cancellation,
        progress_tx: Option<mpsc::Sender<BatchProgress>>,
    ) -> Result<BatchReport<T>, BatchError<T>>
    where
        T: Send + 'static,
    {
        let started = Instant::now();
        let total = items.len();
        let keys: Vec<String> = items.iter().map(|i| i.key.clone()).collect();
        let num_workers = options.mode.limit().min(total);

        tracing::info!(total, workers = num_workers, "batch started");

        let work: WorkQueue<C::Session, T> =
            Arc::new(Mutex::new(items.into_iter().enumerate().collect()));
        let stop_claiming = Arc::new(AtomicBool::new(false));
        let (tx, mut rx) = mpsc::unbounded_channel::<ItemReport<T>>();

        let mut workers = JoinSet::new();
        for _ in 0..num_workers {
            let work = Arc::clone(&work);
            let stop = Arc::clone(&stop_claiming);
            let tx = tx.clone();
            let cancel = cancel.clone();
            let this = self.clone();
            let options = *options;
            workers.spawn(async move {
                loop {
                    if stop.load(Ordering::Relaxed) || cancel.is_cancelled() {
                        break;
                    }
                    let Some((index, item)) = pop(&work) else {
                        break;
                    };
                    let key = item.key.clone();
                    let item_start = Instant::now();
                    // Own task per item so a panicking body fails only its item.
                    // Aborted with the worker when the batch future is dropped.
                    let handle = AbortOnDropHandle::new(tokio::spawn({
                        let this = this.clone();
                        let cancel = cancel.clone();
                        async move { this.run_item(index, item, &options, &cancel).await }
                    }));
                    let report = match handle.await {
                        Ok(report) => report,
                        Err(e) => ItemReport::failed(
                            index,
                            key,
                            format!("item task failed: {e}"),
                            item_start.elapsed(),
                        ),
                    };
                    if report.outcome.is_failure() && !options.continue_on_error {
                        stop.store(true, Ordering::Relaxed);
                    }
                    if tx.send(report).is_err() {
                        break;
                    }
                }
            });
        }
        drop(tx);

        let mut slots: Vec<Option<ItemReport<T>>> = (0..total).map(|_| None).collect();
        let mut first_failure: Option<(String, String)> = None;
        let (mut done, mut succeeded, mut failed) = (0usize, 0usize, 0usize);

        while let Some(report) = rx.recv().await {
            done += 1;
            match report.outcome {
                ItemOutcome::Succeeded | ItemOutcome::AlreadyExists => succeeded += 1,
                ItemOutcome::Failed => failed += 1,
                ItemOutcome::Cancelled | ItemOutcome::Skipped => {}
            }
            tracing::debug!(
                key = %report.key,
                outcome = ?report.outcome,
                attempts = report.attempts,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "batch item finished"
            );

            if report.outcome.is_failure() && !options.continue_on_error && first_failure.is_none() {
                stop_claiming.store(true, Ordering::Relaxed);
                let drained = {
                    let mut q = work.lock().unwrap_or_else(PoisonError::into_inner);
                    let n = q.len();
                    q.clear();
                    n
                };
                tracing::warn!(
                    key = %report.key,
                    skipped = drained,
                    "batch item failed; not starting remaining items"
                );
                first_failure = Some((
                    report.key.clone(),
                    report.error.clone().unwrap_or_default(),
                ));
            }

            if let Some(tx) = progress_tx.as_ref() {
                let _ = tx.try_send(BatchProgress {
                    done,
                    total,
                    succeeded,
                    failed,
                    last_key: report.key.clone(),
                    elapsed_secs: started.elapsed().as_secs_f64(),
                });
            }

            let index = report.index;
            if let Some(slot) = slots.get_mut(index) {
                debug_assert!(slot.is_none(), "item {index} reported twice");
                *slot = Some(report);
            }
        }

        while let Some(res) = workers.join_next().await {
            if let Err(e) = res {
                tracing::error!("batch worker task failed: {}", e);
            }
        }

        let report = BatchReport::assemble(keys, slots, started.elapsed());
        tracing::info!(
            total = report.total,
            succeeded = report.succeeded,
            already_existed = report.already_existed,
            failed = report.failed,
            retried = report.retried,
            skipped = report.skipped,
            elapsed_ms = report.duration.as_millis() as u64,
            "batch completed"
        );

        // A deadline passing after every item finished does not fail the batch.
        if report.cancelled + report.skipped > 0 {
            if let Some(reason) = cancel.check() {
                return Err(BatchError::Cancelled { reason, report });
            }
        }
        if let Some((key, message)) = first_failure {
            return Err(BatchError::Aborted {
                key,
                message,
                report,
            });
        }
        Ok(report)
    }

    async fn run_item<T>(
        &self,
        index: usize,
        item: BatchItem<C::Session, T>,
        options: &BatchOptions,
        cancel: &Cancellation,
    ) -> ItemReport<T> {
        let started = Instant::now();
        let outcome_for = |err: &OperationError| {
            if err.is_cancelled() {
                ItemOutcome::Cancelled
            } else if options.conflict_is_success
                && err.classification().map(|c| c.category) == Some(ErrorCategory::Conflict)
            {
                ItemOutcome::AlreadyExists
            } else {
                ItemOutcome::Failed
            }
        };

        let lease = match self
            .pool
            .acquire(&item.connection, item.auth, false, cancel)
            .await
        {
            Ok(lease) => lease,
            Err(e) => {
                let outcome = if e.is_cancelled() {
                    ItemOutcome::Cancelled
                } else {
                    ItemOutcome::Failed
                };
                return ItemReport::from_error(index, item.key, &e, outcome, started.elapsed());
            }
        };

        let opts = ExecOptions {
            max_retries: Some(options.per_item_max_retries),
            base_delay: None,
            critical: item.critical,
        };
        let operation = Arc::clone(&item.operation);
        match self
            .executor
            .execute(&item.key, &opts, cancel, || operation(lease.clone()))
            .await
        {
            Ok(done) => {
                let attempts = done.attempt_count();
                ItemReport::succeeded(index, item.key, done.value, attempts, started.elapsed())
            }
            Err(e) => {
                let outcome = outcome_for(&e);
                if outcome == ItemOutcome::AlreadyExists {
                    tracing::info!(key = %item.key, "target already exists");
                }
                ItemReport::from_error(index, item.key, &e, outcome, started.elapsed())
            }
        }
    }
}
