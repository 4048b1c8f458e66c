//! Throttled batch orchestration.
//!
//! Fans out many independent provisioning operations under a hard
//! concurrency cap. Each item gets a pooled connection for its tenant and is
//! retried on its own; the batch either continues past failures (counting
//! them) or stops claiming new items on the first hard failure. Sequential
//! runs use the same path with a single worker.

mod item;
mod progress;
mod report;
mod run;

pub use item::{BatchItem, BatchOptions, ExecutionMode, ItemFuture, ItemOperation};
pub use progress::BatchProgress;
pub use report::{BatchError, BatchReport, ItemOutcome, ItemReport};
pub use run::BatchOrchestrator;
