//! Batch items and run options.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::pool::{AuthMethod, ConnectionKey, PooledConnection};

/// Future returned by an item's operation body.
pub type ItemFuture<T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'static>>;

/// Operation body: called once per attempt with the item's pooled connection.
pub type ItemOperation<S, T> = Arc<dyn Fn(PooledConnection<S>) -> ItemFuture<T> + Send + Sync>;

/// One independently retryable unit of work.
pub struct BatchItem<S, T> {
    /// Caller-chosen identity, e.g. a site title. Used in reports and logs.
    pub key: String,
    pub connection: ConnectionKey,
    pub auth: AuthMethod,
    /// Never retried when set.
    pub critical: bool,
    pub(super) operation: ItemOperation<S, T>,
}

impl<S, T> BatchItem<S, T> {
    pub fn new<F, Fut>(key: impl Into<String>, connection: ConnectionKey, operation: F) -> Self
    where
        S: 'static,
        T: 'static,
        F: Fn(PooledConnection<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self {
            key: key.into(),
            connection,
            auth: AuthMethod::default(),
            critical: false,
            operation: Arc::new(move |conn: PooledConnection<S>| -> ItemFuture<T> {
                Box::pin(operation(conn))
            }),
        }
    }

    pub fn with_auth(mut self, auth: AuthMethod) -> Self {
        self.auth = auth;
        self
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }
}

impl<S, T> fmt::Debug for BatchItem<S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchItem")
            .field("key", &self.key)
            .field("connection", &self.connection)
            .field("auth", &self.auth)
            .field("critical", &self.critical)
            .finish_non_exhaustive()
    }
}

/// Sequential is the degenerate parallel case with one worker; both share one code path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Sequential,
    Parallel(usize),
}

impl ExecutionMode {
    /// Number of workers; never zero.
    pub fn limit(self) -> usize {
        match self {
            ExecutionMode::Sequential => 1,
            ExecutionMode::Parallel(n) => n.max(1),
        }
    }
}

/// How a batch runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOptions {
    pub mode: ExecutionMode,
    /// Keep going after a hard failure; otherwise stop claiming new items and return an error.
    pub continue_on_error: bool,
    pub per_item_max_retries: u32,
    /// Report `Conflict` ("already exists") failures as `AlreadyExists` rather than `Failed`.
    pub conflict_is_success: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Parallel(4),
            continue_on_error: true,
            per_item_max_retries: 3,
            conflict_is_success: true,
        }
    }
}

impl BatchOptions {
    pub fn parallel(concurrency_limit: usize) -> Self {
        Self {
            mode: ExecutionMode::Parallel(concurrency_limit),
            ..Self::default()
        }
    }

    pub fn sequential() -> Self {
        Self {
            mode: ExecutionMode::Sequential,
            ..Self::default()
        }
    }

    pub fn continue_on_error(mut self, yes: bool) -> Self {
        self.continue_on_error = yes;
        self
    }

    pub fn per_item_max_retries(mut self, n: u32) -> Self {
        self.per_item_max_retries = n;
        self
    }
}
