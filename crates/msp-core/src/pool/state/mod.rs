//! In-memory connection pool with single-flight acquire.

mod sweep;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::control::Cancellation;
use crate::retry::{ExecOptions, OperationError, OperationExecutor};

use super::entry::{
    AuthMethod, Connection, ConnectionState, Eviction, EvictionReason, PooledConnection,
};
use super::ConnectionKey;

/// Remote side of the pool: establishes sessions and checks they are still usable.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Opaque session handle.
    type Session: Send + Sync + 'static;

    /// Open a new authenticated session. Errors are classified like any other remote call.
    async fn connect(&self, key: &ConnectionKey, auth: AuthMethod) -> anyhow::Result<Self::Session>;

    /// Cheap liveness check on an existing session.
    async fn probe(&self, session: &Self::Session) -> anyhow::Result<()>;
}

/// Pool limits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolSettings {
    /// Maximum live connections; least-recently-used are evicted beyond this.
    pub max_connections: usize,
    /// Connections idle longer than this are stale.
    pub idle_timeout: Duration,
    /// Retries for establishing a connection.
    pub connect_max_retries: u32,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 16,
            idle_timeout: Duration::from_secs(30 * 60),
            connect_max_retries: 3,
        }
    }
}

/// Counters since the pool was created, plus the current live count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub live: usize,
    pub created: u64,
    pub reused: u64,
    pub evicted_stale: u64,
    pub evicted_capacity: u64,
    pub evicted_probe: u64,
    pub forced: u64,
    pub disconnected: u64,
}

impl PoolStats {
    fn record(&mut self, evictions: &[Eviction]) {
        for e in evictions {
            match e.reason {
                EvictionReason::Stale => self.evicted_stale += 1,
                EvictionReason::Capacity => self.evicted_capacity += 1,
                EvictionReason::ProbeFailed => self.evicted_probe += 1,
                EvictionReason::Forced => self.forced += 1,
                EvictionReason::Disconnected => self.disconnected += 1,
            }
        }
    }
}

struct PoolInner<S> {
    entries: HashMap<ConnectionKey, Connection<S>>,
    stats: PoolStats,
}

/// Keyed store of authenticated sessions, owned by the application (never global).
///
/// At most one live connection exists per key. Acquires for the same key are
/// serialised by a per-key gate, so concurrent callers share one connect;
/// acquires for different keys proceed in parallel.
pub struct ConnectionPool<C: Connector> {
    connector: C,
    executor: OperationExecutor,
    settings: PoolSettings,
    inner: Mutex<PoolInner<C::Session>>,
    gates: Mutex<HashMap<ConnectionKey, Arc<tokio::sync::Mutex<()>>>>,
    generation: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn log_evictions(evictions: &[Eviction]) {
    for e in evictions {
        tracing::info!(
            key = %e.key,
            generation = e.generation,
            reason = ?e.reason,
            idle_ms = e.idle.as_millis() as u64,
            "connection evicted"
        );
    }
}

impl<C: Connector> ConnectionPool<C> {
    pub fn new(connector: C, executor: OperationExecutor, settings: PoolSettings) -> Self {
        Self {
            connector,
            executor,
            settings: PoolSettings {
                max_connections: settings.max_connections.max(1),
                ..settings
            },
            inner: Mutex::new(PoolInner {
                entries: HashMap::new(),
                stats: PoolStats::default(),
            }),
            gates: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    fn gate(&self, key: &ConnectionKey) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(lock(&self.gates).entry(key.clone()).or_default())
    }

    /// Get a live connection for `key`, reusing a pooled one when its probe passes.
    ///
    /// With `force`, any pooled connection is discarded and a new one is made.
    /// A failed probe evicts the entry and reconnects transparently. Connect
    /// failures surface once the executor has exhausted its retries.
    pub async fn acquire(
        &self,
        key: &ConnectionKey,
        auth: AuthMethod,
        force: bool,
        cancel: &Cancellation,
    ) -> Result<PooledConnection<C::Session>, OperationError> {
        let gate = self.gate(key);
        let result = self.acquire_gated(key, &gate, auth, force, cancel).await;
        drop(gate);
        self.release_gate(key);
        result
    }

    async fn acquire_gated(
        &self,
        key: &ConnectionKey,
        gate: &tokio::sync::Mutex<()>,
        auth: AuthMethod,
        force: bool,
        cancel: &Cancellation,
    ) -> Result<PooledConnection<C::Session>, OperationError> {
        let _guard = tokio::select! {
            biased;
            reason = cancel.cancelled() => {
                return Err(OperationError::Cancelled {
                    operation: format!("acquire {key}"),
                    reason,
                    attempts: 0,
                });
            }
            guard = gate.lock() => guard,
        };

        let existing = {
            let mut inner = lock(&self.inner);
            let now = Instant::now();
            let verdict = inner.entries.get(key).map(|c| {
                if force {
                    Err(EvictionReason::Forced)
                } else if c.state(now, self.settings.idle_timeout) == ConnectionState::Stale {
                    Err(EvictionReason::Stale)
                } else {
                    Ok(c.lease(true))
                }
            });
            match verdict {
                Some(Ok(lease)) => Some(lease),
                Some(Err(reason)) => {
                    let evicted: Vec<Eviction> = inner
                        .entries
                        .remove(key)
                        .map(|c| c.evicted(reason, now))
                        .into_iter()
                        .collect();
                    inner.stats.record(&evicted);
                    log_evictions(&evicted);
                    None
                }
                None => None,
            }
        };

        if let Some(lease) = existing {
            let probed = self
                .executor
                .execute_suppressed(
                    &format!("probe {key}"),
                    &ExecOptions::retries(0),
                    cancel,
                    || self.connector.probe(lease.session()),
                )
                .await;
            if probed.is_some() {
                let mut inner = lock(&self.inner);
                if let Some(c) = inner.entries.get_mut(key) {
                    if c.generation == lease.generation {
                        c.last_used = Instant::now();
                    }
                }
                inner.stats.reused += 1;
                tracing::debug!(key = %key, generation = lease.generation, "connection reused");
                return Ok(lease);
            }
            if let Some(reason) = cancel.check() {
                return Err(OperationError::Cancelled {
                    operation: format!("acquire {key}"),
                    reason,
                    attempts: 0,
                });
            }
            let mut inner = lock(&self.inner);
            let now = Instant::now();
            // Only evict the generation that failed the probe.
            let same = inner.entries.get(key).map(|c| c.generation) == Some(lease.generation);
            let evicted: Vec<Eviction> = if same {
                inner
                    .entries
                    .remove(key)
                    .map(|c| c.evicted(EvictionReason::ProbeFailed, now))
                    .into_iter()
                    .collect()
            } else {
                Vec::new()
            };
            inner.stats.record(&evicted);
            log_evictions(&evicted);
        }

        let connected = self
            .executor
            .execute(
                &format!("connect {key}"),
                &ExecOptions::retries(self.settings.connect_max_retries),
                cancel,
                || self.connector.connect(key, auth),
            )
            .await?;

        let connect_attempts = connected.attempt_count();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let connection = Connection::new(key.clone(), connected.value, auth, generation);
        let lease = connection.lease(false);

        let mut inner = lock(&self.inner);
        inner.entries.insert(key.clone(), connection);
        inner.stats.created += 1;
        let evicted = sweep::evict_over_capacity(
            &mut inner.entries,
            self.settings.max_connections,
            Some(key),
            Instant::now(),
        );
        inner.stats.record(&evicted);
        log_evictions(&evicted);
        tracing::debug!(
            key = %key,
            generation,
            auth = ?auth,
            attempts = connect_attempts,
            "connection created"
        );
        Ok(lease)
    }

    /// Drop the gate for `key` when nothing is pooled under it and no acquire holds it.
    /// Lock order matches `sweep`: entries, then gates.
    fn release_gate(&self, key: &ConnectionKey) {
        let inner = lock(&self.inner);
        if inner.entries.contains_key(key) {
            return;
        }
        let mut gates = lock(&self.gates);
        if gates.get(key).is_some_and(|g| Arc::strong_count(g) == 1) {
            gates.remove(key);
        }
    }

    /// Evict stale entries, then least-recently-used entries beyond capacity.
    pub fn sweep(&self) -> Vec<Eviction> {
        let mut inner = lock(&self.inner);
        let now = Instant::now();
        let mut evicted = sweep::evict_stale(&mut inner.entries, self.settings.idle_timeout, now);
        evicted.extend(sweep::evict_over_capacity(
            &mut inner.entries,
            self.settings.max_connections,
            None,
            now,
        ));
        inner.stats.record(&evicted);
        log_evictions(&evicted);

        let mut gates = lock(&self.gates);
        gates.retain(|k, g| Arc::strong_count(g) > 1 || inner.entries.contains_key(k));
        evicted
    }

    /// Sweep every `interval` until `cancel` fires.
    pub async fn run_sweeper(&self, interval: Duration, cancel: &Cancellation) {
        loop {
            if cancel.sleep(interval).await.is_err() {
                break;
            }
            self.sweep();
        }
        tracing::debug!("pool sweeper stopped");
    }

    /// Drop the connection for `key`. Returns whether one was pooled.
    pub fn disconnect(&self, key: &ConnectionKey) -> bool {
        let mut inner = lock(&self.inner);
        let now = Instant::now();
        let evicted: Vec<Eviction> = inner
            .entries
            .remove(key)
            .map(|c| c.evicted(EvictionReason::Disconnected, now))
            .into_iter()
            .collect();
        inner.stats.record(&evicted);
        log_evictions(&evicted);
        !evicted.is_empty()
    }

    /// Drop every pooled connection. Returns how many were dropped.
    pub fn disconnect_all(&self) -> usize {
        let mut inner = lock(&self.inner);
        let now = Instant::now();
        let evicted: Vec<Eviction> = inner
            .entries
            .drain()
            .map(|(_, c)| c.evicted(EvictionReason::Disconnected, now))
            .collect();
        inner.stats.record(&evicted);
        log_evictions(&evicted);
        evicted.len()
    }

    /// State of the pooled connection for `key`; `None` if absent.
    pub fn state(&self, key: &ConnectionKey) -> Option<ConnectionState> {
        let inner = lock(&self.inner);
        inner
            .entries
            .get(key)
            .map(|c| c.state(Instant::now(), self.settings.idle_timeout))
    }

    /// Generation of the pooled connection for `key`, if any.
    pub fn generation_of(&self, key: &ConnectionKey) -> Option<u64> {
        lock(&self.inner).entries.get(key).map(|c| c.generation)
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys currently pooled, sorted.
    pub fn keys(&self) -> Vec<ConnectionKey> {
        let mut keys: Vec<ConnectionKey> = lock(&self.inner).entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn stats(&self) -> PoolStats {
        let inner = lock(&self.inner);
        PoolStats {
            live: inner.entries.len(),
            ..inner.stats
        }
    }
}

#[cfg(test)]
mod tests;
