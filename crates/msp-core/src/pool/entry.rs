//! Pooled connection entries and the handle given to callers.

use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::ConnectionKey;

/// How the session was authenticated. A tag only; credentials never reach the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    #[default]
    Interactive,
    DeviceCode,
    Certificate,
    ClientSecret,
    ManagedIdentity,
}

/// Lifecycle state of a connection still held by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Live,
    /// Idle longer than the pool's idle timeout; evicted on next sweep or acquire.
    Stale,
}

/// Why a connection left the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum EvictionReason {
    Stale,
    Capacity,
    ProbeFailed,
    /// Replaced by a forced refresh.
    Forced,
    Disconnected,
}

/// Record of one eviction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eviction {
    pub key: ConnectionKey,
    pub generation: u64,
    pub reason: EvictionReason,
    pub idle: Duration,
}

/// A live session owned by the pool.
#[derive(Debug)]
pub struct Connection<S> {
    pub key: ConnectionKey,
    pub(super) session: Arc<S>,
    pub auth_method: AuthMethod,
    pub created_at: Instant,
    pub last_used: Instant,
    /// Pool-wide, strictly increasing across connects.
    pub generation: u64,
}

impl<S> Connection<S> {
    pub(super) fn new(key: ConnectionKey, session: S, auth_method: AuthMethod, generation: u64) -> Self {
        let now = Instant::now();
        Self {
            key,
            session: Arc::new(session),
            auth_method,
            created_at: now,
            last_used: now,
            generation,
        }
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used)
    }

    pub fn state(&self, now: Instant, idle_timeout: Duration) -> ConnectionState {
        if self.idle_for(now) > idle_timeout {
            ConnectionState::Stale
        } else {
            ConnectionState::Live
        }
    }

    pub(super) fn lease(&self, reused: bool) -> PooledConnection<S> {
        PooledConnection {
            key: self.key.clone(),
            session: Arc::clone(&self.session),
            auth_method: self.auth_method,
            generation: self.generation,
            reused,
        }
    }

    pub(super) fn evicted(&self, reason: EvictionReason, now: Instant) -> Eviction {
        Eviction {
            key: self.key.clone(),
            generation: self.generation,
            reason,
            idle: self.idle_for(now),
        }
    }
}

/// Handle to a pooled session, valid for one operation.
///
/// Holding it does not pin the entry in the pool; if the pool evicts the
/// connection meanwhile, the session stays alive until the handle drops.
#[derive(Debug)]
pub struct PooledConnection<S> {
    pub key: ConnectionKey,
    session: Arc<S>,
    pub auth_method: AuthMethod,
    pub generation: u64,
    /// False when this acquire created the session.
    pub reused: bool,
}

impl<S> Clone for PooledConnection<S> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            session: Arc::clone(&self.session),
            auth_method: self.auth_method,
            generation: self.generation,
            reused: self.reused,
        }
    }
}

impl<S> PooledConnection<S> {
    pub fn session(&self) -> &S {
        &self.session
    }
}

impl<S> Deref for PooledConnection<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.session
    }
}
