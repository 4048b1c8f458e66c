//! Per-tenant connection pool.
//!
//! Sessions to the remote service are expensive to authenticate, so the pool
//! keeps one live session per `(tenant, endpoint)` and reuses it while a
//! cheap liveness probe passes. Connects and probes run through the
//! `OperationExecutor`, so they get the same classification and retry
//! treatment as any other remote call. Entries are evicted when stale, when
//! the probe fails, on explicit disconnect, or least-recently-used first when
//! the pool is over capacity.
//!
//! The pool is an explicit value owned by the application and passed to the
//! batch orchestrator; there is no process-wide instance.

mod entry;
mod key;
mod state;

pub use entry::{AuthMethod, ConnectionState, Eviction, EvictionReason, PooledConnection};
pub use key::ConnectionKey;
pub use state::{ConnectionPool, Connector, PoolSettings, PoolStats};
