//! Tests for ConnectionPool acquire, eviction, and sweeping.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::control::{CancelReason, Cancellation};
use crate::retry::{Backoff, ErrorCategory, OperationError, OperationExecutor, RetryPolicy};

use super::super::entry::{AuthMethod, Connection, ConnectionState, EvictionReason};
use super::super::ConnectionKey;
use super::{sweep, ConnectionPool, Connector, PoolSettings};

#[derive(Debug)]
struct FakeSession {
    id: u32,
}

#[derive(Debug)]
struct FakeConnector {
    connects: AtomicU32,
    probes: AtomicU32,
    probe_ok: AtomicBool,
    connect_delay: Duration,
    connect_failures: Mutex<VecDeque<&'static str>>,
    connect_times: Mutex<Vec<Instant>>,
}

impl FakeConnector {
    fn new() -> Self {
        Self {
            connects: AtomicU32::new(0),
            probes: AtomicU32::new(0),
            probe_ok: AtomicBool::new(true),
            connect_delay: Duration::ZERO,
            connect_failures: Mutex::new(VecDeque::new()),
            connect_times: Mutex::new(Vec::new()),
        }
    }

    fn failing_first(failures: &[&'static str]) -> Self {
        let c = Self::new();
        c.connect_failures.lock().unwrap().extend(failures.iter().copied());
        c
    }

    fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    fn probes(&self) -> u32 {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    type Session = FakeSession;

    async fn connect(&self, _key: &ConnectionKey, _auth: AuthMethod) -> anyhow::Result<FakeSession> {
        self.connect_times.lock().unwrap().push(Instant::now());
        let id = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        let failure = self.connect_failures.lock().unwrap().pop_front();
        if let Some(msg) = failure {
            anyhow::bail!(msg);
        }
        Ok(FakeSession { id })
    }

    async fn probe(&self, _session: &FakeSession) -> anyhow::Result<()> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.probe_ok.load(Ordering::SeqCst) {
            Ok(())
        } else {
            anyhow::bail!("session expired: 401 unauthorized")
        }
    }
}

fn executor() -> OperationExecutor {
    OperationExecutor::new(RetryPolicy {
        max_retries: 3,
        backoff: Backoff {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
        },
        throttle_retry: false,
    })
}

fn pool_with(connector: FakeConnector, settings: PoolSettings) -> ConnectionPool<FakeConnector> {
    ConnectionPool::new(connector, executor(), settings)
}

fn key(tenant: &str) -> ConnectionKey {
    ConnectionKey::new(tenant, "https://contoso-admin.sharepoint.com").unwrap()
}

#[tokio::test(start_paused = true)]
async fn acquire_creates_then_reuses() {
    let pool = pool_with(FakeConnector::new(), PoolSettings::default());
    let cancel = Cancellation::new();
    let k = key("t1");

    let first = pool.acquire(&k, AuthMethod::Certificate, false, &cancel).await.unwrap();
    assert!(!first.reused);
    assert_eq!(first.auth_method, AuthMethod::Certificate);
    assert_eq!(pool.connector().probes(), 0);

    let second = pool.acquire(&k, AuthMethod::Certificate, false, &cancel).await.unwrap();
    assert!(second.reused);
    assert_eq!(second.generation, first.generation);
    assert_eq!(second.id, first.id);
    assert_eq!(pool.connector().connects(), 1);
    assert_eq!(pool.connector().probes(), 1);

    let stats = pool.stats();
    assert_eq!(stats.live, 1);
    assert_eq!(stats.created, 1);
    assert_eq!(stats.reused, 1);
}

#[tokio::test(start_paused = true)]
async fn reuse_bumps_last_used() {
    let settings = PoolSettings {
        idle_timeout: Duration::from_secs(60),
        ..PoolSettings::default()
    };
    let pool = pool_with(FakeConnector::new(), settings);
    let cancel = Cancellation::new();
    let k = key("t1");

    pool.acquire(&k, AuthMethod::Interactive, false, &cancel).await.unwrap();
    tokio::time::advance(Duration::from_secs(50)).await;
    pool.acquire(&k, AuthMethod::Interactive, false, &cancel).await.unwrap();
    tokio::time::advance(Duration::from_secs(50)).await;
    // 100s since creation but only 50s since last use.
    assert_eq!(pool.state(&k), Some(ConnectionState::Live));
}

#[tokio::test(start_paused = true)]
async fn concurrent_acquires_share_one_connect() {
    let mut connector = FakeConnector::new();
    connector.connect_delay = Duration::from_millis(200);
    let pool = Arc::new(pool_with(connector, PoolSettings::default()));
    let k = key("t1");

    let mut handles = Vec::new();
    for _ in 0..16 {
        let pool = Arc::clone(&pool);
        let k = k.clone();
        handles.push(tokio::spawn(async move {
            pool.acquire(&k, AuthMethod::Interactive, false, &Cancellation::new())
                .await
                .map(|lease| lease.generation)
        }));
    }
    let mut generations = Vec::new();
    for h in handles {
        generations.push(h.await.unwrap().unwrap());
    }

    assert_eq!(pool.connector().connects(), 1);
    assert!(generations.iter().all(|g| *g == generations[0]));
    assert_eq!(pool.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn different_keys_connect_independently() {
    let pool = pool_with(FakeConnector::new(), PoolSettings::default());
    let cancel = Cancellation::new();
    let a = pool.acquire(&key("t1"), AuthMethod::Interactive, false, &cancel).await.unwrap();
    let b = pool.acquire(&key("t2"), AuthMethod::Interactive, false, &cancel).await.unwrap();
    assert_ne!(a.generation, b.generation);
    assert!(b.generation > a.generation);
    assert_eq!(pool.keys(), vec![key("t1"), key("t2")]);
}

#[tokio::test(start_paused = true)]
async fn force_replaces_connection() {
    let pool = pool_with(FakeConnector::new(), PoolSettings::default());
    let cancel = Cancellation::new();
    let k = key("t1");

    let first = pool.acquire(&k, AuthMethod::Interactive, false, &cancel).await.unwrap();
    let forced = pool.acquire(&k, AuthMethod::ClientSecret, true, &cancel).await.unwrap();
    assert!(!forced.reused);
    assert!(forced.generation > first.generation);
    assert_eq!(forced.auth_method, AuthMethod::ClientSecret);
    assert_eq!(pool.connector().connects(), 2);
    assert_eq!(pool.connector().probes(), 0);
    assert_eq!(pool.stats().forced, 1);
    assert_eq!(pool.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_probe_reconnects_transparently() {
    let pool = pool_with(FakeConnector::new(), PoolSettings::default());
    let cancel = Cancellation::new();
    let k = key("t1");

    let first = pool.acquire(&k, AuthMethod::Interactive, false, &cancel).await.unwrap();
    pool.connector().probe_ok.store(false, Ordering::SeqCst);
    let second = pool.acquire(&k, AuthMethod::Interactive, false, &cancel).await.unwrap();

    assert!(!second.reused);
    assert!(second.generation > first.generation);
    assert_eq!(pool.connector().probes(), 1);
    assert_eq!(pool.connector().connects(), 2);
    assert_eq!(pool.stats().evicted_probe, 1);
    assert_eq!(pool.generation_of(&k), Some(second.generation));
}

#[tokio::test(start_paused = true)]
async fn stale_connection_is_replaced_without_probe() {
    let settings = PoolSettings {
        idle_timeout: Duration::from_secs(60),
        ..PoolSettings::default()
    };
    let pool = pool_with(FakeConnector::new(), settings);
    let cancel = Cancellation::new();
    let k = key("t1");

    pool.acquire(&k, AuthMethod::Interactive, false, &cancel).await.unwrap();
    tokio::time::advance(Duration::from_secs(61)).await;
    assert_eq!(pool.state(&k), Some(ConnectionState::Stale));

    let lease = pool.acquire(&k, AuthMethod::Interactive, false, &cancel).await.unwrap();
    assert!(!lease.reused);
    assert_eq!(pool.connector().probes(), 0);
    assert_eq!(pool.stats().evicted_stale, 1);
}

#[tokio::test(start_paused = true)]
async fn capacity_evicts_least_recently_used() {
    let settings = PoolSettings {
        max_connections: 2,
        ..PoolSettings::default()
    };
    let pool = pool_with(FakeConnector::new(), settings);
    let cancel = Cancellation::new();

    pool.acquire(&key("t1"), AuthMethod::Interactive, false, &cancel).await.unwrap();
    tokio::time::advance(Duration::from_secs(1)).await;
    pool.acquire(&key("t2"), AuthMethod::Interactive, false, &cancel).await.unwrap();
    tokio::time::advance(Duration::from_secs(1)).await;
    pool.acquire(&key("t3"), AuthMethod::Interactive, false, &cancel).await.unwrap();
    assert_eq!(pool.keys(), vec![key("t2"), key("t3")]);

    // Touch t2 so t3 becomes the least recently used.
    tokio::time::advance(Duration::from_secs(1)).await;
    pool.acquire(&key("t2"), AuthMethod::Interactive, false, &cancel).await.unwrap();
    tokio::time::advance(Duration::from_secs(1)).await;
    pool.acquire(&key("t4"), AuthMethod::Interactive, false, &cancel).await.unwrap();
    assert_eq!(pool.keys(), vec![key("t2"), key("t4")]);
    assert_eq!(pool.stats().evicted_capacity, 2);
}

#[tokio::test(start_paused = true)]
async fn over_capacity_sweep_keeps_most_recent() {
    let base = Instant::now();
    let mut entries = HashMap::new();
    for i in 0..5u64 {
        let k = key(&format!("t{i}"));
        let mut c = Connection::new(k.clone(), FakeSession { id: i as u32 }, AuthMethod::Interactive, i + 1);
        c.last_used = base + Duration::from_secs(i);
        entries.insert(k, c);
    }

    let evicted = sweep::evict_over_capacity(&mut entries, 2, None, base + Duration::from_secs(10));
    assert_eq!(evicted.len(), 3);
    assert!(evicted.iter().all(|e| e.reason == EvictionReason::Capacity));
    let mut gone: Vec<u64> = evicted.iter().map(|e| e.generation).collect();
    gone.sort();
    assert_eq!(gone, vec![1, 2, 3]);
    assert!(entries.contains_key(&key("t4")));
    assert!(entries.contains_key(&key("t3")));

    let none = sweep::evict_over_capacity(&mut entries, 2, None, base);
    assert!(none.is_empty());
}

#[tokio::test(start_paused = true)]
async fn sweep_evicts_only_stale() {
    let settings = PoolSettings {
        idle_timeout: Duration::from_secs(60),
        ..PoolSettings::default()
    };
    let pool = pool_with(FakeConnector::new(), settings);
    let cancel = Cancellation::new();

    pool.acquire(&key("old"), AuthMethod::Interactive, false, &cancel).await.unwrap();
    tokio::time::advance(Duration::from_secs(45)).await;
    pool.acquire(&key("new"), AuthMethod::Interactive, false, &cancel).await.unwrap();
    tokio::time::advance(Duration::from_secs(30)).await;

    let evicted = pool.sweep();
    assert_eq!(evicted.len(), 1);
    assert_eq!(evicted[0].key, key("old"));
    assert_eq!(evicted[0].reason, EvictionReason::Stale);
    assert_eq!(pool.keys(), vec![key("new")]);
}

#[tokio::test(start_paused = true)]
async fn sweeper_runs_until_cancelled() {
    let settings = PoolSettings {
        idle_timeout: Duration::from_secs(60),
        ..PoolSettings::default()
    };
    let pool = Arc::new(pool_with(FakeConnector::new(), settings));
    let cancel = Cancellation::new();
    pool.acquire(&key("t1"), AuthMethod::Interactive, false, &cancel).await.unwrap();

    let sweeper = {
        let pool = Arc::clone(&pool);
        let cancel = cancel.clone();
        tokio::spawn(async move { pool.run_sweeper(Duration::from_secs(30), &cancel).await })
    };
    tokio::time::sleep(Duration::from_secs(100)).await;
    assert!(pool.is_empty());

    cancel.cancel();
    sweeper.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn connect_retries_with_backoff_then_succeeds() {
    let pool = pool_with(
        FakeConnector::failing_first(&["connect timeout", "request timed out"]),
        PoolSettings::default(),
    );
    let lease = pool
        .acquire(&key("t1"), AuthMethod::Interactive, false, &Cancellation::new())
        .await
        .unwrap();
    assert_eq!(lease.id, 3);
    assert_eq!(pool.connector().connects(), 3);

    let times = pool.connector().connect_times.lock().unwrap().clone();
    let base = 1.0;
    for (n, pair) in times.windows(2).enumerate() {
        let gap = (pair[1] - pair[0]).as_secs_f64();
        let min = base * 1.5 * 2f64.powi(n as i32) * 0.8;
        assert!(gap >= min - 1e-6, "gap {n}: {gap} < {min}");
    }
}

#[tokio::test(start_paused = true)]
async fn connect_failure_surfaces_classified_error() {
    let pool = pool_with(
        FakeConnector::failing_first(&["AADSTS: 401 Unauthorized"]),
        PoolSettings::default(),
    );
    let err = pool
        .acquire(&key("t1"), AuthMethod::Interactive, false, &Cancellation::new())
        .await
        .unwrap_err();
    assert_eq!(
        err.classification().map(|c| c.category),
        Some(ErrorCategory::Authorization)
    );
    assert_eq!(err.attempts(), 1);
    assert!(pool.is_empty());
}

#[tokio::test(start_paused = true)]
async fn disconnect_and_disconnect_all() {
    let pool = pool_with(FakeConnector::new(), PoolSettings::default());
    let cancel = Cancellation::new();
    for t in ["t1", "t2", "t3"] {
        pool.acquire(&key(t), AuthMethod::Interactive, false, &cancel).await.unwrap();
    }

    assert!(pool.disconnect(&key("t1")));
    assert!(!pool.disconnect(&key("t1")));
    assert_eq!(pool.state(&key("t1")), None);
    assert_eq!(pool.disconnect_all(), 2);
    assert!(pool.is_empty());
    assert_eq!(pool.stats().disconnected, 3);
}

#[tokio::test(start_paused = true)]
async fn cancelled_acquire_does_not_connect() {
    let pool = pool_with(FakeConnector::new(), PoolSettings::default());
    let cancel = Cancellation::new();
    cancel.cancel();
    let err = pool
        .acquire(&key("t1"), AuthMethod::Interactive, false, &cancel)
        .await
        .unwrap_err();
    match err {
        OperationError::Cancelled { reason, .. } => assert_eq!(reason, CancelReason::Cancelled),
        other => panic!("expected cancellation, got {other}"),
    }
    assert_eq!(pool.connector().connects(), 0);
}

#[tokio::test(start_paused = true)]
async fn gates_are_dropped_for_keys_with_no_connection() {
    let pool = pool_with(
        FakeConnector::failing_first(&["403 forbidden"]),
        PoolSettings::default(),
    );
    let cancel = Cancellation::new();

    pool.acquire(&key("locked"), AuthMethod::Interactive, false, &cancel)
        .await
        .unwrap_err();
    assert!(pool.gates.lock().unwrap().is_empty());

    pool.acquire(&key("t1"), AuthMethod::Interactive, false, &cancel).await.unwrap();
    assert!(pool.gates.lock().unwrap().contains_key(&key("t1")));
    assert_eq!(pool.gates.lock().unwrap().len(), 1);
}
