//! Staleness and capacity eviction over the entry map.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use super::super::entry::{Connection, Eviction, EvictionReason};
use super::super::ConnectionKey;

/// Remove every entry idle longer than `idle_timeout`.
pub(super) fn evict_stale<S>(
    entries: &mut HashMap<ConnectionKey, Connection<S>>,
    idle_timeout: Duration,
    now: Instant,
) -> Vec<Eviction> {
    let stale: Vec<ConnectionKey> = entries
        .values()
        .filter(|c| c.idle_for(now) > idle_timeout)
        .map(|c| c.key.clone())
        .collect();
    remove_all(entries, stale, EvictionReason::Stale, now)
}

/// Remove least-recently-used entries until at most `max` remain.
/// `keep` (the entry just acquired) is never chosen.
pub(super) fn evict_over_capacity<S>(
    entries: &mut HashMap<ConnectionKey, Connection<S>>,
    max: usize,
    keep: Option<&ConnectionKey>,
    now: Instant,
) -> Vec<Eviction> {
    if entries.len() <= max {
        return Vec::new();
    }
    let excess = entries.len() - max;
    let mut candidates: Vec<(Instant, u64, &ConnectionKey)> = entries
        .values()
        .filter(|c| Some(&c.key) != keep)
        .map(|c| (c.last_used, c.generation, &c.key))
        .collect();
    candidates.sort();
    let victims: Vec<ConnectionKey> = candidates
        .into_iter()
        .take(excess)
        .map(|(_, _, key)| key.clone())
        .collect();
    remove_all(entries, victims, EvictionReason::Capacity, now)
}

fn remove_all<S>(
    entries: &mut HashMap<ConnectionKey, Connection<S>>,
    keys: Vec<ConnectionKey>,
    reason: EvictionReason,
    now: Instant,
) -> Vec<Eviction> {
    keys.into_iter()
        .filter_map(|key| entries.remove(&key))
        .map(|c| c.evicted(reason, now))
        .collect()
}
