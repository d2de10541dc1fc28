//! In-memory counter store for single-instance deployments and tests.
//!
//! Each key's record sits behind its own shard lock in a `DashMap`; `record`
//! holds that lock for the whole purge/insert/count/expire sequence, which
//! gives the same per-key atomicity the Redis script provides. Expiry is
//! evaluated against the caller's `now_ms` rather than wall time, and a record
//! stays readable through the last millisecond its newest entry is live.
//!
//! Idle records are swept lazily: a `record` call whose `now_ms` has passed
//! the scheduled sweep time drops every expired record, then schedules the
//! next sweep one window later. `live_count` drops an expired key it reads.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, trace};

use super::{window_floor, CounterStore, StoreError};

/// A sorted set of `(score, member)` plus a member index.
#[derive(Debug, Default)]
struct WindowRecord {
    entries: BTreeSet<(i64, String)>,
    scores: HashMap<String, i64>,
    expires_at_ms: i64,
}

impl WindowRecord {
    fn is_expired(&self, now_ms: i64) -> bool {
        !self.entries.is_empty() && now_ms > self.expires_at_ms
    }

    fn purge_before(&mut self, floor: i64) -> usize {
        let stale: Vec<(i64, String)> = self
            .entries
            .range(..(floor, String::new()))
            .cloned()
            .collect();

        for entry in &stale {
            self.entries.remove(entry);
            self.scores.remove(&entry.1);
        }
        stale.len()
    }

    fn insert(&mut self, member: &str, score: i64) {
        if let Some(previous) = self.scores.insert(member.to_string(), score) {
            self.entries.remove(&(previous, member.to_string()));
        }
        self.entries.insert((score, member.to_string()));
    }

    fn count_from(&self, floor: i64) -> usize {
        self.entries.range((floor, String::new())..).count()
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.scores.clear();
    }
}

/// Counter store kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<String, WindowRecord>,
    next_sweep_ms: AtomicI64,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently held, expired or not.
    pub fn key_count(&self) -> usize {
        self.records.len()
    }

    /// Drop every record whose expiry has passed at `now_ms`.
    pub fn evict_expired(&self, now_ms: i64) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| !record.is_expired(now_ms));
        before - self.records.len()
    }

    /// Sweep expired records if the scheduled sweep time has passed. Only one
    /// caller wins each slot. Must not be called while holding a record guard.
    fn maybe_sweep(&self, now_ms: i64, window_ms: u64) {
        let due = self.next_sweep_ms.load(Ordering::Relaxed);
        if now_ms < due {
            return;
        }

        let next = now_ms.saturating_add(i64::try_from(window_ms).unwrap_or(i64::MAX));
        if self
            .next_sweep_ms
            .compare_exchange(due, next, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        let evicted = self.evict_expired(now_ms);
        if evicted > 0 {
            debug!(evicted = evicted, remaining = self.records.len(), "Swept idle memory store records");
        }
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn record(
        &self,
        key: &str,
        member: &str,
        now_ms: i64,
        window_ms: u64,
    ) -> Result<u64, StoreError> {
        let floor = window_floor(now_ms, window_ms);
        let count = {
            let mut record = self.records.entry(key.to_string()).or_default();

            if record.is_expired(now_ms) {
                record.clear();
            }

            let purged = record.purge_before(floor);
            record.insert(member, now_ms);
            let count = record.entries.len() as u64;
            record.expires_at_ms = now_ms.saturating_add(i64::try_from(window_ms).unwrap_or(i64::MAX));

            trace!(key = %key, purged = purged, count = count, "Recorded event in memory store");
            count
        };

        self.maybe_sweep(now_ms, window_ms);
        Ok(count)
    }

    async fn live_count(&self, key: &str, now_ms: i64, window_ms: u64) -> Result<u64, StoreError> {
        let floor = window_floor(now_ms, window_ms);

        let count = match self.records.get(key) {
            Some(record) if !record.is_expired(now_ms) => Some(record.count_from(floor)),
            Some(_) => None,
            None => Some(0),
        };

        match count {
            Some(count) => Ok(count as u64),
            None => {
                self.records.remove_if(key, |_, record| record.is_expired(now_ms));
                Ok(0)
            }
        }
    }

    async fn clear(&self, key: &str) -> Result<(), StoreError> {
        self.records.remove(key);
        Ok(())
    }
}
