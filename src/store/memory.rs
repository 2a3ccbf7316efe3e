//! In-process store with TTL expiry.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

use super::cas::{Versioned, VersionedStore};
use super::{Reply, ScheduleArgs, ScheduleStore};
use crate::error::StoreResult;
use crate::ratelimit::gcra;

/// Longest expiry honoured; larger TTLs are clamped.
const MAX_TTL: Duration = Duration::from_secs(365 * 24 * 3600);

/// Minimum spacing between full expiry scans triggered by writes.
const PURGE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: f64,
    version: u64,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    next_version: u64,
    last_purge: Option<Instant>,
}

impl Inner {
    /// The unexpired entry under `key`. An expired one is removed.
    fn live(&mut self, key: &str, now: Instant) -> Option<Entry> {
        let entry = *self.entries.get(key)?;
        if entry.expires_at > now {
            Some(entry)
        } else {
            self.entries.remove(key);
            None
        }
    }

    fn purge(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.expires_at > now);
        self.last_purge = Some(now);
        before - self.entries.len()
    }

    /// Scan for expired keys at most once per `PURGE_INTERVAL`, so keys that
    /// are never read again still leave the map.
    fn maybe_purge(&mut self, now: Instant) {
        match self.last_purge {
            None => self.last_purge = Some(now),
            Some(last) if now.saturating_duration_since(last) >= PURGE_INTERVAL => {
                let purged = self.purge(now);
                if purged > 0 {
                    trace!(purged = purged, remaining = self.entries.len(), "Purged expired keys");
                }
            }
            Some(_) => {}
        }
    }

    fn put(&mut self, key: &str, value: f64, ttl: Duration, now: Instant) {
        self.maybe_purge(now);
        self.next_version += 1;
        let entry = Entry {
            value,
            version: self.next_version,
            expires_at: now + ttl.min(MAX_TTL),
        };
        self.entries.insert(key.to_string(), entry);
    }
}

/// A shared store living in this process.
///
/// All commands are serialized through one lock, which gives the scheduling
/// procedure the same indivisibility a scripting server provides. Handles are
/// typically shared as `Arc<MemoryStore>` between several limiters.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The unexpired value stored under `key`.
    pub fn get(&self, key: &str) -> Option<f64> {
        self.inner.lock().live(key, Instant::now()).map(|e| e.value)
    }

    /// Time left before `key` expires.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.inner
            .lock()
            .live(key, now)
            .map(|e| e.expires_at.saturating_duration_since(now))
    }

    /// Number of unexpired keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.inner
            .lock()
            .entries
            .values()
            .filter(|e| e.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired keys; returns how many were removed.
    ///
    /// Writes already do this periodically.
    pub fn purge_expired(&self) -> usize {
        self.inner.lock().purge(Instant::now())
    }
}

#[async_trait]
impl ScheduleStore for MemoryStore {
    async fn schedule(&self, key: &str, args: &ScheduleArgs) -> StoreResult<Reply> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let stored = inner.live(key, now).map(|e| e.value);
        let decision = gcra::evaluate(stored, args);
        if let Some(next) = decision.next {
            inner.put(key, next, decision.ttl, now);
        }

        trace!(
            key = %key,
            allowed = decision.allowed,
            remaining = decision.remaining,
            "Ran schedule procedure"
        );

        Ok(Reply::Array(vec![
            Reply::Int(decision.allowed as i64),
            Reply::Int(decision.remaining as i64),
        ]))
    }
}

#[async_trait]
impl VersionedStore for MemoryStore {
    async fn load(&self, key: &str) -> StoreResult<Option<Versioned>> {
        Ok(self
            .inner
            .lock()
            .live(key, Instant::now())
            .map(|e| Versioned {
                value: e.value,
                version: e.version,
            }))
    }

    async fn store_if(
        &self,
        key: &str,
        expected: Option<u64>,
        value: f64,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let current = inner.live(key, now).map(|e| e.version);
        if current != expected {
            return Ok(false);
        }
        inner.put(key, value, ttl, now);
        Ok(true)
    }
}
