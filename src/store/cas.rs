//! Compare-and-swap emulation of the scheduling procedure.
//!
//! For stores that can version a key but cannot run server-side logic. Each
//! attempt reads the schedule and its version, decides locally with the same
//! evaluator the script mirrors, and writes only if the version is unchanged.
//! Losing the race means another caller's grant landed first, so the attempt is
//! recomputed against the new schedule.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, warn};

use super::{Reply, ScheduleArgs, ScheduleStore};
use crate::error::{StoreError, StoreResult};
use crate::ratelimit::gcra;

/// A stored schedule together with its version token.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Versioned {
    pub value: f64,
    pub version: u64,
}

/// Minimal versioned key-value operations.
#[async_trait]
pub trait VersionedStore: Send + Sync {
    /// Read the unexpired value under `key`.
    async fn load(&self, key: &str) -> StoreResult<Option<Versioned>>;

    /// Write `value` with `ttl` only if the key's current version is `expected`
    /// (`None` meaning absent). Returns whether the write happened.
    async fn store_if(
        &self,
        key: &str,
        expected: Option<u64>,
        value: f64,
        ttl: Duration,
    ) -> StoreResult<bool>;
}

#[async_trait]
impl<S: VersionedStore + ?Sized> VersionedStore for std::sync::Arc<S> {
    async fn load(&self, key: &str) -> StoreResult<Option<Versioned>> {
        (**self).load(key).await
    }

    async fn store_if(
        &self,
        key: &str,
        expected: Option<u64>,
        value: f64,
        ttl: Duration,
    ) -> StoreResult<bool> {
        (**self).store_if(key, expected, value, ttl).await
    }
}

/// Adapts a [`VersionedStore`] into a [`ScheduleStore`].
///
/// Slower than a native script under contention; the grant/deny outcome is the
/// same. Store errors are returned immediately; only version conflicts retry.
pub struct CasScheduleStore<S> {
    inner: S,
    max_attempts: u32,
}

impl<S: VersionedStore> CasScheduleStore<S> {
    pub fn new(inner: S, max_attempts: u32) -> Self {
        Self {
            inner,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: VersionedStore> ScheduleStore for CasScheduleStore<S> {
    async fn schedule(&self, key: &str, args: &ScheduleArgs) -> StoreResult<Reply> {
        for attempt in 1..=self.max_attempts {
            let current = self.inner.load(key).await?;
            let decision = gcra::evaluate(current.map(|v| v.value), args);

            let committed = match decision.next {
                None => true,
                Some(next) => {
                    self.inner
                        .store_if(key, current.map(|v| v.version), next, decision.ttl)
                        .await?
                }
            };

            if committed {
                return Ok(Reply::Array(vec![
                    Reply::Int(decision.allowed as i64),
                    Reply::Int(decision.remaining as i64),
                ]));
            }

            debug!(key = %key, attempt = attempt, "Schedule update conflicted, retrying");
            let jitter = rand::thread_rng().gen_range(0..=50 * attempt as u64);
            tokio::time::sleep(Duration::from_micros(jitter)).await;
        }

        warn!(key = %key, attempts = self.max_attempts, "Giving up on contended schedule");
        Err(StoreError::Conflict {
            attempts: self.max_attempts,
        })
    }
}
