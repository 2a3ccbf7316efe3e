//! Continuous-refill token bucket.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use super::spec::LimitSpec;

/// Result of a refill-and-take attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Take {
    /// The units were removed from the bucket.
    Granted,
    /// Not enough tokens; the wait until enough would be available.
    Short(Duration),
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A token bucket owned by one cache slot.
///
/// Tokens and the refill timestamp live behind one lock. The last-seen stamp is
/// kept outside it so the idle sweep can read it without contending with
/// request-path callers.
pub struct TokenBucket {
    spec: LimitSpec,
    state: Mutex<BucketState>,
    /// Milliseconds since `epoch` at the last access
    last_seen_ms: AtomicU64,
    epoch: Instant,
}

impl TokenBucket {
    /// Create a full bucket. `epoch` anchors the last-seen stamp and must be
    /// shared by every bucket compared in one sweep.
    pub fn new(spec: LimitSpec, epoch: Instant, now: Instant) -> Self {
        Self {
            spec,
            state: Mutex::new(BucketState {
                tokens: spec.burst as f64,
                last_refill: now,
            }),
            last_seen_ms: AtomicU64::new(millis_since(epoch, now)),
            epoch,
        }
    }

    /// Refill to `now`, then remove `n` tokens if that many are available.
    ///
    /// Refill, test and decrement happen under a single lock acquisition.
    pub fn try_take(&self, n: u64, now: Instant) -> Take {
        self.touch(now);
        let mut state = self.state.lock();
        self.refill(&mut state, now);

        let wanted = n as f64;
        if state.tokens >= wanted {
            state.tokens -= wanted;
            Take::Granted
        } else {
            let deficit = wanted - state.tokens;
            Take::Short(
                Duration::try_from_secs_f64(deficit / self.spec.rate).unwrap_or(Duration::MAX),
            )
        }
    }

    /// Tokens available at `now`, without consuming any.
    pub fn available(&self, now: Instant) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state, now);
        state.tokens
    }

    /// How long the bucket has gone without being accessed.
    pub fn idle_for(&self, now: Instant) -> Duration {
        let seen = self.last_seen_ms.load(Ordering::Acquire);
        Duration::from_millis(millis_since(self.epoch, now).saturating_sub(seen))
    }

    /// Record an access at `now`.
    pub(crate) fn touch(&self, now: Instant) {
        self.last_seen_ms
            .fetch_max(millis_since(self.epoch, now), Ordering::AcqRel);
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            state.tokens = (state.tokens + elapsed * self.spec.rate).min(self.spec.burst as f64);
            state.last_refill = now;
        }
    }
}

fn millis_since(epoch: Instant, now: Instant) -> u64 {
    now.saturating_duration_since(epoch).as_millis() as u64
}
