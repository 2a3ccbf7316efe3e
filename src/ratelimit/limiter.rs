//! In-process rate limiter backed by a concurrent bucket cache.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::backend::Limiter;
use super::bucket::{Take, TokenBucket};
use super::context::Context;
use super::spec::{validate_request, LimitSpec};
use crate::config::StandaloneConfig;
use crate::error::{LimiterError, Result};

/// Identity of a cached bucket: the logical key plus the exact policy.
///
/// The same key under two different specs maps to two independent buckets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub key: String,
    rate_bits: u64,
    pub burst: u64,
}

impl BucketKey {
    pub fn new(key: &str, spec: &LimitSpec) -> Self {
        Self {
            key: key.to_string(),
            rate_bits: spec.rate.to_bits(),
            burst: spec.burst,
        }
    }

    pub fn rate(&self) -> f64 {
        f64::from_bits(self.rate_bits)
    }
}

impl std::fmt::Display for BucketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}/{}", self.key, self.rate(), self.burst)
    }
}

type BucketMap = DashMap<BucketKey, Arc<TokenBucket>>;

/// Token-bucket limiter keeping all state in this process.
///
/// Construction spawns the idle sweep on the current tokio runtime; outside one
/// it fails with [`LimiterError::Config`].
pub struct StandaloneLimiter {
    /// Buckets indexed by key and policy
    buckets: Arc<BucketMap>,
    /// Shared anchor for bucket last-seen stamps
    epoch: Instant,
    idle_timeout: Duration,
    shutdown: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl StandaloneLimiter {
    /// Create a limiter and start its idle sweep.
    pub fn new(config: &StandaloneConfig) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| {
            LimiterError::Config("standalone limiter must be created inside a tokio runtime".into())
        })?;

        let buckets: Arc<BucketMap> = Arc::new(DashMap::new());
        let epoch = Instant::now();
        let shutdown = CancellationToken::new();

        let sweeper = runtime.spawn(sweep_loop(
            buckets.clone(),
            epoch,
            config.cleanup_interval(),
            config.idle_timeout(),
            shutdown.clone(),
        ));

        info!(
            cleanup_interval_ms = config.cleanup_interval_ms,
            idle_timeout_ms = config.idle_timeout_ms,
            "Standalone rate limiter started"
        );

        Ok(Self {
            buckets,
            epoch,
            idle_timeout: config.idle_timeout(),
            shutdown,
            sweeper: Mutex::new(Some(sweeper)),
        })
    }

    /// Look up the bucket for `key`/`spec`, creating a full one if absent.
    ///
    /// The bucket is marked as seen while the map entry is still held, so the
    /// sweep's re-check cannot evict a bucket that is being handed out.
    fn bucket(&self, key: &str, spec: &LimitSpec, now: Instant) -> Arc<TokenBucket> {
        let bucket_key = BucketKey::new(key, spec);
        if let Some(bucket) = self.buckets.get(&bucket_key) {
            bucket.touch(now);
            return bucket.clone();
        }

        let bucket = self.buckets.entry(bucket_key).or_insert_with(|| {
            debug!(key = %key, spec = %spec, "Creating new token bucket");
            Arc::new(TokenBucket::new(*spec, self.epoch, now))
        });
        bucket.touch(now);
        bucket.clone()
    }

    /// Evict every bucket idle for longer than the configured timeout.
    ///
    /// Returns the number of buckets removed.
    pub fn evict_idle(&self) -> usize {
        evict_idle(&self.buckets, Instant::now(), self.idle_timeout)
    }

    /// Tokens currently available for `key`/`spec`, if a bucket exists.
    pub fn available(&self, key: &str, spec: &LimitSpec) -> Option<f64> {
        self.buckets
            .get(&BucketKey::new(key, spec))
            .map(|b| b.available(Instant::now()))
    }

    /// Get the number of cached buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Drop all buckets.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.buckets.clear();
    }

    /// Whether the idle sweep has been stopped.
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

#[async_trait]
impl Limiter for StandaloneLimiter {
    async fn allow_n(&self, _ctx: &Context, key: &str, spec: LimitSpec, n: u64) -> Result<bool> {
        validate_request(key, &spec, n)?;

        if n > spec.burst {
            debug!(key = %key, n = n, burst = spec.burst, "Request exceeds burst capacity");
            return Ok(false);
        }

        let now = Instant::now();
        let granted = matches!(self.bucket(key, &spec, now).try_take(n, now), Take::Granted);

        trace!(key = %key, n = n, allowed = granted, "Checked standalone rate limit");
        if !granted {
            debug!(key = %key, spec = %spec, "Rate limit exceeded");
        }
        Ok(granted)
    }

    async fn wait(&self, ctx: &Context, key: &str, spec: LimitSpec) -> Result<()> {
        validate_request(key, &spec, 1)?;

        loop {
            if let Some(err) = ctx.err() {
                return Err(err);
            }

            // try_take has already released the bucket lock when we sleep
            let now = Instant::now();
            let delay = match self.bucket(key, &spec, now).try_take(1, now) {
                Take::Granted => return Ok(()),
                Take::Short(delay) => delay,
            };

            trace!(key = %key, delay_ms = delay.as_millis() as u64, "Waiting for token");

            tokio::select! {
                err = ctx.done() => return Err(err),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn close(&self) {
        self.shutdown.cancel();
        let handle = self.sweeper.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
            info!("Standalone rate limiter stopped");
        }
    }
}

impl Drop for StandaloneLimiter {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn sweep_loop(
    buckets: Arc<BucketMap>,
    epoch: Instant,
    cleanup_interval: Duration,
    idle_timeout: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(epoch + cleanup_interval, cleanup_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let evicted = evict_idle(&buckets, Instant::now(), idle_timeout);
                if evicted > 0 {
                    debug!(evicted = evicted, remaining = buckets.len(), "Evicted idle buckets");
                }
            }
        }
    }
}

/// Remove buckets idle longer than `idle_timeout`.
///
/// Candidates are collected first and each removal re-checks idleness under
/// the shard lock, so a bucket touched in between survives.
fn evict_idle(buckets: &BucketMap, now: Instant, idle_timeout: Duration) -> usize {
    let candidates: Vec<BucketKey> = buckets
        .iter()
        .filter(|entry| entry.value().idle_for(now) > idle_timeout)
        .map(|entry| entry.key().clone())
        .collect();

    candidates
        .into_iter()
        .filter(|key| {
            buckets
                .remove_if(key, |_, bucket| bucket.idle_for(now) > idle_timeout)
                .is_some()
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> StandaloneConfig {
        StandaloneConfig {
            cleanup_interval_ms: 60_000,
            idle_timeout_ms: 300_000,
        }
    }

    fn fast_sweep_config() -> StandaloneConfig {
        StandaloneConfig {
            cleanup_interval_ms: 50,
            idle_timeout_ms: 100,
        }
    }

    #[tokio::test]
    async fn test_limiter_creation() {
        let limiter = StandaloneLimiter::new(&StandaloneConfig::default()).unwrap();
        assert_eq!(limiter.bucket_count(), 0);
        limiter.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_deny() {
        let limiter = StandaloneLimiter::new(&test_config()).unwrap();
        let ctx = Context::background();
        let spec = LimitSpec::new(1.0, 5);

        for i in 1..=5 {
            assert!(limiter.allow(&ctx, "ip", spec).await.unwrap(), "request {} should pass", i);
        }
        assert!(!limiter.allow(&ctx, "ip", spec).await.unwrap());
        assert_eq!(limiter.bucket_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_allow_n_over_burst_never_mutates() {
        let limiter = StandaloneLimiter::new(&test_config()).unwrap();
        let ctx = Context::background();
        let spec = LimitSpec::new(1.0, 5);

        assert!(!limiter.allow_n(&ctx, "fresh", spec, 6).await.unwrap());
        assert_eq!(limiter.bucket_count(), 0);

        assert!(limiter.allow_n(&ctx, "fresh", spec, 5).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_after_sleep() {
        let limiter = StandaloneLimiter::new(&test_config()).unwrap();
        let ctx = Context::background();
        let spec = LimitSpec::new(10.0, 10);

        assert!(limiter.allow_n(&ctx, "k", spec, 10).await.unwrap());
        assert!(!limiter.allow(&ctx, "k", spec).await.unwrap());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(limiter.allow(&ctx, "k", spec).await.unwrap());
    }

    #[tokio::test]
    async fn test_spec_is_part_of_bucket_identity() {
        let limiter = StandaloneLimiter::new(&test_config()).unwrap();
        let ctx = Context::background();

        assert!(limiter.allow_n(&ctx, "user", LimitSpec::new(1.0, 2), 2).await.unwrap());
        assert!(!limiter.allow(&ctx, "user", LimitSpec::new(1.0, 2)).await.unwrap());

        // Same key, different policy: a separate full bucket
        assert!(limiter.allow(&ctx, "user", LimitSpec::new(1.0, 3)).await.unwrap());
        assert_eq!(limiter.bucket_count(), 2);
        limiter.close().await;
    }

    #[tokio::test]
    async fn test_validation_errors() {
        let limiter = StandaloneLimiter::new(&test_config()).unwrap();
        let ctx = Context::background();
        let spec = LimitSpec::new(1.0, 1);

        assert!(matches!(
            limiter.allow(&ctx, "", spec).await,
            Err(LimiterError::KeyEmpty)
        ));
        assert!(matches!(
            limiter.allow_n(&ctx, "k", spec, 0).await,
            Err(LimiterError::InvalidLimit(_))
        ));
        assert!(matches!(
            limiter.wait(&ctx, "k", LimitSpec::new(-1.0, 1)).await,
            Err(LimiterError::InvalidLimit(_))
        ));
        assert!(matches!(
            limiter.wait(&ctx, "k", LimitSpec::new(1.0, 0)).await,
            Err(LimiterError::InvalidLimit(_))
        ));
        assert_eq!(limiter.bucket_count(), 0);
        limiter.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_blocks_until_refill() {
        let limiter = StandaloneLimiter::new(&test_config()).unwrap();
        let ctx = Context::background();
        let spec = LimitSpec::new(2.0, 1);

        assert!(limiter.allow(&ctx, "k", spec).await.unwrap());

        let start = Instant::now();
        limiter.wait(&ctx, "k", spec).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(500));
        assert!(!limiter.allow(&ctx, "k", spec).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_respects_deadline() {
        let limiter = StandaloneLimiter::new(&test_config()).unwrap();
        let spec = LimitSpec::new(0.1, 1);

        assert!(limiter.allow(&Context::background(), "k", spec).await.unwrap());

        let ctx = Context::with_timeout(Duration::from_millis(100));
        let result = limiter.wait(&ctx, "k", spec).await;
        assert!(matches!(result, Err(LimiterError::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn test_wait_on_cancelled_context() {
        let limiter = StandaloneLimiter::new(&test_config()).unwrap();
        let ctx = Context::background();
        ctx.cancel();

        let result = limiter.wait(&ctx, "k", LimitSpec::new(1.0, 1)).await;
        assert!(matches!(result, Err(LimiterError::Cancelled)));
        limiter.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_bucket_is_evicted_and_reset() {
        let limiter = StandaloneLimiter::new(&fast_sweep_config()).unwrap();
        let ctx = Context::background();
        let spec = LimitSpec::new(1.0, 5);

        assert!(limiter.allow_n(&ctx, "k", spec, 5).await.unwrap());
        assert_eq!(limiter.bucket_count(), 1);

        // Only ~0.3 tokens would refill in this time; a full burst afterwards
        // proves the depleted bucket was dropped by the sweep.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(limiter.bucket_count(), 0);
        assert!(limiter.allow_n(&ctx, "k", spec, 5).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_idle_keeps_active_buckets() {
        let limiter = StandaloneLimiter::new(&StandaloneConfig {
            cleanup_interval_ms: 60_000,
            idle_timeout_ms: 100,
        })
        .unwrap();
        let ctx = Context::background();
        let spec = LimitSpec::new(1.0, 5);

        limiter.allow(&ctx, "stale", spec).await.unwrap();
        tokio::time::advance(Duration::from_millis(150)).await;
        limiter.allow(&ctx, "fresh", spec).await.unwrap();

        assert_eq!(limiter.evict_idle(), 1);
        assert!(limiter.available("stale", &spec).is_none());
        assert!(limiter.available("fresh", &spec).is_some());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let limiter = StandaloneLimiter::new(&test_config()).unwrap();
        assert!(!limiter.is_closed());

        limiter.close().await;
        limiter.close().await;
        assert!(limiter.is_closed());

        // Limiting keeps working without the sweep
        let ctx = Context::background();
        assert!(limiter.allow(&ctx, "k", LimitSpec::new(1.0, 1)).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_never_overgrant() {
        let limiter = Arc::new(StandaloneLimiter::new(&test_config()).unwrap());
        let spec = LimitSpec::new(0.001, 50);

        let tasks: Vec<_> = (0..200)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move {
                    limiter
                        .allow(&Context::background(), "shared", spec)
                        .await
                        .unwrap()
                })
            })
            .collect();

        let granted = futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();
        assert_eq!(granted, 50);
        limiter.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_refreshes_last_seen() {
        let limiter = StandaloneLimiter::new(&StandaloneConfig {
            cleanup_interval_ms: 60_000,
            idle_timeout_ms: 100,
        })
        .unwrap();
        let ctx = Context::background();
        let spec = LimitSpec::new(1.0, 5);

        limiter.allow(&ctx, "k", spec).await.unwrap();
        tokio::time::advance(Duration::from_millis(150)).await;

        // A bucket fetched but not yet taken from must survive a sweep
        let held = limiter.bucket("k", &spec, Instant::now());
        assert_eq!(limiter.evict_idle(), 0);
        assert!(Arc::ptr_eq(&held, &limiter.bucket("k", &spec, Instant::now())));
    }

    #[test]
    fn test_new_outside_runtime_is_config_error() {
        let result = StandaloneLimiter::new(&StandaloneConfig::default());
        assert!(matches!(result, Err(LimiterError::Config(_))));
    }

    #[test]
    fn test_bucket_key_display() {
        let key = BucketKey::new("10.0.0.1", &LimitSpec::new(2.5, 10));
        assert_eq!(key.to_string(), "10.0.0.1@2.5/10");
        assert_eq!(key.rate(), 2.5);
    }
}
