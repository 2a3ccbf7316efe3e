//! Distributed rate limiter coordinated through a shared store.
//!
//! Each bucket is a single scheduled timestamp kept under `prefix + key`.
//! Every `allow_n` is exactly one call to the store's atomic scheduling
//! procedure, so any number of processes sharing the store and prefix see one
//! serialized sequence of grants.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, trace};

use super::backend::Limiter;
use super::clock::{Clock, SystemClock};
use super::context::Context;
use super::spec::{validate_request, LimitSpec};
use crate::config::DistributedConfig;
use crate::error::{LimiterError, Result};
use crate::store::{Reply, ScheduleArgs, ScheduleStore};

/// Decoded outcome of one scheduling call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub allowed: bool,
    /// Whole units still admissible
    pub remaining: u64,
}

/// A rate limiter whose state lives in a shared store.
pub struct DistributedLimiter {
    /// The store running the scheduling procedure.
    store: Arc<dyn ScheduleStore>,
    /// Prepended to every key before it reaches the store.
    prefix: String,
    clock: Arc<dyn Clock>,
}

impl DistributedLimiter {
    /// Create a new distributed limiter reading time from the system clock.
    pub fn new(config: &DistributedConfig, store: Arc<dyn ScheduleStore>) -> Self {
        Self::with_clock(config, store, Arc::new(SystemClock))
    }

    /// Create a new distributed limiter with an explicit time source.
    pub fn with_clock(
        config: &DistributedConfig,
        store: Arc<dyn ScheduleStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        info!(prefix = %config.key_prefix, "Distributed rate limiter created");
        Self {
            store,
            prefix: config.key_prefix.clone(),
            clock,
        }
    }

    /// Get the key prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The key under which `key` is stored.
    pub fn store_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Run one scheduling call and return the full decoded reply.
    ///
    /// Store errors are returned as-is; nothing is retried here.
    pub async fn check(&self, ctx: &Context, key: &str, spec: LimitSpec, n: u64) -> Result<Admission> {
        validate_request(key, &spec, n)?;

        let store_key = self.store_key(key);
        let args = ScheduleArgs {
            rate: spec.rate,
            burst: spec.burst,
            now: self.clock.now(),
            n,
        };

        trace!(
            key = %store_key,
            rate = spec.rate,
            burst = spec.burst,
            n = n,
            "Checking distributed rate limit"
        );

        let reply = ctx.run(self.store.schedule(&store_key, &args)).await??;
        let admission = decode_reply(&reply)?;

        if !admission.allowed {
            debug!(
                key = %store_key,
                spec = %spec,
                remaining = admission.remaining,
                "Distributed rate limit exceeded"
            );
        }
        Ok(admission)
    }
}

#[async_trait]
impl Limiter for DistributedLimiter {
    async fn allow_n(&self, ctx: &Context, key: &str, spec: LimitSpec, n: u64) -> Result<bool> {
        Ok(self.check(ctx, key, spec, n).await?.allowed)
    }

    async fn wait(&self, _ctx: &Context, _key: &str, _spec: LimitSpec) -> Result<()> {
        Err(LimiterError::NotSupported(
            "wait on the distributed limiter; poll allow with backoff instead",
        ))
    }
}

/// Decode `[allowed, remaining]`. Anything else is a protocol error, never a
/// grant or a denial.
pub fn decode_reply(reply: &Reply) -> Result<Admission> {
    let items = match reply {
        Reply::Array(items) if items.len() == 2 => items,
        other => {
            return Err(LimiterError::Protocol(format!(
                "expected [allowed, remaining], got {}",
                other
            )))
        }
    };

    let allowed = match reply_int(&items[0])? {
        0 => false,
        1 => true,
        other => {
            return Err(LimiterError::Protocol(format!(
                "allowed flag must be 0 or 1, got {}",
                other
            )))
        }
    };

    let remaining = reply_int(&items[1])?;
    let remaining = u64::try_from(remaining).map_err(|_| {
        LimiterError::Protocol(format!("remaining must not be negative, got {}", remaining))
    })?;

    Ok(Admission { allowed, remaining })
}

fn reply_int(reply: &Reply) -> Result<i64> {
    match reply {
        Reply::Int(i) => Ok(*i),
        Reply::Bulk(s) => s
            .parse()
            .map_err(|_| LimiterError::Protocol(format!("expected an integer, got {:?}", s))),
        other => Err(LimiterError::Protocol(format!(
            "expected an integer, got {}",
            other
        ))),
    }
}
