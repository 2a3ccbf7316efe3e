//! Fail-open admission helpers for transport adapters.
//!
//! Adapters map a request to a key and a [`LimitSpec`], then ask these helpers
//! whether to let it through. A limiter error (store down, malformed reply,
//! expired context) admits the request and logs a warning, so the limiter can
//! never take the protected service down with it. Streaming transports should
//! call these once when a stream is established, not per message.

use tracing::warn;

use super::backend::Limiter;
use super::context::Context;
use super::spec::LimitSpec;

/// Admit one unit, treating limiter errors as allowed.
pub async fn admit(limiter: &dyn Limiter, ctx: &Context, key: &str, spec: LimitSpec) -> bool {
    admit_n(limiter, ctx, key, spec, 1).await
}

/// Admit `n` units, treating limiter errors as allowed.
pub async fn admit_n(
    limiter: &dyn Limiter,
    ctx: &Context,
    key: &str,
    spec: LimitSpec,
    n: u64,
) -> bool {
    match limiter.allow_n(ctx, key, spec, n).await {
        Ok(allowed) => allowed,
        Err(e) => {
            warn!(key = %key, error = %e, "Rate limiter failed, admitting request");
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DistributedConfig;
    use crate::error::{StoreError, StoreResult};
    use crate::ratelimit::DistributedLimiter;
    use crate::store::{MemoryStore, Reply, ScheduleArgs, ScheduleStore};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct Unreachable;

    #[async_trait]
    impl ScheduleStore for Unreachable {
        async fn schedule(&self, _key: &str, _args: &ScheduleArgs) -> StoreResult<Reply> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
    }

    struct Garbled;

    #[async_trait]
    impl ScheduleStore for Garbled {
        async fn schedule(&self, _key: &str, _args: &ScheduleArgs) -> StoreResult<Reply> {
            Ok(Reply::Bulk("OK".into()))
        }
    }

    #[tokio::test]
    async fn test_store_outage_fails_open() {
        let limiter = DistributedLimiter::new(&DistributedConfig::default(), Arc::new(Unreachable));
        let ctx = Context::background();
        let spec = LimitSpec::new(1.0, 1);

        for _ in 0..3 {
            assert!(admit(&limiter, &ctx, "k", spec).await);
        }
    }

    #[tokio::test]
    async fn test_protocol_error_fails_open() {
        let limiter = DistributedLimiter::new(&DistributedConfig::default(), Arc::new(Garbled));
        assert!(admit(&limiter, &Context::background(), "k", LimitSpec::new(1.0, 1)).await);
    }

    #[tokio::test]
    async fn test_denial_is_respected() {
        let limiter =
            DistributedLimiter::new(&DistributedConfig::default(), Arc::new(MemoryStore::new()));
        let ctx = Context::background();
        let spec = LimitSpec::new(0.01, 2);

        assert!(admit_n(&limiter, &ctx, "k", spec, 2).await);
        assert!(!admit(&limiter, &ctx, "k", spec).await);
    }
}
