//! Limiter trait for abstracting standalone and distributed implementations.

use async_trait::async_trait;

use super::context::Context;
use super::spec::LimitSpec;
use crate::error::Result;

/// Admission control shared by every backend.
///
/// Transport adapters hold an `Arc<dyn Limiter>` and never need to know which
/// backend sits behind it.
#[async_trait]
pub trait Limiter: Send + Sync {
    /// Admit one unit for `key` under `spec`.
    async fn allow(&self, ctx: &Context, key: &str, spec: LimitSpec) -> Result<bool> {
        self.allow_n(ctx, key, spec, 1).await
    }

    /// Admit `n` units all-or-nothing.
    ///
    /// Returns `KeyEmpty` or `InvalidLimit` without touching any state when the
    /// inputs are out of range.
    async fn allow_n(&self, ctx: &Context, key: &str, spec: LimitSpec, n: u64) -> Result<bool>;

    /// Block until one unit is admitted or `ctx` finishes.
    async fn wait(&self, ctx: &Context, key: &str, spec: LimitSpec) -> Result<()>;

    /// Stop background work. Safe to call more than once.
    async fn close(&self) {}
}
