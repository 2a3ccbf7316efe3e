//! Quotagate - token-bucket admission control
//!
//! This crate decides whether a unit of work for a given key may proceed under
//! a `{rate, burst}` policy. It ships two backends behind one [`Limiter`]
//! trait: an in-process token bucket cache, and a store-coordinated GCRA
//! limiter that stays consistent across any number of processes.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;

pub use config::{LimiterConfig, Mode};
pub use error::{LimiterError, Result, StoreError};
pub use ratelimit::{
    admit, admit_n, new_limiter, Context, DistributedLimiter, LimitSpec, Limiter,
    StandaloneLimiter,
};
