//! Shared-store plumbing for the distributed limiter.
//!
//! The limiter never talks to a concrete database. It needs one of:
//!
//! - a [`ScheduleStore`], which runs the whole GCRA step as one indivisible
//!   server-side procedure (e.g. [`GCRA_SCRIPT`] loaded into a
//!   Redis-compatible server), or
//! - a [`VersionedStore`] wrapped in [`CasScheduleStore`], which emulates the
//!   procedure with optimistic compare-and-swap for stores without scripting.
//!
//! [`MemoryStore`] implements both in-process.

mod cas;
mod memory;

use std::fmt;

use async_trait::async_trait;

use crate::error::StoreResult;

pub use cas::{CasScheduleStore, VersionedStore, Versioned};
pub use memory::MemoryStore;

/// Lua source of the scheduling procedure for Redis-compatible stores.
///
/// `KEYS[1]` is the prefixed bucket key; `ARGV` is [`ScheduleArgs::to_script_args`].
/// Returns `{allowed, remaining}`.
///
/// It must stay step-for-step equal to [`crate::ratelimit::gcra::evaluate`]:
/// same tolerance ([`crate::ratelimit::gcra::SCHEDULE_EPSILON`]) and the
/// schedule stored at full `f64` precision, so native and scripted backends
/// agree on a shared key.
pub const GCRA_SCRIPT: &str = r#"
local key = KEYS[1]
local rate = tonumber(ARGV[1])
local burst = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local n = tonumber(ARGV[4])
local eps = 1e-9

local interval = 1 / rate
local fill_time = burst * interval

local last = tonumber(redis.call('GET', key))
if last == nil then
  last = now
end

local base = math.max(last, now)
local next_at = base + n * interval
local upper = now + fill_time

if next_at <= upper + eps then
  local ttl = math.max(1, math.ceil(fill_time * 2))
  redis.call('SET', key, string.format('%.17g', next_at), 'EX', ttl)
  return {1, math.floor((upper - next_at + eps) / interval)}
end

return {0, math.floor((upper - base + eps) / interval)}
"#;

/// Arguments of one scheduling call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduleArgs {
    /// Tokens per second
    pub rate: f64,
    /// Bucket capacity
    pub burst: u64,
    /// Caller's current time, fractional Unix seconds
    pub now: f64,
    /// Units requested
    pub n: u64,
}

impl ScheduleArgs {
    /// Encode as `ARGV` for [`GCRA_SCRIPT`].
    ///
    /// Floats use the shortest round-trip form, so the script sees exactly the
    /// values the native evaluator would.
    pub fn to_script_args(&self) -> [String; 4] {
        [
            self.rate.to_string(),
            self.burst.to_string(),
            self.now.to_string(),
            self.n.to_string(),
        ]
    }
}

/// A raw reply from a store procedure, before the limiter decodes it.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Nil,
    Int(i64),
    Bulk(String),
    Array(Vec<Reply>),
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Nil => write!(f, "nil"),
            Reply::Int(i) => write!(f, "{}", i),
            Reply::Bulk(s) => write!(f, "{:?}", s),
            Reply::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

/// A store able to run the scheduling procedure atomically.
///
/// Implementations must execute the read, the decision and the conditional
/// write for `key` without interleaving with any other call on that key, and
/// reply with `[allowed (0|1), remaining]`.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn schedule(&self, key: &str, args: &ScheduleArgs) -> StoreResult<Reply>;
}
