//! Rate limiting logic and state management.

mod admission;
mod backend;
mod bucket;
mod clock;
mod context;
mod distributed;
mod factory;
pub mod gcra;
mod limiter;
mod spec;

pub use admission::{admit, admit_n};
pub use backend::Limiter;
pub use bucket::{Take, TokenBucket};
pub use clock::{Clock, ManualClock, SystemClock};
pub use context::Context;
pub use distributed::{decode_reply, Admission, DistributedLimiter};
pub use factory::new_limiter;
pub use limiter::{BucketKey, StandaloneLimiter};
pub use spec::LimitSpec;
