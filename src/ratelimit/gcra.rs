//! Virtual-scheduling (GCRA) evaluation shared by every store backend.
//!
//! A bucket is a single timestamp `scheduled_at`: the instant at which the
//! bucket would be empty given every grant made so far. Granting `n` units
//! pushes it forward by `n / rate`; a request is admitted while the pushed
//! schedule stays within one fill time of `now`.

use std::time::Duration;

use crate::store::ScheduleArgs;

/// Slack applied to boundary comparisons and floors, in seconds.
///
/// Without it, `k` separate increments of `1/rate` can land one ulp past
/// `now + burst/rate` and deny a request that exactly fits.
pub const SCHEDULE_EPSILON: f64 = 1e-9;

/// Outcome of evaluating one request against a stored schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub allowed: bool,
    /// Whole units still admissible after this request
    pub remaining: u64,
    /// New schedule to persist; `None` when denied
    pub next: Option<f64>,
    /// Expiry to attach to the persisted schedule
    pub ttl: Duration,
}

/// Evaluate a request against the stored schedule (`None` if absent or expired).
pub fn evaluate(stored: Option<f64>, args: &ScheduleArgs) -> Decision {
    let interval = 1.0 / args.rate;
    let fill_time = args.burst as f64 * interval;
    let now = args.now;

    let last = stored.unwrap_or(now);
    let base = last.max(now);
    let next = base + args.n as f64 * interval;
    let upper = now + fill_time;
    let ttl = Duration::from_secs((fill_time * 2.0).ceil().max(1.0) as u64);

    if next <= upper + SCHEDULE_EPSILON {
        Decision {
            allowed: true,
            remaining: whole_units(upper - next, interval),
            next: Some(next),
            ttl,
        }
    } else {
        Decision {
            allowed: false,
            remaining: whole_units(upper - base, interval),
            next: None,
            ttl,
        }
    }
}

fn whole_units(span: f64, interval: f64) -> u64 {
    ((span + SCHEDULE_EPSILON) / interval).floor().max(0.0) as u64
}
