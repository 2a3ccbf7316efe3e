//! Admission policy values and input validation.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{LimiterError, Result};

/// One admission policy: `burst` tokens of capacity refilled at `rate` per second.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LimitSpec {
    /// Tokens added per second
    pub rate: f64,
    /// Bucket capacity
    pub burst: u64,
}

impl LimitSpec {
    pub const fn new(rate: f64, burst: u64) -> Self {
        Self { rate, burst }
    }

    /// Check `rate > 0` and `burst > 0`. Non-finite rates are rejected too.
    pub fn validate(&self) -> Result<()> {
        if !self.rate.is_finite() || self.rate <= 0.0 {
            return Err(LimiterError::InvalidLimit(format!(
                "rate must be positive, got {}",
                self.rate
            )));
        }
        if self.burst == 0 {
            return Err(LimiterError::InvalidLimit("burst must be positive".into()));
        }
        Ok(())
    }

    /// Seconds between two tokens.
    pub fn interval(&self) -> f64 {
        1.0 / self.rate
    }

    /// Seconds for an empty bucket to fill completely.
    pub fn fill_time(&self) -> f64 {
        self.burst as f64 * self.interval()
    }
}

impl fmt::Display for LimitSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/s burst {}", self.rate, self.burst)
    }
}

/// Validate the inputs shared by every limiter operation, in the order callers
/// see them reported: key first, then the spec, then the unit count.
pub(crate) fn validate_request(key: &str, spec: &LimitSpec, n: u64) -> Result<()> {
    if key.is_empty() {
        return Err(LimiterError::KeyEmpty);
    }
    spec.validate()?;
    if n == 0 {
        return Err(LimiterError::InvalidLimit("n must be positive".into()));
    }
    Ok(())
}
