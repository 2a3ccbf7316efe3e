//! Error types for quotagate.

use thiserror::Error;

/// Main error type for limiter operations.
#[derive(Error, Debug)]
pub enum LimiterError {
    /// The key identifying the quota scope was empty.
    #[error("rate limit key must not be empty")]
    KeyEmpty,

    /// Rate, burst or unit count was out of range.
    #[error("invalid limit: {0}")]
    InvalidLimit(String),

    /// The backend does not implement the operation.
    #[error("operation not supported: {0}")]
    NotSupported(&'static str),

    /// The caller's context was cancelled.
    #[error("context cancelled")]
    Cancelled,

    /// The caller's context deadline passed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// The shared store failed; surfaced verbatim.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The store procedure returned something other than `[allowed, remaining]`.
    #[error("malformed store reply: {0}")]
    Protocol(String),

    /// Configuration-related errors
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LimiterError {
    /// Whether this error came from the caller's context rather than the limiter.
    pub fn is_context(&self) -> bool {
        matches!(self, LimiterError::Cancelled | LimiterError::DeadlineExceeded)
    }
}

/// Errors raised by shared-store adapters.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store rejected or failed the command.
    #[error("store command failed: {0}")]
    Command(String),

    /// Optimistic updates kept losing the race.
    #[error("gave up after {attempts} conflicting update attempts")]
    Conflict { attempts: u32 },
}

/// Result type alias for limiter operations.
pub type Result<T> = std::result::Result<T, LimiterError>;

/// Result type alias for store adapters.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
