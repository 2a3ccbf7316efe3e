//! Request-scoped cancellation and deadlines.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::{LimiterError, Result};

/// Carries a caller's cancellation signal and optional deadline into limiter calls.
///
/// Clones share the same cancellation token.
#[derive(Debug, Clone, Default)]
pub struct Context {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: Some(deadline),
        }
    }

    /// A context cancelled together with `token`.
    pub fn with_cancellation(token: CancellationToken) -> Self {
        Self {
            cancel: token,
            deadline: None,
        }
    }

    /// Derive a context that also expires after `timeout`, keeping the earlier deadline.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        Self {
            cancel: self.cancel.child_token(),
            deadline: Some(match self.deadline {
                Some(existing) => existing.min(deadline),
                None => deadline,
            }),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The context error if it is already done, `None` otherwise.
    pub fn err(&self) -> Option<LimiterError> {
        if self.cancel.is_cancelled() {
            return Some(LimiterError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(LimiterError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> LimiterError {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => LimiterError::Cancelled,
                    _ = sleep_until(deadline) => LimiterError::DeadlineExceeded,
                }
            }
            None => {
                self.cancel.cancelled().await;
                LimiterError::Cancelled
            }
        }
    }

    /// Drive `fut` to completion unless the context finishes first.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            out = fut => Ok(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_background_never_done() {
        let ctx = Context::background();
        assert!(ctx.err().is_none());
        assert_eq!(ctx.run(async { 7 }).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_cancel_is_shared_by_clones() {
        let ctx = Context::background();
        let clone = ctx.clone();
        clone.cancel();
        assert!(matches!(ctx.err(), Some(LimiterError::Cancelled)));
        assert!(matches!(
            ctx.run(async { 1 }).await,
            Err(LimiterError::Cancelled)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_interrupts_future() {
        let ctx = Context::with_timeout(Duration::from_millis(50));
        let result = ctx
            .run(tokio::time::sleep(Duration::from_secs(10)))
            .await;
        assert!(matches!(result, Err(LimiterError::DeadlineExceeded)));
        assert!(matches!(ctx.err(), Some(LimiterError::DeadlineExceeded)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_child_keeps_earlier_deadline() {
        let parent = Context::with_timeout(Duration::from_millis(10));
        let child = parent.child_with_timeout(Duration::from_secs(5));
        assert_eq!(child.deadline(), parent.deadline());

        parent.cancel();
        assert!(matches!(child.err(), Some(LimiterError::Cancelled)));
    }
}
