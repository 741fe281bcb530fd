//! Per-verb operation context: a deadline plus a cooperative cancellation
//! flag, threaded into every outbound call.
//!
//! There are no exceptions to unwind through: drivers call `check` at
//! each suspension point and propagate `CANCELED` / `DEADLINE_EXCEEDED`
//! like any other error, so deferred cleanup can inspect the result and
//! choose between rollback and idempotent completion.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{KestrelError, KestrelResult};

/// Cancellable, deadline-carrying operation context. Cloning shares the
/// cancellation flag; child contexts may only tighten the deadline.
#[derive(Clone)]
pub struct OpCtx {
    canceled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl OpCtx {
    /// A context with no deadline, used by background jobs.
    pub fn background() -> Self {
        Self {
            canceled: Arc::new(AtomicBool::new(false)),
            deadline: None,
        }
    }

    /// A context expiring `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            canceled: Arc::new(AtomicBool::new(false)),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// Child context sharing this one's cancellation flag, expiring at the
    /// earlier of the parent deadline and `timeout` from now.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let child_deadline = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(d) => Some(d.min(child_deadline)),
            None => Some(child_deadline),
        };
        Self {
            canceled: Arc::clone(&self.canceled),
            deadline,
        }
    }

    /// Request cancellation. Takes effect at the next `check`.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    /// Time until the deadline; `None` means unbounded, zero means expired.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Fail fast if canceled or past the deadline. `op` names the step for
    /// the error message.
    pub fn check(&self, op: &str) -> KestrelResult<()> {
        if self.is_canceled() {
            return Err(KestrelError::Canceled(format!("{op}: operation canceled")));
        }
        if let Some(d) = self.deadline {
            if Instant::now() >= d {
                return Err(KestrelError::DeadlineExceeded(format!(
                    "{op}: deadline exceeded"
                )));
            }
        }
        Ok(())
    }

    /// Sleep for `d`, capped at the remaining deadline, waking early on
    /// cancellation. Returns the post-sleep `check` result.
    pub async fn sleep(&self, d: Duration, op: &str) -> KestrelResult<()> {
        let capped = match self.remaining() {
            Some(rem) => d.min(rem),
            None => d,
        };
        // Poll the cancel flag at a coarse interval; cutover waits tick in
        // seconds so 50ms wake latency is invisible.
        let step = Duration::from_millis(50);
        let end = Instant::now() + capped;
        while Instant::now() < end {
            if self.is_canceled() {
                break;
            }
            tokio::time::sleep(step.min(end.saturating_duration_since(Instant::now()))).await;
        }
        self.check(op)
    }
}

impl std::fmt::Debug for OpCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpCtx")
            .field("canceled", &self.is_canceled())
            .field("remaining", &self.remaining())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_background_never_expires() {
        let ctx = OpCtx::background();
        assert!(ctx.check("noop").is_ok());
        assert!(ctx.remaining().is_none());
    }

    #[test]
    fn test_cancel_trips_check() {
        let ctx = OpCtx::background();
        ctx.cancel();
        let err = ctx.check("stop source writes").unwrap_err();
        assert_eq!(err.code(), ErrorCode::Canceled);
        assert!(err.to_string().contains("stop source writes"));
    }

    #[test]
    fn test_deadline_trips_check() {
        let ctx = OpCtx::with_timeout(Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        let err = ctx.check("gather positions").unwrap_err();
        assert_eq!(err.code(), ErrorCode::DeadlineExceeded);
    }

    #[test]
    fn test_child_shares_cancellation() {
        let parent = OpCtx::with_timeout(Duration::from_secs(60));
        let child = parent.child_with_timeout(Duration::from_secs(5));
        parent.cancel();
        assert!(child.check("child step").is_err());
    }

    #[test]
    fn test_child_deadline_never_extends_parent() {
        let parent = OpCtx::with_timeout(Duration::from_millis(10));
        let child = parent.child_with_timeout(Duration::from_secs(60));
        let rem = child.remaining().unwrap();
        assert!(rem <= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_sleep_wakes_on_cancel() {
        let ctx = OpCtx::background();
        let ctx2 = ctx.clone();
        let handle = tokio::spawn(async move { ctx2.sleep(Duration::from_secs(30), "wait").await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        ctx.cancel();
        let res = handle.await.unwrap();
        assert_eq!(res.unwrap_err().code(), ErrorCode::Canceled);
    }
}
