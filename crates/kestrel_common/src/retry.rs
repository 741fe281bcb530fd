//! Exponential-backoff retry for narrow sub-steps.
//!
//! Only transient failures are retried; precondition and argument errors
//! surface immediately. The context deadline wins over the attempt count.

use std::future::Future;
use std::time::Duration;

use crate::error::{KestrelError, KestrelResult};
use crate::opctx::OpCtx;

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Run `f` up to `attempts` times, doubling the backoff between tries.
/// `what` names the step for logs and error context.
pub async fn retry_on_error<T, F, Fut>(
    ctx: &OpCtx,
    what: &str,
    attempts: u32,
    mut f: F,
) -> KestrelResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = KestrelResult<T>>,
{
    let attempts = attempts.max(1);
    let mut backoff = INITIAL_BACKOFF;
    let mut last_err: Option<KestrelError> = None;

    for attempt in 0..attempts {
        ctx.check(what)?;
        if attempt > 0 {
            ctx.sleep(backoff, what).await?;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                tracing::warn!(
                    step = what,
                    attempt = attempt + 1,
                    attempts,
                    error = %e,
                    "retryable failure, backing off"
                );
                last_err = Some(e);
            }
            Err(e) => return Err(e.wrap(what)),
        }
    }

    Err(last_err
        .unwrap_or_else(|| KestrelError::Internal("retry loop exited without error".into()))
        .wrap(what))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use crate::error::ErrorCode;

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let ctx = OpCtx::background();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = Arc::clone(&calls);
        let out = retry_on_error(&ctx, "refresh", 5, move || {
            let calls = Arc::clone(&calls2);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(KestrelError::Unavailable("agent restarting".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_precondition_not_retried() {
        let ctx = OpCtx::background();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = Arc::clone(&calls);
        let err = retry_on_error(&ctx, "validate", 5, move || {
            let calls = Arc::clone(&calls2);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(KestrelError::FailedPrecondition("workflow is frozen".into()))
            }
        })
        .await
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::FailedPrecondition);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_surface_last_error() {
        let ctx = OpCtx::background();
        let err = retry_on_error(&ctx, "fan-out", 2, || async {
            Err::<(), _>(KestrelError::Unavailable("still down".into()))
        })
        .await
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Unavailable);
        assert!(err.to_string().contains("fan-out"));
    }

    #[tokio::test]
    async fn test_canceled_context_stops_retries() {
        let ctx = OpCtx::background();
        ctx.cancel();
        let err = retry_on_error(&ctx, "anything", 3, || async { Ok::<_, KestrelError>(1) })
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Canceled);
    }
}
