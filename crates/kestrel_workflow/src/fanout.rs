//! Bounded parallel fan-out to shard agents.
//!
//! All shards run concurrently under a width cap; results come back
//! sorted by shard key. Any shard failure fails the whole fan-out with a
//! combined error naming each offending shard; no partial results.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use kestrel_agent::ShardAgent;
use kestrel_common::error::{ErrorRecorder, KestrelError, KestrelResult};
use kestrel_common::opctx::OpCtx;

/// Run `f` against every `(shard_key, agent)` pair with at most
/// `concurrency` in flight. Returns `(shard_key, value)` pairs sorted by
/// shard key.
pub async fn fanout<T, F, Fut>(
    ctx: &OpCtx,
    what: &str,
    concurrency: usize,
    targets: Vec<(String, Arc<dyn ShardAgent>)>,
    f: F,
) -> KestrelResult<Vec<(String, T)>>
where
    T: Send + 'static,
    F: Fn(Arc<dyn ShardAgent>) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = KestrelResult<T>> + Send + 'static,
{
    ctx.check(what)?;
    let sem = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut set: JoinSet<(String, KestrelResult<T>)> = JoinSet::new();

    for (key, agent) in targets {
        let sem = Arc::clone(&sem);
        let f = f.clone();
        let ctx = ctx.clone();
        let what = what.to_string();
        set.spawn(async move {
            let _permit = match sem.acquire_owned().await {
                Ok(p) => p,
                Err(_) => {
                    return (
                        key,
                        Err(KestrelError::Internal("fan-out semaphore closed".into())),
                    )
                }
            };
            if let Err(e) = ctx.check(&what) {
                return (key, Err(e));
            }
            let result = f(agent).await;
            (key, result)
        });
    }

    let mut ok: Vec<(String, T)> = Vec::new();
    let mut recorder = ErrorRecorder::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((key, Ok(value))) => ok.push((key, value)),
            Ok((key, Err(e))) => recorder.record(key, e),
            Err(join_err) => recorder.record(
                "<task>",
                KestrelError::Internal(format!("fan-out task panicked: {join_err}")),
            ),
        }
    }

    recorder.result().map_err(|e| e.wrap(what))?;
    ok.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(ok)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_agent::FakeAgent;
    use kestrel_common::error::ErrorCode;

    fn agents(shards: &[&str]) -> Vec<(String, Arc<dyn ShardAgent>)> {
        shards
            .iter()
            .map(|s| {
                (
                    format!("ks/{s}"),
                    Arc::new(FakeAgent::new("ks", s)) as Arc<dyn ShardAgent>,
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_fanout_collects_sorted_results() {
        let ctx = OpCtx::background();
        let out = fanout(&ctx, "read", 2, agents(&["80-", "-80"]), |agent| async move {
            Ok(agent.shard_key())
        })
        .await
        .unwrap();
        let keys: Vec<&str> = out.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["ks/-80", "ks/80-"]);
    }

    #[tokio::test]
    async fn test_fanout_fails_whole_call_naming_shards() {
        let ctx = OpCtx::background();
        let targets = agents(&["-80", "80-"]);
        let err = fanout(&ctx, "refresh", 4, targets, |agent| async move {
            if agent.shard_key() == "ks/80-" {
                Err(KestrelError::Unavailable("agent down".into()))
            } else {
                Ok(())
            }
        })
        .await
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Unavailable);
        assert!(err.to_string().contains("ks/80-"));
        assert!(err.to_string().contains("refresh"));
    }

    #[tokio::test]
    async fn test_fanout_respects_cancellation() {
        let ctx = OpCtx::background();
        ctx.cancel();
        let err = fanout(&ctx, "read", 2, agents(&["-80"]), |_| async { Ok(()) })
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Canceled);
    }
}
