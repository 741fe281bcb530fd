//! Workflow fetcher: fans out per-shard stream reads and aggregates the
//! rows into logical workflows.
//!
//! Fetching is read-only and idempotent: two back-to-back fetches with no
//! intervening mutation return equal results. Partial shard failures
//! abort the whole fetch with an error naming the offending shards.

use std::collections::BTreeMap;
use std::sync::Arc;

use kestrel_agent::types::{ReadWorkflowsRequest, StreamRow};
use kestrel_agent::ShardAgent;
use kestrel_common::error::{KestrelError, KestrelResult};
use kestrel_common::opctx::OpCtx;
use kestrel_common::types::now_unix_secs;

use crate::fanout::fanout;
use crate::workflow::{Workflow, WorkflowStream};
use crate::Env;

/// Parameters of a fetch.
#[derive(Debug, Clone, Default)]
pub struct FetchRequest {
    pub keyspace: String,
    /// Restrict to one workflow.
    pub workflow: Option<String>,
    /// Restrict to these target shards; empty = all.
    pub shards: Vec<String>,
    pub include_logs: bool,
}

pub struct WorkflowFetcher {
    env: Env,
}

impl WorkflowFetcher {
    pub fn new(env: Env) -> Self {
        Self { env }
    }

    /// Resolve the target shards of `keyspace` with their primary agents.
    pub(crate) async fn shard_agents(
        &self,
        keyspace: &str,
        filter: &[String],
    ) -> KestrelResult<Vec<(String, Arc<dyn ShardAgent>)>> {
        let mut names = self.env.topo.get_shard_names(keyspace).await?;
        if !filter.is_empty() {
            for wanted in filter {
                if !names.contains(wanted) {
                    return Err(KestrelError::NotFound(format!(
                        "shard {keyspace}/{wanted} not found"
                    )));
                }
            }
            names.retain(|n| filter.contains(n));
        }
        if names.is_empty() {
            return Err(KestrelError::NotFound(format!(
                "keyspace {keyspace} has no shards"
            )));
        }
        names
            .into_iter()
            .map(|shard| {
                let agent = self.env.agents.agent_for(keyspace, &shard)?;
                Ok((shard, agent))
            })
            .collect()
    }

    /// Fetch all matching workflows in `keyspace`.
    pub async fn fetch(&self, ctx: &OpCtx, req: &FetchRequest) -> KestrelResult<Vec<Workflow>> {
        let shards = self.shard_agents(&req.keyspace, &req.shards).await?;
        let keyspace = req.keyspace.clone();

        let read_req = Arc::new(ReadWorkflowsRequest {
            workflows: req.workflow.iter().cloned().collect(),
            include_logs: req.include_logs,
            exclude_frozen: false,
        });

        let targets: Vec<(String, Arc<dyn ShardAgent>)> = shards
            .iter()
            .map(|(shard, agent)| (shard.clone(), Arc::clone(agent)))
            .collect();
        let rr = Arc::clone(&read_req);
        let rows = fanout(ctx, "read workflows", self.env.config.fanout_concurrency, targets, {
            move |agent| {
                let rr = Arc::clone(&rr);
                async move { agent.read_workflows(&rr).await }
            }
        })
        .await
        .map_err(|e| e.wrap(format!("fetch workflows in {keyspace}")))?;

        // Group rows by (workflow, shard); remember each shard's stream ids
        // for the copy-state batch.
        let mut by_workflow: BTreeMap<String, BTreeMap<String, Vec<StreamRow>>> = BTreeMap::new();
        let mut ids_by_shard: BTreeMap<String, Vec<u64>> = BTreeMap::new();
        for (shard_key, shard_rows) in rows {
            for row in shard_rows {
                ids_by_shard
                    .entry(shard_key.clone())
                    .or_default()
                    .push(row.id);
                by_workflow
                    .entry(row.workflow.clone())
                    .or_default()
                    .entry(shard_key.clone())
                    .or_default()
                    .push(row);
            }
        }

        // Second fan-out: copy-state rows, batched per shard.
        let copy_targets: Vec<(String, Arc<dyn ShardAgent>)> = shards
            .iter()
            .filter(|(shard, _)| ids_by_shard.contains_key(shard.as_str()))
            .map(|(shard, agent)| (shard.clone(), Arc::clone(agent)))
            .collect();
        let ids = Arc::new(ids_by_shard);
        let ids2 = Arc::clone(&ids);
        let copy_states = fanout(
            ctx,
            "read copy state",
            self.env.config.fanout_concurrency,
            copy_targets,
            move |agent| {
                let ids = Arc::clone(&ids2);
                async move {
                    let key = agent
                        .shard_key()
                        .split_once('/')
                        .map(|(_, s)| s.to_string())
                        .unwrap_or_default();
                    let stream_ids = ids.get(&key).cloned().unwrap_or_default();
                    agent.copy_state(&stream_ids).await
                }
            },
        )
        .await
        .map_err(|e| e.wrap(format!("fetch copy state in {}", req.keyspace)))?;
        let copy_by_shard: BTreeMap<String, _> = copy_states.into_iter().collect();

        let now = now_unix_secs();
        // One consistent throttle window per fetch.
        let throttle_window = self.env.config.throttle_window_secs;

        let mut workflows: Vec<Workflow> = Vec::with_capacity(by_workflow.len());
        for (name, shards_map) in by_workflow {
            let mut streams: Vec<WorkflowStream> = Vec::new();
            for (shard, mut rows) in shards_map {
                rows.sort_by_key(|r| r.id);
                for row in rows {
                    let copy_states = copy_by_shard
                        .get(&shard)
                        .and_then(|m| m.get(&row.id))
                        .cloned()
                        .unwrap_or_default();
                    let throttled = row.is_throttled(now, throttle_window);
                    streams.push(WorkflowStream {
                        shard: shard.clone(),
                        row,
                        copy_states,
                        throttled,
                    });
                }
            }
            let max_v_replication_lag = streams
                .iter()
                .map(|s| now.saturating_sub(s.row.transaction_timestamp))
                .max()
                .unwrap_or(0);
            let first = &streams[0].row;
            workflows.push(Workflow {
                name,
                target_keyspace: req.keyspace.clone(),
                source_keyspace: Some(first.binlog_source.keyspace.clone()),
                workflow_type: first.workflow_type,
                sub_type: first.workflow_sub_type,
                options: first.options.clone(),
                streams,
                max_v_replication_lag,
            });
        }
        // Deterministic result order.
        workflows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(workflows)
    }

    /// Fetch exactly one workflow or fail with NOT_FOUND.
    pub async fn fetch_one(
        &self,
        ctx: &OpCtx,
        keyspace: &str,
        workflow: &str,
    ) -> KestrelResult<Workflow> {
        let mut found = self
            .fetch(
                ctx,
                &FetchRequest {
                    keyspace: keyspace.to_string(),
                    workflow: Some(workflow.to_string()),
                    shards: vec![],
                    include_logs: false,
                },
            )
            .await?;
        match found.pop() {
            Some(wf) if wf.name == workflow => Ok(wf),
            _ => Err(KestrelError::NotFound(format!(
                "workflow {workflow} not found in keyspace {keyspace}"
            ))),
        }
    }

    /// Whether the workflow exists at all.
    pub async fn exists(
        &self,
        ctx: &OpCtx,
        keyspace: &str,
        workflow: &str,
    ) -> KestrelResult<bool> {
        match self.fetch_one(ctx, keyspace, workflow).await {
            Ok(_) => Ok(true),
            Err(e) if e.code() == kestrel_common::error::ErrorCode::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_agent::types::{
        BinlogSource, CopyStateRow, CreateWorkflowRequest, Filter, FilterRule,
    };
    use kestrel_agent::{FakeAgent, ShardAgent, StaticAgentResolver};
    use kestrel_common::error::ErrorCode;
    use kestrel_common::types::{WorkflowOptions, WorkflowSubType, WorkflowType};
    use kestrel_common::OrchestratorConfig;
    use kestrel_topo::{MemoryTopoStore, ShardRecord};

    struct Fixture {
        env: Env,
        agents: Vec<Arc<FakeAgent>>,
    }

    async fn fixture(target_shards: &[&str]) -> Fixture {
        let topo = Arc::new(MemoryTopoStore::new());
        let resolver = Arc::new(StaticAgentResolver::new());
        let mut agents = Vec::new();
        for shard in target_shards {
            topo.add_shard(ShardRecord::new("ks2", shard).unwrap()).unwrap();
            let agent = Arc::new(FakeAgent::new("ks2", shard));
            resolver.register("ks2", shard, Arc::clone(&agent) as Arc<dyn ShardAgent>);
            agents.push(agent);
        }
        Fixture {
            env: Env::new(topo, resolver, OrchestratorConfig::default()),
            agents,
        }
    }

    fn create_req(workflow: &str, source_shard: &str) -> CreateWorkflowRequest {
        CreateWorkflowRequest {
            workflow: workflow.into(),
            workflow_type: WorkflowType::MoveTables,
            workflow_sub_type: WorkflowSubType::None,
            binlog_sources: vec![BinlogSource {
                keyspace: "ks1".into(),
                shard: source_shard.into(),
                filter: Filter {
                    rules: vec![FilterRule {
                        match_table: "t".into(),
                        ..Default::default()
                    }],
                },
                stop_after_copy: false,
            }],
            cells: vec![],
            tablet_types: vec![],
            auto_start: true,
            stop_after_copy: false,
            options: WorkflowOptions::default(),
        }
    }

    #[tokio::test]
    async fn test_fetch_aggregates_across_shards() {
        let fx = fixture(&["-80", "80-"]).await;
        for agent in &fx.agents {
            agent.create_workflow(&create_req("wf", "0")).await.unwrap();
        }
        let fetcher = WorkflowFetcher::new(fx.env.clone());
        let ctx = OpCtx::background();
        let wfs = fetcher
            .fetch(&ctx, &FetchRequest {
                keyspace: "ks2".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(wfs.len(), 1);
        let wf = &wfs[0];
        assert_eq!(wf.name, "wf");
        assert_eq!(wf.source_keyspace.as_deref(), Some("ks1"));
        assert_eq!(wf.target_shards(), vec!["-80", "80-"]);
    }

    #[tokio::test]
    async fn test_fetch_joins_copy_state() {
        let fx = fixture(&["0"]).await;
        let ids = fx.agents[0].create_workflow(&create_req("wf", "0")).await.unwrap();
        fx.agents[0].set_copy_state(
            ids[0],
            vec![CopyStateRow {
                table: "t".into(),
                last_pk: "42".into(),
            }],
        );
        let fetcher = WorkflowFetcher::new(fx.env.clone());
        let wf = fetcher
            .fetch_one(&OpCtx::background(), "ks2", "wf")
            .await
            .unwrap();
        assert!(wf.is_copying());
        assert_eq!(wf.streams[0].copy_states[0].last_pk, "42");
    }

    #[tokio::test]
    async fn test_fetch_is_idempotent() {
        let fx = fixture(&["-80", "80-"]).await;
        for agent in &fx.agents {
            agent.create_workflow(&create_req("wf", "0")).await.unwrap();
        }
        let fetcher = WorkflowFetcher::new(fx.env.clone());
        let ctx = OpCtx::background();
        let req = FetchRequest {
            keyspace: "ks2".into(),
            ..Default::default()
        };
        let a = fetcher.fetch(&ctx, &req).await.unwrap();
        let b = fetcher.fetch(&ctx, &req).await.unwrap();
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.name, y.name);
            assert_eq!(x.target_shards(), y.target_shards());
            assert_eq!(
                x.streams.iter().map(|s| s.row.id).collect::<Vec<_>>(),
                y.streams.iter().map(|s| s.row.id).collect::<Vec<_>>()
            );
        }
    }

    #[tokio::test]
    async fn test_partial_shard_failure_aborts_with_shard_name() {
        let fx = fixture(&["-80", "80-"]).await;
        for agent in &fx.agents {
            agent.create_workflow(&create_req("wf", "0")).await.unwrap();
        }
        fx.agents[1].faults.kill();
        let fetcher = WorkflowFetcher::new(fx.env.clone());
        let err = fetcher
            .fetch(&OpCtx::background(), &FetchRequest {
                keyspace: "ks2".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Unavailable);
        assert!(err.to_string().contains("80-"));
    }

    #[tokio::test]
    async fn test_fetch_one_not_found() {
        let fx = fixture(&["0"]).await;
        let fetcher = WorkflowFetcher::new(fx.env.clone());
        let err = fetcher
            .fetch_one(&OpCtx::background(), "ks2", "ghost")
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
        assert!(!fetcher
            .exists(&OpCtx::background(), "ks2", "ghost")
            .await
            .unwrap());
    }
}
