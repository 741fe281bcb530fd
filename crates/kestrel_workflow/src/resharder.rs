//! Resharder: plans the streams that fan source shards out into a new
//! shard set covering the same key space.

use kestrel_agent::types::{BinlogSource, CreateWorkflowRequest, Filter, FilterRule};
use kestrel_common::error::{KestrelError, KestrelResult};
use kestrel_common::keyrange::{ranges_cover_equal, KeyRange};
use kestrel_common::opctx::OpCtx;
use kestrel_common::types::{migration_id, TabletType, WorkflowOptions, WorkflowSubType, WorkflowType};

use crate::fanout::fanout;
use crate::fetcher::WorkflowFetcher;
use crate::Env;

/// Every stream of a reshard matches all tables.
const MATCH_ALL_TABLES: &str = "/.*";

#[derive(Debug, Clone)]
pub struct ReshardRequest {
    pub keyspace: String,
    pub workflow: String,
    pub source_shards: Vec<String>,
    pub target_shards: Vec<String>,
    pub cells: Vec<String>,
    pub tablet_types: Vec<TabletType>,
    pub skip_schema_copy: bool,
    pub auto_start: bool,
    pub stop_after_copy: bool,
}

/// A validated reshard plan.
pub struct Resharder {
    env: Env,
    pub req: ReshardRequest,
    source_ranges: Vec<(String, KeyRange)>,
    target_ranges: Vec<(String, KeyRange)>,
}

impl std::fmt::Debug for Resharder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resharder")
            .field("req", &self.req)
            .field("source_ranges", &self.source_ranges)
            .field("target_ranges", &self.target_ranges)
            .finish()
    }
}

impl Resharder {
    pub async fn prepare(env: Env, req: ReshardRequest, ctx: &OpCtx) -> KestrelResult<Self> {
        if req.source_shards.is_empty() || req.target_shards.is_empty() {
            return Err(KestrelError::InvalidArgument(
                "reshard needs both source and target shards".into(),
            ));
        }
        for s in &req.source_shards {
            if req.target_shards.contains(s) {
                return Err(KestrelError::InvalidArgument(format!(
                    "shard {s} appears in both source and target sets"
                )));
            }
        }

        let mut source_ranges = Vec::new();
        for s in &req.source_shards {
            let record = env.topo.get_shard(&req.keyspace, s).await?.value;
            source_ranges.push((s.clone(), record.key_range));
        }
        let mut target_ranges = Vec::new();
        for s in &req.target_shards {
            let record = env.topo.get_shard(&req.keyspace, s).await?.value;
            target_ranges.push((s.clone(), record.key_range));
        }

        let src: Vec<KeyRange> = source_ranges.iter().map(|(_, r)| r.clone()).collect();
        let dst: Vec<KeyRange> = target_ranges.iter().map(|(_, r)| r.clone()).collect();
        if !ranges_cover_equal(&src, &dst) {
            return Err(KestrelError::InvalidArgument(format!(
                "source shards [{}] and target shards [{}] do not cover the same key range",
                req.source_shards.join(","),
                req.target_shards.join(",")
            )));
        }

        // Refuse to stack a second workflow of the same name.
        let fetcher = WorkflowFetcher::new(env.clone());
        if fetcher.exists(ctx, &req.keyspace, &req.workflow).await? {
            return Err(KestrelError::AlreadyExists(format!(
                "workflow {} already exists in keyspace {}",
                req.workflow, req.keyspace
            )));
        }

        Ok(Self {
            env,
            req,
            source_ranges,
            target_ranges,
        })
    }

    /// Deterministic id of the eventual cutover of this reshard.
    pub fn migration_id(&self) -> u64 {
        migration_id(&self.req.keyspace, &self.req.target_shards)
    }

    /// Copy the full schema from the first source shard onto every target
    /// primary.
    pub async fn copy_schema(&self, ctx: &OpCtx) -> KestrelResult<()> {
        if self.req.skip_schema_copy {
            return Ok(());
        }
        let source = self
            .env
            .agents
            .agent_for(&self.req.keyspace, &self.req.source_shards[0])?;
        let ddls = std::sync::Arc::new(source.get_schema(&[]).await?);

        let targets: Vec<_> = self
            .req
            .target_shards
            .iter()
            .map(|s| {
                Ok((
                    s.clone(),
                    self.env.agents.agent_for(&self.req.keyspace, s)?,
                ))
            })
            .collect::<KestrelResult<_>>()?;
        let dl = std::sync::Arc::clone(&ddls);
        fanout(
            ctx,
            "copy schema to target shards",
            self.env.config.fanout_concurrency,
            targets,
            move |agent| {
                let ddls = std::sync::Arc::clone(&dl);
                async move {
                    for ddl in ddls.iter() {
                        agent.apply_schema(ddl).await?;
                    }
                    Ok(())
                }
            },
        )
        .await?;
        Ok(())
    }

    /// Create one stream per (target shard, intersecting source shard).
    pub async fn create_streams(&self, ctx: &OpCtx) -> KestrelResult<()> {
        for (target_shard, target_range) in &self.target_ranges {
            ctx.check("create reshard streams")?;
            let sources: Vec<BinlogSource> = self
                .source_ranges
                .iter()
                .filter(|(_, source_range)| source_range.intersects(target_range))
                .map(|(source_shard, source_range)| BinlogSource {
                    keyspace: self.req.keyspace.clone(),
                    shard: source_shard.clone(),
                    filter: Filter {
                        rules: vec![FilterRule {
                            match_table: MATCH_ALL_TABLES.to_string(),
                            expression: String::new(),
                            key_range: if source_range == target_range {
                                None
                            } else {
                                Some(target_range.clone())
                            },
                        }],
                    },
                    stop_after_copy: self.req.stop_after_copy,
                })
                .collect();

            let agent = self.env.agents.agent_for(&self.req.keyspace, target_shard)?;
            agent
                .create_workflow(&CreateWorkflowRequest {
                    workflow: self.req.workflow.clone(),
                    workflow_type: WorkflowType::Reshard,
                    workflow_sub_type: WorkflowSubType::None,
                    binlog_sources: sources,
                    cells: self.req.cells.clone(),
                    tablet_types: self.req.tablet_types.clone(),
                    auto_start: false,
                    stop_after_copy: self.req.stop_after_copy,
                    options: WorkflowOptions::default(),
                })
                .await
                .map_err(|e| {
                    e.wrap(format!(
                        "create reshard streams on {}/{target_shard}",
                        self.req.keyspace
                    ))
                })?;
        }
        Ok(())
    }

    pub async fn start_streams(&self, ctx: &OpCtx) -> KestrelResult<()> {
        for shard in &self.req.target_shards {
            ctx.check("start reshard streams")?;
            let agent = self.env.agents.agent_for(&self.req.keyspace, shard)?;
            agent
                .update_workflow(&kestrel_agent::types::UpdateWorkflowRequest {
                    workflow: self.req.workflow.clone(),
                    state: Some(kestrel_agent::types::StreamState::Running),
                    ..Default::default()
                })
                .await
                .map_err(|e| e.wrap(format!("start reshard streams on {shard}")))?;
        }
        Ok(())
    }

    /// Remove every stream this plan created.
    pub async fn drop_streams(&self) -> KestrelResult<()> {
        for shard in &self.req.target_shards {
            let agent = self.env.agents.agent_for(&self.req.keyspace, shard)?;
            agent
                .delete_workflow(&self.req.workflow)
                .await
                .map_err(|e| e.wrap(format!("drop reshard streams on {shard}")))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_agent::{FakeAgent, ShardAgent, StaticAgentResolver};
    use kestrel_common::OrchestratorConfig;
    use kestrel_topo::{MemoryTopoStore, ShardRecord};
    use std::sync::Arc;

    async fn env(shards: &[&str]) -> (Env, Vec<Arc<FakeAgent>>) {
        let topo = Arc::new(MemoryTopoStore::new());
        let resolver = Arc::new(StaticAgentResolver::new());
        let mut agents = Vec::new();
        for s in shards {
            topo.add_shard(ShardRecord::new("ks1", s).unwrap()).unwrap();
            let a = Arc::new(FakeAgent::new("ks1", s));
            resolver.register("ks1", s, Arc::clone(&a) as Arc<dyn ShardAgent>);
            agents.push(a);
        }
        (Env::new(topo, resolver, OrchestratorConfig::default()), agents)
    }

    fn req() -> ReshardRequest {
        ReshardRequest {
            keyspace: "ks1".into(),
            workflow: "split".into(),
            source_shards: vec!["0".into()],
            target_shards: vec!["-80".into(), "80-".into()],
            cells: vec![],
            tablet_types: vec![],
            skip_schema_copy: false,
            auto_start: true,
            stop_after_copy: false,
        }
    }

    #[tokio::test]
    async fn test_prepare_rejects_uncovered_ranges() {
        let (env, _) = env(&["0", "-80", "80-"]).await;
        let mut bad = req();
        bad.target_shards = vec!["-80".into()];
        let err = Resharder::prepare(env, bad, &OpCtx::background())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("same key range"));
    }

    #[tokio::test]
    async fn test_prepare_rejects_overlapping_sets() {
        let (env, _) = env(&["0", "-80", "80-"]).await;
        let mut bad = req();
        bad.source_shards = vec!["-80".into(), "80-".into()];
        bad.target_shards = vec!["-80".into()];
        let err = Resharder::prepare(env, bad, &OpCtx::background())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("both source and target"));
    }

    #[tokio::test]
    async fn test_streams_fan_out_with_target_ranges() {
        let (env, agents) = env(&["0", "-80", "80-"]).await;
        let ctx = OpCtx::background();
        let plan = Resharder::prepare(env, req(), &ctx).await.unwrap();
        plan.create_streams(&ctx).await.unwrap();

        // agents[1] serves -80, agents[2] serves 80-.
        for (idx, shard) in [(1usize, "-80"), (2, "80-")] {
            let rows = agents[idx].streams();
            assert_eq!(rows.len(), 1, "shard {shard}");
            let source = &rows[0].binlog_source;
            assert_eq!(source.shard, "0");
            assert_eq!(
                source.filter.rules[0].key_range,
                Some(KeyRange::parse(shard).unwrap())
            );
        }
    }

    #[tokio::test]
    async fn test_schema_copied_from_source() {
        let (env, agents) = env(&["0", "-80", "80-"]).await;
        agents[0].set_schema("t", "create table t (id bigint primary key)");
        let ctx = OpCtx::background();
        let plan = Resharder::prepare(env, req(), &ctx).await.unwrap();
        plan.copy_schema(&ctx).await.unwrap();
        assert_eq!(agents[1].applied_ddls().len(), 1);
        assert_eq!(agents[2].applied_ddls().len(), 1);
    }

    #[tokio::test]
    async fn test_migration_id_is_stable() {
        let (env, _) = env(&["0", "-80", "80-"]).await;
        let ctx = OpCtx::background();
        let a = Resharder::prepare(env.clone(), req(), &ctx).await.unwrap();
        assert_eq!(
            a.migration_id(),
            migration_id("ks1", &["80-".to_string(), "-80".to_string()])
        );
    }
}
