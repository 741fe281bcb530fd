//! Copy-progress reporter: per-table row and byte counts from both sides
//! of a workflow, aggregated across shards.

use std::collections::BTreeMap;
use std::sync::Arc;

use kestrel_common::error::KestrelResult;
use kestrel_common::opctx::OpCtx;
use kestrel_common::types::WorkflowType;

use crate::fanout::fanout;
use crate::workflow::Workflow;
use crate::Env;

/// Progress of one table's copy.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TableCopyProgress {
    pub source_rows: u64,
    pub target_rows: u64,
    pub source_bytes: u64,
    pub target_bytes: u64,
    /// `100.0 * target_rows / source_rows`, 0 when the source is empty.
    /// Computed in f64, narrowed to f32 for transport.
    pub pct: f32,
}

/// Per-table progress, keyed by table name.
pub type CopyProgress = BTreeMap<String, TableCopyProgress>;

/// Aggregate copy progress for `workflow`, or `None` for workflow kinds
/// whose source primaries may be unreachable (Migrate).
pub async fn get_copy_progress(
    env: &Env,
    ctx: &OpCtx,
    workflow: &Workflow,
) -> KestrelResult<Option<CopyProgress>> {
    if workflow.workflow_type == Some(WorkflowType::Migrate) {
        return Ok(None);
    }

    // Tables still being copied anywhere, from the copy-state metadata.
    let mut tables: Vec<String> = workflow
        .streams
        .iter()
        .flat_map(|s| s.copy_states.iter().map(|c| c.table.clone()))
        .collect();
    tables.sort();
    tables.dedup();
    if tables.is_empty() {
        return Ok(Some(CopyProgress::new()));
    }

    let Some(source_keyspace) = workflow.source_keyspace.clone() else {
        return Ok(Some(CopyProgress::new()));
    };

    let target_agents: Vec<_> = workflow
        .target_shards()
        .into_iter()
        .map(|shard| {
            Ok((
                shard.clone(),
                env.agents.agent_for(&workflow.target_keyspace, &shard)?,
            ))
        })
        .collect::<KestrelResult<_>>()?;
    let source_agents: Vec<_> = workflow
        .source_shards()
        .into_iter()
        .map(|shard| Ok((shard.clone(), env.agents.agent_for(&source_keyspace, &shard)?)))
        .collect::<KestrelResult<_>>()?;

    let tables = Arc::new(tables);
    let t1 = Arc::clone(&tables);
    let target_stats = fanout(
        ctx,
        "target table stats",
        env.config.fanout_concurrency,
        target_agents,
        move |agent| {
            let tables = Arc::clone(&t1);
            async move { agent.table_stats(&tables).await }
        },
    )
    .await?;
    let t2 = Arc::clone(&tables);
    let source_stats = fanout(
        ctx,
        "source table stats",
        env.config.fanout_concurrency,
        source_agents,
        move |agent| {
            let tables = Arc::clone(&t2);
            async move { agent.table_stats(&tables).await }
        },
    )
    .await?;

    let mut progress = CopyProgress::new();
    for table in tables.iter() {
        let mut p = TableCopyProgress::default();
        for (_, stats) in &source_stats {
            if let Some(s) = stats.get(table) {
                p.source_rows += s.rows;
                p.source_bytes += s.bytes;
            }
        }
        for (_, stats) in &target_stats {
            if let Some(s) = stats.get(table) {
                p.target_rows += s.rows;
                p.target_bytes += s.bytes;
            }
        }
        p.pct = if p.source_rows == 0 {
            0.0
        } else {
            (100.0_f64 * p.target_rows as f64 / p.source_rows as f64) as f32
        };
        progress.insert(table.clone(), p);
    }
    Ok(Some(progress))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::WorkflowStream;
    use kestrel_agent::types::{BinlogSource, CopyStateRow, StreamRow, TableStats};
    use kestrel_agent::{FakeAgent, ShardAgent, StaticAgentResolver};
    use kestrel_common::types::{WorkflowOptions, WorkflowSubType};
    use kestrel_common::OrchestratorConfig;
    use kestrel_topo::MemoryTopoStore;

    fn test_workflow(workflow_type: WorkflowType, copying: &[&str]) -> Workflow {
        Workflow {
            name: "wf".into(),
            target_keyspace: "ks2".into(),
            source_keyspace: Some("ks1".into()),
            workflow_type: Some(workflow_type),
            sub_type: WorkflowSubType::None,
            options: WorkflowOptions::default(),
            streams: vec![WorkflowStream {
                shard: "0".into(),
                row: StreamRow {
                    id: 1,
                    workflow: "wf".into(),
                    binlog_source: BinlogSource {
                        keyspace: "ks1".into(),
                        shard: "0".into(),
                        ..Default::default()
                    },
                    ..Default::default()
                },
                copy_states: copying
                    .iter()
                    .map(|t| CopyStateRow {
                        table: t.to_string(),
                        last_pk: "1".into(),
                    })
                    .collect(),
                throttled: false,
            }],
            max_v_replication_lag: 0,
        }
    }

    fn env_with_agents() -> (Env, Arc<FakeAgent>, Arc<FakeAgent>) {
        let topo = Arc::new(MemoryTopoStore::new());
        let resolver = Arc::new(StaticAgentResolver::new());
        let source = Arc::new(FakeAgent::new("ks1", "0"));
        let target = Arc::new(FakeAgent::new("ks2", "0"));
        resolver.register("ks1", "0", Arc::clone(&source) as Arc<dyn ShardAgent>);
        resolver.register("ks2", "0", Arc::clone(&target) as Arc<dyn ShardAgent>);
        (
            Env::new(topo, resolver, OrchestratorConfig::default()),
            source,
            target,
        )
    }

    #[tokio::test]
    async fn test_progress_pct_and_sums() {
        let (env, source, target) = env_with_agents();
        source.set_table_stats("t", TableStats { rows: 1000, bytes: 4096 });
        target.set_table_stats("t", TableStats { rows: 250, bytes: 1024 });

        let wf = test_workflow(WorkflowType::MoveTables, &["t"]);
        let progress = get_copy_progress(&env, &OpCtx::background(), &wf)
            .await
            .unwrap()
            .unwrap();
        let p = progress["t"];
        assert_eq!(p.source_rows, 1000);
        assert_eq!(p.target_rows, 250);
        assert!((p.pct - 25.0).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn test_progress_zero_when_source_empty() {
        let (env, source, target) = env_with_agents();
        source.set_table_stats("t", TableStats { rows: 0, bytes: 0 });
        target.set_table_stats("t", TableStats { rows: 0, bytes: 0 });
        let wf = test_workflow(WorkflowType::MoveTables, &["t"]);
        let progress = get_copy_progress(&env, &OpCtx::background(), &wf)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(progress["t"].pct, 0.0);
    }

    #[tokio::test]
    async fn test_migrate_workflows_report_no_progress() {
        let (env, _, _) = env_with_agents();
        let wf = test_workflow(WorkflowType::Migrate, &["t"]);
        assert!(get_copy_progress(&env, &OpCtx::background(), &wf)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_no_copying_tables_is_empty_progress() {
        let (env, _, _) = env_with_agents();
        let wf = test_workflow(WorkflowType::MoveTables, &[]);
        let progress = get_copy_progress(&env, &OpCtx::background(), &wf)
            .await
            .unwrap()
            .unwrap();
        assert!(progress.is_empty());
    }
}
