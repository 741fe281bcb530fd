//! The cutover capability set, split into an executing implementation and
//! a recording one. A dry run drives the identical step sequence through
//! the recorder, so its output is exactly the plan the real run follows.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use kestrel_agent::types::{
    BinlogSource, CreateWorkflowRequest, Journal, ShardGtid, StreamState, UpdateWorkflowRequest,
    FROZEN_MESSAGE,
};
use kestrel_common::error::{KestrelError, KestrelResult};
use kestrel_common::opctx::OpCtx;
use kestrel_common::retry::retry_on_error;
use kestrel_common::types::{MigrationType, Position, TabletType};
use kestrel_common::KeyRange;
use kestrel_topo::routing::TrafficDirection;
use kestrel_topo::store::TopoStoreExt;

use crate::fanout::fanout;
use crate::stream_migrator::StreamMigrator;
use crate::traffic::TrafficSwitcher;

/// Everything a switch mutates, as one capability surface.
#[async_trait]
pub trait SwitchActions: Send + Sync {
    fn is_dry_run(&self) -> bool;
    /// Recorded step lines; empty for the executing implementation.
    fn log(&self) -> Vec<String>;

    async fn remove_mirror_rules(
        &self,
        ts: &TrafficSwitcher,
        tablet_types: &[TabletType],
    ) -> KestrelResult<()>;

    async fn switch_table_reads(
        &self,
        ts: &TrafficSwitcher,
        cells: &[String],
        tablet_types: &[TabletType],
        direction: TrafficDirection,
    ) -> KestrelResult<()>;

    async fn switch_keyspace_reads(
        &self,
        ts: &TrafficSwitcher,
        tablet_types: &[TabletType],
        direction: TrafficDirection,
    ) -> KestrelResult<()>;

    async fn switch_shard_reads(
        &self,
        ts: &TrafficSwitcher,
        cells: &[String],
        tablet_types: &[TabletType],
        direction: TrafficDirection,
    ) -> KestrelResult<()>;

    async fn stop_source_writes(&self, ts: &TrafficSwitcher) -> KestrelResult<()>;
    async fn undo_stop_source_writes(&self, ts: &TrafficSwitcher) -> KestrelResult<()>;
    async fn lock_source_tables(&self, ts: &TrafficSwitcher, ctx: &OpCtx) -> KestrelResult<()>;

    async fn wait_for_catchup(
        &self,
        ts: &TrafficSwitcher,
        ctx: &OpCtx,
        positions: &BTreeMap<String, Position>,
        timeout: Duration,
    ) -> KestrelResult<()>;

    async fn stop_dependent_streams(
        &self,
        ts: &TrafficSwitcher,
        sm: &StreamMigrator,
        ctx: &OpCtx,
    ) -> KestrelResult<()>;
    async fn migrate_dependent_streams(
        &self,
        ts: &TrafficSwitcher,
        sm: &StreamMigrator,
        ctx: &OpCtx,
    ) -> KestrelResult<()>;
    async fn cancel_dependent_streams(
        &self,
        ts: &TrafficSwitcher,
        sm: &StreamMigrator,
        ctx: &OpCtx,
    ) -> KestrelResult<()>;
    async fn finalize_dependent_streams(
        &self,
        ts: &TrafficSwitcher,
        sm: &StreamMigrator,
        ctx: &OpCtx,
    ) -> KestrelResult<()>;

    async fn reset_sequences(&self, ts: &TrafficSwitcher) -> KestrelResult<()>;
    async fn initialize_target_sequences(&self, ts: &TrafficSwitcher) -> KestrelResult<()>;

    async fn create_reverse_workflow(
        &self,
        ts: &TrafficSwitcher,
        positions: &BTreeMap<String, Position>,
    ) -> KestrelResult<()>;
    async fn start_reverse_workflow(&self, ts: &TrafficSwitcher) -> KestrelResult<()>;
    async fn delete_reverse_workflow(&self, ts: &TrafficSwitcher) -> KestrelResult<()>;

    async fn create_journals(
        &self,
        ts: &TrafficSwitcher,
        positions: &BTreeMap<String, Position>,
        source_workflows: &[String],
    ) -> KestrelResult<()>;

    async fn allow_target_writes(&self, ts: &TrafficSwitcher) -> KestrelResult<()>;
    async fn change_write_routing(
        &self,
        ts: &TrafficSwitcher,
        direction: TrafficDirection,
    ) -> KestrelResult<()>;
    async fn freeze_target(&self, ts: &TrafficSwitcher) -> KestrelResult<()>;
}

// ── Executing implementation ────────────────────────────────────────────────

/// Performs every capability against the topology store and agents.
pub struct ExecuteActions;

impl ExecuteActions {
    /// Refresh serving state on a shard set. Refreshes are retried a few
    /// times: a tablet mid-restart recovers within the backoff window and
    /// failing the whole cutover for it would be needless.
    async fn refresh_shards(
        ts: &TrafficSwitcher,
        what: &str,
        targets: Vec<(String, std::sync::Arc<dyn kestrel_agent::ShardAgent>)>,
    ) -> KestrelResult<()> {
        let ctx = OpCtx::background();
        fanout(
            &ctx,
            what,
            ts.env.config.fanout_concurrency,
            targets,
            |agent| async move {
                let ctx = OpCtx::background();
                retry_on_error(&ctx, "refresh state", 3, || async {
                    agent.refresh_state().await
                })
                .await
            },
        )
        .await?;
        Ok(())
    }

    /// Reverse-direction binlog sources: each source shard consumes from
    /// every target shard whose range intersects its own.
    fn reverse_sources_for(
        ts: &TrafficSwitcher,
        source_shard: &str,
    ) -> KestrelResult<Vec<BinlogSource>> {
        let source_range = KeyRange::parse(source_shard)?;
        let mut out = Vec::new();
        for target in &ts.targets {
            let target_range = KeyRange::parse(&target.shard)?;
            if !source_range.intersects(&target_range) {
                continue;
            }
            let rules = ts
                .tables
                .iter()
                .map(|t| kestrel_agent::types::FilterRule {
                    match_table: t.clone(),
                    expression: String::new(),
                    key_range: if source_range == target_range {
                        None
                    } else {
                        Some(source_range.clone())
                    },
                })
                .collect();
            out.push(BinlogSource {
                keyspace: ts.target_keyspace.clone(),
                shard: target.shard.clone(),
                filter: kestrel_agent::types::Filter { rules },
                stop_after_copy: false,
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl SwitchActions for ExecuteActions {
    fn is_dry_run(&self) -> bool {
        false
    }

    fn log(&self) -> Vec<String> {
        Vec::new()
    }

    async fn remove_mirror_rules(
        &self,
        ts: &TrafficSwitcher,
        tablet_types: &[TabletType],
    ) -> KestrelResult<()> {
        let versioned = ts.env.topo.get_mirror_rules().await?;
        let mut rules = versioned.value;
        let before = rules.rules.len();
        rules.remove_mirror(&ts.source_keyspace, &ts.tables, tablet_types);
        if rules.rules.len() != before {
            ts.env
                .topo
                .save_mirror_rules(&rules, versioned.version)
                .await?;
            ts.env.topo.rebuild_srv_vschema(&[]).await?;
        }
        Ok(())
    }

    async fn switch_table_reads(
        &self,
        ts: &TrafficSwitcher,
        cells: &[String],
        tablet_types: &[TabletType],
        direction: TrafficDirection,
    ) -> KestrelResult<()> {
        let versioned = ts.env.topo.get_routing_rules().await?;
        let snapshot = versioned.value.clone();
        let mut rules = versioned.value;
        rules.switch_table_reads(
            &ts.source_keyspace,
            &ts.target_keyspace,
            &ts.tables,
            tablet_types,
            direction,
        );
        let saved_version = ts
            .env
            .topo
            .save_routing_rules(&rules, versioned.version)
            .await?;
        ts.env.topo.rebuild_srv_vschema(cells).await?;

        // Served views must agree with what was just written; an
        // inconsistent rebuild is rolled back rather than left split.
        let check_cells = if cells.is_empty() {
            ts.env.topo.get_cell_names().await?
        } else {
            cells.to_vec()
        };
        for cell in &check_cells {
            let srv = ts.env.topo.get_srv_vschema(cell).await?;
            let mut expected = srv.routing_rules.clone();
            expected.normalize();
            let mut want = rules.clone();
            want.normalize();
            if expected != want {
                tracing::error!(cell, "served vschema diverged after rebuild; rolling back read switch");
                ts.env
                    .topo
                    .save_routing_rules(&snapshot, saved_version)
                    .await?;
                ts.env.topo.rebuild_srv_vschema(cells).await?;
                return Err(KestrelError::Internal(format!(
                    "served vschema for cell {cell} diverged after read switch; rolled back"
                )));
            }
        }
        Ok(())
    }

    async fn switch_keyspace_reads(
        &self,
        ts: &TrafficSwitcher,
        tablet_types: &[TabletType],
        direction: TrafficDirection,
    ) -> KestrelResult<()> {
        let versioned = ts.env.topo.get_keyspace_rules().await?;
        let mut rules = versioned.value;
        let to = match direction {
            TrafficDirection::Forward => &ts.target_keyspace,
            TrafficDirection::Backward => &ts.source_keyspace,
        };
        let read_types: Vec<TabletType> = tablet_types
            .iter()
            .copied()
            .filter(|t| !t.is_primary())
            .collect();
        rules.switch_keyspace(&ts.source_keyspace, to, &read_types);
        ts.env
            .topo
            .save_keyspace_rules(&rules, versioned.version)
            .await?;
        ts.env.topo.rebuild_srv_vschema(&[]).await?;
        Ok(())
    }

    async fn switch_shard_reads(
        &self,
        ts: &TrafficSwitcher,
        cells: &[String],
        tablet_types: &[TabletType],
        direction: TrafficDirection,
    ) -> KestrelResult<()> {
        let disable = direction == TrafficDirection::Forward;
        for s in &ts.sources {
            ts.env
                .topo
                .update_shard_fields(&s.keyspace, &s.shard, |record| {
                    for tt in tablet_types.iter().filter(|t| !t.is_primary()) {
                        record.set_query_service_disabled(*tt, cells, disable);
                    }
                    Ok(())
                })
                .await?;
        }
        Self::refresh_shards(ts, "refresh source tablets", ts.source_agents()?).await?;
        ts.env.topo.rebuild_srv_vschema(cells).await?;
        Ok(())
    }

    async fn stop_source_writes(&self, ts: &TrafficSwitcher) -> KestrelResult<()> {
        match ts.migration_type {
            MigrationType::Tables => {
                for s in &ts.sources {
                    let tables = ts.tables.clone();
                    ts.env
                        .topo
                        .update_shard_fields(&s.keyspace, &s.shard, move |record| {
                            record.update_denied_tables(TabletType::Primary, &[], false, &tables)
                        })
                        .await?;
                }
            }
            MigrationType::Shards => {
                for s in &ts.sources {
                    ts.env
                        .topo
                        .update_shard_fields(&s.keyspace, &s.shard, |record| {
                            record.set_query_service_disabled(TabletType::Primary, &[], true);
                            Ok(())
                        })
                        .await?;
                }
            }
        }
        Self::refresh_shards(ts, "refresh sources after write stop", ts.source_agents()?).await
    }

    async fn undo_stop_source_writes(&self, ts: &TrafficSwitcher) -> KestrelResult<()> {
        match ts.migration_type {
            MigrationType::Tables => {
                for s in &ts.sources {
                    let tables = ts.tables.clone();
                    // Only the entries actually present are removed, so a
                    // rollback of a partially-applied stop still succeeds.
                    ts.env
                        .topo
                        .update_shard_fields(&s.keyspace, &s.shard, move |record| {
                            let denied = record.denied_tables(TabletType::Primary);
                            let present: Vec<String> = tables
                                .iter()
                                .filter(|t| denied.contains(t))
                                .cloned()
                                .collect();
                            if !present.is_empty() {
                                record.update_denied_tables(
                                    TabletType::Primary,
                                    &[],
                                    true,
                                    &present,
                                )?;
                            }
                            Ok(())
                        })
                        .await?;
                }
            }
            MigrationType::Shards => {
                for s in &ts.sources {
                    ts.env
                        .topo
                        .update_shard_fields(&s.keyspace, &s.shard, |record| {
                            record.set_query_service_disabled(TabletType::Primary, &[], false);
                            Ok(())
                        })
                        .await?;
                }
            }
        }
        Self::refresh_shards(ts, "refresh sources after rollback", ts.source_agents()?).await
    }

    async fn lock_source_tables(&self, ts: &TrafficSwitcher, ctx: &OpCtx) -> KestrelResult<()> {
        let cycles = ts.env.config.lock_tables_cycles.max(1);
        let delay = ts.env.config.lock_tables_cycle_delay();
        for cycle in 0..cycles {
            if cycle > 0 {
                ctx.sleep(delay, "between lock-tables cycles").await?;
            }
            for (shard, agent) in ts.source_agents()? {
                agent
                    .lock_tables_cycle(&ts.tables)
                    .await
                    .map_err(|e| e.wrap(format!("lock tables on {shard}")))?;
            }
        }
        Ok(())
    }

    async fn wait_for_catchup(
        &self,
        ts: &TrafficSwitcher,
        ctx: &OpCtx,
        positions: &BTreeMap<String, Position>,
        timeout: Duration,
    ) -> KestrelResult<()> {
        // Union of all frozen source positions: a target is caught up
        // once it has applied everything every source had.
        let mut goal = Position::new();
        for pos in positions.values() {
            goal.join(pos);
        }
        let workflow = ts.workflow_name.clone();
        let ctx = ctx.child_with_timeout(timeout);
        let goal = std::sync::Arc::new(goal);
        let wf = workflow.clone();
        fanout(
            &ctx,
            "wait for target catch-up",
            ts.env.config.fanout_concurrency,
            ts.target_agents()?,
            move |agent| {
                let goal = std::sync::Arc::clone(&goal);
                let workflow = wf.clone();
                async move {
                    agent
                        .wait_for_workflow_position(&workflow, &goal, timeout)
                        .await
                }
            },
        )
        .await?;
        Ok(())
    }

    async fn stop_dependent_streams(
        &self,
        ts: &TrafficSwitcher,
        sm: &StreamMigrator,
        ctx: &OpCtx,
    ) -> KestrelResult<()> {
        sm.stop_streams(ts, ctx).await
    }

    async fn migrate_dependent_streams(
        &self,
        ts: &TrafficSwitcher,
        sm: &StreamMigrator,
        ctx: &OpCtx,
    ) -> KestrelResult<()> {
        sm.migrate_streams(ts, ctx).await
    }

    async fn cancel_dependent_streams(
        &self,
        ts: &TrafficSwitcher,
        sm: &StreamMigrator,
        ctx: &OpCtx,
    ) -> KestrelResult<()> {
        sm.cancel(ts, ctx).await
    }

    async fn finalize_dependent_streams(
        &self,
        ts: &TrafficSwitcher,
        sm: &StreamMigrator,
        ctx: &OpCtx,
    ) -> KestrelResult<()> {
        sm.finalize(ts, ctx).await
    }

    async fn reset_sequences(&self, ts: &TrafficSwitcher) -> KestrelResult<()> {
        let sequences = ts.sequence_tables();
        if sequences.is_empty() {
            return Ok(());
        }
        for (shard, agent) in ts.source_agents()? {
            agent
                .reset_sequences(&sequences)
                .await
                .map_err(|e| e.wrap(format!("reset sequences on {shard}")))?;
        }
        Ok(())
    }

    async fn initialize_target_sequences(&self, ts: &TrafficSwitcher) -> KestrelResult<()> {
        let sequences = ts.sequence_tables();
        if sequences.is_empty() {
            return Ok(());
        }
        for (shard, agent) in ts.target_agents()? {
            agent
                .reset_sequences(&sequences)
                .await
                .map_err(|e| e.wrap(format!("initialize sequences on {shard}")))?;
        }
        Ok(())
    }

    async fn create_reverse_workflow(
        &self,
        ts: &TrafficSwitcher,
        positions: &BTreeMap<String, Position>,
    ) -> KestrelResult<()> {
        let workflow_type = ts
            .workflow
            .workflow_type
            .unwrap_or(kestrel_common::types::WorkflowType::MoveTables);
        for s in &ts.sources {
            let agent = ts.env.agents.agent_for(&s.keyspace, &s.shard)?;
            let sources = Self::reverse_sources_for(ts, &s.shard)?;
            let created = agent
                .create_workflow(&CreateWorkflowRequest {
                    workflow: ts.reverse_workflow_name.clone(),
                    workflow_type,
                    workflow_sub_type: ts.workflow.sub_type,
                    binlog_sources: sources,
                    cells: vec![],
                    tablet_types: vec![],
                    auto_start: false,
                    stop_after_copy: false,
                    options: ts.workflow.options.clone(),
                })
                .await;
            match created {
                Ok(_) => {}
                // A crashed previous attempt may have left the reverse
                // workflow behind; that is the desired end state.
                Err(e) if e.code() == kestrel_common::error::ErrorCode::AlreadyExists => {
                    tracing::info!(
                        workflow = %ts.reverse_workflow_name,
                        shard = %s.shard,
                        "reverse workflow already present, keeping it"
                    );
                }
                Err(e) => return Err(e.wrap(format!("create reverse streams on {}", s.key()))),
            }
            // Reverse streams start from the frozen source position.
            if let Some(pos) = positions.get(&s.shard) {
                agent
                    .update_workflow(&UpdateWorkflowRequest {
                        workflow: ts.reverse_workflow_name.clone(),
                        stop_position: Some(pos.clone()),
                        ..Default::default()
                    })
                    .await?;
            }
        }
        Ok(())
    }

    async fn start_reverse_workflow(&self, ts: &TrafficSwitcher) -> KestrelResult<()> {
        for (shard, agent) in ts.source_agents()? {
            agent
                .update_workflow(&UpdateWorkflowRequest {
                    workflow: ts.reverse_workflow_name.clone(),
                    state: Some(StreamState::Running),
                    ..Default::default()
                })
                .await
                .map_err(|e| e.wrap(format!("start reverse streams on {shard}")))?;
        }
        Ok(())
    }

    async fn delete_reverse_workflow(&self, ts: &TrafficSwitcher) -> KestrelResult<()> {
        for (shard, agent) in ts.source_agents()? {
            agent
                .delete_workflow(&ts.reverse_workflow_name)
                .await
                .map_err(|e| e.wrap(format!("delete reverse streams on {shard}")))?;
        }
        Ok(())
    }

    async fn create_journals(
        &self,
        ts: &TrafficSwitcher,
        positions: &BTreeMap<String, Position>,
        source_workflows: &[String],
    ) -> KestrelResult<()> {
        let id = ts.migration_id();
        let shard_gtids: Vec<ShardGtid> = positions
            .iter()
            .map(|(shard, gtid)| ShardGtid {
                keyspace: ts.source_keyspace.clone(),
                shard: shard.clone(),
                gtid: gtid.clone(),
            })
            .collect();
        let participants: Vec<String> = ts.sources.iter().map(|s| s.key()).collect();

        for s in &ts.sources {
            let agent = ts.env.agents.agent_for(&s.keyspace, &s.shard)?;
            let journal = Journal {
                id,
                migration_type: ts.migration_type,
                tables: ts.tables.clone(),
                local_position: positions.get(&s.shard).cloned().unwrap_or_default(),
                shard_gtids: shard_gtids.clone(),
                participants: participants.clone(),
                source_workflows: source_workflows.to_vec(),
            };
            match agent.create_journal(&journal).await {
                Ok(()) => {}
                // Re-run after a crash: the journal is already durable.
                Err(e) if e.code() == kestrel_common::error::ErrorCode::AlreadyExists => {}
                Err(e) => return Err(e.wrap(format!("create journal on {}", s.key()))),
            }
        }
        Ok(())
    }

    async fn allow_target_writes(&self, ts: &TrafficSwitcher) -> KestrelResult<()> {
        for t in &ts.targets {
            let tables = ts.tables.clone();
            let migration_type = ts.migration_type;
            ts.env
                .topo
                .update_shard_fields(&t.keyspace, &t.shard, move |record| {
                    match migration_type {
                        MigrationType::Tables => {
                            // Target-side denial may or may not be present
                            // depending on create options; dropping is
                            // best-effort idempotent.
                            let denied = record.denied_tables(TabletType::Primary);
                            let to_remove: Vec<String> = tables
                                .iter()
                                .filter(|t| denied.contains(t))
                                .cloned()
                                .collect();
                            if !to_remove.is_empty() {
                                record.update_denied_tables(
                                    TabletType::Primary,
                                    &[],
                                    true,
                                    &to_remove,
                                )?;
                            }
                        }
                        MigrationType::Shards => {
                            record.set_query_service_disabled(TabletType::Primary, &[], false);
                        }
                    }
                    Ok(())
                })
                .await?;
        }
        Self::refresh_shards(ts, "refresh targets after write allow", ts.target_agents()?).await
    }

    async fn change_write_routing(
        &self,
        ts: &TrafficSwitcher,
        direction: TrafficDirection,
    ) -> KestrelResult<()> {
        if ts.is_partial() {
            let versioned = ts.env.topo.get_shard_rules().await?;
            let mut rules = versioned.value;
            for t in &ts.targets {
                match direction {
                    TrafficDirection::Forward => {
                        // Source-addressed traffic lands on the target, and
                        // the create-time target→source redirect goes away.
                        rules.set(&ts.source_keyspace, &t.shard, &ts.target_keyspace);
                        rules.delete(&ts.target_keyspace, &t.shard);
                    }
                    TrafficDirection::Backward => {
                        rules.delete(&ts.source_keyspace, &t.shard);
                        rules.set(&ts.target_keyspace, &t.shard, &ts.source_keyspace);
                    }
                }
            }
            ts.env
                .topo
                .save_shard_rules(&rules, versioned.version)
                .await?;
        } else if ts.is_multi_tenant() {
            let versioned = ts.env.topo.get_keyspace_rules().await?;
            let mut rules = versioned.value;
            rules.switch_keyspace(
                &ts.source_keyspace,
                &ts.target_keyspace,
                &[TabletType::Primary],
            );
            ts.env
                .topo
                .save_keyspace_rules(&rules, versioned.version)
                .await?;
        } else if ts.migration_type == MigrationType::Tables {
            let versioned = ts.env.topo.get_routing_rules().await?;
            let mut rules = versioned.value;
            rules.switch_table_writes(
                &ts.source_keyspace,
                &ts.target_keyspace,
                &ts.tables,
                direction,
            );
            ts.env
                .topo
                .save_routing_rules(&rules, versioned.version)
                .await?;
        } else {
            // Reshard: the serving flags swap from retiring to new shards.
            for s in &ts.sources {
                ts.env
                    .topo
                    .update_shard_fields(&s.keyspace, &s.shard, |record| {
                        record.is_primary_serving = false;
                        Ok(())
                    })
                    .await?;
            }
            for t in &ts.targets {
                ts.env
                    .topo
                    .update_shard_fields(&t.keyspace, &t.shard, |record| {
                        record.is_primary_serving = true;
                        Ok(())
                    })
                    .await?;
            }
        }
        ts.env.topo.rebuild_srv_vschema(&[]).await?;
        Ok(())
    }

    async fn freeze_target(&self, ts: &TrafficSwitcher) -> KestrelResult<()> {
        for (shard, agent) in ts.target_agents()? {
            agent
                .update_workflow(&UpdateWorkflowRequest {
                    workflow: ts.workflow_name.clone(),
                    state: Some(StreamState::Running),
                    message: Some(FROZEN_MESSAGE.to_string()),
                    ..Default::default()
                })
                .await
                .map_err(|e| e.wrap(format!("freeze workflow on {shard}")))?;
        }
        Ok(())
    }
}

// ── Recording implementation ────────────────────────────────────────────────

/// Records the step a real run would take, mutating nothing.
#[derive(Default)]
pub struct DryRunRecorder {
    lines: Mutex<Vec<String>>,
}

impl DryRunRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, line: String) -> KestrelResult<()> {
        self.lines.lock().push(line);
        Ok(())
    }
}

#[async_trait]
impl SwitchActions for DryRunRecorder {
    fn is_dry_run(&self) -> bool {
        true
    }

    fn log(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    async fn remove_mirror_rules(
        &self,
        ts: &TrafficSwitcher,
        tablet_types: &[TabletType],
    ) -> KestrelResult<()> {
        self.record(format!(
            "Remove mirror rules for tables [{}] at tablet types {:?}",
            ts.tables.join(","),
            tablet_types
        ))
    }

    async fn switch_table_reads(
        &self,
        ts: &TrafficSwitcher,
        cells: &[String],
        tablet_types: &[TabletType],
        direction: TrafficDirection,
    ) -> KestrelResult<()> {
        self.record(format!(
            "Switch reads ({direction}) for tables [{}] to keyspace {} in cells [{}] at tablet types {:?}",
            ts.tables.join(","),
            match direction {
                TrafficDirection::Forward => &ts.target_keyspace,
                TrafficDirection::Backward => &ts.source_keyspace,
            },
            if cells.is_empty() { "all".to_string() } else { cells.join(",") },
            tablet_types
        ))
    }

    async fn switch_keyspace_reads(
        &self,
        ts: &TrafficSwitcher,
        tablet_types: &[TabletType],
        direction: TrafficDirection,
    ) -> KestrelResult<()> {
        self.record(format!(
            "Switch keyspace-routed reads ({direction}) for {} at tablet types {:?}",
            ts.source_keyspace, tablet_types
        ))
    }

    async fn switch_shard_reads(
        &self,
        ts: &TrafficSwitcher,
        cells: &[String],
        tablet_types: &[TabletType],
        direction: TrafficDirection,
    ) -> KestrelResult<()> {
        self.record(format!(
            "Switch shard reads ({direction}) on source shards [{}] in cells [{}] at tablet types {:?}",
            ts.sources.iter().map(|s| s.shard.as_str()).collect::<Vec<_>>().join(","),
            if cells.is_empty() { "all".to_string() } else { cells.join(",") },
            tablet_types
        ))
    }

    async fn stop_source_writes(&self, ts: &TrafficSwitcher) -> KestrelResult<()> {
        self.record(format!(
            "Stop writes on source keyspace {} for tables [{}]",
            ts.source_keyspace,
            ts.tables.join(",")
        ))
    }

    async fn undo_stop_source_writes(&self, ts: &TrafficSwitcher) -> KestrelResult<()> {
        self.record(format!(
            "Re-allow writes on source keyspace {}",
            ts.source_keyspace
        ))
    }

    async fn lock_source_tables(&self, ts: &TrafficSwitcher, _ctx: &OpCtx) -> KestrelResult<()> {
        self.record(format!(
            "Run {} LOCK TABLES cycle(s) on source shards [{}]",
            ts.env.config.lock_tables_cycles,
            ts.sources.iter().map(|s| s.shard.as_str()).collect::<Vec<_>>().join(",")
        ))
    }

    async fn wait_for_catchup(
        &self,
        ts: &TrafficSwitcher,
        _ctx: &OpCtx,
        _positions: &BTreeMap<String, Position>,
        timeout: Duration,
    ) -> KestrelResult<()> {
        self.record(format!(
            "Wait for target streams of {} to reach the frozen source positions (timeout {}s)",
            ts.workflow_name,
            timeout.as_secs()
        ))
    }

    async fn stop_dependent_streams(
        &self,
        _ts: &TrafficSwitcher,
        sm: &StreamMigrator,
        _ctx: &OpCtx,
    ) -> KestrelResult<()> {
        if sm.is_empty() {
            return Ok(());
        }
        self.record(format!(
            "Stop dependent streams of workflows [{}]",
            sm.workflow_names().join(",")
        ))
    }

    async fn migrate_dependent_streams(
        &self,
        ts: &TrafficSwitcher,
        sm: &StreamMigrator,
        _ctx: &OpCtx,
    ) -> KestrelResult<()> {
        if sm.is_empty() {
            return Ok(());
        }
        self.record(format!(
            "Migrate dependent streams [{}] to target shards [{}]",
            sm.workflow_names().join(","),
            ts.targets.iter().map(|t| t.shard.as_str()).collect::<Vec<_>>().join(",")
        ))
    }

    async fn cancel_dependent_streams(
        &self,
        _ts: &TrafficSwitcher,
        sm: &StreamMigrator,
        _ctx: &OpCtx,
    ) -> KestrelResult<()> {
        if sm.is_empty() {
            return Ok(());
        }
        self.record(format!(
            "Cancel dependent stream migration for workflows [{}]",
            sm.workflow_names().join(",")
        ))
    }

    async fn finalize_dependent_streams(
        &self,
        _ts: &TrafficSwitcher,
        sm: &StreamMigrator,
        _ctx: &OpCtx,
    ) -> KestrelResult<()> {
        if sm.is_empty() {
            return Ok(());
        }
        self.record(format!(
            "Finalize dependent streams [{}]",
            sm.workflow_names().join(",")
        ))
    }

    async fn reset_sequences(&self, ts: &TrafficSwitcher) -> KestrelResult<()> {
        let sequences = ts.sequence_tables();
        if sequences.is_empty() {
            return Ok(());
        }
        self.record(format!("Reset sequences [{}] on sources", sequences.join(",")))
    }

    async fn initialize_target_sequences(&self, ts: &TrafficSwitcher) -> KestrelResult<()> {
        let sequences = ts.sequence_tables();
        if sequences.is_empty() {
            return Ok(());
        }
        self.record(format!(
            "Initialize sequences [{}] on targets",
            sequences.join(",")
        ))
    }

    async fn create_reverse_workflow(
        &self,
        ts: &TrafficSwitcher,
        _positions: &BTreeMap<String, Position>,
    ) -> KestrelResult<()> {
        self.record(format!(
            "Create reverse workflow {} on source shards [{}] (paused)",
            ts.reverse_workflow_name,
            ts.sources.iter().map(|s| s.shard.as_str()).collect::<Vec<_>>().join(",")
        ))
    }

    async fn start_reverse_workflow(&self, ts: &TrafficSwitcher) -> KestrelResult<()> {
        self.record(format!(
            "Start reverse workflow {}",
            ts.reverse_workflow_name
        ))
    }

    async fn delete_reverse_workflow(&self, ts: &TrafficSwitcher) -> KestrelResult<()> {
        self.record(format!(
            "Delete reverse workflow {}",
            ts.reverse_workflow_name
        ))
    }

    async fn create_journals(
        &self,
        ts: &TrafficSwitcher,
        _positions: &BTreeMap<String, Position>,
        _source_workflows: &[String],
    ) -> KestrelResult<()> {
        self.record(format!(
            "Create journal {} on source shards [{}]",
            ts.migration_id(),
            ts.sources.iter().map(|s| s.shard.as_str()).collect::<Vec<_>>().join(",")
        ))
    }

    async fn allow_target_writes(&self, ts: &TrafficSwitcher) -> KestrelResult<()> {
        self.record(format!(
            "Allow writes on target keyspace {}",
            ts.target_keyspace
        ))
    }

    async fn change_write_routing(
        &self,
        ts: &TrafficSwitcher,
        direction: TrafficDirection,
    ) -> KestrelResult<()> {
        self.record(format!(
            "Route primary traffic ({direction}) for tables [{}] to keyspace {}",
            ts.tables.join(","),
            match direction {
                TrafficDirection::Forward => &ts.target_keyspace,
                TrafficDirection::Backward => &ts.source_keyspace,
            }
        ))
    }

    async fn freeze_target(&self, ts: &TrafficSwitcher) -> KestrelResult<()> {
        self.record(format!("Freeze target workflow {}", ts.workflow_name))
    }
}
