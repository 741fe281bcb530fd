//! Traffic switcher: the read/write cutover state machine.
//!
//! A switcher is built fresh per verb from the workflow's streams and the
//! topology store, never cached. The machine walks
//! `INIT → READS_SWITCHED → WRITES_SWITCHED → FROZEN`; the backward
//! direction rebuilds the switcher around the reverse workflow and walks
//! the same machine forward.
//!
//! Every mutation goes through [`SwitchActions`], which has an executing
//! implementation and a recording one, so a dry run emits exactly the
//! step list the real run would perform.

pub mod actions;
pub mod reads;
pub mod writes;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use kestrel_agent::ShardAgent;
use kestrel_common::error::{KestrelError, KestrelResult};
use kestrel_common::opctx::OpCtx;
use kestrel_common::types::{migration_id, MigrationType, Position, TabletType, WorkflowSubType};
use kestrel_topo::routing::TrafficDirection;
use kestrel_topo::vschema::{TableKind, VSchema};

use crate::fanout::fanout;
use crate::fetcher::WorkflowFetcher;
use crate::workflow::{reverse_name, Workflow};
use crate::Env;

pub use actions::{DryRunRecorder, ExecuteActions, SwitchActions};

/// Per-shard view of a cutover endpoint.
#[derive(Debug, Clone)]
pub struct MigrationShard {
    pub keyspace: String,
    pub shard: String,
    /// Stream ids living on this shard (targets only).
    pub stream_ids: Vec<u64>,
}

impl MigrationShard {
    pub fn key(&self) -> String {
        format!("{}/{}", self.keyspace, self.shard)
    }
}

/// Caller parameters for a traffic switch.
#[derive(Debug, Clone)]
pub struct SwitchRequest {
    pub keyspace: String,
    pub workflow: String,
    pub tablet_types: Vec<TabletType>,
    /// Cells whose read traffic moves; empty = every cell.
    pub cells: Vec<String>,
    pub direction: TrafficDirection,
    pub dry_run: bool,
    /// Skip gate validations that would otherwise refuse the switch.
    pub force: bool,
    pub enable_reverse_replication: bool,
    pub initialize_target_sequences: bool,
    /// Abort an in-flight write switch and roll back.
    pub cancel: bool,
    pub timeout: Option<Duration>,
    pub max_replication_lag_allowed: Option<Duration>,
}

impl Default for SwitchRequest {
    fn default() -> Self {
        Self {
            keyspace: String::new(),
            workflow: String::new(),
            tablet_types: vec![],
            cells: vec![],
            direction: TrafficDirection::Forward,
            dry_run: false,
            force: false,
            enable_reverse_replication: true,
            initialize_target_sequences: false,
            cancel: false,
            timeout: None,
            max_replication_lag_allowed: None,
        }
    }
}

/// Verb result: human summary plus the states before and after.
#[derive(Debug, Clone, Default)]
pub struct SwitchResponse {
    pub summary: String,
    pub start_state: String,
    pub current_state: String,
    pub dry_run_log: Vec<String>,
}

/// The cutover plan for one workflow, derived at verb start.
pub struct TrafficSwitcher {
    pub(crate) env: Env,
    pub workflow: Workflow,
    pub workflow_name: String,
    pub reverse_workflow_name: String,
    pub source_keyspace: String,
    pub target_keyspace: String,
    pub migration_type: MigrationType,
    pub tables: Vec<String>,
    pub sources: Vec<MigrationShard>,
    pub targets: Vec<MigrationShard>,
    pub source_vschema: VSchema,
}

impl TrafficSwitcher {
    /// Gather everything a cutover needs and check the build invariants.
    pub async fn build(env: Env, target_keyspace: &str, workflow: &str, ctx: &OpCtx) -> KestrelResult<Self> {
        let fetcher = WorkflowFetcher::new(env.clone());
        let wf = fetcher.fetch_one(ctx, target_keyspace, workflow).await?;

        let source_keyspace = wf.source_keyspace.clone().ok_or_else(|| {
            KestrelError::Internal(format!("workflow {workflow} has no streams"))
        })?;

        // Build invariant: every stream consumes the same source keyspace.
        for s in &wf.streams {
            if s.row.binlog_source.keyspace != source_keyspace {
                return Err(KestrelError::Internal(format!(
                    "workflow {workflow} has streams with mismatched source keyspaces: {} vs {}",
                    source_keyspace, s.row.binlog_source.keyspace
                )));
            }
        }

        // Build invariant: every stream matches the same table set.
        let tables = wf.tables();
        for s in &wf.streams {
            let stream_tables = s.row.binlog_source.filter.match_tables();
            if stream_tables != tables {
                return Err(KestrelError::Internal(format!(
                    "workflow {workflow} streams disagree on table set: {stream_tables:?} vs {tables:?}"
                )));
            }
        }

        let migration_type = if source_keyspace == target_keyspace {
            MigrationType::Shards
        } else {
            MigrationType::Tables
        };

        let mut targets: Vec<MigrationShard> = wf
            .streams_by_shard()
            .into_iter()
            .map(|(shard, streams)| MigrationShard {
                keyspace: target_keyspace.to_string(),
                shard,
                stream_ids: streams.iter().map(|s| s.row.id).collect(),
            })
            .collect();
        targets.sort_by(|a, b| a.shard.cmp(&b.shard));

        let sources: Vec<MigrationShard> = wf
            .source_shards()
            .into_iter()
            .map(|shard| MigrationShard {
                keyspace: source_keyspace.clone(),
                shard,
                stream_ids: vec![],
            })
            .collect();

        let source_vschema = env.topo.get_vschema(&source_keyspace).await?.value;

        Ok(Self {
            env,
            reverse_workflow_name: reverse_name(workflow),
            workflow_name: workflow.to_string(),
            workflow: wf,
            source_keyspace,
            target_keyspace: target_keyspace.to_string(),
            migration_type,
            tables,
            sources,
            targets,
            source_vschema,
        })
    }

    pub fn is_partial(&self) -> bool {
        self.workflow.sub_type == WorkflowSubType::Partial
    }

    pub fn is_multi_tenant(&self) -> bool {
        self.workflow.sub_type == WorkflowSubType::MultiTenant
    }

    /// Deterministic id of this cutover run.
    pub fn migration_id(&self) -> u64 {
        let shards: Vec<String> = self.targets.iter().map(|t| t.shard.clone()).collect();
        migration_id(&self.target_keyspace, &shards)
    }

    /// Sequence tables referenced by the workflow's tables, from the
    /// source vschema.
    pub fn sequence_tables(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .tables
            .iter()
            .filter_map(|t| self.source_vschema.tables.get(t))
            .filter_map(|t| t.auto_increment_sequence.clone())
            .collect();
        out.extend(
            self.source_vschema
                .tables
                .iter()
                .filter(|(name, t)| t.kind == TableKind::Sequence && self.tables.contains(name))
                .map(|(name, _)| name.clone()),
        );
        out.sort();
        out.dedup();
        out
    }

    pub(crate) fn source_agents(&self) -> KestrelResult<Vec<(String, Arc<dyn ShardAgent>)>> {
        self.sources
            .iter()
            .map(|s| {
                Ok((
                    s.shard.clone(),
                    self.env.agents.agent_for(&s.keyspace, &s.shard)?,
                ))
            })
            .collect()
    }

    pub(crate) fn target_agents(&self) -> KestrelResult<Vec<(String, Arc<dyn ShardAgent>)>> {
        self.targets
            .iter()
            .map(|t| {
                Ok((
                    t.shard.clone(),
                    self.env.agents.agent_for(&t.keyspace, &t.shard)?,
                ))
            })
            .collect()
    }

    // ── Gate validations ────────────────────────────────────────────────

    /// The preconditions every switch checks before touching anything.
    /// Failures are terminal for the verb; nothing is retried.
    pub async fn validate_switch(
        &self,
        ctx: &OpCtx,
        max_lag: Duration,
        force: bool,
    ) -> KestrelResult<()> {
        if self.workflow.has_errors() {
            return Err(KestrelError::FailedPrecondition(format!(
                "cannot switch: workflow {} has errors",
                self.workflow_name
            )));
        }
        if self.workflow.is_copying() {
            return Err(KestrelError::FailedPrecondition(format!(
                "cannot switch: copy is still in progress for workflow {}",
                self.workflow_name
            )));
        }
        if self.workflow.is_frozen() {
            return Err(KestrelError::FailedPrecondition(format!(
                "cannot switch: workflow {} is frozen",
                self.workflow_name
            )));
        }
        let lag = self.workflow.max_v_replication_lag;
        if lag > max_lag.as_secs() {
            return Err(KestrelError::FailedPrecondition(format!(
                "cannot switch: replication lag {lag}s is higher than allowed lag {}s",
                max_lag.as_secs()
            )));
        }

        // Source and target tablets must be refreshable so serving changes
        // land; a force switch proceeds anyway.
        let mut refresh_targets = self.source_agents()?;
        refresh_targets.extend(self.target_agents()?);
        let refresh = fanout(
            ctx,
            "refresh tablets",
            self.env.config.fanout_concurrency,
            refresh_targets,
            |agent| async move { agent.refresh_state().await },
        )
        .await;
        if let Err(e) = refresh {
            if !force {
                return Err(KestrelError::FailedPrecondition(format!(
                    "cannot switch: tablet refresh failed: {e}"
                )));
            }
            tracing::warn!(workflow = %self.workflow_name, error = %e, "tablet refresh failed, proceeding under force");
        }
        Ok(())
    }

    /// Reverse-replication feasibility: the sources must be able to host
    /// the reverse streams and each target must have a primary to stream
    /// from. Agents that do not implement the permission probe pass.
    pub async fn validate_reverse_feasible(&self, ctx: &OpCtx) -> KestrelResult<()> {
        let sources = self.source_agents()?;
        fanout(
            ctx,
            "validate reverse replication",
            self.env.config.fanout_concurrency,
            sources,
            |agent| async move {
                match agent.validate_vreplication_permissions().await {
                    Ok(()) => Ok(()),
                    // Older agents predate the probe; treat as success.
                    Err(e) if e.code() == kestrel_common::error::ErrorCode::Unimplemented => Ok(()),
                    Err(e) => Err(e),
                }
            },
        )
        .await?;
        for t in &self.targets {
            let tablets = self.env.topo.get_tablet_map(&t.keyspace, &t.shard).await?;
            if tablets.is_empty() {
                return Err(KestrelError::FailedPrecondition(format!(
                    "cannot create reverse streams: target shard {} has no tablets",
                    t.key()
                )));
            }
        }
        Ok(())
    }

    // ── State snapshot ──────────────────────────────────────────────────

    /// Derive the ephemeral traffic state from the topology store.
    pub async fn workflow_state(&self, _ctx: &OpCtx) -> KestrelResult<crate::workflow::WorkflowState> {
        let mut state = crate::workflow::WorkflowState {
            is_reverse: self.workflow.is_reverse(),
            is_partial: self.is_partial(),
            workflow_type: self.workflow.workflow_type,
            ..Default::default()
        };

        if self.is_partial() {
            let shard_rules = self.env.topo.get_shard_rules().await?.value;
            for t in &self.targets {
                let switched =
                    shard_rules.get(&self.source_keyspace, &t.shard) == Some(self.target_keyspace.as_str());
                if switched {
                    state.shards_already_switched.push(t.shard.clone());
                } else {
                    state.shards_not_yet_switched.push(t.shard.clone());
                }
            }
            state.writes_switched = state.shards_not_yet_switched.is_empty();
            return Ok(state);
        }

        if self.is_multi_tenant() {
            let rules = self.env.topo.get_keyspace_rules().await?.value;
            state.writes_switched =
                rules.get(&self.source_keyspace) == Some(self.target_keyspace.as_str());
            for cell in self.env.topo.get_cell_names().await? {
                let srv = self.env.topo.get_srv_vschema(&cell).await?;
                for tt in TabletType::READ_ONLY {
                    let key = format!("{}{}", self.source_keyspace, tt.suffix());
                    let switched =
                        srv.keyspace_rules.get(&key) == Some(self.target_keyspace.as_str());
                    push_cell(&mut state, tt, &cell, switched);
                }
            }
            return Ok(state);
        }

        match self.migration_type {
            MigrationType::Tables => {
                let table = match self.tables.first() {
                    Some(t) => t.clone(),
                    None => return Ok(state),
                };
                let rules = self.env.topo.get_routing_rules().await?.value;
                let primary_key = format!("{}.{}", self.source_keyspace, table);
                state.writes_switched =
                    rules.resolved_keyspace(&primary_key) == Some(self.target_keyspace.as_str());

                for cell in self.env.topo.get_cell_names().await? {
                    let srv = self.env.topo.get_srv_vschema(&cell).await?;
                    for tt in TabletType::READ_ONLY {
                        let key = format!("{}.{}{}", self.source_keyspace, table, tt.suffix());
                        let switched = srv.routing_rules.resolved_keyspace(&key)
                            == Some(self.target_keyspace.as_str());
                        push_cell(&mut state, tt, &cell, switched);
                    }
                }
            }
            MigrationType::Shards => {
                let mut all_unserved = true;
                for s in &self.sources {
                    let record = self.env.topo.get_shard(&s.keyspace, &s.shard).await?.value;
                    if record.is_primary_serving {
                        all_unserved = false;
                    }
                }
                state.writes_switched = all_unserved;

                for cell in self.env.topo.get_cell_names().await? {
                    for tt in TabletType::READ_ONLY {
                        // Reads are switched when every source shard has
                        // query service disabled for the type in the cell.
                        let mut switched = true;
                        for s in &self.sources {
                            let record =
                                self.env.topo.get_shard(&s.keyspace, &s.shard).await?.value;
                            if !record.query_service_disabled(tt, &cell) {
                                switched = false;
                                break;
                            }
                        }
                        push_cell(&mut state, tt, &cell, switched);
                    }
                }
            }
        }
        Ok(state)
    }

    /// Frozen source positions, gathered after writes stop.
    pub(crate) async fn gather_source_positions(
        &self,
        ctx: &OpCtx,
    ) -> KestrelResult<BTreeMap<String, Position>> {
        let sources = self.source_agents()?;
        let out = fanout(
            ctx,
            "gather source positions",
            self.env.config.fanout_concurrency,
            sources,
            |agent| async move { agent.primary_position().await },
        )
        .await?;
        Ok(out.into_iter().collect())
    }

    /// Whether journals from a previous run of this cutover already exist
    /// on the sources. Presence means the point of no return was passed.
    pub(crate) async fn journals_exist(&self, ctx: &OpCtx) -> KestrelResult<bool> {
        let id = self.migration_id();
        let sources = self.source_agents()?;
        let results = fanout(
            ctx,
            "check journals",
            self.env.config.fanout_concurrency,
            sources,
            move |agent| async move { agent.read_journal(id).await },
        )
        .await?;
        Ok(results.iter().any(|(_, j)| j.is_some()))
    }
}

fn push_cell(
    state: &mut crate::workflow::WorkflowState,
    tt: TabletType,
    cell: &str,
    switched: bool,
) {
    let (yes, no) = match tt {
        TabletType::Replica => (
            &mut state.replica_cells_switched,
            &mut state.replica_cells_not_switched,
        ),
        TabletType::Rdonly => (
            &mut state.rdonly_cells_switched,
            &mut state.rdonly_cells_not_switched,
        ),
        TabletType::Primary => return,
    };
    if switched {
        yes.push(cell.to_string());
    } else {
        no.push(cell.to_string());
    }
}
