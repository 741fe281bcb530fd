//! Materializer: plans and emits the stream definitions behind
//! MoveTables, Materialize, Migrate, and lookup-index backfills.
//!
//! For every target shard it generates one binlog source per intersecting
//! source shard, with a filter rule per table. When a source and target
//! shard cover byte-identical ranges the key-range filter is elided so
//! the agent can stream without row-level range checks.

use std::collections::BTreeMap;

use kestrel_agent::types::{BinlogSource, CreateWorkflowRequest, Filter, FilterRule};
use kestrel_common::error::{KestrelError, KestrelResult};
use kestrel_common::keyrange::KeyRange;
use kestrel_common::opctx::OpCtx;
use kestrel_common::types::{TabletType, WorkflowOptions, WorkflowSubType, WorkflowType};

use crate::fanout::fanout;
use crate::Env;

/// `create_ddl` value asking the materializer to copy the table
/// definition from the source.
pub const CREATE_DDL_AS_COPY: &str = "copy";

/// One materialized table: where it lands, what feeds it, how to create it.
#[derive(Debug, Clone)]
pub struct TableSetting {
    pub target_table: String,
    /// Source query feeding the table, e.g. `select * from customer`.
    pub source_expression: String,
    /// DDL for the target table, or [`CREATE_DDL_AS_COPY`].
    pub create_ddl: String,
}

/// Caller intent for a materialization.
#[derive(Debug, Clone)]
pub struct MaterializeSettings {
    pub workflow: String,
    pub source_keyspace: String,
    pub target_keyspace: String,
    pub cells: Vec<String>,
    pub tablet_types: Vec<TabletType>,
    pub table_settings: Vec<TableSetting>,
    /// Alternative to `table_settings`: copy these tables verbatim as
    /// reference tables.
    pub reference_tables: Vec<String>,
    pub workflow_type: WorkflowType,
    pub workflow_sub_type: WorkflowSubType,
    pub options: WorkflowOptions,
    pub stop_after_copy: bool,
    /// Start streams as soon as they are created.
    pub auto_start: bool,
    /// Compare target schema against the deployed DDL after the copy.
    pub verify_schema: bool,
    /// Restrict to these source shards (partial migrations); empty = all.
    pub source_shard_filter: Vec<String>,
    /// Restrict to these target shards (partial migrations); empty = all.
    pub target_shard_filter: Vec<String>,
}

impl Default for MaterializeSettings {
    fn default() -> Self {
        Self {
            workflow: String::new(),
            source_keyspace: String::new(),
            target_keyspace: String::new(),
            cells: vec![],
            tablet_types: vec![],
            table_settings: vec![],
            reference_tables: vec![],
            workflow_type: WorkflowType::Materialize,
            workflow_sub_type: WorkflowSubType::None,
            options: WorkflowOptions::default(),
            stop_after_copy: false,
            auto_start: true,
            verify_schema: false,
            source_shard_filter: vec![],
            target_shard_filter: vec![],
        }
    }
}

/// A validated materialization plan bound to concrete shard sets.
pub struct Materializer {
    env: Env,
    pub settings: MaterializeSettings,
    /// `(shard name, key range)`, sorted.
    pub source_shards: Vec<(String, KeyRange)>,
    pub target_shards: Vec<(String, KeyRange)>,
}

impl Materializer {
    /// Validate the settings and resolve the shard sets.
    pub async fn prepare(env: Env, mut settings: MaterializeSettings) -> KestrelResult<Self> {
        if settings.workflow.is_empty() {
            return Err(KestrelError::InvalidArgument(
                "materialize settings need a workflow name".into(),
            ));
        }
        match (
            settings.table_settings.is_empty(),
            settings.reference_tables.is_empty(),
        ) {
            (true, true) => {
                return Err(KestrelError::InvalidArgument(
                    "materialize settings need table settings or reference tables".into(),
                ))
            }
            (false, false) => {
                return Err(KestrelError::InvalidArgument(
                    "materialize settings cannot mix table settings and reference tables".into(),
                ))
            }
            _ => {}
        }
        // Reference tables are sugar for verbatim copies.
        if !settings.reference_tables.is_empty() {
            settings.table_settings = settings
                .reference_tables
                .iter()
                .map(|t| TableSetting {
                    target_table: t.clone(),
                    source_expression: format!("select * from {t}"),
                    create_ddl: CREATE_DDL_AS_COPY.to_string(),
                })
                .collect();
        }

        let mut source_shards = shard_ranges(&env, &settings.source_keyspace).await?;
        let mut target_shards = shard_ranges(&env, &settings.target_keyspace).await?;
        if !settings.source_shard_filter.is_empty() {
            source_shards.retain(|(name, _)| settings.source_shard_filter.contains(name));
            if source_shards.is_empty() {
                return Err(KestrelError::NotFound(
                    "source shard filter matches no shards".into(),
                ));
            }
        }
        if !settings.target_shard_filter.is_empty() {
            target_shards.retain(|(name, _)| settings.target_shard_filter.contains(name));
            if target_shards.is_empty() {
                return Err(KestrelError::NotFound(
                    "target shard filter matches no shards".into(),
                ));
            }
        }
        Ok(Self {
            env,
            settings,
            source_shards,
            target_shards,
        })
    }

    /// Binlog sources for one target shard: a stream per intersecting
    /// source shard.
    pub fn generate_binlog_sources(&self, target_shard: &str) -> KestrelResult<Vec<BinlogSource>> {
        let target_range = self
            .target_shards
            .iter()
            .find(|(name, _)| name == target_shard)
            .map(|(_, r)| r.clone())
            .ok_or_else(|| {
                KestrelError::Internal(format!(
                    "target shard {target_shard} not in materializer plan"
                ))
            })?;

        let mut out = Vec::new();
        for (source_shard, source_range) in &self.source_shards {
            if !source_range.intersects(&target_range) {
                continue;
            }
            let ranges_equal = *source_range == target_range;
            let rules = self
                .settings
                .table_settings
                .iter()
                .map(|ts| FilterRule {
                    match_table: ts.target_table.clone(),
                    expression: ts.source_expression.clone(),
                    key_range: if ranges_equal {
                        None
                    } else {
                        Some(target_range.clone())
                    },
                })
                .collect();
            out.push(BinlogSource {
                keyspace: self.settings.source_keyspace.clone(),
                shard: source_shard.clone(),
                filter: Filter { rules },
                stop_after_copy: self.settings.stop_after_copy,
            });
        }
        Ok(out)
    }

    /// Deploy the target schema: fetch CREATEs from one source shard for
    /// copy-mode tables, apply every DDL on each target primary, and
    /// optionally compare afterwards.
    pub async fn deploy_schema(&self, ctx: &OpCtx) -> KestrelResult<()> {
        let mut ddls: BTreeMap<String, String> = BTreeMap::new();
        for ts in &self.settings.table_settings {
            if ts.create_ddl == CREATE_DDL_AS_COPY {
                let (source_shard, _) = &self.source_shards[0];
                let agent = self
                    .env
                    .agents
                    .agent_for(&self.settings.source_keyspace, source_shard)?;
                let fetched = agent
                    .get_schema(&[ts.target_table.clone()])
                    .await
                    .map_err(|e| {
                        e.wrap(format!(
                            "fetch schema for {} from {}/{}",
                            ts.target_table, self.settings.source_keyspace, source_shard
                        ))
                    })?;
                ddls.insert(ts.target_table.clone(), fetched[0].clone());
            } else {
                ddls.insert(ts.target_table.clone(), ts.create_ddl.clone());
            }
        }

        let targets = self.target_agents()?;
        let ddl_list: Vec<String> = ddls.values().cloned().collect();
        let ddl_list = std::sync::Arc::new(ddl_list);
        let dl = std::sync::Arc::clone(&ddl_list);
        fanout(
            ctx,
            "deploy target schema",
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

        if self.settings.verify_schema {
            let tables: Vec<String> = ddls.keys().cloned().collect();
            for (shard, agent) in self.target_agents()? {
                let present = agent.get_schema(&tables).await.map_err(|e| {
                    e.wrap(format!("verify schema on {}/{shard}", self.settings.target_keyspace))
                })?;
                for (table, ddl) in tables.iter().zip(present.iter()) {
                    if ddls.get(table) != Some(ddl) {
                        return Err(KestrelError::Internal(format!(
                            "schema mismatch for table {table} on target shard {shard} after copy"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Create the stream rows on every target shard. Streams are created
    /// stopped and started afterwards when `auto_start` is set, so a
    /// failed create never leaves half a workflow running.
    pub async fn create_streams(&self, ctx: &OpCtx) -> KestrelResult<()> {
        for (shard, agent) in self.target_agents()? {
            ctx.check("create streams")?;
            let sources = self.generate_binlog_sources(&shard)?;
            if sources.is_empty() {
                continue;
            }
            agent
                .create_workflow(&CreateWorkflowRequest {
                    workflow: self.settings.workflow.clone(),
                    workflow_type: self.settings.workflow_type,
                    workflow_sub_type: self.settings.workflow_sub_type,
                    binlog_sources: sources,
                    cells: self.settings.cells.clone(),
                    tablet_types: self.settings.tablet_types.clone(),
                    auto_start: false,
                    stop_after_copy: self.settings.stop_after_copy,
                    options: self.settings.options.clone(),
                })
                .await
                .map_err(|e| {
                    e.wrap(format!(
                        "create streams for {} on {}/{shard}",
                        self.settings.workflow, self.settings.target_keyspace
                    ))
                })?;
        }
        Ok(())
    }

    /// Start the created streams.
    pub async fn start_streams(&self, ctx: &OpCtx) -> KestrelResult<()> {
        for (shard, agent) in self.target_agents()? {
            ctx.check("start streams")?;
            agent
                .update_workflow(&kestrel_agent::types::UpdateWorkflowRequest {
                    workflow: self.settings.workflow.clone(),
                    state: Some(kestrel_agent::types::StreamState::Running),
                    ..Default::default()
                })
                .await
                .map_err(|e| e.wrap(format!("start streams on {shard}")))?;
        }
        Ok(())
    }

    /// Drop every stream row this materializer created.
    pub async fn drop_streams(&self) -> KestrelResult<()> {
        for (shard, agent) in self.target_agents()? {
            agent
                .delete_workflow(&self.settings.workflow)
                .await
                .map_err(|e| e.wrap(format!("drop streams on {shard}")))?;
        }
        Ok(())
    }

    fn target_agents(
        &self,
    ) -> KestrelResult<Vec<(String, std::sync::Arc<dyn kestrel_agent::ShardAgent>)>> {
        self.target_shards
            .iter()
            .map(|(shard, _)| {
                Ok((
                    shard.clone(),
                    self.env
                        .agents
                        .agent_for(&self.settings.target_keyspace, shard)?,
                ))
            })
            .collect()
    }
}

pub(crate) async fn shard_ranges(
    env: &Env,
    keyspace: &str,
) -> KestrelResult<Vec<(String, KeyRange)>> {
    let names = env.topo.get_shard_names(keyspace).await?;
    if names.is_empty() {
        return Err(KestrelError::NotFound(format!(
            "keyspace {keyspace} has no shards"
        )));
    }
    let mut out = Vec::with_capacity(names.len());
    for name in names {
        let record = env.topo.get_shard(keyspace, &name).await?.value;
        out.push((name, record.key_range));
    }
    Ok(out)
}
