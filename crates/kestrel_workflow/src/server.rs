//! The workflow server: public operation surface for workflow lifecycle,
//! traffic switching, mirroring, progress, and lookup-vindex management.
//!
//! Verb discipline:
//! - every verb resolves its timeout up front (sub-second is refused),
//! - mutating verbs hold the `<keyspace>/<workflow>` named lock for the
//!   whole verb; cutover steps additionally take keyspace locks,
//! - create verbs install artifacts in a fixed order with a deferred
//!   cleanup that undoes them on any failure,
//! - all state is re-derived from the topology store per verb.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use kestrel_agent::types::{StreamState, UpdateWorkflowRequest};
use kestrel_common::error::{ErrorCode, KestrelError, KestrelResult};
use kestrel_common::opctx::OpCtx;
use kestrel_common::types::{TabletType, WorkflowOptions, WorkflowSubType, WorkflowType};
use kestrel_topo::lock::{KeyspaceLock, NamedLock};
use kestrel_topo::routing::TrafficDirection;
use kestrel_topo::store::TopoStoreExt;
use kestrel_topo::vschema::{VSchema, VSchemaTable, Vindex};

use crate::fetcher::{FetchRequest, WorkflowFetcher};
use crate::materializer::{MaterializeSettings, Materializer, TableSetting, CREATE_DDL_AS_COPY};
use crate::progress::{get_copy_progress, CopyProgress};
use crate::resharder::{Resharder, ReshardRequest};
use crate::traffic::{
    DryRunRecorder, ExecuteActions, SwitchActions, SwitchRequest, SwitchResponse, TrafficSwitcher,
};
use crate::workflow::{is_reverse_name, reverse_name, Workflow, WorkflowState};
use crate::Env;

// ── Requests / responses ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MoveTablesCreateRequest {
    pub workflow: String,
    pub source_keyspace: String,
    pub target_keyspace: String,
    pub tables: Vec<String>,
    pub cells: Vec<String>,
    pub tablet_types: Vec<TabletType>,
    pub sub_type: WorkflowSubType,
    pub tenant_id: Option<String>,
    /// Shard scoping for partial migrations.
    pub source_shards: Vec<String>,
    pub target_shards: Vec<String>,
    pub auto_start: bool,
    pub stop_after_copy: bool,
    /// Skip the initial routing-rule install (expert use).
    pub no_routing_rules: bool,
    pub timeout: Option<Duration>,
}

impl Default for MoveTablesCreateRequest {
    fn default() -> Self {
        Self {
            workflow: String::new(),
            source_keyspace: String::new(),
            target_keyspace: String::new(),
            tables: vec![],
            cells: vec![],
            tablet_types: vec![],
            sub_type: WorkflowSubType::None,
            tenant_id: None,
            source_shards: vec![],
            target_shards: vec![],
            auto_start: true,
            stop_after_copy: false,
            no_routing_rules: false,
            timeout: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkflowDeleteRequest {
    pub keyspace: String,
    pub workflow: String,
    pub keep_data: bool,
    pub keep_routing_rules: bool,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct MoveTablesCompleteRequest {
    pub keyspace: String,
    pub workflow: String,
    pub keep_data: bool,
    pub keep_routing_rules: bool,
    /// Rename source tables out of the way instead of dropping them.
    pub rename_tables: bool,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct MirrorTrafficRequest {
    pub keyspace: String,
    pub workflow: String,
    pub tablet_types: Vec<TabletType>,
    pub percent: f32,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct WorkflowUpdateRequest {
    pub keyspace: String,
    pub update: UpdateWorkflowRequest,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct LookupVindexCreateRequest {
    /// Keyspace that owns the indexed table and gets the vindex entry.
    pub keyspace: String,
    pub workflow: String,
    pub vindex_name: String,
    pub vindex_type: String,
    pub owner_table: String,
    pub from_columns: Vec<String>,
    pub to_column: String,
    /// Keyspace hosting the backfilled lookup table.
    pub lookup_keyspace: String,
    /// DDL for the lookup table.
    pub lookup_table_ddl: String,
    pub cells: Vec<String>,
    pub tablet_types: Vec<TabletType>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct LookupVindexRequest {
    /// Keyspace that owns the vindex entry.
    pub keyspace: String,
    pub vindex_name: String,
    /// Where the backfill workflow runs.
    pub workflow_keyspace: String,
    pub workflow: String,
    pub keep_workflow: bool,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct StreamStatus {
    pub shard: String,
    pub id: u64,
    pub state: StreamState,
    pub position: String,
    pub message: String,
    pub throttled: bool,
}

#[derive(Debug, Clone)]
pub struct WorkflowStatusResponse {
    pub workflow: String,
    pub traffic_state: String,
    pub state: WorkflowState,
    pub max_v_replication_lag: u64,
    pub streams: Vec<StreamStatus>,
    pub copy_progress: Option<CopyProgress>,
}

// ── Server ──────────────────────────────────────────────────────────────────

pub struct WorkflowServer {
    env: Env,
    fetcher: WorkflowFetcher,
    /// Caps concurrent background jobs; at capacity the job is skipped,
    /// never queued.
    background_jobs: Arc<Semaphore>,
}

impl WorkflowServer {
    pub fn new(env: Env) -> Self {
        let background_jobs = Arc::new(Semaphore::new(env.config.background_job_capacity.max(1)));
        Self {
            fetcher: WorkflowFetcher::new(env.clone()),
            env,
            background_jobs,
        }
    }

    fn ctx(&self, timeout: Option<Duration>) -> KestrelResult<(OpCtx, Duration)> {
        let timeout = self.env.config.resolve_timeout(timeout)?;
        Ok((OpCtx::with_timeout(timeout), timeout))
    }

    // ── Reads ───────────────────────────────────────────────────────────

    pub async fn get_workflows(&self, req: &FetchRequest) -> KestrelResult<Vec<Workflow>> {
        let (ctx, _) = self.ctx(None)?;
        self.fetcher.fetch(&ctx, req).await
    }

    pub async fn get_workflow(&self, keyspace: &str, workflow: &str) -> KestrelResult<Workflow> {
        let (ctx, _) = self.ctx(None)?;
        self.fetcher.fetch_one(&ctx, keyspace, workflow).await
    }

    pub async fn workflow_status(
        &self,
        keyspace: &str,
        workflow: &str,
    ) -> KestrelResult<WorkflowStatusResponse> {
        let (ctx, _) = self.ctx(None)?;
        let wf = self.fetcher.fetch_one(&ctx, keyspace, workflow).await?;
        let ts = TrafficSwitcher::build(self.env.clone(), keyspace, workflow, &ctx).await?;
        let state = ts.workflow_state(&ctx).await?;
        let copy_progress = get_copy_progress(&self.env, &ctx, &wf).await?;
        let streams = wf
            .streams
            .iter()
            .map(|s| StreamStatus {
                shard: s.shard.clone(),
                id: s.row.id,
                state: s.row.state,
                position: s.row.position.to_string(),
                message: s.row.message.clone(),
                throttled: s.throttled,
            })
            .collect();
        Ok(WorkflowStatusResponse {
            workflow: workflow.to_string(),
            traffic_state: state.to_string(),
            max_v_replication_lag: wf.max_v_replication_lag,
            state,
            streams,
            copy_progress,
        })
    }

    pub async fn get_copy_progress(
        &self,
        keyspace: &str,
        workflow: &str,
    ) -> KestrelResult<Option<CopyProgress>> {
        let (ctx, _) = self.ctx(None)?;
        let wf = self.fetcher.fetch_one(&ctx, keyspace, workflow).await?;
        get_copy_progress(&self.env, &ctx, &wf).await
    }

    // ── Create verbs ────────────────────────────────────────────────────

    pub async fn move_tables_create(&self, req: &MoveTablesCreateRequest) -> KestrelResult<()> {
        self.tables_create(req, WorkflowType::MoveTables).await
    }

    /// Migrate: MoveTables whose source lives in an external cluster.
    pub async fn migrate_create(
        &self,
        req: &MoveTablesCreateRequest,
        external_cluster: &str,
    ) -> KestrelResult<()> {
        if external_cluster.is_empty() {
            return Err(KestrelError::InvalidArgument(
                "migrate requires an external cluster handle".into(),
            ));
        }
        self.tables_create_with(req, WorkflowType::Migrate, Some(external_cluster.to_string()))
            .await
    }

    async fn tables_create(
        &self,
        req: &MoveTablesCreateRequest,
        workflow_type: WorkflowType,
    ) -> KestrelResult<()> {
        self.tables_create_with(req, workflow_type, None).await
    }

    async fn tables_create_with(
        &self,
        req: &MoveTablesCreateRequest,
        workflow_type: WorkflowType,
        external_cluster: Option<String>,
    ) -> KestrelResult<()> {
        let (ctx, _) = self.ctx(req.timeout)?;

        if req.tables.is_empty() {
            return Err(KestrelError::InvalidArgument(
                "no tables to move".into(),
            ));
        }
        if is_reverse_name(&req.workflow) {
            return Err(KestrelError::InvalidArgument(format!(
                "workflow name {} is reserved for reverse workflows",
                req.workflow
            )));
        }
        match req.sub_type {
            WorkflowSubType::MultiTenant if req.tenant_id.is_none() => {
                return Err(KestrelError::InvalidArgument(
                    "multi-tenant workflows need a tenant id".into(),
                ))
            }
            WorkflowSubType::Partial if req.source_shards.is_empty() => {
                return Err(KestrelError::InvalidArgument(
                    "partial workflows need explicit source shards".into(),
                ))
            }
            _ => {}
        }
        if self
            .fetcher
            .exists(&ctx, &req.target_keyspace, &req.workflow)
            .await?
        {
            return Err(KestrelError::AlreadyExists(format!(
                "workflow {} already exists in keyspace {}",
                req.workflow, req.target_keyspace
            )));
        }

        let lock = NamedLock::acquire(
            self.env.topo.clone(),
            &req.target_keyspace,
            &req.workflow,
            "MoveTablesCreate",
            self.env.config.lock_ttl(Duration::from_secs(self.env.config.verb_timeout_secs)),
        )
        .await?;
        let result = self
            .tables_create_locked(&ctx, req, workflow_type, external_cluster)
            .await;
        lock.release().await;

        if result.is_ok() {
            self.spawn_copy_state_optimize(&req.target_keyspace, &req.target_shards);
        }
        result.map_err(|e| e.wrap(format!("create workflow {}", req.workflow)))
    }

    async fn tables_create_locked(
        &self,
        ctx: &OpCtx,
        req: &MoveTablesCreateRequest,
        workflow_type: WorkflowType,
        external_cluster: Option<String>,
    ) -> KestrelResult<()> {
        let options = WorkflowOptions {
            tenant_id: req.tenant_id.clone(),
            lookup_vindexes: vec![],
            disable_reverse_replication: false,
            external_cluster,
        };
        let settings = MaterializeSettings {
            workflow: req.workflow.clone(),
            source_keyspace: req.source_keyspace.clone(),
            target_keyspace: req.target_keyspace.clone(),
            cells: req.cells.clone(),
            tablet_types: req.tablet_types.clone(),
            table_settings: req
                .tables
                .iter()
                .map(|t| TableSetting {
                    target_table: t.clone(),
                    // Multi-tenant streams copy only the migrating tenant's rows.
                    source_expression: match (&req.sub_type, &req.tenant_id) {
                        (WorkflowSubType::MultiTenant, Some(tenant)) => {
                            format!("select * from {t} where tenant_id = '{tenant}'")
                        }
                        _ => format!("select * from {t}"),
                    },
                    create_ddl: CREATE_DDL_AS_COPY.to_string(),
                })
                .collect(),
            reference_tables: vec![],
            workflow_type,
            workflow_sub_type: req.sub_type,
            options,
            stop_after_copy: req.stop_after_copy,
            auto_start: req.auto_start,
            verify_schema: false,
            source_shard_filter: req.source_shards.clone(),
            target_shard_filter: req.target_shards.clone(),
        };
        let materializer = Materializer::prepare(self.env.clone(), settings).await?;
        let target_shards: Vec<String> = materializer
            .target_shards
            .iter()
            .map(|(s, _)| s.clone())
            .collect();

        let mut cleanup = CreateCleanup::new(self.env.clone(), req, target_shards.clone());

        // Artifact order: vschema → streams → routing rules → denied
        // tables → rebuild → start. The cleanup undoes in reverse.
        let result = self
            .install_tables_artifacts(ctx, req, &materializer, &target_shards, &mut cleanup)
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!(workflow = %req.workflow, error = %e, "create failed, running deferred cleanup");
                cleanup.run(&materializer).await;
                Err(e)
            }
        }
    }

    async fn install_tables_artifacts(
        &self,
        ctx: &OpCtx,
        req: &MoveTablesCreateRequest,
        materializer: &Materializer,
        target_shards: &[String],
        cleanup: &mut CreateCleanup,
    ) -> KestrelResult<()> {
        // Target vschema gets entries for the moved tables.
        let versioned = self.env.topo.get_vschema(&req.target_keyspace).await?;
        let mut vschema = versioned.value.clone();
        let mut changed = false;
        for t in &req.tables {
            if !vschema.tables.contains_key(t) {
                vschema.tables.insert(t.clone(), VSchemaTable::default());
                changed = true;
            }
        }
        if changed {
            self.env
                .topo
                .save_vschema(&req.target_keyspace, &vschema, versioned.version)
                .await?;
            cleanup.vschema_snapshot = Some(versioned.value);
        }

        materializer.deploy_schema(ctx).await?;
        // Flags are raised before each install so a half-landed step is
        // still undone.
        cleanup.streams_created = true;
        materializer.create_streams(ctx).await?;

        if !req.no_routing_rules {
            cleanup.routing_installed = true;
            self.install_initial_routing(req, target_shards).await?;
        }

        // Target-side write denial: nothing may write the moved tables on
        // the target until the cutover allows it.
        cleanup.denied_installed = true;
        for shard in target_shards {
            let tables = req.tables.clone();
            self.env
                .topo
                .update_shard_fields(&req.target_keyspace, shard, move |record| {
                    record.update_denied_tables(TabletType::Primary, &[], false, &tables)
                })
                .await?;
        }

        self.env.topo.rebuild_srv_vschema(&[]).await?;

        if req.auto_start {
            materializer.start_streams(ctx).await?;
        }
        tracing::info!(
            workflow = %req.workflow,
            source = %req.source_keyspace,
            target = %req.target_keyspace,
            tables = req.tables.len(),
            "workflow created"
        );
        Ok(())
    }

    /// Create-time routing: everything points at the source until a
    /// switch says otherwise.
    async fn install_initial_routing(
        &self,
        req: &MoveTablesCreateRequest,
        target_shards: &[String],
    ) -> KestrelResult<()> {
        match req.sub_type {
            WorkflowSubType::Partial => {
                let versioned = self.env.topo.get_shard_rules().await?;
                let mut rules = versioned.value;
                for shard in target_shards {
                    rules.set(&req.target_keyspace, shard, &req.source_keyspace);
                }
                self.env
                    .topo
                    .save_shard_rules(&rules, versioned.version)
                    .await?;
            }
            WorkflowSubType::MultiTenant => {
                let versioned = self.env.topo.get_keyspace_rules().await?;
                let mut rules = versioned.value;
                rules.switch_keyspace(&req.source_keyspace, &req.source_keyspace, &TabletType::ALL);
                self.env
                    .topo
                    .save_keyspace_rules(&rules, versioned.version)
                    .await?;
            }
            WorkflowSubType::None => {
                let versioned = self.env.topo.get_routing_rules().await?;
                let mut rules = versioned.value;
                rules.route_tables(
                    &req.source_keyspace,
                    &req.target_keyspace,
                    &req.tables,
                    &TabletType::ALL,
                    &req.source_keyspace,
                );
                self.env
                    .topo
                    .save_routing_rules(&rules, versioned.version)
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn reshard_create(&self, req: &ReshardRequest) -> KestrelResult<()> {
        let (ctx, _) = self.ctx(None)?;
        let lock = NamedLock::acquire(
            self.env.topo.clone(),
            &req.keyspace,
            &req.workflow,
            "ReshardCreate",
            self.env.config.lock_ttl(Duration::from_secs(self.env.config.verb_timeout_secs)),
        )
        .await?;
        let result = async {
            let plan = Resharder::prepare(self.env.clone(), req.clone(), &ctx).await?;
            plan.copy_schema(&ctx).await?;
            if let Err(e) = plan.create_streams(&ctx).await {
                // Partial stream creation is dropped wholesale.
                if let Err(cleanup_err) = plan.drop_streams().await {
                    tracing::warn!(error = %cleanup_err, "reshard cleanup failed");
                }
                return Err(e);
            }
            if req.auto_start {
                plan.start_streams(&ctx).await?;
            }
            tracing::info!(
                keyspace = %req.keyspace,
                workflow = %req.workflow,
                migration = plan.migration_id(),
                "reshard created"
            );
            Ok(())
        }
        .await;
        lock.release().await;
        if result.is_ok() {
            self.spawn_copy_state_optimize(&req.keyspace, &req.target_shards);
        }
        result.map_err(|e| e.wrap(format!("create reshard {}", req.workflow)))
    }

    pub async fn materialize_create(&self, settings: MaterializeSettings) -> KestrelResult<()> {
        let (ctx, _) = self.ctx(None)?;
        let workflow = settings.workflow.clone();
        let keyspace = settings.target_keyspace.clone();
        if self.fetcher.exists(&ctx, &keyspace, &workflow).await? {
            return Err(KestrelError::AlreadyExists(format!(
                "workflow {workflow} already exists in keyspace {keyspace}"
            )));
        }
        let lock = NamedLock::acquire(
            self.env.topo.clone(),
            &keyspace,
            &workflow,
            "MaterializeCreate",
            self.env.config.lock_ttl(Duration::from_secs(self.env.config.verb_timeout_secs)),
        )
        .await?;
        let auto_start = settings.auto_start;
        let result = async {
            let materializer = Materializer::prepare(self.env.clone(), settings).await?;
            materializer.deploy_schema(&ctx).await?;
            if let Err(e) = materializer.create_streams(&ctx).await {
                if let Err(cleanup_err) = materializer.drop_streams().await {
                    tracing::warn!(error = %cleanup_err, "materialize cleanup failed");
                }
                return Err(e);
            }
            if auto_start {
                materializer.start_streams(&ctx).await?;
            }
            Ok(())
        }
        .await;
        lock.release().await;
        result.map_err(|e| e.wrap(format!("create materialization {workflow}")))
    }

    // ── Update ──────────────────────────────────────────────────────────

    /// Fan the field-merge update out to every target shard. Returns the
    /// number of streams updated.
    pub async fn workflow_update(&self, req: &WorkflowUpdateRequest) -> KestrelResult<u64> {
        let (ctx, _) = self.ctx(req.timeout)?;
        let workflow = req.update.workflow.clone();
        let lock = NamedLock::acquire(
            self.env.topo.clone(),
            &req.keyspace,
            &workflow,
            "WorkflowUpdate",
            self.env.config.lock_ttl(Duration::from_secs(self.env.config.verb_timeout_secs)),
        )
        .await?;
        let result = async {
            let shards = self.fetcher.shard_agents(&req.keyspace, &[]).await?;
            let update = Arc::new(req.update.clone());
            let u = Arc::clone(&update);
            let updated = crate::fanout::fanout(
                &ctx,
                "update workflow",
                self.env.config.fanout_concurrency,
                shards,
                move |agent| {
                    let update = Arc::clone(&u);
                    async move { agent.update_workflow(&update).await }
                },
            )
            .await?;
            let total: u64 = updated.iter().map(|(_, n)| n).sum();
            if total == 0 {
                return Err(KestrelError::NotFound(format!(
                    "workflow {workflow} not found in keyspace {}",
                    req.keyspace
                )));
            }
            Ok(total)
        }
        .await;
        lock.release().await;
        result.map_err(|e| e.wrap(format!("update workflow {}", req.update.workflow)))
    }

    // ── Traffic verbs ───────────────────────────────────────────────────

    /// Switch read and/or write traffic. The requested tablet types pick
    /// the machine steps: read-only types run SwitchReads, primary runs
    /// SwitchWrites after them.
    pub async fn workflow_switch_traffic(&self, req: &SwitchRequest) -> KestrelResult<SwitchResponse> {
        let (ctx, _) = self.ctx(req.timeout)?;
        if req.tablet_types.is_empty() {
            return Err(KestrelError::InvalidArgument(
                "switch traffic needs at least one tablet type".into(),
            ));
        }

        let lock = NamedLock::acquire(
            self.env.topo.clone(),
            &req.keyspace,
            &req.workflow,
            "SwitchTraffic",
            self.env.config.lock_ttl(Duration::from_secs(self.env.config.verb_timeout_secs)),
        )
        .await?;
        let result = self.switch_traffic_locked(&ctx, req).await;
        lock.release().await;
        result
    }

    async fn switch_traffic_locked(
        &self,
        ctx: &OpCtx,
        req: &SwitchRequest,
    ) -> KestrelResult<SwitchResponse> {
        let wants_writes = req.tablet_types.iter().any(|t| t.is_primary());

        // The backward direction operates on the reverse workflow, which
        // lives on the original source keyspace; from there the machine
        // is walked forward.
        let (ts, effective) = match req.direction {
            TrafficDirection::Forward => {
                let ts =
                    TrafficSwitcher::build(self.env.clone(), &req.keyspace, &req.workflow, ctx)
                        .await?;
                (ts, req.clone())
            }
            TrafficDirection::Backward => {
                let forward = self
                    .fetcher
                    .fetch_one(ctx, &req.keyspace, &req.workflow)
                    .await?;
                if forward.is_multi_tenant() && wants_writes {
                    return Err(KestrelError::InvalidArgument(format!(
                        "cannot reverse writes for multi-tenant workflow {}: multiple tenants share the target tables",
                        req.workflow
                    )));
                }
                let source_keyspace = forward.source_keyspace.clone().ok_or_else(|| {
                    KestrelError::Internal(format!("workflow {} has no streams", req.workflow))
                })?;
                let ts = TrafficSwitcher::build(
                    self.env.clone(),
                    &source_keyspace,
                    &reverse_name(&req.workflow),
                    ctx,
                )
                .await?;
                let mut effective = req.clone();
                effective.direction = TrafficDirection::Forward;
                (ts, effective)
            }
        };

        let mut effective = effective;
        if ts.workflow.options.disable_reverse_replication {
            effective.enable_reverse_replication = false;
        }

        let start_state = ts.workflow_state(ctx).await?;

        let execute = ExecuteActions;
        let dry_run = DryRunRecorder::new();
        let actions: &dyn SwitchActions = if req.dry_run { &dry_run } else { &execute };

        let has_reads = effective.tablet_types.iter().any(|t| !t.is_primary());
        if has_reads {
            ts.switch_reads(ctx, &effective, actions).await?;
        }
        if wants_writes {
            ts.switch_writes(ctx, &effective, actions).await?;
        }

        let current_state = ts.workflow_state(ctx).await?;
        let summary = format!(
            "traffic switched for workflow {}: {}",
            req.workflow, current_state
        );
        tracing::info!(workflow = %req.workflow, state = %current_state, dry_run = req.dry_run, "switch traffic done");
        Ok(SwitchResponse {
            summary,
            start_state: start_state.to_string(),
            current_state: current_state.to_string(),
            dry_run_log: actions.log(),
        })
    }

    /// Mirror a percentage of read/write traffic to the target without
    /// affecting responses. MoveTables only; refused once the requested
    /// tablet types have switched.
    pub async fn workflow_mirror_traffic(&self, req: &MirrorTrafficRequest) -> KestrelResult<()> {
        let (ctx, _) = self.ctx(req.timeout)?;
        if req.tablet_types.is_empty() {
            return Err(KestrelError::InvalidArgument(
                "mirror traffic needs at least one tablet type".into(),
            ));
        }
        if is_reverse_name(&req.workflow) {
            return Err(KestrelError::InvalidArgument(
                "cannot mirror traffic for a reverse workflow".into(),
            ));
        }
        let ts = TrafficSwitcher::build(self.env.clone(), &req.keyspace, &req.workflow, &ctx).await?;
        if ts.workflow.workflow_type != Some(WorkflowType::MoveTables) {
            return Err(KestrelError::InvalidArgument(format!(
                "cannot mirror traffic for {} workflows",
                ts.workflow.workflow_type.map(|t| t.to_string()).unwrap_or_default()
            )));
        }
        if ts.is_partial() || ts.is_multi_tenant() {
            return Err(KestrelError::InvalidArgument(format!(
                "cannot mirror traffic for {} workflows",
                ts.workflow.sub_type
            )));
        }

        let state = ts.workflow_state(&ctx).await?;
        for tt in &req.tablet_types {
            let switched = match tt {
                TabletType::Primary => state.writes_switched,
                TabletType::Replica => !state.replica_cells_switched.is_empty(),
                TabletType::Rdonly => !state.rdonly_cells_switched.is_empty(),
            };
            if switched {
                return Err(KestrelError::FailedPrecondition(format!(
                    "cannot mirror traffic for workflow {}: traffic for those tablet types is switched",
                    req.workflow
                )));
            }
        }

        let versioned = self.env.topo.get_mirror_rules().await?;
        let mut rules = versioned.value;
        rules.set_mirror(
            &ts.source_keyspace,
            &ts.target_keyspace,
            &ts.tables,
            &req.tablet_types,
            req.percent,
        );
        self.env
            .topo
            .save_mirror_rules(&rules, versioned.version)
            .await?;
        self.env.topo.rebuild_srv_vschema(&[]).await?;
        tracing::info!(
            workflow = %req.workflow,
            percent = req.percent,
            "mirror rules updated"
        );
        Ok(())
    }

    // ── Delete / complete ───────────────────────────────────────────────

    /// Delete a workflow that has not switched writes. After writes are
    /// switched only a reverse followed by delete, or a complete, is
    /// legal.
    pub async fn workflow_delete(&self, req: &WorkflowDeleteRequest) -> KestrelResult<()> {
        let (ctx, timeout) = self.ctx(req.timeout)?;
        let ts = TrafficSwitcher::build(self.env.clone(), &req.keyspace, &req.workflow, &ctx).await?;
        let state = ts.workflow_state(&ctx).await?;
        if state.writes_switched {
            return Err(KestrelError::FailedPrecondition(format!(
                "cannot delete workflow {}: writes have been switched, reverse traffic first",
                req.workflow
            )));
        }

        let lock = KeyspaceLock::acquire(
            self.env.topo.clone(),
            &req.keyspace,
            "WorkflowDelete",
            self.env.config.lock_ttl(timeout),
        )
        .await?;
        let result = self.workflow_delete_locked(&ctx, req, &ts).await;
        lock.release().await;
        result.map_err(|e| e.wrap(format!("delete workflow {}", req.workflow)))
    }

    async fn workflow_delete_locked(
        &self,
        ctx: &OpCtx,
        req: &WorkflowDeleteRequest,
        ts: &TrafficSwitcher,
    ) -> KestrelResult<()> {
        // Streams first: target shards, then any reverse remnants on the
        // sources.
        for (shard, agent) in ts.target_agents()? {
            ctx.check("delete workflow")?;
            agent
                .delete_workflow(&req.workflow)
                .await
                .map_err(|e| e.wrap(format!("delete streams on {shard}")))?;
        }
        for (_, agent) in ts.source_agents()? {
            // Reverse streams may not exist; their absence is fine.
            let _ = agent.delete_workflow(&ts.reverse_workflow_name).await;
        }

        // Target data for table migrations, unless kept.
        if !req.keep_data && ts.migration_type == kestrel_common::types::MigrationType::Tables {
            for (shard, agent) in ts.target_agents()? {
                agent
                    .drop_tables(&ts.tables)
                    .await
                    .map_err(|e| e.wrap(format!("drop target tables on {shard}")))?;
            }
        }

        // Target-side denied tables from create time.
        for t in &ts.targets {
            let tables = ts.tables.clone();
            self.env
                .topo
                .update_shard_fields(&t.keyspace, &t.shard, move |record| {
                    let denied = record.denied_tables(TabletType::Primary);
                    let present: Vec<String> =
                        tables.iter().filter(|t| denied.contains(t)).cloned().collect();
                    if !present.is_empty() {
                        record.update_denied_tables(TabletType::Primary, &[], true, &present)?;
                    }
                    Ok(())
                })
                .await?;
        }

        if !req.keep_routing_rules {
            self.remove_workflow_routing(ts).await?;
        }
        self.env.topo.rebuild_srv_vschema(&[]).await?;
        tracing::info!(workflow = %req.workflow, keyspace = %req.keyspace, "workflow deleted");
        Ok(())
    }

    /// Retire a fully-switched MoveTables: drop the frozen target
    /// streams, the reverse streams, and the source tables.
    pub async fn move_tables_complete(&self, req: &MoveTablesCompleteRequest) -> KestrelResult<()> {
        let (ctx, timeout) = self.ctx(req.timeout)?;
        let ts = TrafficSwitcher::build(self.env.clone(), &req.keyspace, &req.workflow, &ctx).await?;
        let state = ts.workflow_state(&ctx).await?;
        if !state.fully_switched() {
            return Err(KestrelError::FailedPrecondition(format!(
                "cannot complete workflow {}: traffic is not fully switched ({state})",
                req.workflow
            )));
        }

        let source_lock = KeyspaceLock::acquire(
            self.env.topo.clone(),
            &ts.source_keyspace,
            "MoveTablesComplete",
            self.env.config.lock_ttl(timeout),
        )
        .await?;
        let target_lock = match KeyspaceLock::acquire(
            self.env.topo.clone(),
            &ts.target_keyspace,
            "MoveTablesComplete",
            self.env.config.lock_ttl(timeout),
        )
        .await
        {
            Ok(lock) => lock,
            Err(e) => {
                source_lock.release().await;
                return Err(e);
            }
        };

        let result = self.move_tables_complete_locked(&ctx, req, &ts).await;
        target_lock.release().await;
        source_lock.release().await;
        result.map_err(|e| e.wrap(format!("complete workflow {}", req.workflow)))
    }

    async fn move_tables_complete_locked(
        &self,
        ctx: &OpCtx,
        req: &MoveTablesCompleteRequest,
        ts: &TrafficSwitcher,
    ) -> KestrelResult<()> {
        for (shard, agent) in ts.target_agents()? {
            ctx.check("complete workflow")?;
            agent
                .delete_workflow(&req.workflow)
                .await
                .map_err(|e| e.wrap(format!("delete frozen streams on {shard}")))?;
        }
        for (_, agent) in ts.source_agents()? {
            let _ = agent.delete_workflow(&ts.reverse_workflow_name).await;
        }

        // Source tables are gone from the serving path; retire the data.
        if !req.keep_data {
            for (shard, agent) in ts.source_agents()? {
                if req.rename_tables {
                    for table in &ts.tables {
                        agent
                            .exec_dba(&format!("rename table {table} to _{table}_moved"))
                            .await
                            .map_err(|e| e.wrap(format!("rename {table} on {shard}")))?;
                    }
                } else {
                    agent
                        .drop_tables(&ts.tables)
                        .await
                        .map_err(|e| e.wrap(format!("drop source tables on {shard}")))?;
                }
            }
        }

        // Source-side denied tables from the write switch.
        for s in &ts.sources {
            let tables = ts.tables.clone();
            self.env
                .topo
                .update_shard_fields(&s.keyspace, &s.shard, move |record| {
                    let denied = record.denied_tables(TabletType::Primary);
                    let present: Vec<String> =
                        tables.iter().filter(|t| denied.contains(t)).cloned().collect();
                    if !present.is_empty() {
                        record.update_denied_tables(TabletType::Primary, &[], true, &present)?;
                    }
                    Ok(())
                })
                .await?;
        }

        if !req.keep_routing_rules {
            self.remove_workflow_routing(ts).await?;
        }
        // Rebuild is best-effort here: the verbs' artifacts are already
        // gone and routers converge on the next rebuild.
        if let Err(e) = self.env.topo.rebuild_srv_vschema(&[]).await {
            tracing::warn!(error = %e, "served vschema rebuild after complete failed");
        }
        tracing::info!(workflow = %req.workflow, "workflow completed");
        Ok(())
    }

    /// Drop the table rules and mirror rules a workflow installed.
    /// Keyspace and shard rules express permanent routing after a switch
    /// and are only cleaned when still pointing at the source.
    async fn remove_workflow_routing(&self, ts: &TrafficSwitcher) -> KestrelResult<()> {
        let versioned = self.env.topo.get_routing_rules().await?;
        let mut rules = versioned.value;
        rules.delete_table_rules(&ts.source_keyspace, &ts.target_keyspace, &ts.tables);
        self.env
            .topo
            .save_routing_rules(&rules, versioned.version)
            .await?;

        let versioned = self.env.topo.get_mirror_rules().await?;
        let mut mirror = versioned.value;
        mirror.remove_mirror(&ts.source_keyspace, &ts.tables, &TabletType::ALL);
        self.env
            .topo
            .save_mirror_rules(&mirror, versioned.version)
            .await?;

        if ts.is_partial() {
            let versioned = self.env.topo.get_shard_rules().await?;
            let mut shard_rules = versioned.value;
            for t in &ts.targets {
                if shard_rules.get(&ts.target_keyspace, &t.shard) == Some(ts.source_keyspace.as_str())
                {
                    shard_rules.delete(&ts.target_keyspace, &t.shard);
                }
            }
            self.env
                .topo
                .save_shard_rules(&shard_rules, versioned.version)
                .await?;
        }
        Ok(())
    }

    // ── Lookup vindex verbs ─────────────────────────────────────────────

    /// Create a write-only lookup vindex plus its backfill workflow.
    pub async fn lookup_vindex_create(&self, req: &LookupVindexCreateRequest) -> KestrelResult<()> {
        let (ctx, _) = self.ctx(req.timeout)?;
        if req.from_columns.is_empty() {
            return Err(KestrelError::InvalidArgument(
                "lookup vindex needs at least one from column".into(),
            ));
        }

        let versioned = self.env.topo.get_vschema(&req.keyspace).await?;
        let mut vschema = versioned.value.clone();
        if vschema.vindexes.contains_key(&req.vindex_name) {
            return Err(KestrelError::AlreadyExists(format!(
                "vindex {} already exists in keyspace {}",
                req.vindex_name, req.keyspace
            )));
        }
        let mut params = std::collections::BTreeMap::new();
        params.insert(
            "table".to_string(),
            format!("{}.{}", req.lookup_keyspace, req.vindex_name),
        );
        params.insert("from".to_string(), req.from_columns.join(","));
        params.insert("to".to_string(), req.to_column.clone());
        vschema.vindexes.insert(
            req.vindex_name.clone(),
            Vindex {
                vindex_type: req.vindex_type.clone(),
                params,
                owner: Some(req.owner_table.clone()),
                write_only: true,
            },
        );
        vschema
            .tables
            .entry(req.owner_table.clone())
            .or_insert_with(VSchemaTable::default)
            .column_vindexes
            .push(kestrel_topo::vschema::ColumnVindex {
                column: req.from_columns[0].clone(),
                vindex: req.vindex_name.clone(),
            });
        self.env
            .topo
            .save_vschema(&req.keyspace, &vschema, versioned.version)
            .await?;

        let settings = MaterializeSettings {
            workflow: req.workflow.clone(),
            source_keyspace: req.keyspace.clone(),
            target_keyspace: req.lookup_keyspace.clone(),
            cells: req.cells.clone(),
            tablet_types: req.tablet_types.clone(),
            table_settings: vec![TableSetting {
                target_table: req.vindex_name.clone(),
                source_expression: format!(
                    "select {}, keyspace_id() from {}",
                    req.from_columns.join(", "),
                    req.owner_table
                ),
                create_ddl: req.lookup_table_ddl.clone(),
            }],
            reference_tables: vec![],
            workflow_type: WorkflowType::CreateLookupIndex,
            workflow_sub_type: WorkflowSubType::None,
            options: WorkflowOptions {
                lookup_vindexes: vec![req.vindex_name.clone()],
                ..Default::default()
            },
            stop_after_copy: true,
            auto_start: true,
            verify_schema: false,
            source_shard_filter: vec![],
            target_shard_filter: vec![],
        };

        let result = async {
            let materializer = Materializer::prepare(self.env.clone(), settings).await?;
            materializer.deploy_schema(&ctx).await?;
            if let Err(e) = materializer.create_streams(&ctx).await {
                // Half-created backfill streams come out wholesale.
                if let Err(cleanup_err) = materializer.drop_streams().await {
                    tracing::warn!(error = %cleanup_err, "backfill stream cleanup failed");
                }
                return Err(e);
            }
            materializer.start_streams(&ctx).await?;
            Ok(())
        }
        .await;
        if let Err(e) = result {
            // Roll the vschema edit back so a failed create leaves no
            // half-defined vindex behind.
            let current = self.env.topo.get_vschema(&req.keyspace).await?;
            let mut restored = current.value.clone();
            restored.vindexes.remove(&req.vindex_name);
            if let Some(table) = restored.tables.get_mut(&req.owner_table) {
                table.column_vindexes.retain(|cv| cv.vindex != req.vindex_name);
            }
            // An owner-table entry synthesized by this create is removed
            // again once it holds nothing.
            if restored.tables.get(&req.owner_table) == Some(&VSchemaTable::default()) {
                restored.tables.remove(&req.owner_table);
            }
            if let Err(cleanup_err) = self
                .env
                .topo
                .save_vschema(&req.keyspace, &restored, current.version)
                .await
            {
                tracing::warn!(error = %cleanup_err, "vschema rollback after failed vindex create failed");
            }
            return Err(e.wrap(format!("create lookup vindex {}", req.vindex_name)));
        }
        Ok(())
    }

    /// Make a backfilled lookup vindex visible for routing.
    pub async fn lookup_vindex_externalize(&self, req: &LookupVindexRequest) -> KestrelResult<()> {
        let (ctx, _) = self.ctx(req.timeout)?;
        let wf = self
            .fetcher
            .fetch_one(&ctx, &req.workflow_keyspace, &req.workflow)
            .await?;
        if wf.is_copying() {
            return Err(KestrelError::FailedPrecondition(format!(
                "cannot externalize vindex {}: backfill is still copying",
                req.vindex_name
            )));
        }
        self.set_vindex_write_only(&req.keyspace, &req.vindex_name, false)
            .await?;
        if !req.keep_workflow {
            for shard in wf.target_shards() {
                let agent = self.env.agents.agent_for(&req.workflow_keyspace, &shard)?;
                agent.delete_workflow(&req.workflow).await?;
            }
        }
        Ok(())
    }

    /// Take an externalized vindex back to write-only (backfill repair).
    pub async fn lookup_vindex_internalize(&self, req: &LookupVindexRequest) -> KestrelResult<()> {
        let (_ctx, _) = self.ctx(req.timeout)?;
        self.set_vindex_write_only(&req.keyspace, &req.vindex_name, true)
            .await
    }

    /// Finish the lookup-vindex lifecycle: vindex stays, workflow goes.
    pub async fn lookup_vindex_complete(&self, req: &LookupVindexRequest) -> KestrelResult<()> {
        let (ctx, _) = self.ctx(req.timeout)?;
        let versioned = self.env.topo.get_vschema(&req.keyspace).await?;
        match versioned.value.vindexes.get(&req.vindex_name) {
            None => {
                return Err(KestrelError::NotFound(format!(
                    "vindex {} not found in keyspace {}",
                    req.vindex_name, req.keyspace
                )))
            }
            Some(v) if v.write_only => {
                return Err(KestrelError::FailedPrecondition(format!(
                    "cannot complete vindex {}: it has not been externalized",
                    req.vindex_name
                )))
            }
            Some(_) => {}
        }
        let wf = self
            .fetcher
            .fetch_one(&ctx, &req.workflow_keyspace, &req.workflow)
            .await;
        match wf {
            Ok(wf) => {
                for shard in wf.target_shards() {
                    let agent = self.env.agents.agent_for(&req.workflow_keyspace, &shard)?;
                    agent.delete_workflow(&req.workflow).await?;
                }
            }
            Err(e) if e.code() == ErrorCode::NotFound => {}
            Err(e) => return Err(e),
        }
        Ok(())
    }

    async fn set_vindex_write_only(
        &self,
        keyspace: &str,
        vindex: &str,
        write_only: bool,
    ) -> KestrelResult<()> {
        let versioned = self.env.topo.get_vschema(keyspace).await?;
        let mut vschema = versioned.value;
        match vschema.vindexes.get_mut(vindex) {
            Some(v) => v.write_only = write_only,
            None => {
                return Err(KestrelError::NotFound(format!(
                    "vindex {vindex} not found in keyspace {keyspace}"
                )))
            }
        }
        self.env
            .topo
            .save_vschema(keyspace, &vschema, versioned.version)
            .await?;
        self.env.topo.rebuild_srv_vschema(&[]).await?;
        Ok(())
    }

    // ── Background jobs ─────────────────────────────────────────────────

    /// Post-create copy-state maintenance. At capacity the job is skipped
    /// outright rather than queued behind other work.
    fn spawn_copy_state_optimize(&self, keyspace: &str, shards: &[String]) {
        let permit = match Arc::clone(&self.background_jobs).try_acquire_owned() {
            Ok(p) => p,
            Err(_) => {
                tracing::debug!(keyspace, "copy-state optimize skipped: at capacity");
                return;
            }
        };
        let env = self.env.clone();
        let keyspace = keyspace.to_string();
        let shards = shards.to_vec();
        tokio::spawn(async move {
            let _permit = permit;
            let shard_names = if shards.is_empty() {
                match env.topo.get_shard_names(&keyspace).await {
                    Ok(names) => names,
                    Err(e) => {
                        tracing::warn!(keyspace, error = %e, "optimize: shard enumeration failed");
                        return;
                    }
                }
            } else {
                shards
            };
            for shard in shard_names {
                let agent = match env.agents.agent_for(&keyspace, &shard) {
                    Ok(a) => a,
                    Err(e) => {
                        tracing::debug!(keyspace, shard, error = %e, "optimize: no agent");
                        continue;
                    }
                };
                if let Err(e) = agent.exec_dba("optimize table copy_state").await {
                    tracing::debug!(keyspace, shard, error = %e, "optimize failed");
                }
            }
        });
    }
}

/// Records which create artifacts landed so a failed create undoes
/// exactly those. Cleanup failures are logged, never surfaced, so the
/// original create error survives.
struct CreateCleanup {
    env: Env,
    workflow: String,
    source_keyspace: String,
    target_keyspace: String,
    tables: Vec<String>,
    sub_type: WorkflowSubType,
    target_shards: Vec<String>,
    vschema_snapshot: Option<VSchema>,
    streams_created: bool,
    routing_installed: bool,
    denied_installed: bool,
}

impl CreateCleanup {
    fn new(env: Env, req: &MoveTablesCreateRequest, target_shards: Vec<String>) -> Self {
        Self {
            env,
            workflow: req.workflow.clone(),
            source_keyspace: req.source_keyspace.clone(),
            target_keyspace: req.target_keyspace.clone(),
            tables: req.tables.clone(),
            sub_type: req.sub_type,
            target_shards,
            vschema_snapshot: None,
            streams_created: false,
            routing_installed: false,
            denied_installed: false,
        }
    }

    async fn run(self, materializer: &Materializer) {
        if self.denied_installed {
            for shard in &self.target_shards {
                let tables = self.tables.clone();
                let result = self
                    .env
                    .topo
                    .update_shard_fields(&self.target_keyspace, shard, move |record| {
                        let denied = record.denied_tables(TabletType::Primary);
                        let present: Vec<String> =
                            tables.iter().filter(|t| denied.contains(t)).cloned().collect();
                        if !present.is_empty() {
                            record.update_denied_tables(TabletType::Primary, &[], true, &present)?;
                        }
                        Ok(())
                    })
                    .await;
                if let Err(e) = result {
                    tracing::warn!(shard, error = %e, "cleanup: denied-table removal failed");
                }
            }
        }
        if self.routing_installed {
            if let Err(e) = self.remove_routing().await {
                tracing::warn!(error = %e, "cleanup: routing removal failed");
            }
        }
        if self.streams_created {
            if let Err(e) = materializer.drop_streams().await {
                tracing::warn!(error = %e, "cleanup: stream removal failed");
            }
        }
        if let Some(snapshot) = self.vschema_snapshot {
            let current = self.env.topo.get_vschema(&self.target_keyspace).await;
            match current {
                Ok(current) => {
                    if let Err(e) = self
                        .env
                        .topo
                        .save_vschema(&self.target_keyspace, &snapshot, current.version)
                        .await
                    {
                        tracing::warn!(error = %e, "cleanup: vschema restore failed");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "cleanup: vschema read failed"),
            }
        }
        if let Err(e) = self.env.topo.rebuild_srv_vschema(&[]).await {
            tracing::warn!(error = %e, "cleanup: served vschema rebuild failed");
        }
        tracing::info!(workflow = %self.workflow, "deferred cleanup finished");
    }

    async fn remove_routing(&self) -> KestrelResult<()> {
        match self.sub_type {
            WorkflowSubType::Partial => {
                let versioned = self.env.topo.get_shard_rules().await?;
                let mut rules = versioned.value;
                for shard in &self.target_shards {
                    rules.delete(&self.target_keyspace, shard);
                }
                self.env.topo.save_shard_rules(&rules, versioned.version).await?;
            }
            WorkflowSubType::MultiTenant => {
                let versioned = self.env.topo.get_keyspace_rules().await?;
                let mut rules = versioned.value;
                rules.delete_keyspace(&self.source_keyspace);
                self.env
                    .topo
                    .save_keyspace_rules(&rules, versioned.version)
                    .await?;
            }
            WorkflowSubType::None => {
                let versioned = self.env.topo.get_routing_rules().await?;
                let mut rules = versioned.value;
                rules.delete_table_rules(&self.source_keyspace, &self.target_keyspace, &self.tables);
                self.env
                    .topo
                    .save_routing_rules(&rules, versioned.version)
                    .await?;
            }
        }
        Ok(())
    }
}
