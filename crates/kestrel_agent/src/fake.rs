//! In-process shard agent used by tests and local exercises.
//!
//! Holds the same state a real agent keeps in its sidecar schema and
//! exposes fault-injection knobs so cutover failure paths can be driven
//! deterministically.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use kestrel_common::error::{KestrelError, KestrelResult};
use kestrel_common::types::{now_unix_secs, Position};

use crate::types::{
    trim_stream_logs, CopyStateRow, CreateWorkflowRequest, Journal, ReadWorkflowsRequest,
    StreamLog, StreamRow, StreamState, TableStats, UpdateWorkflowRequest, FROZEN_MESSAGE,
};
use crate::ShardAgent;

/// Log lines kept per stream.
const LOG_RETENTION: usize = 100;

/// Fault-injection state for one fake agent. Armed errors are consumed
/// FIFO per method; the unavailable flag fails every call until cleared.
#[derive(Default)]
pub struct AgentFaults {
    queued: Mutex<HashMap<&'static str, Vec<KestrelError>>>,
    unavailable: AtomicBool,
}

impl AgentFaults {
    /// Arm `err` to be returned by the next call to `method`.
    pub fn inject(&self, method: &'static str, err: KestrelError) {
        self.queued.lock().entry(method).or_default().push(err);
    }

    /// Fail every call until `revive`.
    pub fn kill(&self) {
        self.unavailable.store(true, Ordering::SeqCst);
    }

    pub fn revive(&self) {
        self.unavailable.store(false, Ordering::SeqCst);
    }

    fn check(&self, method: &'static str, shard: &str) -> KestrelResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(KestrelError::Unavailable(format!(
                "agent for {shard} is down"
            )));
        }
        let mut queued = self.queued.lock();
        if let Some(errs) = queued.get_mut(method) {
            if !errs.is_empty() {
                return Err(errs.remove(0));
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct FakeState {
    streams: BTreeMap<u64, StreamRow>,
    copy_state: BTreeMap<u64, Vec<CopyStateRow>>,
    journals: HashMap<u64, Journal>,
    applied_ddls: Vec<String>,
    schema: BTreeMap<String, String>,
    dba_queries: Vec<String>,
    table_stats: BTreeMap<String, TableStats>,
    sequences_reset: Vec<String>,
    dropped_tables: Vec<String>,
    lock_cycles: u64,
    refresh_count: u64,
}

/// In-memory `ShardAgent`.
pub struct FakeAgent {
    keyspace: String,
    shard: String,
    state: Mutex<FakeState>,
    primary_pos: Mutex<Position>,
    next_stream_id: AtomicU64,
    /// When set (the default), waiting for a position simply advances the
    /// matching streams to it, simulating instant catch-up.
    auto_catchup: AtomicBool,
    permissions_error: Mutex<Option<KestrelError>>,
    pub faults: AgentFaults,
}

impl FakeAgent {
    pub fn new(keyspace: &str, shard: &str) -> Self {
        Self {
            keyspace: keyspace.to_string(),
            shard: shard.to_string(),
            state: Mutex::new(FakeState::default()),
            primary_pos: Mutex::new(Position::new()),
            next_stream_id: AtomicU64::new(1),
            auto_catchup: AtomicBool::new(true),
            permissions_error: Mutex::new(None),
            faults: AgentFaults::default(),
        }
    }

    // ── test drivers ────────────────────────────────────────────────────

    /// Move the shard's own replication position forward.
    pub fn advance_primary_position(&self, source: &str, sequence: u64) {
        self.primary_pos.lock().advance(source, sequence);
    }

    pub fn set_auto_catchup(&self, on: bool) {
        self.auto_catchup.store(on, Ordering::SeqCst);
    }

    /// Mutate one stream row in place (state, timestamps, throttling).
    pub fn with_stream<F: FnOnce(&mut StreamRow)>(&self, id: u64, f: F) {
        let mut state = self.state.lock();
        if let Some(row) = state.streams.get_mut(&id) {
            f(row);
        }
    }

    /// Mutate every stream of a workflow.
    pub fn with_workflow_streams<F: Fn(&mut StreamRow)>(&self, workflow: &str, f: F) {
        let mut state = self.state.lock();
        for row in state.streams.values_mut().filter(|r| r.workflow == workflow) {
            f(row);
        }
    }

    pub fn set_copy_state(&self, stream_id: u64, rows: Vec<CopyStateRow>) {
        self.state.lock().copy_state.insert(stream_id, rows);
    }

    pub fn set_table_stats(&self, table: &str, stats: TableStats) {
        self.state.lock().table_stats.insert(table.to_string(), stats);
    }

    pub fn set_schema(&self, table: &str, create_ddl: &str) {
        self.state
            .lock()
            .schema
            .insert(table.to_string(), create_ddl.to_string());
    }

    pub fn set_permissions_error(&self, err: Option<KestrelError>) {
        *self.permissions_error.lock() = err;
    }

    // ── test observers ──────────────────────────────────────────────────

    pub fn streams(&self) -> Vec<StreamRow> {
        self.state.lock().streams.values().cloned().collect()
    }

    pub fn journals(&self) -> Vec<Journal> {
        self.state.lock().journals.values().cloned().collect()
    }

    pub fn applied_ddls(&self) -> Vec<String> {
        self.state.lock().applied_ddls.clone()
    }

    pub fn dba_queries(&self) -> Vec<String> {
        self.state.lock().dba_queries.clone()
    }

    pub fn lock_cycles(&self) -> u64 {
        self.state.lock().lock_cycles
    }

    pub fn refresh_count(&self) -> u64 {
        self.state.lock().refresh_count
    }

    pub fn sequences_reset(&self) -> Vec<String> {
        self.state.lock().sequences_reset.clone()
    }

    pub fn dropped_tables(&self) -> Vec<String> {
        self.state.lock().dropped_tables.clone()
    }
}

#[async_trait]
impl ShardAgent for FakeAgent {
    fn shard_key(&self) -> String {
        format!("{}/{}", self.keyspace, self.shard)
    }

    async fn read_workflows(&self, req: &ReadWorkflowsRequest) -> KestrelResult<Vec<StreamRow>> {
        self.faults.check("read_workflows", &self.shard_key())?;
        let state = self.state.lock();
        let mut rows: Vec<StreamRow> = state
            .streams
            .values()
            .filter(|r| req.workflows.is_empty() || req.workflows.contains(&r.workflow))
            .filter(|r| !(req.exclude_frozen && r.message == FROZEN_MESSAGE))
            .cloned()
            .map(|mut r| {
                if !req.include_logs {
                    r.logs.clear();
                }
                r
            })
            .collect();
        rows.sort_by_key(|r| r.id);
        Ok(rows)
    }

    async fn create_workflow(&self, req: &CreateWorkflowRequest) -> KestrelResult<Vec<u64>> {
        self.faults.check("create_workflow", &self.shard_key())?;
        let mut state = self.state.lock();
        if state.streams.values().any(|r| r.workflow == req.workflow) {
            return Err(KestrelError::AlreadyExists(format!(
                "workflow {} already exists on shard {}",
                req.workflow,
                self.shard_key()
            )));
        }
        let now = now_unix_secs();
        let mut ids = Vec::with_capacity(req.binlog_sources.len());
        for source in &req.binlog_sources {
            let id = self.next_stream_id.fetch_add(1, Ordering::SeqCst);
            let row = StreamRow {
                id,
                workflow: req.workflow.clone(),
                workflow_type: Some(req.workflow_type),
                workflow_sub_type: req.workflow_sub_type,
                binlog_source: source.clone(),
                state: if req.auto_start {
                    StreamState::Running
                } else {
                    StreamState::Stopped
                },
                position: Position::new(),
                stop_position: None,
                message: String::new(),
                transaction_timestamp: now,
                time_updated: now,
                time_throttled: 0,
                component_throttled: String::new(),
                rows_copied: 0,
                options: req.options.clone(),
                logs: Vec::new(),
            };
            state.streams.insert(id, row);
            ids.push(id);
        }
        Ok(ids)
    }

    async fn update_workflow(&self, req: &UpdateWorkflowRequest) -> KestrelResult<u64> {
        self.faults.check("update_workflow", &self.shard_key())?;
        let mut state = self.state.lock();
        let now = now_unix_secs();
        let mut updated = 0;
        for row in state
            .streams
            .values_mut()
            .filter(|r| r.workflow == req.workflow)
        {
            if let Some(s) = req.state {
                row.state = s;
            }
            if let Some(m) = &req.message {
                row.message = m.clone();
            }
            if let Some(p) = &req.stop_position {
                row.stop_position = Some(p.clone());
            }
            if let Some(sources) = &req.binlog_sources {
                if let Some(src) = sources.get(&row.id) {
                    row.binlog_source = src.clone();
                }
            }
            row.time_updated = now;
            row.logs.push(StreamLog {
                at_unix_secs: now,
                state: row.state,
                message: row.message.clone(),
            });
            trim_stream_logs(&mut row.logs, LOG_RETENTION)?;
            updated += 1;
        }
        Ok(updated)
    }

    async fn delete_workflow(&self, workflow: &str) -> KestrelResult<()> {
        self.faults.check("delete_workflow", &self.shard_key())?;
        let mut state = self.state.lock();
        let ids: Vec<u64> = state
            .streams
            .values()
            .filter(|r| r.workflow == workflow)
            .map(|r| r.id)
            .collect();
        for id in ids {
            state.streams.remove(&id);
            state.copy_state.remove(&id);
        }
        Ok(())
    }

    async fn copy_state(
        &self,
        stream_ids: &[u64],
    ) -> KestrelResult<BTreeMap<u64, Vec<CopyStateRow>>> {
        self.faults.check("copy_state", &self.shard_key())?;
        let state = self.state.lock();
        Ok(stream_ids
            .iter()
            .filter_map(|id| state.copy_state.get(id).map(|rows| (*id, rows.clone())))
            .collect())
    }

    async fn primary_position(&self) -> KestrelResult<Position> {
        self.faults.check("primary_position", &self.shard_key())?;
        Ok(self.primary_pos.lock().clone())
    }

    async fn wait_for_workflow_position(
        &self,
        workflow: &str,
        pos: &Position,
        timeout: Duration,
    ) -> KestrelResult<()> {
        self.faults
            .check("wait_for_workflow_position", &self.shard_key())?;
        if self.auto_catchup.load(Ordering::SeqCst) {
            let mut state = self.state.lock();
            for row in state
                .streams
                .values_mut()
                .filter(|r| r.workflow == workflow)
            {
                row.position.join(pos);
                row.transaction_timestamp = now_unix_secs();
            }
            return Ok(());
        }
        let deadline = Instant::now() + timeout;
        loop {
            {
                let state = self.state.lock();
                let caught_up = state
                    .streams
                    .values()
                    .filter(|r| r.workflow == workflow)
                    .all(|r| r.position.at_least(pos));
                if caught_up {
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(KestrelError::DeadlineExceeded(format!(
                    "shard {} streams did not reach {pos} within {}ms",
                    self.shard_key(),
                    timeout.as_millis()
                )));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn refresh_state(&self) -> KestrelResult<()> {
        self.faults.check("refresh_state", &self.shard_key())?;
        self.state.lock().refresh_count += 1;
        Ok(())
    }

    async fn apply_schema(&self, ddl: &str) -> KestrelResult<()> {
        self.faults.check("apply_schema", &self.shard_key())?;
        self.state.lock().applied_ddls.push(ddl.to_string());
        Ok(())
    }

    async fn get_schema(&self, tables: &[String]) -> KestrelResult<Vec<String>> {
        self.faults.check("get_schema", &self.shard_key())?;
        let state = self.state.lock();
        // Empty table list means the whole schema.
        if tables.is_empty() {
            return Ok(state.schema.values().cloned().collect());
        }
        let mut out = Vec::new();
        for t in tables {
            match state.schema.get(t) {
                Some(ddl) => out.push(ddl.clone()),
                None => {
                    return Err(KestrelError::NotFound(format!(
                        "table {t} not found on shard {}",
                        self.shard_key()
                    )))
                }
            }
        }
        Ok(out)
    }

    async fn exec_dba(&self, query: &str) -> KestrelResult<u64> {
        self.faults.check("exec_dba", &self.shard_key())?;
        self.state.lock().dba_queries.push(query.to_string());
        Ok(0)
    }

    async fn lock_tables_cycle(&self, _tables: &[String]) -> KestrelResult<()> {
        self.faults.check("lock_tables_cycle", &self.shard_key())?;
        self.state.lock().lock_cycles += 1;
        Ok(())
    }

    async fn reset_sequences(&self, tables: &[String]) -> KestrelResult<()> {
        self.faults.check("reset_sequences", &self.shard_key())?;
        self.state.lock().sequences_reset.extend_from_slice(tables);
        Ok(())
    }

    async fn drop_tables(&self, tables: &[String]) -> KestrelResult<()> {
        self.faults.check("drop_tables", &self.shard_key())?;
        self.state.lock().dropped_tables.extend_from_slice(tables);
        Ok(())
    }

    async fn table_stats(&self, tables: &[String]) -> KestrelResult<BTreeMap<String, TableStats>> {
        self.faults.check("table_stats", &self.shard_key())?;
        let state = self.state.lock();
        Ok(tables
            .iter()
            .filter_map(|t| state.table_stats.get(t).map(|s| (t.clone(), *s)))
            .collect())
    }

    async fn create_journal(&self, journal: &Journal) -> KestrelResult<()> {
        self.faults.check("create_journal", &self.shard_key())?;
        let mut state = self.state.lock();
        // Journal creation is exactly-once per migration id.
        if state.journals.contains_key(&journal.id) {
            return Err(KestrelError::AlreadyExists(format!(
                "journal {} already exists on shard {}",
                journal.id,
                self.shard_key()
            )));
        }
        state.journals.insert(journal.id, journal.clone());
        Ok(())
    }

    async fn read_journal(&self, migration_id: u64) -> KestrelResult<Option<Journal>> {
        self.faults.check("read_journal", &self.shard_key())?;
        Ok(self.state.lock().journals.get(&migration_id).cloned())
    }

    async fn validate_vreplication_permissions(&self) -> KestrelResult<()> {
        self.faults
            .check("validate_vreplication_permissions", &self.shard_key())?;
        match self.permissions_error.lock().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BinlogSource, Filter, FilterRule};
    use kestrel_common::error::ErrorCode;
    use kestrel_common::types::{WorkflowOptions, WorkflowSubType, WorkflowType};

    fn create_req(workflow: &str) -> CreateWorkflowRequest {
        CreateWorkflowRequest {
            workflow: workflow.to_string(),
            workflow_type: WorkflowType::MoveTables,
            workflow_sub_type: WorkflowSubType::None,
            binlog_sources: vec![BinlogSource {
                keyspace: "ks1".into(),
                shard: "0".into(),
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
    async fn test_create_read_delete_workflow() {
        let agent = FakeAgent::new("ks2", "0");
        let ids = agent.create_workflow(&create_req("wf")).await.unwrap();
        assert_eq!(ids.len(), 1);

        // Duplicate create refused.
        let err = agent.create_workflow(&create_req("wf")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::AlreadyExists);

        let rows = agent
            .read_workflows(&ReadWorkflowsRequest::default())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].state, StreamState::Running);

        agent.delete_workflow("wf").await.unwrap();
        assert!(agent
            .read_workflows(&ReadWorkflowsRequest::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_exclude_frozen_filter() {
        let agent = FakeAgent::new("ks2", "0");
        agent.create_workflow(&create_req("wf")).await.unwrap();
        agent.with_workflow_streams("wf", |r| r.message = FROZEN_MESSAGE.into());
        let rows = agent
            .read_workflows(&ReadWorkflowsRequest {
                exclude_frozen: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_update_merges_only_set_fields() {
        let agent = FakeAgent::new("ks2", "0");
        let ids = agent.create_workflow(&create_req("wf")).await.unwrap();
        let updated = agent
            .update_workflow(&UpdateWorkflowRequest {
                workflow: "wf".into(),
                state: Some(StreamState::Stopped),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(updated, 1);
        let row = &agent.streams()[0];
        assert_eq!(row.state, StreamState::Stopped);
        assert_eq!(row.id, ids[0]);
        assert_eq!(row.binlog_source.keyspace, "ks1");
    }

    #[tokio::test]
    async fn test_wait_for_position_auto_catchup() {
        let agent = FakeAgent::new("ks2", "0");
        agent.create_workflow(&create_req("wf")).await.unwrap();
        let target = Position::parse("s1:10").unwrap();
        agent
            .wait_for_workflow_position("wf", &target, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(agent.streams()[0].position.at_least(&target));
    }

    #[tokio::test]
    async fn test_wait_for_position_times_out_without_catchup() {
        let agent = FakeAgent::new("ks2", "0");
        agent.set_auto_catchup(false);
        agent.create_workflow(&create_req("wf")).await.unwrap();
        let target = Position::parse("s1:10").unwrap();
        let err = agent
            .wait_for_workflow_position("wf", &target, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::DeadlineExceeded);
    }

    #[tokio::test]
    async fn test_journal_exactly_once() {
        let agent = FakeAgent::new("ks1", "0");
        let journal = Journal {
            id: 7,
            migration_type: kestrel_common::types::MigrationType::Tables,
            tables: vec!["t".into()],
            local_position: Position::new(),
            shard_gtids: vec![],
            participants: vec!["ks1/0".into()],
            source_workflows: vec![],
        };
        agent.create_journal(&journal).await.unwrap();
        assert!(agent.read_journal(7).await.unwrap().is_some());
        assert!(agent.create_journal(&journal).await.is_err());
        assert!(agent.read_journal(8).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fault_injection_fifo_and_kill() {
        let agent = FakeAgent::new("ks1", "0");
        agent
            .faults
            .inject("refresh_state", KestrelError::Unavailable("boom".into()));
        assert!(agent.refresh_state().await.is_err());
        assert!(agent.refresh_state().await.is_ok());

        agent.faults.kill();
        assert!(agent.primary_position().await.is_err());
        agent.faults.revive();
        assert!(agent.primary_position().await.is_ok());
    }
}
