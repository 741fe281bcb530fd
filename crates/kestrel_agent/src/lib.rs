//! The shard-agent surface the orchestrator consumes.
//!
//! Agents own the per-shard stream rows and execute SQL on the shard
//! primary; the orchestrator only ever talks to them through the
//! [`ShardAgent`] trait. The in-process [`FakeAgent`] implements the
//! whole surface against local state with fault-injection knobs, so the
//! entire cutover machinery is testable without a cluster.

pub mod fake;
pub mod types;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use kestrel_common::error::{KestrelError, KestrelResult};
use kestrel_common::types::Position;

pub use fake::{AgentFaults, FakeAgent};
pub use types::{
    trim_stream_logs, BinlogSource, CopyStateRow, CreateWorkflowRequest, Filter, FilterRule,
    Journal, ReadWorkflowsRequest, ShardGtid, StreamLog, StreamRow, StreamState, TableStats,
    UpdateWorkflowRequest,
};

/// RPC surface of one shard's primary agent.
#[async_trait]
pub trait ShardAgent: Send + Sync {
    /// Stable identity, `keyspace/shard`.
    fn shard_key(&self) -> String;

    // ── stream rows ─────────────────────────────────────────────────────
    async fn read_workflows(&self, req: &ReadWorkflowsRequest) -> KestrelResult<Vec<StreamRow>>;
    async fn create_workflow(&self, req: &CreateWorkflowRequest) -> KestrelResult<Vec<u64>>;
    /// Merge the set fields of `req` into every stream of the workflow;
    /// returns the number of streams updated.
    async fn update_workflow(&self, req: &UpdateWorkflowRequest) -> KestrelResult<u64>;
    async fn delete_workflow(&self, workflow: &str) -> KestrelResult<()>;
    /// Copy-state rows for the given streams, batched in one call.
    async fn copy_state(
        &self,
        stream_ids: &[u64],
    ) -> KestrelResult<BTreeMap<u64, Vec<CopyStateRow>>>;

    // ── replication control ─────────────────────────────────────────────
    async fn primary_position(&self) -> KestrelResult<Position>;
    /// Block until the shard's relevant stream set reaches `pos`, or time
    /// out with DEADLINE_EXCEEDED.
    async fn wait_for_workflow_position(
        &self,
        workflow: &str,
        pos: &Position,
        timeout: Duration,
    ) -> KestrelResult<()>;
    /// Re-read the shard record and apply serving changes (denied tables,
    /// query-service flags).
    async fn refresh_state(&self) -> KestrelResult<()>;

    // ── SQL execution ───────────────────────────────────────────────────
    async fn apply_schema(&self, ddl: &str) -> KestrelResult<()>;
    /// Fetch the shard's CREATE statements for deploying schema
    /// elsewhere. An empty table list fetches every table.
    async fn get_schema(&self, tables: &[String]) -> KestrelResult<Vec<String>>;
    async fn exec_dba(&self, query: &str) -> KestrelResult<u64>;
    /// One LOCK TABLES cycle: take read locks on `tables`, drain, release.
    async fn lock_tables_cycle(&self, tables: &[String]) -> KestrelResult<()>;
    async fn reset_sequences(&self, tables: &[String]) -> KestrelResult<()>;
    async fn drop_tables(&self, tables: &[String]) -> KestrelResult<()>;
    /// Row/byte counts from information_schema for the given tables.
    async fn table_stats(&self, tables: &[String]) -> KestrelResult<BTreeMap<String, TableStats>>;

    // ── cutover journal ─────────────────────────────────────────────────
    async fn create_journal(&self, journal: &Journal) -> KestrelResult<()>;
    async fn read_journal(&self, migration_id: u64) -> KestrelResult<Option<Journal>>;

    // ── validation ──────────────────────────────────────────────────────
    /// May return UNIMPLEMENTED on older agents; callers treat that as
    /// success for forward compatibility.
    async fn validate_vreplication_permissions(&self) -> KestrelResult<()>;
}

/// Resolves the primary agent for a shard. The production implementation
/// dials the tablet from the topology record; tests register fakes.
pub trait AgentResolver: Send + Sync {
    fn agent_for(&self, keyspace: &str, shard: &str) -> KestrelResult<Arc<dyn ShardAgent>>;
}

/// Static in-process resolver used by tests and embedded setups.
#[derive(Default)]
pub struct StaticAgentResolver {
    agents: parking_lot::RwLock<BTreeMap<String, Arc<dyn ShardAgent>>>,
}

impl StaticAgentResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, keyspace: &str, shard: &str, agent: Arc<dyn ShardAgent>) {
        self.agents
            .write()
            .insert(format!("{keyspace}/{shard}"), agent);
    }
}

impl AgentResolver for StaticAgentResolver {
    fn agent_for(&self, keyspace: &str, shard: &str) -> KestrelResult<Arc<dyn ShardAgent>> {
        self.agents
            .read()
            .get(&format!("{keyspace}/{shard}"))
            .cloned()
            .ok_or_else(|| {
                KestrelError::Unavailable(format!("no agent for shard {keyspace}/{shard}"))
            })
    }
}
