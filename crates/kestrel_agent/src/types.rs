//! Wire types of the shard-agent surface: stream rows, binlog sources,
//! copy state, and the cutover journal.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use kestrel_common::keyrange::KeyRange;
use kestrel_common::types::{
    MigrationType, Position, TabletType, WorkflowOptions, WorkflowSubType, WorkflowType,
};

/// One table-match rule inside a binlog filter. An empty expression
/// copies the table as-is; reshard rules additionally carry the target's
/// key range so the agent only applies rows landing in it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRule {
    pub match_table: String,
    #[serde(default)]
    pub expression: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_range: Option<KeyRange>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default)]
    pub rules: Vec<FilterRule>,
}

impl Filter {
    /// Sorted table names this filter matches.
    pub fn match_tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = self.rules.iter().map(|r| r.match_table.clone()).collect();
        tables.sort();
        tables.dedup();
        tables
    }
}

/// Which upstream commits one stream consumes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinlogSource {
    pub keyspace: String,
    pub shard: String,
    #[serde(default)]
    pub filter: Filter,
    /// Pause the stream once the initial copy finishes.
    #[serde(default)]
    pub stop_after_copy: bool,
}

impl BinlogSource {
    pub fn shard_key(&self) -> String {
        format!("{}/{}", self.keyspace, self.shard)
    }
}

/// Stream lifecycle state as reported by the agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    #[default]
    Init,
    Copying,
    Running,
    Stopped,
    Error,
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamState::Init => write!(f, "Init"),
            StreamState::Copying => write!(f, "Copying"),
            StreamState::Running => write!(f, "Running"),
            StreamState::Stopped => write!(f, "Stopped"),
            StreamState::Error => write!(f, "Error"),
        }
    }
}

/// Marker message set on target streams once writes are switched. A
/// frozen stream is never edited again except by a reverse.
pub const FROZEN_MESSAGE: &str = "FROZEN";

/// Per-stream log line kept by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamLog {
    pub at_unix_secs: u64,
    pub state: StreamState,
    pub message: String,
}

/// Trim a stream's log to its newest `min_retention_count` entries.
/// Retention below one entry is refused: a stream must always keep the
/// record of its latest transition. Returns the number of lines dropped.
pub fn trim_stream_logs(
    logs: &mut Vec<StreamLog>,
    min_retention_count: usize,
) -> kestrel_common::error::KestrelResult<usize> {
    if min_retention_count < 1 {
        return Err(kestrel_common::error::KestrelError::InvalidArgument(
            format!("log retention count must be at least 1, got {min_retention_count}"),
        ));
    }
    if logs.len() <= min_retention_count {
        return Ok(0);
    }
    let dropped = logs.len() - min_retention_count;
    logs.drain(..dropped);
    Ok(dropped)
}

/// One stream row as stored in the shard's sidecar schema.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRow {
    /// Unique within the shard.
    pub id: u64,
    pub workflow: String,
    pub workflow_type: Option<WorkflowType>,
    #[serde(default)]
    pub workflow_sub_type: WorkflowSubType,
    pub binlog_source: BinlogSource,
    pub state: StreamState,
    pub position: Position,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_position: Option<Position>,
    #[serde(default)]
    pub message: String,
    /// Commit timestamp of the last applied transaction, Unix seconds.
    pub transaction_timestamp: u64,
    pub time_updated: u64,
    /// Last throttler report, Unix seconds; 0 = never throttled.
    #[serde(default)]
    pub time_throttled: u64,
    #[serde(default)]
    pub component_throttled: String,
    #[serde(default)]
    pub rows_copied: u64,
    #[serde(default)]
    pub options: WorkflowOptions,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<StreamLog>,
}

impl StreamRow {
    /// Whether this stream counts as throttled at `now` with the given
    /// window.
    pub fn is_throttled(&self, now_unix_secs: u64, window_secs: u64) -> bool {
        self.time_throttled != 0 && now_unix_secs.saturating_sub(self.time_throttled) < window_secs
    }
}

/// Copy-state row: one table still being copied, with the last primary
/// key reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyStateRow {
    pub table: String,
    pub last_pk: String,
}

/// information_schema numbers for one table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableStats {
    pub rows: u64,
    pub bytes: u64,
}

// ── Requests ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct ReadWorkflowsRequest {
    /// Empty = all workflows on the shard.
    pub workflows: Vec<String>,
    pub include_logs: bool,
    /// Skip workflows whose streams carry the frozen marker.
    pub exclude_frozen: bool,
}

#[derive(Debug, Clone)]
pub struct CreateWorkflowRequest {
    pub workflow: String,
    pub workflow_type: WorkflowType,
    pub workflow_sub_type: WorkflowSubType,
    pub binlog_sources: Vec<BinlogSource>,
    pub cells: Vec<String>,
    pub tablet_types: Vec<TabletType>,
    pub auto_start: bool,
    pub stop_after_copy: bool,
    pub options: WorkflowOptions,
}

/// Field-merge update: only the set fields change, everything else is
/// left as stored.
#[derive(Debug, Clone, Default)]
pub struct UpdateWorkflowRequest {
    pub workflow: String,
    pub state: Option<StreamState>,
    pub message: Option<String>,
    pub stop_position: Option<Position>,
    pub tablet_types: Option<Vec<TabletType>>,
    /// Replace the binlog source of the stream with the same index, used
    /// by the stream migrator. Keyed by stream id.
    pub binlog_sources: Option<BTreeMap<u64, BinlogSource>>,
}

// ── Journal ─────────────────────────────────────────────────────────────────

/// Position of one shard at the cutover point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardGtid {
    pub keyspace: String,
    pub shard: String,
    pub gtid: Position,
}

/// Durable per-source record written exactly once at the point of no
/// return. Its presence converts a retried cutover into roll-forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Journal {
    pub id: u64,
    pub migration_type: MigrationType,
    pub tables: Vec<String>,
    pub local_position: Position,
    pub shard_gtids: Vec<ShardGtid>,
    /// `keyspace/shard` keys of every source that took part.
    pub participants: Vec<String>,
    pub source_workflows: Vec<String>,
}
