//! Workflow aggregates: the logical, cluster-wide view assembled from
//! per-shard stream rows, plus the ephemeral traffic-state snapshot.

use std::collections::BTreeMap;

use serde::Serialize;

use kestrel_agent::types::{CopyStateRow, StreamRow, StreamState, FROZEN_MESSAGE};
use kestrel_common::types::{WorkflowOptions, WorkflowSubType, WorkflowType};

/// Reserved suffix of the reverse twin workflow.
pub const REVERSE_WORKFLOW_SUFFIX: &str = "_reverse";

/// Name of the reverse workflow. Involution: applying it twice returns
/// the original name.
pub fn reverse_name(workflow: &str) -> String {
    match workflow.strip_suffix(REVERSE_WORKFLOW_SUFFIX) {
        Some(base) => base.to_string(),
        None => format!("{workflow}{REVERSE_WORKFLOW_SUFFIX}"),
    }
}

pub fn is_reverse_name(workflow: &str) -> bool {
    workflow.ends_with(REVERSE_WORKFLOW_SUFFIX)
}

/// One stream as seen cluster-wide: the row plus the target shard it
/// lands on and its joined copy state.
#[derive(Debug, Clone)]
pub struct WorkflowStream {
    /// Target shard name.
    pub shard: String,
    pub row: StreamRow,
    pub copy_states: Vec<CopyStateRow>,
    /// Bucketing applies one throttle window per fetch.
    pub throttled: bool,
}

impl WorkflowStream {
    pub fn is_copying(&self) -> bool {
        self.row.state == StreamState::Copying || !self.copy_states.is_empty()
    }
}

/// The logical replication job identified by `(target_keyspace, name)`.
#[derive(Debug, Clone)]
pub struct Workflow {
    pub name: String,
    pub target_keyspace: String,
    /// All streams share one source keyspace; `None` when the workflow
    /// has no streams at all.
    pub source_keyspace: Option<String>,
    pub workflow_type: Option<WorkflowType>,
    pub sub_type: WorkflowSubType,
    pub options: WorkflowOptions,
    /// Sorted by (shard, stream id).
    pub streams: Vec<WorkflowStream>,
    /// `max(now - transaction_timestamp)` across streams, seconds.
    pub max_v_replication_lag: u64,
}

impl Workflow {
    /// Sorted union of the tables the workflow's filters match.
    pub fn tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = self
            .streams
            .iter()
            .flat_map(|s| s.row.binlog_source.filter.match_tables())
            .collect();
        tables.sort();
        tables.dedup();
        tables
    }

    /// Sorted target shard names.
    pub fn target_shards(&self) -> Vec<String> {
        let mut shards: Vec<String> = self.streams.iter().map(|s| s.shard.clone()).collect();
        shards.sort();
        shards.dedup();
        shards
    }

    /// Sorted source shard names.
    pub fn source_shards(&self) -> Vec<String> {
        let mut shards: Vec<String> = self
            .streams
            .iter()
            .map(|s| s.row.binlog_source.shard.clone())
            .collect();
        shards.sort();
        shards.dedup();
        shards
    }

    /// Streams grouped by target shard, preserving stream-id order.
    pub fn streams_by_shard(&self) -> BTreeMap<String, Vec<&WorkflowStream>> {
        let mut map: BTreeMap<String, Vec<&WorkflowStream>> = BTreeMap::new();
        for s in &self.streams {
            map.entry(s.shard.clone()).or_default().push(s);
        }
        map
    }

    pub fn has_errors(&self) -> bool {
        self.streams.iter().any(|s| s.row.state == StreamState::Error)
    }

    pub fn is_copying(&self) -> bool {
        self.streams.iter().any(|s| s.is_copying())
    }

    pub fn is_frozen(&self) -> bool {
        !self.streams.is_empty() && self.streams.iter().any(|s| s.row.message == FROZEN_MESSAGE)
    }

    pub fn is_partial(&self) -> bool {
        self.sub_type == WorkflowSubType::Partial
    }

    pub fn is_multi_tenant(&self) -> bool {
        self.sub_type == WorkflowSubType::MultiTenant
    }

    pub fn is_reverse(&self) -> bool {
        is_reverse_name(&self.name)
    }
}

/// Ephemeral traffic-state snapshot, derived entirely from the topology
/// store at request time.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkflowState {
    pub writes_switched: bool,
    pub replica_cells_switched: Vec<String>,
    pub replica_cells_not_switched: Vec<String>,
    pub rdonly_cells_switched: Vec<String>,
    pub rdonly_cells_not_switched: Vec<String>,
    pub is_reverse: bool,
    pub is_partial: bool,
    pub shards_already_switched: Vec<String>,
    pub shards_not_yet_switched: Vec<String>,
    pub workflow_type: Option<WorkflowType>,
}

impl WorkflowState {
    pub fn reads_fully_switched(&self) -> bool {
        self.replica_cells_not_switched.is_empty() && self.rdonly_cells_not_switched.is_empty()
    }

    /// All traffic at the target: gate for MoveTablesComplete.
    pub fn fully_switched(&self) -> bool {
        if self.is_partial {
            return self.shards_not_yet_switched.is_empty();
        }
        self.writes_switched && self.reads_fully_switched()
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_partial {
            return write!(
                f,
                "shards switched: [{}], not switched: [{}]",
                self.shards_already_switched.join(","),
                self.shards_not_yet_switched.join(",")
            );
        }
        let reads = |switched: &[String], not: &[String]| -> String {
            if not.is_empty() && !switched.is_empty() {
                "all cells".to_string()
            } else if switched.is_empty() {
                "no cells".to_string()
            } else {
                format!("cells [{}]", switched.join(","))
            }
        };
        write!(
            f,
            "replica reads switched in {}; rdonly reads switched in {}; writes {}",
            reads(&self.replica_cells_switched, &self.replica_cells_not_switched),
            reads(&self.rdonly_cells_switched, &self.rdonly_cells_not_switched),
            if self.writes_switched {
                "switched"
            } else {
                "not switched"
            }
        )
    }
}
