//! Vschema: per-keyspace routing and sharding configuration, and the
//! per-cell served view derived from it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::routing::{KeyspaceRules, MirrorRules, RoutingRules, ShardRules};

/// How a table participates in routing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableKind {
    #[default]
    Standard,
    Sequence,
    Reference,
}

/// Column-to-vindex binding on a sharded table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnVindex {
    pub column: String,
    pub vindex: String,
}

/// A named vindex definition within a keyspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vindex {
    pub vindex_type: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    /// Owning table for lookup vindexes; `None` once internalized.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Backfill-in-progress marker. While set, the vindex is not used for
    /// routing decisions and must not be externalized implicitly.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub write_only: bool,
}

/// Per-table vschema entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VSchemaTable {
    #[serde(default)]
    pub kind: TableKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub column_vindexes: Vec<ColumnVindex>,
    /// For sequence-backed tables: the sequence table feeding inserts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_increment_sequence: Option<String>,
}

/// Per-keyspace vschema.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VSchema {
    #[serde(default)]
    pub sharded: bool,
    #[serde(default)]
    pub tables: BTreeMap<String, VSchemaTable>,
    #[serde(default)]
    pub vindexes: BTreeMap<String, Vindex>,
    /// When set, tables absent from `tables` are not routable at all.
    #[serde(default)]
    pub require_explicit_routing: bool,
}

/// The served view one cell's SQL routers consume: every keyspace's
/// vschema plus a snapshot of all rule kinds, rebuilt on demand.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SrvVSchema {
    #[serde(default)]
    pub keyspaces: BTreeMap<String, VSchema>,
    #[serde(default)]
    pub routing_rules: RoutingRules,
    #[serde(default)]
    pub shard_rules: ShardRules,
    #[serde(default)]
    pub keyspace_rules: KeyspaceRules,
    #[serde(default)]
    pub mirror_rules: MirrorRules,
}
