//! Cluster addressing types: tablet types and aliases, replication
//! positions, and the deterministic id hash used for cutover journals.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{KestrelError, KestrelResult};

/// Role a tablet serves traffic as. Routing-rule keys carry the role as a
/// suffix: primary has no suffix, replicas and rdonlys use `@replica` /
/// `@rdonly`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TabletType {
    #[default]
    Primary,
    Replica,
    Rdonly,
}

impl TabletType {
    /// All roles, in routing-rule emission order.
    pub const ALL: [TabletType; 3] = [TabletType::Primary, TabletType::Replica, TabletType::Rdonly];

    /// The two read-only roles affected by SwitchReads.
    pub const READ_ONLY: [TabletType; 2] = [TabletType::Replica, TabletType::Rdonly];

    /// Routing-rule key suffix for this role.
    pub fn suffix(&self) -> &'static str {
        match self {
            TabletType::Primary => "",
            TabletType::Replica => "@replica",
            TabletType::Rdonly => "@rdonly",
        }
    }

    pub fn is_primary(&self) -> bool {
        matches!(self, TabletType::Primary)
    }
}

impl std::fmt::Display for TabletType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TabletType::Primary => write!(f, "primary"),
            TabletType::Replica => write!(f, "replica"),
            TabletType::Rdonly => write!(f, "rdonly"),
        }
    }
}

impl std::str::FromStr for TabletType {
    type Err = KestrelError;

    fn from_str(s: &str) -> KestrelResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "primary" => Ok(TabletType::Primary),
            "replica" => Ok(TabletType::Replica),
            "rdonly" => Ok(TabletType::Rdonly),
            other => Err(KestrelError::InvalidArgument(format!(
                "unknown tablet type {other:?}"
            ))),
        }
    }
}

/// Globally unique tablet address: failure-domain cell plus a uid.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TabletAlias {
    pub cell: String,
    pub uid: u32,
}

impl TabletAlias {
    pub fn new(cell: impl Into<String>, uid: u32) -> Self {
        Self { cell: cell.into(), uid }
    }
}

impl std::fmt::Display for TabletAlias {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{:010}", self.cell, self.uid)
    }
}

// ── Replication positions ───────────────────────────────────────────────────

/// Opaque replication progress point: a GTID set keyed by source server id.
/// Supports the `at_least` comparison the cutover needs and nothing more;
/// the orchestrator never interprets positions beyond that.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position(pub BTreeMap<String, u64>);

impl Position {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Record progress for one source, keeping the max.
    pub fn advance(&mut self, source: impl Into<String>, sequence: u64) {
        let entry = self.0.entry(source.into()).or_insert(0);
        if sequence > *entry {
            *entry = sequence;
        }
    }

    /// True when this position has reached `other`: every source in
    /// `other` is present here with at least the same sequence.
    pub fn at_least(&self, other: &Position) -> bool {
        other
            .0
            .iter()
            .all(|(src, seq)| self.0.get(src).is_some_and(|have| have >= seq))
    }

    /// Merge `other` in, keeping per-source maxima.
    pub fn join(&mut self, other: &Position) {
        for (src, seq) in &other.0 {
            self.advance(src.clone(), *seq);
        }
    }

    /// Parse `"src1:42,src2:7"`. Empty string parses to the empty position.
    pub fn parse(s: &str) -> KestrelResult<Self> {
        let mut pos = Position::new();
        for part in s.split(',').filter(|p| !p.is_empty()) {
            let (src, seq) = part.split_once(':').ok_or_else(|| {
                KestrelError::InvalidArgument(format!("malformed position component {part:?}"))
            })?;
            let seq: u64 = seq.parse().map_err(|_| {
                KestrelError::InvalidArgument(format!("malformed position sequence {seq:?}"))
            })?;
            pos.advance(src, seq);
        }
        Ok(pos)
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (src, seq) in &self.0 {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{src}:{seq}")?;
            first = false;
        }
        Ok(())
    }
}

// ── Workflow vocabulary ─────────────────────────────────────────────────────

/// Kind of replication workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowType {
    MoveTables,
    Reshard,
    Materialize,
    Migrate,
    CreateLookupIndex,
}

impl std::fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowType::MoveTables => write!(f, "MoveTables"),
            WorkflowType::Reshard => write!(f, "Reshard"),
            WorkflowType::Materialize => write!(f, "Materialize"),
            WorkflowType::Migrate => write!(f, "Migrate"),
            WorkflowType::CreateLookupIndex => write!(f, "CreateLookupIndex"),
        }
    }
}

/// Workflow sub-type refining traffic-switch behavior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowSubType {
    #[default]
    None,
    /// Source and target are shard-scoped; switching is per shard.
    Partial,
    /// Target keyspace receives many source keyspaces; switching is per
    /// tenant via keyspace rules.
    MultiTenant,
}

impl std::fmt::Display for WorkflowSubType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowSubType::None => write!(f, "none"),
            WorkflowSubType::Partial => write!(f, "partial"),
            WorkflowSubType::MultiTenant => write!(f, "multi_tenant"),
        }
    }
}

/// Whether a cutover moves table traffic across keyspaces or shard
/// traffic within one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationType {
    Tables,
    Shards,
}

impl std::fmt::Display for MigrationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationType::Tables => write!(f, "TABLES"),
            MigrationType::Shards => write!(f, "SHARDS"),
        }
    }
}

/// Free-form workflow options carried on every stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    /// Lookup-vindex names owned by a CreateLookupIndex workflow.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lookup_vindexes: Vec<String>,
    /// When set, SwitchWrites skips creating the reverse workflow.
    #[serde(default)]
    pub disable_reverse_replication: bool,
    /// Handle of the external cluster a Migrate workflow reads from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_cluster: Option<String>,
}

/// Seconds since the Unix epoch; the timestamp domain of stream rows.
pub fn now_unix_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ── Deterministic ids ───────────────────────────────────────────────────────

/// FNV-1a 64-bit. Stable across releases, used for cutover journal ids
/// which must be recomputable after a crash.
pub fn fnv64a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Journal id for a cutover: hash of the target keyspace and the sorted
/// target shard names. Re-running the same cutover yields the same id.
pub fn migration_id(target_keyspace: &str, target_shards: &[String]) -> u64 {
    let mut shards: Vec<&str> = target_shards.iter().map(String::as_str).collect();
    shards.sort_unstable();
    let mut buf = Vec::with_capacity(64);
    buf.extend_from_slice(target_keyspace.as_bytes());
    for s in shards {
        buf.push(b'|');
        buf.extend_from_slice(s.as_bytes());
    }
    fnv64a(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tablet_type_suffixes() {
        assert_eq!(TabletType::Primary.suffix(), "");
        assert_eq!(TabletType::Replica.suffix(), "@replica");
        assert_eq!(TabletType::Rdonly.suffix(), "@rdonly");
    }

    #[test]
    fn test_tablet_type_parse() {
        assert_eq!("replica".parse::<TabletType>().unwrap(), TabletType::Replica);
        assert_eq!("PRIMARY".parse::<TabletType>().unwrap(), TabletType::Primary);
        assert!("batch".parse::<TabletType>().is_err());
    }

    #[test]
    fn test_tablet_alias_display() {
        let a = TabletAlias::new("zone1", 100);
        assert_eq!(a.to_string(), "zone1-0000000100");
    }

    #[test]
    fn test_position_at_least() {
        let mut a = Position::new();
        a.advance("s1", 10);
        a.advance("s2", 5);
        let mut b = Position::new();
        b.advance("s1", 10);
        assert!(a.at_least(&b));
        assert!(!b.at_least(&a));

        b.advance("s2", 6);
        assert!(!a.at_least(&b));
    }

    #[test]
    fn test_position_at_least_empty() {
        let empty = Position::new();
        let mut a = Position::new();
        a.advance("s1", 1);
        // Everything has reached the empty position.
        assert!(empty.at_least(&empty));
        assert!(a.at_least(&empty));
        assert!(!empty.at_least(&a));
    }

    #[test]
    fn test_position_advance_is_monotonic() {
        let mut p = Position::new();
        p.advance("s1", 10);
        p.advance("s1", 3);
        assert_eq!(p.0["s1"], 10);
    }

    #[test]
    fn test_position_parse_roundtrip() {
        let p = Position::parse("s1:42,s2:7").unwrap();
        assert_eq!(Position::parse(&p.to_string()).unwrap(), p);
        assert!(Position::parse("").unwrap().is_empty());
        assert!(Position::parse("nocolon").is_err());
        assert!(Position::parse("s1:abc").is_err());
    }

    #[test]
    fn test_migration_id_deterministic_and_order_free() {
        let a = migration_id("ks2", &["-80".into(), "80-".into()]);
        let b = migration_id("ks2", &["80-".into(), "-80".into()]);
        assert_eq!(a, b);
        assert_ne!(a, migration_id("ks3", &["-80".into(), "80-".into()]));
        assert_ne!(a, migration_id("ks2", &["0".into()]));
    }
}
