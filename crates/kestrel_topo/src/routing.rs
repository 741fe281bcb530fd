//! Routing rules: the polymorphic rule kinds the SQL router consumes and
//! the transforms the traffic switcher applies to them.
//!
//! Three addressing levels exist, and a MoveTables workflow uses exactly
//! one of them for its tables at any time:
//! - **Table rules**: `{keyspace?}.{table}[@type]` → ordered target list;
//!   the first non-self target is authoritative.
//! - **Shard rules**: `(keyspace, shard)` → `to_keyspace`, used by partial
//!   migrations; switching is all-or-nothing per shard.
//! - **Keyspace rules**: `from_keyspace[@type]` → `to_keyspace`, used by
//!   multi-tenant migrations.
//!
//! Mirror rules additionally carry a percentage in `[0, 100]`; percent 0
//! is expressed by deleting the rule.
//!
//! Stored rule ordering carries no semantics but is normalized on save so
//! that stored snapshots diff cleanly.

use serde::{Deserialize, Serialize};

use kestrel_common::types::TabletType;

/// Which way a switch moves traffic. `Backward` rebuilds the switcher
/// around the reverse workflow and walks the same machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrafficDirection {
    Forward,
    Backward,
}

impl std::fmt::Display for TrafficDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrafficDirection::Forward => write!(f, "forward"),
            TrafficDirection::Backward => write!(f, "backward"),
        }
    }
}

// ── Table rules ─────────────────────────────────────────────────────────────

/// One table-level rule: lookup key (with optional tablet-type suffix) to
/// an ordered list of `keyspace.table` targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRule {
    pub from_table: String,
    pub to_tables: Vec<String>,
}

/// The full table-rule set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRules {
    #[serde(default)]
    pub rules: Vec<TableRule>,
}

/// The three lookup keys that must stay in agreement for one table:
/// bare name, source-qualified, target-qualified.
pub fn table_rule_keys(
    source_keyspace: &str,
    target_keyspace: &str,
    table: &str,
    tablet_type: TabletType,
) -> [String; 3] {
    let suffix = tablet_type.suffix();
    [
        format!("{table}{suffix}"),
        format!("{source_keyspace}.{table}{suffix}"),
        format!("{target_keyspace}.{table}{suffix}"),
    ]
}

impl RoutingRules {
    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.rules
            .iter()
            .find(|r| r.from_table == key)
            .map(|r| r.to_tables.as_slice())
    }

    /// Insert or replace the rule for `key`.
    pub fn set(&mut self, key: impl Into<String>, to_tables: Vec<String>) {
        let key = key.into();
        match self.rules.iter_mut().find(|r| r.from_table == key) {
            Some(rule) => rule.to_tables = to_tables,
            None => self.rules.push(TableRule {
                from_table: key,
                to_tables,
            }),
        }
    }

    pub fn delete(&mut self, key: &str) {
        self.rules.retain(|r| r.from_table != key);
    }

    /// Point every lookup key for `tables` (the given tablet types, all
    /// three key spellings) at `to_keyspace`. This is the single
    /// primitive create, switch-reads, and switch-writes all reduce to.
    pub fn route_tables(
        &mut self,
        source_keyspace: &str,
        target_keyspace: &str,
        tables: &[String],
        tablet_types: &[TabletType],
        to_keyspace: &str,
    ) {
        for table in tables {
            for &tt in tablet_types {
                let target = format!("{to_keyspace}.{table}");
                for key in table_rule_keys(source_keyspace, target_keyspace, table, tt) {
                    self.set(key, vec![target.clone()]);
                }
            }
        }
    }

    /// Read-traffic switch: touches only `@replica`/`@rdonly` keys, never
    /// the primary spelling.
    pub fn switch_table_reads(
        &mut self,
        source_keyspace: &str,
        target_keyspace: &str,
        tables: &[String],
        tablet_types: &[TabletType],
        direction: TrafficDirection,
    ) {
        let read_types: Vec<TabletType> = tablet_types
            .iter()
            .copied()
            .filter(|tt| !tt.is_primary())
            .collect();
        let to_keyspace = match direction {
            TrafficDirection::Forward => target_keyspace,
            TrafficDirection::Backward => source_keyspace,
        };
        self.route_tables(
            source_keyspace,
            target_keyspace,
            tables,
            &read_types,
            to_keyspace,
        );
    }

    /// Write-traffic switch: rewrites the primary-suffix keys.
    pub fn switch_table_writes(
        &mut self,
        source_keyspace: &str,
        target_keyspace: &str,
        tables: &[String],
        direction: TrafficDirection,
    ) {
        let to_keyspace = match direction {
            TrafficDirection::Forward => target_keyspace,
            TrafficDirection::Backward => source_keyspace,
        };
        self.route_tables(
            source_keyspace,
            target_keyspace,
            tables,
            &[TabletType::Primary],
            to_keyspace,
        );
    }

    /// Drop every key (all spellings, all suffixes) for `tables`.
    pub fn delete_table_rules(
        &mut self,
        source_keyspace: &str,
        target_keyspace: &str,
        tables: &[String],
    ) {
        for table in tables {
            for tt in TabletType::ALL {
                for key in table_rule_keys(source_keyspace, target_keyspace, table, tt) {
                    self.delete(&key);
                }
            }
        }
    }

    /// The effective keyspace a lookup key resolves to, if any: keyspace
    /// part of the first target.
    pub fn resolved_keyspace(&self, key: &str) -> Option<&str> {
        self.get(key)
            .and_then(|targets| targets.first())
            .and_then(|t| t.split_once('.').map(|(ks, _)| ks))
    }

    /// Normalize ordering for storage. Semantics-free; keeps stored
    /// snapshots diffable.
    pub fn normalize(&mut self) {
        self.rules.sort_by(|a, b| a.from_table.cmp(&b.from_table));
        self.rules.dedup_by(|a, b| a.from_table == b.from_table);
    }
}

// ── Shard rules ─────────────────────────────────────────────────────────────

/// Shard-scoped rule for partial migrations: all traffic for
/// `(from_keyspace, shard)` goes to `to_keyspace`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRule {
    pub from_keyspace: String,
    pub shard: String,
    pub to_keyspace: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRules {
    #[serde(default)]
    pub rules: Vec<ShardRule>,
}

impl ShardRules {
    pub fn get(&self, from_keyspace: &str, shard: &str) -> Option<&str> {
        self.rules
            .iter()
            .find(|r| r.from_keyspace == from_keyspace && r.shard == shard)
            .map(|r| r.to_keyspace.as_str())
    }

    /// Replace the shard's target atomically (all-or-nothing per shard).
    pub fn set(&mut self, from_keyspace: &str, shard: &str, to_keyspace: &str) {
        match self
            .rules
            .iter_mut()
            .find(|r| r.from_keyspace == from_keyspace && r.shard == shard)
        {
            Some(rule) => rule.to_keyspace = to_keyspace.to_string(),
            None => self.rules.push(ShardRule {
                from_keyspace: from_keyspace.to_string(),
                shard: shard.to_string(),
                to_keyspace: to_keyspace.to_string(),
            }),
        }
    }

    pub fn delete(&mut self, from_keyspace: &str, shard: &str) {
        self.rules
            .retain(|r| !(r.from_keyspace == from_keyspace && r.shard == shard));
    }

    pub fn normalize(&mut self) {
        self.rules.sort_by(|a, b| {
            (&a.from_keyspace, &a.shard).cmp(&(&b.from_keyspace, &b.shard))
        });
    }
}

// ── Keyspace rules ──────────────────────────────────────────────────────────

/// Keyspace-scoped rule for multi-tenant migrations. `from_keyspace`
/// carries the tablet-type suffix spelling (`ks`, `ks@replica`,
/// `ks@rdonly`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyspaceRule {
    pub from_keyspace: String,
    pub to_keyspace: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyspaceRules {
    #[serde(default)]
    pub rules: Vec<KeyspaceRule>,
}

impl KeyspaceRules {
    pub fn get(&self, from_keyspace: &str) -> Option<&str> {
        self.rules
            .iter()
            .find(|r| r.from_keyspace == from_keyspace)
            .map(|r| r.to_keyspace.as_str())
    }

    pub fn set(&mut self, from_keyspace: &str, to_keyspace: &str) {
        match self
            .rules
            .iter_mut()
            .find(|r| r.from_keyspace == from_keyspace)
        {
            Some(rule) => rule.to_keyspace = to_keyspace.to_string(),
            None => self.rules.push(KeyspaceRule {
                from_keyspace: from_keyspace.to_string(),
                to_keyspace: to_keyspace.to_string(),
            }),
        }
    }

    /// Repoint `from_keyspace` for the given tablet types.
    pub fn switch_keyspace(
        &mut self,
        from_keyspace: &str,
        to_keyspace: &str,
        tablet_types: &[TabletType],
    ) {
        for tt in tablet_types {
            let key = format!("{from_keyspace}{}", tt.suffix());
            self.set(&key, to_keyspace);
        }
    }

    pub fn delete_keyspace(&mut self, from_keyspace: &str) {
        for tt in TabletType::ALL {
            let key = format!("{from_keyspace}{}", tt.suffix());
            self.rules.retain(|r| r.from_keyspace != key);
        }
    }

    pub fn normalize(&mut self) {
        self.rules
            .sort_by(|a, b| a.from_keyspace.cmp(&b.from_keyspace));
    }
}

// ── Mirror rules ────────────────────────────────────────────────────────────

/// Mirror a percentage of traffic for one lookup key to the target table,
/// without affecting responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorRule {
    pub from_table: String,
    pub to_table: String,
    pub percent: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MirrorRules {
    #[serde(default)]
    pub rules: Vec<MirrorRule>,
}

impl MirrorRules {
    pub fn get(&self, key: &str) -> Option<&MirrorRule> {
        self.rules.iter().find(|r| r.from_table == key)
    }

    /// Set the mirror percentage for `tables` at the given tablet types.
    /// Percent is clamped to `[0, 100]`; 0 removes the rule entirely.
    pub fn set_mirror(
        &mut self,
        source_keyspace: &str,
        target_keyspace: &str,
        tables: &[String],
        tablet_types: &[TabletType],
        percent: f32,
    ) {
        let percent = percent.clamp(0.0, 100.0);
        for table in tables {
            for &tt in tablet_types {
                let suffix = tt.suffix();
                let to_table = format!("{target_keyspace}.{table}");
                for key in [
                    format!("{table}{suffix}"),
                    format!("{source_keyspace}.{table}{suffix}"),
                ] {
                    if percent == 0.0 {
                        self.rules.retain(|r| r.from_table != key);
                    } else {
                        match self.rules.iter_mut().find(|r| r.from_table == key) {
                            Some(rule) => {
                                rule.percent = percent;
                                rule.to_table = to_table.clone();
                            }
                            None => self.rules.push(MirrorRule {
                                from_table: key,
                                to_table: to_table.clone(),
                                percent,
                            }),
                        }
                    }
                }
            }
        }
    }

    /// Drop mirror rules for `tables` at the given tablet types.
    pub fn remove_mirror(
        &mut self,
        source_keyspace: &str,
        tables: &[String],
        tablet_types: &[TabletType],
    ) {
        for table in tables {
            for &tt in tablet_types {
                let suffix = tt.suffix();
                let bare = format!("{table}{suffix}");
                let qualified = format!("{source_keyspace}.{table}{suffix}");
                self.rules
                    .retain(|r| r.from_table != bare && r.from_table != qualified);
            }
        }
    }

    pub fn normalize(&mut self) {
        self.rules.sort_by(|a, b| a.from_table.cmp(&b.from_table));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_table_rule_keys_cover_three_spellings() {
        let keys = table_rule_keys("ks1", "ks2", "t", TabletType::Replica);
        assert_eq!(keys[0], "t@replica");
        assert_eq!(keys[1], "ks1.t@replica");
        assert_eq!(keys[2], "ks2.t@replica");
    }

    #[test]
    fn test_route_tables_points_all_keys_at_one_target() {
        let mut rr = RoutingRules::default();
        rr.route_tables("ks1", "ks2", &tables(&["t"]), &TabletType::ALL, "ks1");
        for tt in TabletType::ALL {
            for key in table_rule_keys("ks1", "ks2", "t", tt) {
                assert_eq!(rr.get(&key).unwrap(), ["ks1.t".to_string()]);
            }
        }
    }

    #[test]
    fn test_switch_reads_leaves_primary_untouched() {
        let mut rr = RoutingRules::default();
        rr.route_tables("ks1", "ks2", &tables(&["t"]), &TabletType::ALL, "ks1");
        rr.switch_table_reads(
            "ks1",
            "ks2",
            &tables(&["t"]),
            &[TabletType::Replica],
            TrafficDirection::Forward,
        );
        assert_eq!(rr.resolved_keyspace("t@replica"), Some("ks2"));
        assert_eq!(rr.resolved_keyspace("t@rdonly"), Some("ks1"));
        assert_eq!(rr.resolved_keyspace("t"), Some("ks1"));
    }

    #[test]
    fn test_switch_reads_backward_restores_source() {
        let mut rr = RoutingRules::default();
        rr.route_tables("ks1", "ks2", &tables(&["t"]), &TabletType::ALL, "ks1");
        let before = {
            let mut c = rr.clone();
            c.normalize();
            c
        };
        rr.switch_table_reads(
            "ks1",
            "ks2",
            &tables(&["t"]),
            &[TabletType::Replica, TabletType::Rdonly],
            TrafficDirection::Forward,
        );
        rr.switch_table_reads(
            "ks1",
            "ks2",
            &tables(&["t"]),
            &[TabletType::Replica, TabletType::Rdonly],
            TrafficDirection::Backward,
        );
        rr.normalize();
        assert_eq!(rr, before);
    }

    #[test]
    fn test_switch_writes_rewrites_primary_keys() {
        let mut rr = RoutingRules::default();
        rr.route_tables("ks1", "ks2", &tables(&["t"]), &TabletType::ALL, "ks1");
        rr.switch_table_writes("ks1", "ks2", &tables(&["t"]), TrafficDirection::Forward);
        assert_eq!(rr.resolved_keyspace("t"), Some("ks2"));
        assert_eq!(rr.resolved_keyspace("ks1.t"), Some("ks2"));
        assert_eq!(rr.resolved_keyspace("ks2.t"), Some("ks2"));
    }

    #[test]
    fn test_one_effective_target_per_table() {
        // Invariant: the three spellings resolve identically after any
        // sequence of transforms.
        let mut rr = RoutingRules::default();
        rr.route_tables("ks1", "ks2", &tables(&["t"]), &TabletType::ALL, "ks1");
        rr.switch_table_reads(
            "ks1",
            "ks2",
            &tables(&["t"]),
            &[TabletType::Rdonly],
            TrafficDirection::Forward,
        );
        rr.switch_table_writes("ks1", "ks2", &tables(&["t"]), TrafficDirection::Forward);
        for tt in TabletType::ALL {
            let keys = table_rule_keys("ks1", "ks2", "t", tt);
            let resolved: Vec<_> = keys.iter().map(|k| rr.resolved_keyspace(k)).collect();
            assert_eq!(resolved[0], resolved[1]);
            assert_eq!(resolved[1], resolved[2]);
        }
    }

    #[test]
    fn test_normalize_sorts_and_dedups() {
        let mut rr = RoutingRules::default();
        rr.set("b", vec!["ks.b".into()]);
        rr.set("a", vec!["ks.a".into()]);
        rr.rules.push(TableRule {
            from_table: "a".into(),
            to_tables: vec!["ks.stale".into()],
        });
        rr.normalize();
        assert_eq!(rr.rules.len(), 2);
        assert_eq!(rr.rules[0].from_table, "a");
        assert_eq!(rr.rules[0].to_tables, vec!["ks.a".to_string()]);
    }

    #[test]
    fn test_shard_rules_replace_atomically() {
        let mut sr = ShardRules::default();
        sr.set("ks1", "-80", "ks1");
        sr.set("ks1", "-80", "ks2");
        assert_eq!(sr.get("ks1", "-80"), Some("ks2"));
        assert_eq!(sr.rules.len(), 1);
        sr.delete("ks1", "-80");
        assert!(sr.get("ks1", "-80").is_none());
    }

    #[test]
    fn test_keyspace_rules_switch_per_tablet_type() {
        let mut kr = KeyspaceRules::default();
        kr.switch_keyspace("ks1", "ks2", &[TabletType::Replica, TabletType::Rdonly]);
        assert_eq!(kr.get("ks1@replica"), Some("ks2"));
        assert_eq!(kr.get("ks1@rdonly"), Some("ks2"));
        assert_eq!(kr.get("ks1"), None);
        kr.switch_keyspace("ks1", "ks2", &[TabletType::Primary]);
        assert_eq!(kr.get("ks1"), Some("ks2"));
    }

    #[test]
    fn test_mirror_percent_zero_removes_rule() {
        let mut mr = MirrorRules::default();
        mr.set_mirror("ks1", "ks2", &tables(&["t"]), &[TabletType::Replica], 25.0);
        assert!(mr.get("t@replica").is_some());
        assert!(mr.get("ks1.t@replica").is_some());
        mr.set_mirror("ks1", "ks2", &tables(&["t"]), &[TabletType::Replica], 0.0);
        assert!(mr.rules.is_empty());
    }

    #[test]
    fn test_mirror_percent_clamped() {
        let mut mr = MirrorRules::default();
        mr.set_mirror("ks1", "ks2", &tables(&["t"]), &[TabletType::Primary], 250.0);
        assert_eq!(mr.get("t").unwrap().percent, 100.0);
        mr.set_mirror("ks1", "ks2", &tables(&["t"]), &[TabletType::Primary], -5.0);
        assert!(mr.get("t").is_none());
    }
}
