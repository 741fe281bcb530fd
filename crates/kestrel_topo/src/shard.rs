//! Shard and tablet records as persisted in the topology store.

use serde::{Deserialize, Serialize};

use kestrel_common::error::{KestrelError, KestrelResult};
use kestrel_common::keyrange::KeyRange;
use kestrel_common::types::{TabletAlias, TabletType};

/// Per-tablet-type traffic control on a shard: the SQL router refuses
/// the denied tables, and query service can be cut entirely for the
/// listed cells.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardTabletControl {
    pub tablet_type: TabletType,
    /// Empty means all cells.
    #[serde(default)]
    pub cells: Vec<String>,
    #[serde(default)]
    pub denied_tables: Vec<String>,
    #[serde(default)]
    pub disable_query_service: bool,
}

/// Persisted shard descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRecord {
    pub keyspace: String,
    pub name: String,
    #[serde(default)]
    pub key_range: KeyRange,
    /// Whether this shard's primary serves write traffic. Flipped during
    /// a reshard cutover.
    #[serde(default)]
    pub is_primary_serving: bool,
    #[serde(default)]
    pub primary_alias: Option<TabletAlias>,
    #[serde(default)]
    pub tablet_controls: Vec<ShardTabletControl>,
}

impl ShardRecord {
    pub fn new(keyspace: &str, name: &str) -> KestrelResult<Self> {
        Ok(Self {
            keyspace: keyspace.to_string(),
            name: name.to_string(),
            key_range: KeyRange::parse(name)?,
            is_primary_serving: true,
            primary_alias: None,
            tablet_controls: Vec::new(),
        })
    }

    /// `keyspace/shard` form used in error messages and lock paths.
    pub fn key(&self) -> String {
        format!("{}/{}", self.keyspace, self.name)
    }

    fn control_mut(&mut self, tablet_type: TabletType, cells: &[String]) -> &mut ShardTabletControl {
        let idx = self
            .tablet_controls
            .iter()
            .position(|c| c.tablet_type == tablet_type && c.cells == cells);
        match idx {
            Some(i) => &mut self.tablet_controls[i],
            None => {
                self.tablet_controls.push(ShardTabletControl {
                    tablet_type,
                    cells: cells.to_vec(),
                    denied_tables: Vec::new(),
                    disable_query_service: false,
                });
                self.tablet_controls.last_mut().expect("just pushed")
            }
        }
    }

    /// Add or remove denied-table entries for one tablet type. Removing a
    /// table that is not denied is an error so rollback bugs surface
    /// instead of passing silently.
    pub fn update_denied_tables(
        &mut self,
        tablet_type: TabletType,
        cells: &[String],
        remove: bool,
        tables: &[String],
    ) -> KestrelResult<()> {
        let key = self.key();
        let control = self.control_mut(tablet_type, cells);
        if remove {
            for t in tables {
                if !control.denied_tables.contains(t) {
                    return Err(KestrelError::FailedPrecondition(format!(
                        "table {t} is not denied on shard {key} for {tablet_type}"
                    )));
                }
            }
            control.denied_tables.retain(|t| !tables.contains(t));
        } else {
            for t in tables {
                if !control.denied_tables.contains(t) {
                    control.denied_tables.push(t.clone());
                }
            }
            control.denied_tables.sort();
        }
        // Drop empty controls so a full rollback restores the pre-call record.
        self.tablet_controls
            .retain(|c| !c.denied_tables.is_empty() || c.disable_query_service);
        Ok(())
    }

    /// Set or clear disable-query-service for one tablet type in the
    /// given cells (shard-level read switching).
    pub fn set_query_service_disabled(
        &mut self,
        tablet_type: TabletType,
        cells: &[String],
        disabled: bool,
    ) {
        let control = self.control_mut(tablet_type, cells);
        control.disable_query_service = disabled;
        self.tablet_controls
            .retain(|c| !c.denied_tables.is_empty() || c.disable_query_service);
    }

    /// Denied tables for a tablet type, across all cell scopes.
    pub fn denied_tables(&self, tablet_type: TabletType) -> Vec<String> {
        let mut out: Vec<String> = self
            .tablet_controls
            .iter()
            .filter(|c| c.tablet_type == tablet_type)
            .flat_map(|c| c.denied_tables.iter().cloned())
            .collect();
        out.sort();
        out.dedup();
        out
    }

    pub fn query_service_disabled(&self, tablet_type: TabletType, cell: &str) -> bool {
        self.tablet_controls.iter().any(|c| {
            c.tablet_type == tablet_type
                && c.disable_query_service
                && (c.cells.is_empty() || c.cells.iter().any(|x| x == cell))
        })
    }
}

/// Registered tablet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletRecord {
    pub alias: TabletAlias,
    pub keyspace: String,
    pub shard: String,
    pub tablet_type: TabletType,
    pub hostname: String,
}
