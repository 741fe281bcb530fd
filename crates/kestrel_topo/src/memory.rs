//! In-memory topology store: the test double for the external metadata
//! store, with real CAS and TTL-lease semantics so orchestrator code
//! exercises the same conflict paths it would hit in production.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use kestrel_common::error::{KestrelError, KestrelResult};
use kestrel_common::types::TabletAlias;

use crate::routing::{KeyspaceRules, MirrorRules, RoutingRules, ShardRules};
use crate::shard::{ShardRecord, TabletRecord};
use crate::store::{LockLease, TopoStore, Version, Versioned};
use crate::vschema::{SrvVSchema, VSchema};

const ROUTING_RULES_PATH: &str = "routing_rules";
const SHARD_RULES_PATH: &str = "shard_rules";
const KEYSPACE_RULES_PATH: &str = "keyspace_rules";
const MIRROR_RULES_PATH: &str = "mirror_rules";

#[derive(Debug, Clone)]
struct Stored {
    json: serde_json::Value,
    version: Version,
}

#[derive(Debug)]
struct HeldLock {
    id: u64,
    expires_at: Instant,
    info: String,
}

/// In-memory `TopoStore`. All objects are stored as JSON values under
/// stable paths, mirroring the hierarchical layout of the real store.
#[derive(Default)]
pub struct MemoryTopoStore {
    objects: DashMap<String, Stored>,
    srv_vschemas: DashMap<String, SrvVSchema>,
    tablets: DashMap<String, TabletRecord>,
    cells: Mutex<Vec<String>>,
    locks: Mutex<HashMap<String, HeldLock>>,
    next_lock_id: AtomicU64,
}

impl MemoryTopoStore {
    pub fn new() -> Self {
        Self {
            next_lock_id: AtomicU64::new(1),
            ..Default::default()
        }
    }

    fn vschema_path(keyspace: &str) -> String {
        format!("keyspaces/{keyspace}/vschema")
    }

    fn shard_path(keyspace: &str, shard: &str) -> String {
        format!("keyspaces/{keyspace}/shards/{shard}")
    }

    fn get_json<T: serde::de::DeserializeOwned + Default>(
        &self,
        path: &str,
    ) -> KestrelResult<Versioned<T>> {
        match self.objects.get(path) {
            Some(stored) => {
                let value: T = serde_json::from_value(stored.json.clone()).map_err(|e| {
                    KestrelError::Internal(format!("corrupt topo object at {path}: {e}"))
                })?;
                Ok(Versioned::new(value, stored.version))
            }
            None => Ok(Versioned::new(T::default(), 0)),
        }
    }

    fn save_json<T: serde::Serialize>(
        &self,
        path: &str,
        value: &T,
        expected: Version,
    ) -> KestrelResult<Version> {
        let json = serde_json::to_value(value)
            .map_err(|e| KestrelError::Internal(format!("serialize {path}: {e}")))?;
        match self.objects.entry(path.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let stored = occupied.get_mut();
                if stored.version != expected {
                    return Err(KestrelError::Aborted(format!(
                        "version mismatch at {path}: expected {expected}, found {}",
                        stored.version
                    )));
                }
                stored.json = json;
                stored.version += 1;
                Ok(stored.version)
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                if expected != 0 {
                    return Err(KestrelError::Aborted(format!(
                        "version mismatch at {path}: expected {expected}, found 0"
                    )));
                }
                vacant.insert(Stored { json, version: 1 });
                Ok(1)
            }
        }
    }

    // ── test/bootstrap helpers ──────────────────────────────────────────

    /// Register a cell.
    pub fn add_cell(&self, cell: &str) {
        let mut cells = self.cells.lock();
        if !cells.iter().any(|c| c == cell) {
            cells.push(cell.to_string());
        }
    }

    /// Create a shard record (bootstrap only; production shards come from
    /// the provisioning plane).
    pub fn add_shard(&self, record: ShardRecord) -> KestrelResult<()> {
        let path = Self::shard_path(&record.keyspace, &record.name);
        self.save_json(&path, &record, 0)
            .map(|_| ())
            .map_err(|e| e.wrap(format!("create shard {}", record.key())))
    }

    pub fn add_tablet(&self, record: TabletRecord) {
        self.tablets.insert(record.alias.to_string(), record);
    }
}

#[async_trait]
impl TopoStore for MemoryTopoStore {
    async fn get_vschema(&self, keyspace: &str) -> KestrelResult<Versioned<VSchema>> {
        self.get_json(&Self::vschema_path(keyspace))
    }

    async fn save_vschema(
        &self,
        keyspace: &str,
        vschema: &VSchema,
        expected: Version,
    ) -> KestrelResult<Version> {
        self.save_json(&Self::vschema_path(keyspace), vschema, expected)
    }

    async fn get_srv_vschema(&self, cell: &str) -> KestrelResult<SrvVSchema> {
        Ok(self
            .srv_vschemas
            .get(cell)
            .map(|s| s.clone())
            .unwrap_or_default())
    }

    async fn rebuild_srv_vschema(&self, cells: &[String]) -> KestrelResult<()> {
        let targets = if cells.is_empty() {
            self.get_cell_names().await?
        } else {
            cells.to_vec()
        };

        let mut keyspaces = std::collections::BTreeMap::new();
        for path in self.objects.iter() {
            if let Some(ks) = path
                .key()
                .strip_prefix("keyspaces/")
                .and_then(|rest| rest.strip_suffix("/vschema"))
            {
                let vs: VSchema = serde_json::from_value(path.json.clone()).map_err(|e| {
                    KestrelError::Internal(format!("corrupt vschema for {ks}: {e}"))
                })?;
                keyspaces.insert(ks.to_string(), vs);
            }
        }
        let snapshot = SrvVSchema {
            keyspaces,
            routing_rules: self.get_routing_rules().await?.value,
            shard_rules: self.get_shard_rules().await?.value,
            keyspace_rules: self.get_keyspace_rules().await?.value,
            mirror_rules: self.get_mirror_rules().await?.value,
        };
        for cell in targets {
            self.srv_vschemas.insert(cell, snapshot.clone());
        }
        Ok(())
    }

    async fn get_routing_rules(&self) -> KestrelResult<Versioned<RoutingRules>> {
        self.get_json(ROUTING_RULES_PATH)
    }

    async fn save_routing_rules(
        &self,
        rules: &RoutingRules,
        expected: Version,
    ) -> KestrelResult<Version> {
        let mut normalized = rules.clone();
        normalized.normalize();
        self.save_json(ROUTING_RULES_PATH, &normalized, expected)
    }

    async fn get_shard_rules(&self) -> KestrelResult<Versioned<ShardRules>> {
        self.get_json(SHARD_RULES_PATH)
    }

    async fn save_shard_rules(
        &self,
        rules: &ShardRules,
        expected: Version,
    ) -> KestrelResult<Version> {
        let mut normalized = rules.clone();
        normalized.normalize();
        self.save_json(SHARD_RULES_PATH, &normalized, expected)
    }

    async fn get_keyspace_rules(&self) -> KestrelResult<Versioned<KeyspaceRules>> {
        self.get_json(KEYSPACE_RULES_PATH)
    }

    async fn save_keyspace_rules(
        &self,
        rules: &KeyspaceRules,
        expected: Version,
    ) -> KestrelResult<Version> {
        let mut normalized = rules.clone();
        normalized.normalize();
        self.save_json(KEYSPACE_RULES_PATH, &normalized, expected)
    }

    async fn get_mirror_rules(&self) -> KestrelResult<Versioned<MirrorRules>> {
        self.get_json(MIRROR_RULES_PATH)
    }

    async fn save_mirror_rules(
        &self,
        rules: &MirrorRules,
        expected: Version,
    ) -> KestrelResult<Version> {
        let mut normalized = rules.clone();
        normalized.normalize();
        self.save_json(MIRROR_RULES_PATH, &normalized, expected)
    }

    async fn get_keyspace_names(&self) -> KestrelResult<Vec<String>> {
        let mut names: Vec<String> = self
            .objects
            .iter()
            .filter_map(|e| {
                e.key()
                    .strip_prefix("keyspaces/")
                    .and_then(|rest| rest.split('/').next())
                    .map(str::to_string)
            })
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn get_shard_names(&self, keyspace: &str) -> KestrelResult<Vec<String>> {
        let prefix = format!("keyspaces/{keyspace}/shards/");
        let mut names: Vec<String> = self
            .objects
            .iter()
            .filter_map(|e| e.key().strip_prefix(&prefix).map(str::to_string))
            .collect();
        names.sort();
        Ok(names)
    }

    async fn get_shard(&self, keyspace: &str, shard: &str) -> KestrelResult<Versioned<ShardRecord>> {
        let path = Self::shard_path(keyspace, shard);
        if !self.objects.contains_key(&path) {
            return Err(KestrelError::NotFound(format!(
                "shard {keyspace}/{shard} not found"
            )));
        }
        self.get_json(&path)
    }

    async fn update_shard(
        &self,
        keyspace: &str,
        shard: &str,
        record: &ShardRecord,
        expected: Version,
    ) -> KestrelResult<Version> {
        self.save_json(&Self::shard_path(keyspace, shard), record, expected)
    }

    async fn delete_shard(&self, keyspace: &str, shard: &str) -> KestrelResult<()> {
        self.objects.remove(&Self::shard_path(keyspace, shard));
        Ok(())
    }

    async fn get_tablet(&self, alias: &TabletAlias) -> KestrelResult<TabletRecord> {
        self.tablets
            .get(&alias.to_string())
            .map(|t| t.clone())
            .ok_or_else(|| KestrelError::NotFound(format!("tablet {alias} not found")))
    }

    async fn get_tablet_map(
        &self,
        keyspace: &str,
        shard: &str,
    ) -> KestrelResult<Vec<TabletRecord>> {
        let mut out: Vec<TabletRecord> = self
            .tablets
            .iter()
            .filter(|t| t.keyspace == keyspace && t.shard == shard)
            .map(|t| t.clone())
            .collect();
        out.sort_by(|a, b| a.alias.cmp(&b.alias));
        Ok(out)
    }

    async fn get_cell_names(&self) -> KestrelResult<Vec<String>> {
        Ok(self.cells.lock().clone())
    }

    async fn lock(&self, path: &str, ttl: Duration, info: &str) -> KestrelResult<LockLease> {
        let mut locks = self.locks.lock();
        let now = Instant::now();
        if let Some(held) = locks.get(path) {
            if held.expires_at > now {
                return Err(KestrelError::Aborted(format!(
                    "lock {path} already held: {}",
                    held.info
                )));
            }
            tracing::warn!(path, stale = %held.info, "taking over expired lock lease");
        }
        let id = self.next_lock_id.fetch_add(1, Ordering::SeqCst);
        locks.insert(
            path.to_string(),
            HeldLock {
                id,
                expires_at: now + ttl,
                info: info.to_string(),
            },
        );
        Ok(LockLease {
            path: path.to_string(),
            id,
        })
    }

    async fn check_lock(&self, lease: &LockLease) -> KestrelResult<()> {
        let locks = self.locks.lock();
        match locks.get(&lease.path) {
            Some(held) if held.id == lease.id && held.expires_at > Instant::now() => Ok(()),
            Some(held) if held.id == lease.id => Err(KestrelError::Aborted(format!(
                "lock {} lease expired",
                lease.path
            ))),
            _ => Err(KestrelError::Aborted(format!(
                "lock {} no longer held by this lease",
                lease.path
            ))),
        }
    }

    async fn unlock(&self, lease: &LockLease) -> KestrelResult<()> {
        let mut locks = self.locks.lock();
        match locks.get(&lease.path) {
            Some(held) if held.id == lease.id => {
                locks.remove(&lease.path);
                Ok(())
            }
            _ => Err(KestrelError::Aborted(format!(
                "unlock {}: lease not current",
                lease.path
            ))),
        }
    }
}
