//! The consumed topology-store trait.
//!
//! Every persisted object is versioned and every write is compare-and-
//! swap: a mismatched expected version fails with `ABORTED` and the
//! caller re-reads and retries. Locks are TTL leases; holding a lease id
//! lets long operations re-check ownership at each major step.

use std::time::Duration;

use async_trait::async_trait;

use kestrel_common::error::KestrelResult;
use kestrel_common::types::TabletAlias;

use crate::routing::{KeyspaceRules, MirrorRules, RoutingRules, ShardRules};
use crate::shard::{ShardRecord, TabletRecord};
use crate::vschema::{SrvVSchema, VSchema};

/// Topology object version. Version 0 means "object does not exist yet";
/// a successful save returns the new version.
pub type Version = u64;

/// A value read from the store together with the version to CAS against.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: Version,
}

impl<T> Versioned<T> {
    pub fn new(value: T, version: Version) -> Self {
        Self { value, version }
    }
}

/// A held TTL lock lease. The id is checked on `check_lock` and
/// `unlock`; a lease that expired and was re-acquired by someone else no
/// longer verifies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    pub path: String,
    pub id: u64,
}

/// The hierarchical metadata store the orchestrator runs against.
///
/// Mirrors the external store's RPC surface; the in-memory implementation
/// in [`crate::memory`] is the test double.
#[async_trait]
pub trait TopoStore: Send + Sync {
    // ── vschema ─────────────────────────────────────────────────────────
    async fn get_vschema(&self, keyspace: &str) -> KestrelResult<Versioned<VSchema>>;
    async fn save_vschema(
        &self,
        keyspace: &str,
        vschema: &VSchema,
        expected: Version,
    ) -> KestrelResult<Version>;

    /// The served view for one cell.
    async fn get_srv_vschema(&self, cell: &str) -> KestrelResult<SrvVSchema>;
    /// Recompute the served view for the given cells (all cells when
    /// empty) from the current global vschemas and rules.
    async fn rebuild_srv_vschema(&self, cells: &[String]) -> KestrelResult<()>;

    // ── routing rules ───────────────────────────────────────────────────
    async fn get_routing_rules(&self) -> KestrelResult<Versioned<RoutingRules>>;
    async fn save_routing_rules(
        &self,
        rules: &RoutingRules,
        expected: Version,
    ) -> KestrelResult<Version>;

    async fn get_shard_rules(&self) -> KestrelResult<Versioned<ShardRules>>;
    async fn save_shard_rules(
        &self,
        rules: &ShardRules,
        expected: Version,
    ) -> KestrelResult<Version>;

    async fn get_keyspace_rules(&self) -> KestrelResult<Versioned<KeyspaceRules>>;
    async fn save_keyspace_rules(
        &self,
        rules: &KeyspaceRules,
        expected: Version,
    ) -> KestrelResult<Version>;

    async fn get_mirror_rules(&self) -> KestrelResult<Versioned<MirrorRules>>;
    async fn save_mirror_rules(
        &self,
        rules: &MirrorRules,
        expected: Version,
    ) -> KestrelResult<Version>;

    // ── keyspaces / shards / tablets ────────────────────────────────────
    async fn get_keyspace_names(&self) -> KestrelResult<Vec<String>>;
    async fn get_shard_names(&self, keyspace: &str) -> KestrelResult<Vec<String>>;
    async fn get_shard(&self, keyspace: &str, shard: &str) -> KestrelResult<Versioned<ShardRecord>>;
    async fn update_shard(
        &self,
        keyspace: &str,
        shard: &str,
        record: &ShardRecord,
        expected: Version,
    ) -> KestrelResult<Version>;
    async fn delete_shard(&self, keyspace: &str, shard: &str) -> KestrelResult<()>;

    async fn get_tablet(&self, alias: &TabletAlias) -> KestrelResult<TabletRecord>;
    async fn get_tablet_map(&self, keyspace: &str, shard: &str)
        -> KestrelResult<Vec<TabletRecord>>;
    async fn get_cell_names(&self) -> KestrelResult<Vec<String>>;

    // ── locks ───────────────────────────────────────────────────────────
    /// Acquire the lock at `path` with the given TTL, or fail with
    /// `ABORTED` if someone else holds an unexpired lease.
    async fn lock(&self, path: &str, ttl: Duration, info: &str) -> KestrelResult<LockLease>;
    /// Verify the lease is still held (not expired, not stolen).
    async fn check_lock(&self, lease: &LockLease) -> KestrelResult<()>;
    async fn unlock(&self, lease: &LockLease) -> KestrelResult<()>;
}

/// Read-modify-write helpers over the raw CAS surface.
#[async_trait]
pub trait TopoStoreExt: TopoStore {
    /// Apply `mutate` to the shard record and save, retrying the CAS a
    /// bounded number of times. Shard-field updates are contended only by
    /// other orchestrator verbs, which the keyspace lock serializes, so
    /// conflicts here are rare and short.
    async fn update_shard_fields<F>(
        &self,
        keyspace: &str,
        shard: &str,
        mutate: F,
    ) -> KestrelResult<ShardRecord>
    where
        F: Fn(&mut ShardRecord) -> KestrelResult<()> + Send + Sync,
    {
        let mut last_err = None;
        for _ in 0..3 {
            let Versioned { mut value, version } = self.get_shard(keyspace, shard).await?;
            mutate(&mut value)?;
            match self.update_shard(keyspace, shard, &value, version).await {
                Ok(_) => return Ok(value),
                Err(e) if e.is_retryable() => last_err = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last_err
            .expect("retry loop always records an error")
            .wrap(format!("update shard {keyspace}/{shard}")))
    }
}

#[async_trait]
impl<T: TopoStore + ?Sized> TopoStoreExt for T {}
