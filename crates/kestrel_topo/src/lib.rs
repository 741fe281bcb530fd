//! Topology-store surface for the KestrelDB workflow orchestrator.
//!
//! The store is the single source of truth: routing rules, vschemas,
//! shard records, and tablet registrations live here, every mutation is
//! compare-and-swap, and the orchestrator keeps no state of its own
//! across verbs. The real backend is an external hierarchical key-value
//! store; this crate defines the consumed trait plus an in-memory
//! implementation used by tests and embedded deployments.

pub mod lock;
pub mod memory;
pub mod routing;
pub mod shard;
pub mod store;
pub mod vschema;

pub use lock::{KeyspaceLock, NamedLock};
pub use memory::MemoryTopoStore;
pub use routing::{
    KeyspaceRule, KeyspaceRules, MirrorRule, MirrorRules, RoutingRules, ShardRule, ShardRules,
    TableRule, TrafficDirection,
};
pub use shard::{ShardRecord, ShardTabletControl, TabletRecord};
pub use store::{LockLease, TopoStore, TopoStoreExt, Version, Versioned};
pub use vschema::{ColumnVindex, SrvVSchema, VSchema, VSchemaTable, Vindex};
