//! Workflow orchestration for KestrelDB: the control plane that moves
//! data across shards of a live cluster without interrupting traffic.
//!
//! # Architecture
//!
//! ```text
//!   WorkflowServer (public verbs)
//!       |
//!       +-- WorkflowFetcher (fan-out stream reads → Workflow aggregates)
//!       +-- Materializer / Resharder (plan + create streams)
//!       +-- TrafficSwitcher (SwitchReads / SwitchWrites state machine)
//!       |       +-- SwitchActions (execute vs dry-run record)
//!       |       +-- StreamMigrator (dependent streams during reshard)
//!       +-- CopyProgress (per-table rows/bytes both sides)
//!       |
//!   topology store (routing rules, shard records, locks)  [kestrel_topo]
//!   shard agents   (stream rows, SQL, positions, journal)  [kestrel_agent]
//! ```
//!
//! The topology store owns all persisted truth; each verb derives what it
//! needs, mutates under locks, and drops its state on return.

pub mod fanout;
pub mod fetcher;
pub mod materializer;
pub mod progress;
pub mod resharder;
pub mod server;
pub mod stream_migrator;
pub mod traffic;
pub mod workflow;

use std::sync::Arc;

use kestrel_agent::AgentResolver;
use kestrel_common::OrchestratorConfig;
use kestrel_topo::TopoStore;

pub use fetcher::{FetchRequest, WorkflowFetcher};
pub use materializer::{MaterializeSettings, Materializer, TableSetting};
pub use progress::{CopyProgress, TableCopyProgress};
pub use resharder::{Resharder, ReshardRequest};
pub use server::{
    LookupVindexCreateRequest, LookupVindexRequest, MirrorTrafficRequest,
    MoveTablesCompleteRequest, MoveTablesCreateRequest, StreamStatus, WorkflowDeleteRequest,
    WorkflowServer, WorkflowStatusResponse, WorkflowUpdateRequest,
};
pub use stream_migrator::StreamMigrator;
pub use traffic::{SwitchRequest, SwitchResponse, TrafficSwitcher};
pub use workflow::{reverse_name, Workflow, WorkflowState, WorkflowStream};

/// Shared handles every component runs against.
#[derive(Clone)]
pub struct Env {
    pub topo: Arc<dyn TopoStore>,
    pub agents: Arc<dyn AgentResolver>,
    pub config: Arc<OrchestratorConfig>,
}

impl Env {
    pub fn new(
        topo: Arc<dyn TopoStore>,
        agents: Arc<dyn AgentResolver>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            topo,
            agents,
            config: Arc::new(config),
        }
    }
}
