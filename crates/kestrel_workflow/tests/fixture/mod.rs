//! Shared cluster fixture: in-memory topology store plus fake shard
//! agents, wired the way an embedded orchestrator would be.

use std::collections::HashMap;
use std::sync::Arc;

use kestrel_agent::{FakeAgent, ShardAgent, StaticAgentResolver};
use kestrel_common::types::{TabletAlias, TabletType};
use kestrel_common::OrchestratorConfig;
use kestrel_topo::{MemoryTopoStore, ShardRecord, TabletRecord, TopoStore};
use kestrel_workflow::{Env, WorkflowServer};

pub struct Cluster {
    pub topo: Arc<MemoryTopoStore>,
    pub env: Env,
    pub server: WorkflowServer,
    agents: HashMap<String, Arc<FakeAgent>>,
}

pub struct KeyspaceSpec<'a> {
    pub name: &'a str,
    pub shards: &'a [&'a str],
    pub serving: bool,
}

/// Route orchestrator logs through the test harness; `RUST_LOG` filters.
fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

impl Cluster {
    /// Build a cluster with cells `c1`/`c2` and the given keyspaces, one
    /// fake agent and one registered primary tablet per shard.
    pub fn new(keyspaces: &[KeyspaceSpec<'_>]) -> Self {
        init_tracing();
        let topo = Arc::new(MemoryTopoStore::new());
        topo.add_cell("c1");
        topo.add_cell("c2");
        let resolver = Arc::new(StaticAgentResolver::new());
        let mut agents = HashMap::new();
        let mut uid = 100;

        for ks in keyspaces {
            for shard in ks.shards {
                let mut record = ShardRecord::new(ks.name, shard).unwrap();
                record.is_primary_serving = ks.serving;
                record.primary_alias = Some(TabletAlias::new("c1", uid));
                topo.add_shard(record).unwrap();
                topo.add_tablet(TabletRecord {
                    alias: TabletAlias::new("c1", uid),
                    keyspace: ks.name.to_string(),
                    shard: shard.to_string(),
                    tablet_type: TabletType::Primary,
                    hostname: format!("{}-{shard}", ks.name),
                });
                uid += 1;

                let agent = Arc::new(FakeAgent::new(ks.name, shard));
                resolver.register(ks.name, shard, Arc::clone(&agent) as Arc<dyn ShardAgent>);
                agents.insert(format!("{}/{shard}", ks.name), agent);
            }
        }

        let env = Env::new(
            Arc::clone(&topo) as Arc<dyn TopoStore>,
            resolver,
            OrchestratorConfig::default(),
        );
        Cluster {
            topo,
            server: WorkflowServer::new(env.clone()),
            env,
            agents,
        }
    }

    pub fn agent(&self, keyspace: &str, shard: &str) -> &Arc<FakeAgent> {
        self.agents
            .get(&format!("{keyspace}/{shard}"))
            .unwrap_or_else(|| panic!("no fixture agent for {keyspace}/{shard}"))
    }
}
