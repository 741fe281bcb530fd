//! SwitchReads: move replica/rdonly traffic between source and target.

use kestrel_common::error::{KestrelError, KestrelResult};
use kestrel_common::opctx::OpCtx;
use kestrel_common::types::{MigrationType, TabletType};
use kestrel_topo::lock::KeyspaceLock;

use crate::traffic::{SwitchActions, SwitchRequest, TrafficSwitcher};

impl TrafficSwitcher {
    /// Switch read traffic for the requested cells and tablet types.
    ///
    /// Protocol:
    /// 1. Gate validations (errors, copy, frozen, lag, refresh).
    /// 2. Source keyspace lock, TTL at least the verb timeout.
    /// 3. Drop mirror rules for the requested read types.
    /// 4. Rewrite the routing layer that governs this workflow's reads.
    /// 5. Served views verified against the write; rolled back on
    ///    divergence (inside the executing actions).
    pub async fn switch_reads(
        &self,
        ctx: &OpCtx,
        req: &SwitchRequest,
        actions: &dyn SwitchActions,
    ) -> KestrelResult<()> {
        let read_types: Vec<TabletType> = req
            .tablet_types
            .iter()
            .copied()
            .filter(|t| !t.is_primary())
            .collect();
        if read_types.is_empty() {
            return Err(KestrelError::InvalidArgument(
                "switch reads requires at least one replica or rdonly tablet type".into(),
            ));
        }

        let timeout = self.env.config.resolve_timeout(req.timeout)?;
        let max_lag = req
            .max_replication_lag_allowed
            .unwrap_or(self.env.config.max_replication_lag_allowed());
        self.validate_switch(ctx, max_lag, req.force).await?;

        let lock = KeyspaceLock::acquire(
            self.env.topo.clone(),
            &self.source_keyspace,
            "SwitchReads",
            self.env.config.lock_ttl(timeout).max(timeout),
        )
        .await?;

        let result = self
            .switch_reads_locked(ctx, req, &read_types, actions)
            .await;
        lock.release().await;
        result.map_err(|e| e.wrap(format!("switch reads for workflow {}", self.workflow_name)))
    }

    async fn switch_reads_locked(
        &self,
        ctx: &OpCtx,
        req: &SwitchRequest,
        read_types: &[TabletType],
        actions: &dyn SwitchActions,
    ) -> KestrelResult<()> {
        ctx.check("switch reads")?;
        actions.remove_mirror_rules(self, read_types).await?;

        if self.is_partial() {
            // Shard routing governs a partial migration; reads and writes
            // move together per shard at SwitchWrites time.
            tracing::info!(
                workflow = %self.workflow_name,
                "partial workflow: read switching is a no-op, shard rules govern"
            );
            return Ok(());
        }
        if self.is_multi_tenant() {
            return actions
                .switch_keyspace_reads(self, read_types, req.direction)
                .await;
        }
        match self.migration_type {
            MigrationType::Tables => {
                actions
                    .switch_table_reads(self, &req.cells, read_types, req.direction)
                    .await
            }
            MigrationType::Shards => {
                actions
                    .switch_shard_reads(self, &req.cells, read_types, req.direction)
                    .await
            }
        }
    }
}
