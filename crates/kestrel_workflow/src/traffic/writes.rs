//! SwitchWrites: the primary-traffic cutover.
//!
//! The flow stops source writes, drains in-flight transactions, waits for
//! the targets to absorb everything the sources ever committed, then
//! repoints primary routing, with a journal written at the point of no
//! return so a crashed run resumes by rolling forward instead of back.
//!
//! Rollback discipline: every step before the journal is undone by
//! `roll_back`; once journals exist, errors surface but the machinery is
//! left in place and a re-run finds the journal and completes the
//! remaining steps idempotently.

use std::collections::BTreeMap;
use std::time::Duration;

use kestrel_common::error::{KestrelError, KestrelResult};
use kestrel_common::opctx::OpCtx;
use kestrel_common::types::{Position, TabletType};
use kestrel_topo::lock::KeyspaceLock;
use kestrel_topo::routing::TrafficDirection;

use crate::stream_migrator::StreamMigrator;
use crate::traffic::{SwitchActions, SwitchRequest, TrafficSwitcher};

impl TrafficSwitcher {
    /// Switch primary traffic to the target. Returns the journal id of
    /// this cutover run.
    pub async fn switch_writes(
        &self,
        ctx: &OpCtx,
        req: &SwitchRequest,
        actions: &dyn SwitchActions,
    ) -> KestrelResult<u64> {
        if self.is_multi_tenant() && req.direction == TrafficDirection::Backward {
            return Err(KestrelError::InvalidArgument(format!(
                "cannot reverse writes for multi-tenant workflow {}: multiple tenants share the target tables",
                self.workflow_name
            )));
        }

        let timeout = self.env.config.resolve_timeout(req.timeout)?;
        let max_lag = req
            .max_replication_lag_allowed
            .unwrap_or(self.env.config.max_replication_lag_allowed());

        if !req.cancel {
            self.validate_switch(ctx, max_lag, req.force).await?;
            if req.enable_reverse_replication {
                self.validate_reverse_feasible(ctx).await?;
            }
        }

        // Source and target keyspaces both lock for the duration; a
        // reshard shares one keyspace and takes a single lock. TTL spans
        // several RPC groups, so it must comfortably outlive the verb.
        let lock_ttl = self.env.config.lock_ttl(timeout).max(timeout * 3);
        let source_lock = KeyspaceLock::acquire(
            self.env.topo.clone(),
            &self.source_keyspace,
            "SwitchWrites",
            lock_ttl,
        )
        .await?;
        let target_lock = if self.target_keyspace != self.source_keyspace {
            Some(
                match KeyspaceLock::acquire(
                    self.env.topo.clone(),
                    &self.target_keyspace,
                    "SwitchWrites",
                    lock_ttl,
                )
                .await
                {
                    Ok(lock) => lock,
                    Err(e) => {
                        source_lock.release().await;
                        return Err(e);
                    }
                },
            )
        } else {
            None
        };

        let result = self
            .switch_writes_locked(ctx, req, timeout, &source_lock, actions)
            .await;

        if let Some(lock) = target_lock {
            lock.release().await;
        }
        source_lock.release().await;
        result.map_err(|e| e.wrap(format!("switch writes for workflow {}", self.workflow_name)))
    }

    async fn switch_writes_locked(
        &self,
        ctx: &OpCtx,
        req: &SwitchRequest,
        timeout: Duration,
        source_lock: &KeyspaceLock,
        actions: &dyn SwitchActions,
    ) -> KestrelResult<u64> {
        let journal_id = self.migration_id();

        actions.remove_mirror_rules(self, &[TabletType::Primary]).await?;

        // A journal from an earlier run means the point of no return was
        // already crossed: the only legal continuation is rolling forward.
        let journals_exist = !actions.is_dry_run() && self.journals_exist(ctx).await?;
        if journals_exist && req.cancel {
            return Err(KestrelError::FailedPrecondition(format!(
                "cannot cancel: journal {journal_id} exists on the sources, the cutover must roll forward"
            )));
        }
        if journals_exist {
            tracing::info!(
                workflow = %self.workflow_name,
                journal = journal_id,
                "journal found on sources, rolling the cutover forward"
            );
            return self.complete_after_journal(ctx, req, actions).await;
        }

        let sm = StreamMigrator::build(self, ctx).await?;

        if req.cancel {
            actions.cancel_dependent_streams(self, &sm, ctx).await?;
            actions.undo_stop_source_writes(self).await?;
            if req.enable_reverse_replication {
                actions.delete_reverse_workflow(self).await?;
            }
            tracing::info!(workflow = %self.workflow_name, "write switch canceled and rolled back");
            return Ok(journal_id);
        }

        // Writes stop now; everything from here to journal creation must
        // be rollback-safe.
        actions.stop_source_writes(self).await?;

        let pre_journal = async {
            actions.stop_dependent_streams(self, &sm, ctx).await?;
            actions.lock_source_tables(self, ctx).await?;

            let positions: BTreeMap<String, Position> = if actions.is_dry_run() {
                BTreeMap::new()
            } else {
                self.gather_source_positions(ctx).await?
            };

            actions
                .wait_for_catchup(self, ctx, &positions, timeout)
                .await?;
            source_lock.check().await?;

            actions.migrate_dependent_streams(self, &sm, ctx).await?;
            actions.reset_sequences(self).await?;

            if req.enable_reverse_replication {
                actions.create_reverse_workflow(self, &positions).await?;
            }
            if req.initialize_target_sequences {
                actions.initialize_target_sequences(self).await?;
            }
            Ok::<_, KestrelError>(positions)
        }
        .await;

        let positions = match pre_journal {
            Ok(positions) => positions,
            Err(e) => {
                self.roll_back(ctx, req, &sm, actions).await;
                return Err(e.wrap("write switch rolled back"));
            }
        };

        source_lock.check().await?;

        // Point of no return: after the journals land, this cutover only
        // rolls forward.
        actions
            .create_journals(self, &positions, &sm.workflow_names())
            .await?;

        actions.allow_target_writes(self).await?;
        actions.change_write_routing(self, req.direction).await?;
        actions.finalize_dependent_streams(self, &sm, ctx).await?;
        if req.enable_reverse_replication {
            actions.start_reverse_workflow(self).await?;
        }
        actions.freeze_target(self).await?;

        tracing::info!(
            workflow = %self.workflow_name,
            journal = journal_id,
            source = %self.source_keyspace,
            target = %self.target_keyspace,
            "write traffic switched"
        );
        Ok(journal_id)
    }

    /// The completion tail executed when a journal already exists.
    async fn complete_after_journal(
        &self,
        ctx: &OpCtx,
        req: &SwitchRequest,
        actions: &dyn SwitchActions,
    ) -> KestrelResult<u64> {
        let sm = StreamMigrator::build(self, ctx).await?;
        actions.allow_target_writes(self).await?;
        actions.change_write_routing(self, req.direction).await?;
        actions.finalize_dependent_streams(self, &sm, ctx).await?;
        if req.enable_reverse_replication {
            actions.start_reverse_workflow(self).await?;
        }
        actions.freeze_target(self).await?;
        Ok(self.migration_id())
    }

    /// Best-effort rollback of a pre-journal failure. Rollback failures
    /// are logged, never returned, so the original error survives.
    async fn roll_back(
        &self,
        ctx: &OpCtx,
        req: &SwitchRequest,
        sm: &StreamMigrator,
        actions: &dyn SwitchActions,
    ) {
        if let Err(e) = actions.cancel_dependent_streams(self, sm, ctx).await {
            tracing::warn!(workflow = %self.workflow_name, error = %e, "rollback: canceling dependent streams failed");
        }
        if let Err(e) = actions.undo_stop_source_writes(self).await {
            tracing::warn!(workflow = %self.workflow_name, error = %e, "rollback: restoring source writes failed");
        }
        if req.enable_reverse_replication {
            if let Err(e) = actions.delete_reverse_workflow(self).await {
                tracing::debug!(workflow = %self.workflow_name, error = %e, "rollback: no reverse workflow to delete");
            }
        }
    }
}
