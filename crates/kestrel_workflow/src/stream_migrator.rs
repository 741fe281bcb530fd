//! Stream migrator: carries streams that land on shards being retired by
//! a reshard over to the replacement shards.
//!
//! During a shard cutover, any stream whose target is one of the retiring
//! shards (a materialization into the keyspace, an index backfill) would
//! be orphaned. The migrator stops those streams at the frozen position,
//! recreates them on the new shards with key ranges narrowed to each new
//! shard's slice, and deletes the originals at finalize. Cancellation
//! removes the copies and restarts the originals.

use std::collections::BTreeMap;

use kestrel_agent::types::{
    BinlogSource, CreateWorkflowRequest, ReadWorkflowsRequest, StreamRow, StreamState,
    UpdateWorkflowRequest,
};
use kestrel_common::error::KestrelResult;
use kestrel_common::opctx::OpCtx;
use kestrel_common::types::MigrationType;
use kestrel_common::KeyRange;

use crate::traffic::TrafficSwitcher;
use crate::workflow::reverse_name;

/// Streams found on retiring shards, keyed by source shard name.
pub struct StreamMigrator {
    streams: BTreeMap<String, Vec<StreamRow>>,
}

impl StreamMigrator {
    /// Detect migratable streams. Only shard cutovers have any: a table
    /// migration leaves its source shards alive.
    pub async fn build(ts: &TrafficSwitcher, _ctx: &OpCtx) -> KestrelResult<Self> {
        let mut streams: BTreeMap<String, Vec<StreamRow>> = BTreeMap::new();
        if ts.migration_type != MigrationType::Shards {
            return Ok(Self { streams });
        }

        let own = &ts.workflow_name;
        let own_reverse = reverse_name(own);
        for (shard, agent) in ts.source_agents()? {
            let rows = agent
                .read_workflows(&ReadWorkflowsRequest::default())
                .await?;
            let found: Vec<StreamRow> = rows
                .into_iter()
                .filter(|r| r.workflow != *own && r.workflow != own_reverse)
                .collect();
            if !found.is_empty() {
                streams.insert(shard, found);
            }
        }
        Ok(Self { streams })
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Names of the workflows being carried over, for the journal.
    pub fn workflow_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .streams
            .values()
            .flatten()
            .map(|r| r.workflow.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Stop every dependent stream so its position freezes with the
    /// source writes.
    pub async fn stop_streams(&self, ts: &TrafficSwitcher, _ctx: &OpCtx) -> KestrelResult<()> {
        for (shard, rows) in &self.streams {
            let agent = ts.env.agents.agent_for(&ts.source_keyspace, shard)?;
            for workflow in workflows_of(rows) {
                agent
                    .update_workflow(&UpdateWorkflowRequest {
                        workflow,
                        state: Some(StreamState::Stopped),
                        ..Default::default()
                    })
                    .await?;
            }
        }
        Ok(())
    }

    /// Recreate the stopped streams on every target shard, paused, with
    /// each copy's filter narrowed to the new shard's key range.
    pub async fn migrate_streams(&self, ts: &TrafficSwitcher, _ctx: &OpCtx) -> KestrelResult<()> {
        if self.streams.is_empty() {
            return Ok(());
        }

        // Group all originals by workflow so each target gets one
        // workflow with the union of binlog sources.
        let mut by_workflow: BTreeMap<String, Vec<StreamRow>> = BTreeMap::new();
        for rows in self.streams.values() {
            for row in rows {
                by_workflow
                    .entry(row.workflow.clone())
                    .or_default()
                    .push(row.clone());
            }
        }

        for target in &ts.targets {
            let agent = ts.env.agents.agent_for(&target.keyspace, &target.shard)?;
            let target_range = KeyRange::parse(&target.shard)?;
            for (workflow, rows) in &by_workflow {
                let sources: Vec<BinlogSource> = rows
                    .iter()
                    .map(|row| {
                        let mut source = row.binlog_source.clone();
                        for rule in &mut source.filter.rules {
                            rule.key_range = Some(target_range.clone());
                        }
                        source
                    })
                    .collect();
                let first = &rows[0];
                agent
                    .create_workflow(&CreateWorkflowRequest {
                        workflow: workflow.clone(),
                        workflow_type: first
                            .workflow_type
                            .unwrap_or(kestrel_common::types::WorkflowType::Materialize),
                        workflow_sub_type: first.workflow_sub_type,
                        binlog_sources: sources,
                        cells: vec![],
                        tablet_types: vec![],
                        auto_start: false,
                        stop_after_copy: false,
                        options: first.options.clone(),
                    })
                    .await?;
            }
        }
        Ok(())
    }

    /// Undo everything: drop the target copies, restart the originals.
    pub async fn cancel(&self, ts: &TrafficSwitcher, _ctx: &OpCtx) -> KestrelResult<()> {
        let names = self.workflow_names();
        for target in &ts.targets {
            let agent = ts.env.agents.agent_for(&target.keyspace, &target.shard)?;
            for workflow in &names {
                agent.delete_workflow(workflow).await?;
            }
        }
        for (shard, rows) in &self.streams {
            let agent = ts.env.agents.agent_for(&ts.source_keyspace, shard)?;
            for workflow in workflows_of(rows) {
                agent
                    .update_workflow(&UpdateWorkflowRequest {
                        workflow,
                        state: Some(StreamState::Running),
                        ..Default::default()
                    })
                    .await?;
            }
        }
        Ok(())
    }

    /// Commit: delete the originals from the retiring shards and start
    /// the copies on the new ones.
    pub async fn finalize(&self, ts: &TrafficSwitcher, _ctx: &OpCtx) -> KestrelResult<()> {
        let names = self.workflow_names();
        for (shard, rows) in &self.streams {
            let agent = ts.env.agents.agent_for(&ts.source_keyspace, shard)?;
            for workflow in workflows_of(rows) {
                agent.delete_workflow(&workflow).await?;
            }
        }
        for target in &ts.targets {
            let agent = ts.env.agents.agent_for(&target.keyspace, &target.shard)?;
            for workflow in &names {
                agent
                    .update_workflow(&UpdateWorkflowRequest {
                        workflow: workflow.clone(),
                        state: Some(StreamState::Running),
                        ..Default::default()
                    })
                    .await?;
            }
        }
        Ok(())
    }
}

fn workflows_of(rows: &[StreamRow]) -> Vec<String> {
    let mut names: Vec<String> = rows.iter().map(|r| r.workflow.clone()).collect();
    names.sort();
    names.dedup();
    names
}
