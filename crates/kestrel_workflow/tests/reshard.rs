//! End-to-end Reshard exercises: split one shard into two, switch reads
//! via shard tablet controls, flip serving flags at the write switch,
//! and carry dependent streams over to the new shards.

mod fixture;

use fixture::{Cluster, KeyspaceSpec};
use kestrel_agent::types::{
    BinlogSource, CreateWorkflowRequest, Filter, FilterRule, StreamState, UpdateWorkflowRequest,
    FROZEN_MESSAGE,
};
use kestrel_agent::ShardAgent;
use kestrel_common::error::ErrorCode;
use kestrel_common::types::{
    migration_id, TabletType, WorkflowOptions, WorkflowSubType, WorkflowType,
};
use kestrel_common::KeyRange;
use kestrel_topo::TopoStore;
use kestrel_workflow::{ReshardRequest, SwitchRequest, WorkflowDeleteRequest, WorkflowUpdateRequest};

fn reshard_cluster() -> Cluster {
    let cluster = Cluster::new(&[KeyspaceSpec {
        name: "ks1",
        shards: &["0", "-80", "80-"],
        serving: false,
    }]);
    cluster
        .agent("ks1", "0")
        .set_schema("t", "create table t (id bigint primary key)");
    cluster.agent("ks1", "0").advance_primary_position("src1", 7);
    cluster
}

async fn mark_source_serving(cluster: &Cluster) {
    let v = cluster.topo.get_shard("ks1", "0").await.unwrap();
    let mut record = v.value;
    record.is_primary_serving = true;
    cluster
        .topo
        .update_shard("ks1", "0", &record, v.version)
        .await
        .unwrap();
}

fn reshard_req() -> ReshardRequest {
    ReshardRequest {
        keyspace: "ks1".into(),
        workflow: "split".into(),
        source_shards: vec!["0".into()],
        target_shards: vec!["-80".into(), "80-".into()],
        cells: vec![],
        tablet_types: vec![],
        skip_schema_copy: false,
        auto_start: true,
        stop_after_copy: false,
    }
}

fn switch_req(tablet_types: &[TabletType]) -> SwitchRequest {
    SwitchRequest {
        keyspace: "ks1".into(),
        workflow: "split".into(),
        tablet_types: tablet_types.to_vec(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_reshard_full_lifecycle() {
    let cluster = reshard_cluster();
    mark_source_serving(&cluster).await;

    // Create: schema lands on both halves, streams fan out from shard 0
    // with the target's key range as filter.
    cluster.server.reshard_create(&reshard_req()).await.unwrap();
    for shard in ["-80", "80-"] {
        assert_eq!(cluster.agent("ks1", shard).applied_ddls().len(), 1);
        let rows = cluster.agent("ks1", shard).streams();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].state, StreamState::Running);
        assert_eq!(rows[0].binlog_source.shard, "0");
        assert_eq!(
            rows[0].binlog_source.filter.rules[0].key_range,
            Some(KeyRange::parse(shard).unwrap())
        );
    }

    // Reads: shard-level switching disables query service on the source.
    cluster
        .server
        .workflow_switch_traffic(&switch_req(&[TabletType::Replica, TabletType::Rdonly]))
        .await
        .unwrap();
    let source = cluster.topo.get_shard("ks1", "0").await.unwrap().value;
    assert!(source.query_service_disabled(TabletType::Replica, "c1"));
    assert!(source.query_service_disabled(TabletType::Rdonly, "c2"));
    let status = cluster.server.workflow_status("ks1", "split").await.unwrap();
    assert!(status.state.reads_fully_switched());
    assert!(!status.state.writes_switched);

    // Writes: serving flips from the retiring shard to the new ones.
    cluster
        .server
        .workflow_switch_traffic(&switch_req(&[TabletType::Primary]))
        .await
        .unwrap();

    let source = cluster.topo.get_shard("ks1", "0").await.unwrap().value;
    assert!(!source.is_primary_serving);
    for shard in ["-80", "80-"] {
        let record = cluster.topo.get_shard("ks1", shard).await.unwrap().value;
        assert!(record.is_primary_serving, "shard {shard} must serve");
        assert_eq!(
            cluster.agent("ks1", shard).streams()[0].message,
            FROZEN_MESSAGE
        );
    }
    let id = migration_id("ks1", &["-80".to_string(), "80-".to_string()]);
    assert!(cluster.agent("ks1", "0").read_journal(id).await.unwrap().is_some());
    // Reverse streams wait on the retiring shard for a cutback.
    let reverse: Vec<_> = cluster
        .agent("ks1", "0")
        .streams()
        .into_iter()
        .filter(|r| r.workflow == "split_reverse")
        .collect();
    assert_eq!(reverse.len(), 2);

    let status = cluster.server.workflow_status("ks1", "split").await.unwrap();
    assert!(status.state.writes_switched);
}

#[tokio::test]
async fn test_dependent_streams_migrate_with_the_cutover() {
    let cluster = reshard_cluster();
    mark_source_serving(&cluster).await;

    // A materialization into the retiring shard, fed from elsewhere.
    cluster
        .agent("ks1", "0")
        .create_workflow(&CreateWorkflowRequest {
            workflow: "mat".into(),
            workflow_type: WorkflowType::Materialize,
            workflow_sub_type: WorkflowSubType::None,
            binlog_sources: vec![BinlogSource {
                keyspace: "ks9".into(),
                shard: "0".into(),
                filter: Filter {
                    rules: vec![FilterRule {
                        match_table: "m".into(),
                        ..Default::default()
                    }],
                },
                stop_after_copy: false,
            }],
            cells: vec![],
            tablet_types: vec![],
            auto_start: true,
            stop_after_copy: false,
            options: WorkflowOptions::default(),
        })
        .await
        .unwrap();

    cluster.server.reshard_create(&reshard_req()).await.unwrap();
    cluster
        .server
        .workflow_switch_traffic(&switch_req(&[
            TabletType::Replica,
            TabletType::Rdonly,
            TabletType::Primary,
        ]))
        .await
        .unwrap();

    // The materialization now lands on the new shards, narrowed to each
    // one's range, and is gone from the retiring shard.
    assert!(cluster
        .agent("ks1", "0")
        .streams()
        .iter()
        .all(|r| r.workflow != "mat"));
    for shard in ["-80", "80-"] {
        let mat: Vec<_> = cluster
            .agent("ks1", shard)
            .streams()
            .into_iter()
            .filter(|r| r.workflow == "mat")
            .collect();
        assert_eq!(mat.len(), 1, "shard {shard}");
        assert_eq!(mat[0].state, StreamState::Running);
        assert_eq!(mat[0].binlog_source.keyspace, "ks9");
        assert_eq!(
            mat[0].binlog_source.filter.rules[0].key_range,
            Some(KeyRange::parse(shard).unwrap())
        );
    }
}

#[tokio::test]
async fn test_failed_switch_cancels_migrated_dependent_streams() {
    let cluster = reshard_cluster();
    mark_source_serving(&cluster).await;

    cluster
        .agent("ks1", "0")
        .create_workflow(&CreateWorkflowRequest {
            workflow: "mat".into(),
            workflow_type: WorkflowType::Materialize,
            workflow_sub_type: WorkflowSubType::None,
            binlog_sources: vec![BinlogSource {
                keyspace: "ks9".into(),
                shard: "0".into(),
                filter: Filter {
                    rules: vec![FilterRule {
                        match_table: "m".into(),
                        ..Default::default()
                    }],
                },
                stop_after_copy: false,
            }],
            cells: vec![],
            tablet_types: vec![],
            auto_start: true,
            stop_after_copy: false,
            options: WorkflowOptions::default(),
        })
        .await
        .unwrap();
    cluster.server.reshard_create(&reshard_req()).await.unwrap();

    // Reverse-stream creation dies after the dependent streams have
    // already been migrated to the new shards; the rollback must pull
    // them back and re-open the source.
    cluster.agent("ks1", "0").faults.inject(
        "create_workflow",
        kestrel_common::error::KestrelError::Unavailable("agent lost".into()),
    );
    let err = cluster
        .server
        .workflow_switch_traffic(&switch_req(&[TabletType::Primary]))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Unavailable);
    assert!(err.to_string().contains("rolled back"), "{err}");

    // The dependent stream runs on the retiring shard again and its
    // copies are gone from the new shards.
    let mat: Vec<_> = cluster
        .agent("ks1", "0")
        .streams()
        .into_iter()
        .filter(|r| r.workflow == "mat")
        .collect();
    assert_eq!(mat.len(), 1);
    assert_eq!(mat[0].state, StreamState::Running);
    for shard in ["-80", "80-"] {
        assert!(
            cluster
                .agent("ks1", shard)
                .streams()
                .iter()
                .all(|r| r.workflow != "mat"),
            "shard {shard}"
        );
    }

    // Source serving state is back to its pre-switch shape and no
    // journal was written.
    let source = cluster.topo.get_shard("ks1", "0").await.unwrap().value;
    assert!(source.is_primary_serving);
    assert!(!source.query_service_disabled(TabletType::Primary, "c1"));
    let id = migration_id("ks1", &["-80".to_string(), "80-".to_string()]);
    assert!(cluster.agent("ks1", "0").read_journal(id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_reshard_create_validations() {
    let cluster = reshard_cluster();

    let mut bad = reshard_req();
    bad.target_shards = vec!["-80".into()];
    let err = cluster.server.reshard_create(&bad).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);

    cluster.server.reshard_create(&reshard_req()).await.unwrap();
    let err = cluster.server.reshard_create(&reshard_req()).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::AlreadyExists);
}

#[tokio::test]
async fn test_workflow_update_fans_out_and_merges() {
    let cluster = reshard_cluster();
    cluster.server.reshard_create(&reshard_req()).await.unwrap();

    let updated = cluster
        .server
        .workflow_update(&WorkflowUpdateRequest {
            keyspace: "ks1".into(),
            update: UpdateWorkflowRequest {
                workflow: "split".into(),
                state: Some(StreamState::Stopped),
                message: Some("operator hold".into()),
                ..Default::default()
            },
            timeout: None,
        })
        .await
        .unwrap();
    assert_eq!(updated, 2);
    for shard in ["-80", "80-"] {
        let rows = cluster.agent("ks1", shard).streams();
        assert_eq!(rows[0].state, StreamState::Stopped);
        assert_eq!(rows[0].message, "operator hold");
    }

    let err = cluster
        .server
        .workflow_update(&WorkflowUpdateRequest {
            keyspace: "ks1".into(),
            update: UpdateWorkflowRequest {
                workflow: "ghost".into(),
                state: Some(StreamState::Running),
                ..Default::default()
            },
            timeout: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
}

#[tokio::test]
async fn test_reshard_delete_before_switch() {
    let cluster = reshard_cluster();
    mark_source_serving(&cluster).await;
    cluster.server.reshard_create(&reshard_req()).await.unwrap();

    cluster
        .server
        .workflow_delete(&WorkflowDeleteRequest {
            keyspace: "ks1".into(),
            workflow: "split".into(),
            keep_data: true,
            keep_routing_rules: false,
            timeout: None,
        })
        .await
        .unwrap();
    for shard in ["-80", "80-"] {
        assert!(cluster.agent("ks1", shard).streams().is_empty());
    }
}

#[tokio::test]
async fn test_throttled_streams_surface_in_status() {
    let cluster = reshard_cluster();
    cluster.server.reshard_create(&reshard_req()).await.unwrap();

    let now = kestrel_common::types::now_unix_secs();
    cluster
        .agent("ks1", "-80")
        .with_workflow_streams("split", |row| {
            row.time_throttled = now - 10;
            row.component_throttled = "vcopier".into();
        });
    let status = cluster.server.workflow_status("ks1", "split").await.unwrap();
    let throttled: Vec<_> = status.streams.iter().filter(|s| s.throttled).collect();
    assert_eq!(throttled.len(), 1);
    assert_eq!(throttled[0].shard, "-80");
}
