//! End-to-end exercises for the remaining create verbs: Materialize,
//! Migrate (external source cluster), and the lookup-vindex lifecycle
//! from write-only backfill to externalization.

mod fixture;

use fixture::{Cluster, KeyspaceSpec};
use kestrel_agent::types::{CopyStateRow, StreamState};
use kestrel_common::error::ErrorCode;
use kestrel_common::types::WorkflowType;
use kestrel_topo::TopoStore;
use kestrel_workflow::{
    LookupVindexCreateRequest, LookupVindexRequest, MaterializeSettings, MoveTablesCreateRequest,
    TableSetting,
};

fn materialize_cluster() -> Cluster {
    Cluster::new(&[
        KeyspaceSpec {
            name: "ks1",
            shards: &["0"],
            serving: true,
        },
        KeyspaceSpec {
            name: "ks2",
            shards: &["-80", "80-"],
            serving: true,
        },
    ])
}

fn settings() -> MaterializeSettings {
    MaterializeSettings {
        workflow: "daily_totals".into(),
        source_keyspace: "ks1".into(),
        target_keyspace: "ks2".into(),
        table_settings: vec![TableSetting {
            target_table: "totals".into(),
            source_expression: "select customer_id, sum(amount) from orders group by customer_id"
                .into(),
            create_ddl: "create table totals (customer_id bigint primary key, total bigint)".into(),
        }],
        ..Default::default()
    }
}

#[tokio::test]
async fn test_materialize_create_deploys_schema_and_starts_streams() {
    let cluster = materialize_cluster();
    cluster.server.materialize_create(settings()).await.unwrap();

    for shard in ["-80", "80-"] {
        let agent = cluster.agent("ks2", shard);
        assert_eq!(
            agent.applied_ddls(),
            vec!["create table totals (customer_id bigint primary key, total bigint)"],
            "shard {shard}"
        );
        let rows = agent.streams();
        assert_eq!(rows.len(), 1, "shard {shard}");
        assert_eq!(rows[0].state, StreamState::Running);
        assert_eq!(rows[0].workflow_type, Some(WorkflowType::Materialize));
        assert_eq!(rows[0].binlog_source.shard, "0");
        assert!(rows[0].binlog_source.filter.rules[0]
            .expression
            .contains("group by"));
    }

    let err = cluster.server.materialize_create(settings()).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::AlreadyExists);
}

#[tokio::test]
async fn test_materialize_create_failure_drops_partial_streams() {
    let cluster = materialize_cluster();
    // The first target shard accepts its streams, the second refuses;
    // the verb must come back with nothing left on either.
    cluster.agent("ks2", "80-").faults.inject(
        "create_workflow",
        kestrel_common::error::KestrelError::Unavailable("agent restarting".into()),
    );
    let err = cluster.server.materialize_create(settings()).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::Unavailable);

    for shard in ["-80", "80-"] {
        assert!(
            cluster.agent("ks2", shard).streams().is_empty(),
            "shard {shard}"
        );
    }

    // A clean re-run succeeds.
    cluster.server.materialize_create(settings()).await.unwrap();
}

#[tokio::test]
async fn test_migrate_create_from_external_cluster() {
    let cluster = Cluster::new(&[
        KeyspaceSpec {
            name: "ext_ks",
            shards: &["0"],
            serving: true,
        },
        KeyspaceSpec {
            name: "ks2",
            shards: &["0"],
            serving: true,
        },
    ]);
    cluster
        .agent("ext_ks", "0")
        .set_schema("t", "create table t (id bigint primary key)");

    let req = MoveTablesCreateRequest {
        workflow: "import".into(),
        source_keyspace: "ext_ks".into(),
        target_keyspace: "ks2".into(),
        tables: vec!["t".into()],
        ..Default::default()
    };
    let err = cluster.server.migrate_create(&req, "").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);

    cluster.server.migrate_create(&req, "legacy_prod").await.unwrap();
    let rows = cluster.agent("ks2", "0").streams();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].workflow_type, Some(WorkflowType::Migrate));
    assert_eq!(rows[0].options.external_cluster.as_deref(), Some("legacy_prod"));

    // Migrate workflows report no copy progress: the external source
    // primaries may be unreachable.
    assert!(cluster
        .server
        .get_copy_progress("ks2", "import")
        .await
        .unwrap()
        .is_none());
}

// ── Lookup vindex lifecycle ─────────────────────────────────────────────────

fn lookup_cluster() -> Cluster {
    Cluster::new(&[
        KeyspaceSpec {
            name: "ks1",
            shards: &["0"],
            serving: true,
        },
        KeyspaceSpec {
            name: "lkp",
            shards: &["0"],
            serving: true,
        },
    ])
}

fn vindex_create_req() -> LookupVindexCreateRequest {
    LookupVindexCreateRequest {
        keyspace: "ks1".into(),
        workflow: "name_idx_backfill".into(),
        vindex_name: "name_idx".into(),
        vindex_type: "consistent_lookup_unique".into(),
        owner_table: "customer".into(),
        from_columns: vec!["name".into()],
        to_column: "keyspace_id".into(),
        lookup_keyspace: "lkp".into(),
        lookup_table_ddl:
            "create table name_idx (name varchar(128), keyspace_id varbinary(16), primary key (name))"
                .into(),
        cells: vec![],
        tablet_types: vec![],
        timeout: None,
    }
}

fn vindex_req(keep_workflow: bool) -> LookupVindexRequest {
    LookupVindexRequest {
        keyspace: "ks1".into(),
        vindex_name: "name_idx".into(),
        workflow_keyspace: "lkp".into(),
        workflow: "name_idx_backfill".into(),
        keep_workflow,
        timeout: None,
    }
}

#[tokio::test]
async fn test_lookup_vindex_lifecycle() {
    let cluster = lookup_cluster();
    cluster.server.lookup_vindex_create(&vindex_create_req()).await.unwrap();

    // The owner keyspace carries the write-only vindex and the column
    // binding; the lookup keyspace runs the backfill.
    let vschema = cluster.topo.get_vschema("ks1").await.unwrap().value;
    let vindex = vschema.vindexes.get("name_idx").unwrap();
    assert!(vindex.write_only);
    assert_eq!(vindex.owner.as_deref(), Some("customer"));
    assert_eq!(vindex.params.get("table").map(String::as_str), Some("lkp.name_idx"));
    assert_eq!(
        vschema.tables.get("customer").unwrap().column_vindexes[0].vindex,
        "name_idx"
    );
    let backfill = cluster.agent("lkp", "0").streams();
    assert_eq!(backfill.len(), 1);
    assert_eq!(backfill[0].workflow_type, Some(WorkflowType::CreateLookupIndex));
    assert_eq!(backfill[0].options.lookup_vindexes, vec!["name_idx"]);

    // Duplicate create refused.
    let err = cluster
        .server
        .lookup_vindex_create(&vindex_create_req())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::AlreadyExists);

    // Externalize refuses while the backfill is still copying.
    cluster.agent("lkp", "0").set_copy_state(
        backfill[0].id,
        vec![CopyStateRow {
            table: "name_idx".into(),
            last_pk: "m".into(),
        }],
    );
    let err = cluster
        .server
        .lookup_vindex_externalize(&vindex_req(true))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::FailedPrecondition);
    assert!(err.to_string().contains("still copying"));

    // Backfill done: externalize flips the vindex live.
    cluster.agent("lkp", "0").set_copy_state(backfill[0].id, vec![]);
    cluster
        .server
        .lookup_vindex_externalize(&vindex_req(true))
        .await
        .unwrap();
    let vschema = cluster.topo.get_vschema("ks1").await.unwrap().value;
    assert!(!vschema.vindexes.get("name_idx").unwrap().write_only);
    assert_eq!(cluster.agent("lkp", "0").streams().len(), 1);

    // Internalize takes it back to write-only for a backfill repair,
    // after which complete is refused.
    cluster
        .server
        .lookup_vindex_internalize(&vindex_req(true))
        .await
        .unwrap();
    let vschema = cluster.topo.get_vschema("ks1").await.unwrap().value;
    assert!(vschema.vindexes.get("name_idx").unwrap().write_only);
    let err = cluster
        .server
        .lookup_vindex_complete(&vindex_req(false))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::FailedPrecondition);

    // Externalize again without keeping the workflow, then complete.
    cluster
        .server
        .lookup_vindex_externalize(&vindex_req(false))
        .await
        .unwrap();
    assert!(cluster.agent("lkp", "0").streams().is_empty());
    cluster.server.lookup_vindex_complete(&vindex_req(false)).await.unwrap();
    let vschema = cluster.topo.get_vschema("ks1").await.unwrap().value;
    assert!(!vschema.vindexes.get("name_idx").unwrap().write_only);
}

#[tokio::test]
async fn test_lookup_vindex_create_validations() {
    let cluster = lookup_cluster();
    let mut bad = vindex_create_req();
    bad.from_columns.clear();
    let err = cluster.server.lookup_vindex_create(&bad).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);
}

#[tokio::test]
async fn test_lookup_vindex_create_rolls_back_vschema_on_failure() {
    let cluster = lookup_cluster();

    // The lookup table never lands: schema deployment on the lookup
    // keyspace dies after the vschema edit has been saved.
    cluster.agent("lkp", "0").faults.inject(
        "apply_schema",
        kestrel_common::error::KestrelError::Unavailable("agent lost".into()),
    );
    let err = cluster
        .server
        .lookup_vindex_create(&vindex_create_req())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Unavailable);
    assert!(err.to_string().contains("name_idx"));

    // The vschema edit was retracted wholesale: no vindex, no column
    // binding, no synthesized owner-table entry, no backfill streams.
    let vschema = cluster.topo.get_vschema("ks1").await.unwrap().value;
    assert!(vschema.vindexes.is_empty());
    assert!(!vschema.tables.contains_key("customer"));
    assert!(cluster.agent("lkp", "0").streams().is_empty());

    // With the fault gone the same create succeeds.
    cluster.server.lookup_vindex_create(&vindex_create_req()).await.unwrap();
    let vschema = cluster.topo.get_vschema("ks1").await.unwrap().value;
    assert!(vschema.vindexes.contains_key("name_idx"));
}
