//! Replication dispatcher over in-memory replica targets

mod common;

use common::{address, customer, single_platform, starter, Harness, FORENSIC};
use ydp_common::model::{ContainerKind, Ecosystem, MilestoneStrategy};
use ydp_engine::merge::MergeStore;
use ydp_engine::replication::{ReplicateOutcome, BATCH_IN_COLUMN, BATCH_OUT_COLUMN, OPEN_VERSION};
use ydp_engine::records::Value;
use ydp_engine::transformer::TransformerRegistry;
use ydp_engine::PipelineError;

const LIVE_CUSTOMERS: &str = "yellowlive_store1_customers";
const FORENSIC_CUSTOMERS: &str = "yellowforensic_store1_customers";
const FORENSIC_ADDRESSES: &str = "yellowforensic_store1_addresses";

/// Starter ecosystem whose Postgres group has a second replica
fn two_replicas() -> Ecosystem {
    let mut eco = starter();
    let group = eco
        .platform_service_provider
        .consumer_replica_groups
        .iter_mut()
        .find(|g| g.name == "Postgres")
        .unwrap();
    let mut second = group.data_containers[0].clone();
    second.name = "PostgresReplica2".to_string();
    group.data_containers.push(second);
    eco
}

fn ids(rows: &[ydp_engine::records::Row]) -> Vec<String> {
    let mut ids: Vec<String> = rows
        .iter()
        .filter_map(|r| r.get("id").and_then(Value::canonical))
        .collect();
    ids.sort();
    ids
}

#[tokio::test]
async fn test_unreachable_target_is_caught_up_next_trigger() {
    let h = Harness::new(two_replicas(), TransformerRegistry::new());
    let up = h.target("Postgres", "PostgresReplica");
    let down = h.target("Postgres", "PostgresReplica2");
    down.set_reachable(false);

    h.source.set_rows("Store1", "customers", vec![customer("1", "a@x.com")]);
    h.pipeline.fire("Store1").await.unwrap();

    let outcome = h.pipeline.replicate("Postgres").await.unwrap();
    assert!(outcome.report("PostgresReplica").unwrap().is_ok());
    let failed = outcome.report("PostgresReplica2").unwrap();
    match &failed.result {
        Err(PipelineError::ReplicationTargetUnavailable { group, target, .. }) => {
            assert_eq!(group, "Postgres");
            assert_eq!(target, "PostgresReplica2");
        },
        other => panic!("expected unavailable target, got {:?}", other),
    }
    assert_eq!(up.stored_watermark(LIVE_CUSTOMERS), 1);
    assert_eq!(down.stored_watermark(LIVE_CUSTOMERS), 0);

    h.source.set_rows(
        "Store1",
        "customers",
        vec![customer("1", "b@x.com"), customer("2", "c@x.com")],
    );
    h.pipeline.fire("Store1").await.unwrap();

    down.set_reachable(true);
    let outcome = h.pipeline.replicate("Postgres").await.unwrap();
    assert!(outcome.reports().iter().all(|r| r.is_ok()));

    for target in [&up, &down] {
        assert_eq!(target.stored_watermark(LIVE_CUSTOMERS), 2);
        assert_eq!(target.stored_watermark(FORENSIC_CUSTOMERS), 2);
        assert_eq!(ids(&target.rows(LIVE_CUSTOMERS)), vec!["1", "2"]);
        assert_eq!(target.rows(FORENSIC_CUSTOMERS).len(), 3);
    }
    assert_eq!(up.rows(FORENSIC_CUSTOMERS), down.rows(FORENSIC_CUSTOMERS));
}

#[tokio::test]
async fn test_forensic_replica_mirrors_merge_history() {
    let h = Harness::starter();
    let replica = h.target("SQLServer", "SQLServer");

    for email in ["a@x.com", "b@x.com", "c@x.com"] {
        h.source.set_rows("Store1", "customers", vec![customer("1", email)]);
        h.pipeline.fire("Store1").await.unwrap();
    }
    h.pipeline.replicate("SQLServer").await.unwrap();

    let mut stored: Vec<(i64, i64)> = replica
        .rows(FORENSIC_CUSTOMERS)
        .iter()
        .map(|r| {
            let batch = |c: &str| match r.get(c) {
                Some(Value::Int(b)) => *b,
                other => panic!("{} not an integer: {:?}", c, other),
            };
            (batch(BATCH_IN_COLUMN), batch(BATCH_OUT_COLUMN))
        })
        .collect();
    stored.sort();
    assert_eq!(stored, vec![(1, 2), (2, 3), (3, OPEN_VERSION)]);

    let merged = h.versions(FORENSIC, "customers").await;
    assert_eq!(merged.len(), stored.len());
}

#[tokio::test]
async fn test_crash_mid_apply_replays_without_duplicates() {
    let h = Harness::starter();
    let replica = h.target("Postgres", "PostgresReplica");

    h.source.set_rows("Store1", "customers", vec![customer("1", "a@x.com")]);
    h.source.set_rows(
        "Store1",
        "addresses",
        vec![address("10", "1", "Springfield"), address("11", "1", "Shelbyville")],
    );
    h.pipeline.fire("Store1").await.unwrap();

    // First view in table order is the forensic addresses table
    replica.crash_after(1);
    let crashed = h.pipeline.replicate("Postgres").await.unwrap();
    assert!(!crashed.report("PostgresReplica").unwrap().is_ok());
    assert_eq!(replica.stored_watermark(FORENSIC_ADDRESSES), 0);
    assert!(replica.rows(FORENSIC_ADDRESSES).is_empty());

    let replayed = h.pipeline.replicate("Postgres").await.unwrap();
    assert!(replayed.report("PostgresReplica").unwrap().is_ok());
    assert_eq!(replica.stored_watermark(FORENSIC_ADDRESSES), 1);
    assert_eq!(ids(&replica.rows(FORENSIC_ADDRESSES)), vec!["10", "11"]);

    // Nothing new: a further cycle changes nothing
    let idle = h.pipeline.replicate("Postgres").await.unwrap();
    let views = idle.report("PostgresReplica").unwrap().result.as_ref().unwrap();
    assert!(views.iter().all(|v| v.applied == 0 && v.from == v.to));
    assert_eq!(replica.rows(FORENSIC_ADDRESSES).len(), 2);
}

#[tokio::test]
async fn test_watermark_never_decreases() {
    let h = Harness::starter();
    let replica = h.target("Postgres", "PostgresReplica");
    let mut seen = 0;

    for (n, email) in ["a@x.com", "a@x.com", "b@x.com", "b@x.com"].iter().enumerate() {
        h.source.set_rows("Store1", "customers", vec![customer("1", email)]);
        h.pipeline.fire("Store1").await.unwrap();
        if n == 1 {
            replica.set_reachable(false);
        }
        h.pipeline.replicate("Postgres").await.unwrap();
        replica.set_reachable(true);

        let watermark = replica.stored_watermark(LIVE_CUSTOMERS);
        assert!(watermark >= seen, "watermark went from {} to {}", seen, watermark);
        seen = watermark;
    }
    assert_eq!(seen, 4);

    // Batches 2 and 4 changed nothing, yet the watermark reached 4
    let live = h
        .store
        .changes_since("YellowLive", "Store1", "customers", 0, 4)
        .await
        .unwrap();
    assert_eq!(live.len(), 2);
}

#[tokio::test]
async fn test_group_serves_only_its_workspaces_views() {
    let h = Harness::starter();
    h.source.set_rows("Store1", "customers", vec![customer("1", "a@x.com")]);
    h.pipeline.fire("Store1").await.unwrap();

    let outcome = h.pipeline.replicate("Postgres").await.unwrap();
    let views = outcome.report("PostgresReplica").unwrap().result.as_ref().unwrap();
    let mut tables: Vec<&str> = views.iter().map(|v| v.table.as_str()).collect();
    tables.sort();
    assert_eq!(
        tables,
        vec![
            "yellowforensic_store1_addresses",
            "yellowforensic_store1_customers",
            "yellowlive_maskedcustomers_customers",
            "yellowlive_store1_addresses",
            "yellowlive_store1_customers",
        ]
    );

    // The transformer output has not produced a batch yet
    let masked = views
        .iter()
        .find(|v| v.table == "yellowlive_maskedcustomers_customers")
        .unwrap();
    assert_eq!((masked.from, masked.to), (0, 0));
}

#[tokio::test]
async fn test_unsatisfiable_binding_is_skipped_not_fatal() {
    let h = Harness::new(single_platform(MilestoneStrategy::LiveOnly), TransformerRegistry::new());
    let problems = h.pipeline.validate();
    assert!(problems
        .iter()
        .any(|p| matches!(p, PipelineError::NoCompatiblePlatform { group, .. } if group == "ForensicDSG")));

    h.source.set_rows("Store1", "customers", vec![customer("1", "a@x.com")]);
    h.pipeline.fire("Store1").await.unwrap();
    let outcome = h.pipeline.replicate("SQLServer").await.unwrap();
    let views = outcome.report("SQLServer").unwrap().result.as_ref().unwrap();
    assert!(views.iter().all(|v| v.table.starts_with("yellowlive_")));
}

#[tokio::test]
async fn test_unknown_group_rejected_and_empty_store_is_noop() {
    let h = Harness::starter();
    assert!(matches!(
        h.pipeline.replicate("NoSuchGroup").await,
        Err(PipelineError::Config(_))
    ));

    let outcome = h.pipeline.replicate("SQLServer").await.unwrap();
    assert!(matches!(outcome, ReplicateOutcome::Completed(_)));
    assert_eq!(h.target("SQLServer", "SQLServer").stored_watermark(LIVE_CUSTOMERS), 0);
}

#[tokio::test]
async fn test_unsupported_container_kind_is_a_validation_problem() {
    let mut eco = starter();
    eco.platform_service_provider.consumer_replica_groups[0].data_containers[0].kind = ContainerKind::Oracle;
    let h = Harness::new(eco, TransformerRegistry::new());

    let problems = h.pipeline.validate();
    assert!(problems
        .iter()
        .any(|p| p.kind() == "Config" && p.to_string().contains("oracle")));
}
