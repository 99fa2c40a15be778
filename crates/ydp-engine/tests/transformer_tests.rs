//! Transformer runner: placement, output batches and failure handling

mod common;

use async_trait::async_trait;
use std::sync::Arc;

use common::{customer, starter, Harness, TestPostgres, LIVE};
use ydp_common::model::{CodeArtifact, Ecosystem};
use ydp_engine::batch::{BatchStatus, StreamKey};
use ydp_engine::cqrs::queries::list_batches::{self, ListBatchesQuery};
use ydp_engine::merge::{MergeStore, PgMergeStore};
use ydp_engine::records::{Row, Value};
use ydp_engine::replication::ReplicaTarget;
use ydp_engine::transformer::{TransformOutcome, Transformer, TransformerContext, TransformerRegistry};
use ydp_engine::PipelineError;

const WORKSPACE: &str = "MaskedStoreGenerator";

/// Copies Store1 customers with every email replaced
struct EmailMasker;

#[async_trait]
impl Transformer for EmailMasker {
    async fn execute(&self, context: &TransformerContext, connection: &dyn ReplicaTarget) -> anyhow::Result<()> {
        let input = context.get_input_table_name("A", "Store1", "customers")?;
        for (_, spec) in context.output_tables() {
            let rows: Vec<Row> = connection
                .fetch_rows(&input, &spec.column_names())
                .await?
                .into_iter()
                .map(|row| row.with("email", "masked@example.com"))
                .collect();
            connection.write_rows(&spec, &rows).await?;
        }
        Ok(())
    }
}

struct Broken;

#[async_trait]
impl Transformer for Broken {
    async fn execute(&self, _context: &TransformerContext, _connection: &dyn ReplicaTarget) -> anyhow::Result<()> {
        anyhow::bail!("division by zero in masking rule")
    }
}

fn registered(name: &str) -> Ecosystem {
    let mut eco = starter();
    let job = eco.teams[0].workspaces[1].transformer.as_mut().unwrap();
    job.code = CodeArtifact::Registered { name: name.to_string() };
    eco
}

#[tokio::test]
async fn test_registered_transformer_publishes_masked_store() {
    let registry = TransformerRegistry::new().register("masker", Arc::new(EmailMasker));
    let h = Harness::new(registered("masker"), registry);

    h.source.set_rows(
        "Store1",
        "customers",
        vec![customer("1", "ada@x.com"), customer("2", "bob@x.com")],
    );
    h.pipeline.fire("Store1").await.unwrap();
    h.pipeline.replicate("SQLServer").await.unwrap();

    let outcome = h.pipeline.transform(WORKSPACE).await.unwrap();
    let runs = outcome.runs();
    assert_eq!(runs.len(), 2);
    for run in runs {
        assert!(run.is_committed(), "{:?}", run.result);
        assert_eq!(run.stream, StreamKey::datastore("MaskedCustomers"));
        assert_eq!(run.sequence, 1);
    }

    let masked = h.store.open_records(LIVE, "MaskedCustomers", "customers").await.unwrap();
    assert_eq!(masked.len(), 2);
    assert!(masked
        .values()
        .all(|r| r.row.get("email") == Some(&Value::text("masked@example.com"))));

    // Consumer1 sees the masked store through its Postgres replica
    let replica = h.target("Postgres", "PostgresReplica");
    h.pipeline.replicate("Postgres").await.unwrap();
    assert_eq!(replica.rows("yellowlive_maskedcustomers_customers").len(), 2);
    assert_eq!(replica.stored_watermark("yellowlive_maskedcustomers_customers"), 1);
}

#[tokio::test]
async fn test_failed_body_marks_output_batches_failed() {
    let registry = TransformerRegistry::new().register("broken", Arc::new(Broken));
    let h = Harness::new(registered("broken"), registry);

    let outcome = h.pipeline.transform(WORKSPACE).await.unwrap();
    assert_eq!(outcome.runs().len(), 2);
    for run in outcome.runs() {
        match run.result.as_ref().unwrap_err() {
            PipelineError::TransformerExecutionFailure { job, batch, reason } => {
                assert_eq!(job, "MaskedCustomerGenerator");
                assert_eq!(*batch, 1);
                assert!(reason.contains("division by zero"));
            },
            other => panic!("expected transformer failure, got {:?}", other),
        }
    }

    let failed = list_batches::handle(
        h.store.clone(),
        ListBatchesQuery {
            stream: Some("MaskedCustomers".to_string()),
            status: Some("failed".to_string()),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(failed.batches.len(), 2);
    assert!(failed.batches.iter().all(|b| b.status == BatchStatus::Failed));
    assert!(h
        .store
        .open_records(LIVE, "MaskedCustomers", "customers")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_sql_transformer_runs_expanded_script_on_placement() {
    let h = Harness::starter();
    let placement = h.target("SQLServer", "SQLServer");

    let outcome = h.pipeline.transform(WORKSPACE).await.unwrap();
    assert!(outcome.runs().iter().all(|r| r.is_committed()));

    let executed = placement.executed();
    assert_eq!(executed.len(), 1);
    assert!(executed[0].contains("INSERT INTO [maskedstoregenerator_maskedcustomers_customers_dt]"));
    assert!(executed[0].contains("FROM [yellowlive_store1_customers]"));
    assert!(!executed[0].contains("{{"));
}

#[tokio::test]
async fn test_unplaceable_or_missing_transformer() {
    let h = Harness::starter();
    let err = h.pipeline.transform("Consumer1").await.unwrap_err();
    assert_eq!(err.kind(), "Config");

    let registry = TransformerRegistry::new();
    let h = Harness::new(registered("masker"), registry);
    let outcome = h.pipeline.transform(WORKSPACE).await.unwrap();
    assert!(matches!(outcome, TransformOutcome::Completed(_)));
    assert!(outcome.runs().iter().all(|r| !r.is_committed()));
    assert!(outcome.runs()[0]
        .result
        .as_ref()
        .unwrap_err()
        .to_string()
        .contains("no transformer registered as masker"));
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_postgres_merge_store_records_transformer_batches() {
    let pg = TestPostgres::start().await.unwrap();
    let store = Arc::new(PgMergeStore::new(pg.pool().clone()));

    let stream = StreamKey::datastore("MaskedCustomers");
    assert_eq!(store.last_committed(LIVE, &stream).await.unwrap(), 0);
    store
        .begin_batch(LIVE, &stream, 1, uuid::Uuid::new_v4())
        .await
        .unwrap();
    store.fail_batch(LIVE, &stream, 1, "placement unreachable").await.unwrap();

    let batches = list_batches::handle(store.clone(), ListBatchesQuery::default()).await.unwrap();
    assert_eq!(batches.batches.len(), 1);
    assert_eq!(batches.batches[0].status, BatchStatus::Failed);
    assert_eq!(store.last_committed(LIVE, &stream).await.unwrap(), 0);
}
