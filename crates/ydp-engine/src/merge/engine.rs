//! Milestoned merge
//!
//! Planning is pure: given the open records of a dataset and one capture, it
//! yields the ops that bring the store up to date plus the merge counters.
//! `MergeEngine::apply` plans every dataset of a batch and commits them in a
//! single store transaction.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

use ydp_common::model::{Dataset, Datastore, MilestoneStrategy, Schema};

use super::store::{
    BatchCommit, DatasetCommit, MergeOp, MergeStore, SchemaRecord, StoreError, StoredRecord,
};
use crate::batch::{MergeResult, MergeStats, StreamKey};
use crate::error::{PipelineError, Result};
use crate::records::{ChangeKind, DatasetChanges, Row, RowKey};

/// Ops plus counters for one dataset
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergePlan {
    pub ops: Vec<MergeOp>,
    pub stats: MergeStats,
}

/// Decide whether `declared` may replace the recorded schema.
///
/// An identical shape proceeds. A changed shape needs a higher declared
/// version; otherwise it is a mismatch.
pub fn check_schema_evolution(
    declared: &Schema,
    recorded: Option<&SchemaRecord>,
) -> std::result::Result<SchemaRecord, String> {
    let next = SchemaRecord {
        version: declared.version,
        fingerprint: declared.fingerprint(),
    };

    match recorded {
        None => Ok(next),
        Some(prev) if prev.fingerprint == next.fingerprint => Ok(SchemaRecord {
            version: prev.version.max(next.version),
            ..next
        }),
        Some(prev) if next.version > prev.version => Ok(next),
        Some(prev) => Err(format!(
            "declared schema changed without a version bump (recorded v{}, declared v{})",
            prev.version, next.version
        )),
    }
}

/// Check a captured row against `schema` and convert its values to the
/// declared types. Absent nullable columns become NULL.
pub fn conform_row(row: Row, schema: &Schema) -> std::result::Result<Row, String> {
    if let Some(unknown) = row.columns().find(|c| schema.column(c).is_none()) {
        return Err(format!("unknown column {}", unknown));
    }

    let mut conformed = Row::new();
    for column in &schema.columns {
        let value = row.value_or_null(&column.name).clone();
        if value.is_null() {
            if column.primary_key {
                return Err(format!("missing primary key value for {}", column.name));
            }
            if !column.accepts_null() {
                return Err(format!("NULL in NOT NULL column {}", column.name));
            }
        }
        let value = value
            .coerce(&column.data_type)
            .map_err(|e| format!("column {}: {}", column.name, e))?;
        conformed.insert(column.name.clone(), value);
    }
    Ok(conformed)
}

/// Plan one dataset's changes under `strategy`
pub fn plan_dataset(
    strategy: MilestoneStrategy,
    dataset: &Dataset,
    open: &BTreeMap<RowKey, StoredRecord>,
    capture: &DatasetChanges,
) -> std::result::Result<MergePlan, String> {
    let schema = &dataset.schema;

    if let Some(unknown) = capture
        .observed_columns
        .iter()
        .find(|c| schema.column(c).is_none())
    {
        return Err(format!("unknown column {}", unknown));
    }

    // Last signal per key wins within one capture
    let mut incoming: BTreeMap<RowKey, (ChangeKind, Row)> = BTreeMap::new();
    for change in &capture.changes {
        let row = match change.kind {
            ChangeKind::Upsert => conform_row(change.row.clone(), schema)?,
            ChangeKind::Delete => {
                let key_row = change.row.key_projection(schema);
                if schema
                    .primary_key()
                    .any(|c| key_row.value_or_null(&c.name).is_null())
                {
                    return Err("delete signal without a full primary key".to_string());
                }
                key_row
            },
        };
        incoming.insert(row.key(schema), (change.kind, row));
    }

    if capture.snapshot {
        for (key, record) in open {
            incoming
                .entry(key.clone())
                .or_insert_with(|| (ChangeKind::Delete, record.row.key_projection(schema)));
        }
    }

    let mut plan = MergePlan::default();
    for (key, (kind, row)) in incoming {
        let current = open.get(&key);
        match (kind, current) {
            (ChangeKind::Upsert, Some(existing)) => {
                let hash = row.content_hash(schema);
                if existing.hash == hash {
                    plan.stats.inc_unchanged();
                    continue;
                }
                plan.stats.inc_updated();
                match strategy {
                    MilestoneStrategy::LiveOnly => {
                        plan.ops.push(MergeOp::Upsert { key, row, hash });
                    },
                    MilestoneStrategy::BatchMilestoned => {
                        plan.stats.inc_closed();
                        plan.ops.push(MergeOp::CloseVersion {
                            key: key.clone(),
                            previous: existing.row.clone(),
                        });
                        plan.ops.push(MergeOp::OpenVersion { key, row, hash });
                    },
                }
            },
            (ChangeKind::Upsert, None) => {
                let hash = row.content_hash(schema);
                plan.stats.inc_inserted();
                plan.ops.push(match strategy {
                    MilestoneStrategy::LiveOnly => MergeOp::Upsert { key, row, hash },
                    MilestoneStrategy::BatchMilestoned => MergeOp::OpenVersion { key, row, hash },
                });
            },
            (ChangeKind::Delete, Some(existing)) => {
                plan.stats.inc_deleted();
                let previous = existing.row.clone();
                plan.ops.push(match strategy {
                    MilestoneStrategy::LiveOnly => MergeOp::Delete { key, previous },
                    MilestoneStrategy::BatchMilestoned => {
                        plan.stats.inc_closed();
                        MergeOp::CloseVersion { key, previous }
                    },
                });
            },
            // Deleting an absent key is a no-op
            (ChangeKind::Delete, None) => {},
        }
    }

    Ok(plan)
}

/// One capture, sequenced and ready to merge
#[derive(Debug, Clone)]
pub struct CapturedBatch<'a> {
    pub platform: &'a str,
    pub datastore: &'a Datastore,
    pub stream: StreamKey,
    pub sequence: i64,
    pub changes: Vec<DatasetChanges>,
}

/// Applies captured batches to the merge store
#[derive(Clone)]
pub struct MergeEngine {
    store: Arc<dyn MergeStore>,
    commit_timeout: Duration,
}

impl MergeEngine {
    pub fn new(store: Arc<dyn MergeStore>, commit_timeout: Duration) -> Self {
        Self {
            store,
            commit_timeout,
        }
    }

    pub fn store(&self) -> &Arc<dyn MergeStore> {
        &self.store
    }

    /// Merge `batch` under `strategy`.
    ///
    /// Every dataset is planned before anything is written; one failing
    /// dataset fails the whole batch.
    #[instrument(skip_all, fields(platform = %batch.platform, stream = %batch.stream, batch = batch.sequence))]
    pub async fn apply(&self, batch: CapturedBatch<'_>, strategy: MilestoneStrategy) -> Result<MergeResult> {
        let CapturedBatch {
            platform,
            datastore,
            stream,
            sequence,
            changes,
        } = batch;
        let context = format!("{}/{} batch {}", platform, stream, sequence);

        let mismatch = |dataset: &str, detail: String| PipelineError::SchemaMismatch {
            platform: platform.to_string(),
            stream: stream.clone(),
            batch: sequence,
            dataset: dataset.to_string(),
            detail,
        };

        let mut datasets = Vec::with_capacity(changes.len());
        for capture in &changes {
            let dataset = datastore
                .dataset(&capture.dataset)
                .ok_or_else(|| mismatch(&capture.dataset, "dataset is not declared".to_string()))?;
            if let Some(only) = &stream.dataset {
                if *only != dataset.name {
                    return Err(mismatch(&dataset.name, format!("not carried by stream {}", stream)));
                }
            }

            let recorded = self
                .store
                .schema_record(platform, &datastore.name, &dataset.name)
                .await
                .map_err(PipelineError::store(&context))?;
            let schema = check_schema_evolution(&dataset.schema, recorded.as_ref())
                .map_err(|e| mismatch(&dataset.name, e))?;
            if let Some(prev) = &recorded {
                if prev.version < schema.version {
                    info!(
                        dataset = %dataset.name,
                        from = prev.version,
                        to = schema.version,
                        "Schema migration recorded"
                    );
                }
            }

            let open = self
                .store
                .open_records(platform, &datastore.name, &dataset.name)
                .await
                .map_err(PipelineError::store(&context))?;
            let plan = plan_dataset(strategy, dataset, &open, capture)
                .map_err(|e| mismatch(&dataset.name, e))?;

            debug!(dataset = %dataset.name, ops = plan.ops.len(), "Dataset planned");
            datasets.push(DatasetCommit {
                dataset: dataset.name.clone(),
                ops: plan.ops,
                schema,
                stats: plan.stats,
            });
        }

        let commit = BatchCommit {
            platform: platform.to_string(),
            stream: stream.clone(),
            sequence,
            datasets,
        };

        match tokio::time::timeout(self.commit_timeout, self.store.commit_batch(&commit)).await {
            Ok(result) => result.map_err(PipelineError::store(&context))?,
            Err(_) => {
                return Err(PipelineError::store(&context)(StoreError::Timeout(self.commit_timeout)));
            },
        }

        let result = MergeResult {
            platform: platform.to_string(),
            stream,
            sequence,
            datasets: commit
                .datasets
                .into_iter()
                .map(|d| (d.dataset, d.stats))
                .collect(),
        };

        let totals = result.totals();
        info!(
            inserted = totals.inserted,
            updated = totals.updated,
            closed = totals.closed,
            unchanged = totals.unchanged,
            deleted = totals.deleted,
            "Batch committed"
        );

        Ok(result)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::records::{RowChange, Value};
    use ydp_common::model::{Column, DataType};

    fn customers() -> Dataset {
        Dataset::new(
            "customers",
            Schema::new(vec![
                Column::key("id", DataType::VarChar { length: 20 }),
                Column::new("firstname", DataType::VarChar { length: 100 }).not_null(),
                Column::new("email", DataType::VarChar { length: 100 }),
            ]),
        )
    }

    fn row(id: &str, email: &str) -> Row {
        Row::new().with("id", id).with("firstname", "Ann").with("email", email)
    }

    fn stored(rows: &[Row]) -> BTreeMap<RowKey, StoredRecord> {
        let schema = &customers().schema;
        rows.iter()
            .map(|r| {
                (
                    r.key(schema),
                    StoredRecord {
                        row: r.clone(),
                        hash: r.content_hash(schema),
                    },
                )
            })
            .collect()
    }

    #[test]
    fn test_live_upsert_and_snapshot_delete() {
        let open = stored(&[row("1", "a@x.com"), row("2", "c@x.com")]);
        let capture = DatasetChanges::snapshot("customers", vec![row("1", "b@x.com")]);

        let plan = plan_dataset(MilestoneStrategy::LiveOnly, &customers(), &open, &capture).unwrap();
        assert_eq!(plan.stats.updated, 1);
        assert_eq!(plan.stats.deleted, 1);
        assert!(matches!(plan.ops[0], MergeOp::Upsert { .. }));
        assert!(matches!(plan.ops[1], MergeOp::Delete { .. }));
    }

    #[test]
    fn test_forensic_update_closes_then_opens() {
        let open = stored(&[row("1", "a@x.com")]);
        let capture = DatasetChanges::snapshot("customers", vec![row("1", "b@x.com")]);

        let plan =
            plan_dataset(MilestoneStrategy::BatchMilestoned, &customers(), &open, &capture).unwrap();
        assert_eq!(plan.ops.len(), 2);
        assert!(matches!(plan.ops[0], MergeOp::CloseVersion { .. }));
        assert!(matches!(plan.ops[1], MergeOp::OpenVersion { .. }));
        assert_eq!(plan.stats.updated, 1);
        assert_eq!(plan.stats.closed, 1);
    }

    #[test]
    fn test_identical_redelivery_is_noop() {
        let open = stored(&[row("1", "a@x.com")]);
        let capture = DatasetChanges::snapshot("customers", vec![row("1", "a@x.com")]);

        for strategy in [MilestoneStrategy::LiveOnly, MilestoneStrategy::BatchMilestoned] {
            let plan = plan_dataset(strategy, &customers(), &open, &capture).unwrap();
            assert!(plan.ops.is_empty());
            assert_eq!(plan.stats.unchanged, 1);
        }
    }

    #[test]
    fn test_forensic_delete_is_tombstone() {
        let open = stored(&[row("1", "a@x.com")]);
        let capture = DatasetChanges::change_set(
            "customers",
            vec![RowChange::delete(Row::new().with("id", "1"))],
        );

        let plan =
            plan_dataset(MilestoneStrategy::BatchMilestoned, &customers(), &open, &capture).unwrap();
        assert_eq!(plan.ops.len(), 1);
        assert!(matches!(plan.ops[0], MergeOp::CloseVersion { .. }));
        assert_eq!(plan.stats.deleted, 1);
    }

    #[test]
    fn test_change_set_leaves_unmentioned_keys() {
        let open = stored(&[row("1", "a@x.com"), row("2", "c@x.com")]);
        let capture =
            DatasetChanges::change_set("customers", vec![RowChange::upsert(row("3", "d@x.com"))]);

        let plan = plan_dataset(MilestoneStrategy::LiveOnly, &customers(), &open, &capture).unwrap();
        assert_eq!(plan.ops.len(), 1);
        assert_eq!(plan.stats.inserted, 1);
        assert_eq!(plan.stats.deleted, 0);
    }

    #[test]
    fn test_schema_violations() {
        let open = BTreeMap::new();
        let unknown = DatasetChanges::snapshot("customers", vec![row("1", "a").with("nickname", "x")]);
        let err = plan_dataset(MilestoneStrategy::LiveOnly, &customers(), &open, &unknown).unwrap_err();
        assert!(err.contains("unknown column nickname"));

        let not_null = DatasetChanges::snapshot(
            "customers",
            vec![Row::new().with("id", "1").with("firstname", Value::Null)],
        );
        let err = plan_dataset(MilestoneStrategy::LiveOnly, &customers(), &open, &not_null).unwrap_err();
        assert!(err.contains("NOT NULL column firstname"));

        let no_key = DatasetChanges::snapshot("customers", vec![Row::new().with("firstname", "Ann")]);
        let err = plan_dataset(MilestoneStrategy::LiveOnly, &customers(), &open, &no_key).unwrap_err();
        assert!(err.contains("missing primary key"));

        let wrong_type = DatasetChanges::snapshot(
            "customers",
            vec![row("1", "a").with("firstname", Value::Int(7))],
        );
        assert!(plan_dataset(MilestoneStrategy::LiveOnly, &customers(), &open, &wrong_type).is_err());
    }

    #[test]
    fn test_schema_evolution_rules() {
        let v1 = customers().schema;
        let recorded = check_schema_evolution(&v1, None).unwrap();
        assert_eq!(recorded.version, 1);

        assert!(check_schema_evolution(&v1, Some(&recorded)).is_ok());

        let mut changed = v1.clone();
        changed.columns.push(Column::new("phone", DataType::VarChar { length: 100 }));
        assert!(check_schema_evolution(&changed, Some(&recorded)).is_err());

        let migrated = check_schema_evolution(&changed.with_version(2), Some(&recorded)).unwrap();
        assert_eq!(migrated.version, 2);
        assert_ne!(migrated.fingerprint, recorded.fingerprint);
    }
}
