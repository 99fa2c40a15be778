//! Postgres merge store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::migrate::Migrator;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row as _};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::store::{
    BatchCommit, BatchFilter, ChangeEvent, MergeOp, MergeStore, SchemaRecord, StoreError,
    StoredRecord, VersionRecord,
};
use crate::batch::{BatchRecord, BatchStatus, MergeStats, StreamKey, StreamState};
use crate::records::{Row, RowKey};

/// Merge-store schema migrations
pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

const DEFAULT_BATCH_LIMIT: i64 = 100;

#[derive(Clone)]
pub struct PgMergeStore {
    pool: PgPool,
}

impl PgMergeStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(format!("migration failed: {}", e)))
    }
}

fn corrupt(e: String) -> StoreError {
    StoreError::Corrupt(e)
}

fn batch_from_row(row: &PgRow) -> Result<BatchRecord, StoreError> {
    let status: String = row.try_get("status")?;
    let stream: String = row.try_get("stream")?;
    let stats: Option<Json<MergeStats>> = row.try_get("stats")?;
    Ok(BatchRecord {
        platform: row.try_get("platform")?,
        stream: stream.parse().map_err(corrupt)?,
        sequence: row.try_get("seq")?,
        status: status.parse::<BatchStatus>().map_err(corrupt)?,
        attempts: row.try_get("attempts")?,
        run_id: row.try_get::<Uuid, _>("run_id")?,
        error: row.try_get("error")?,
        stats: stats.map(|s| s.0),
        started_at: row.try_get::<DateTime<Utc>, _>("started_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}

#[async_trait]
impl MergeStore for PgMergeStore {
    async fn last_committed(&self, platform: &str, stream: &StreamKey) -> Result<i64, StoreError> {
        let seq: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT last_committed_seq
            FROM ydp_stream_state
            WHERE platform = $1 AND stream = $2
            "#,
        )
        .bind(platform)
        .bind(stream.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(seq.unwrap_or(0))
    }

    async fn begin_batch(
        &self,
        platform: &str,
        stream: &StreamKey,
        sequence: i64,
        run_id: Uuid,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO ydp_batches (platform, stream, seq, status, attempts, run_id, started_at)
            VALUES ($1, $2, $3, $4, 1, $5, NOW())
            ON CONFLICT (platform, stream, seq) DO UPDATE
            SET status = EXCLUDED.status,
                attempts = ydp_batches.attempts + 1,
                run_id = EXCLUDED.run_id,
                error = NULL,
                started_at = NOW(),
                finished_at = NULL
            WHERE ydp_batches.status <> 'COMMITTED'
            "#,
        )
        .bind(platform)
        .bind(stream.to_string())
        .bind(sequence)
        .bind(BatchStatus::Running.as_str())
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::SequenceConflict {
                platform: platform.to_string(),
                stream: stream.to_string(),
                attempted: sequence,
                current: sequence,
            });
        }

        Ok(())
    }

    async fn fail_batch(
        &self,
        platform: &str,
        stream: &StreamKey,
        sequence: i64,
        error: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE ydp_batches
            SET status = $4, error = $5, finished_at = NOW()
            WHERE platform = $1 AND stream = $2 AND seq = $3 AND status <> 'COMMITTED'
            "#,
        )
        .bind(platform)
        .bind(stream.to_string())
        .bind(sequence)
        .bind(BatchStatus::Failed.as_str())
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn commit_batch(&self, commit: &BatchCommit) -> Result<(), StoreError> {
        let platform = commit.platform.as_str();
        let stream = commit.stream.to_string();
        let datastore = commit.stream.datastore.as_str();
        let seq = commit.sequence;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO ydp_stream_state (platform, stream)
            VALUES ($1, $2)
            ON CONFLICT (platform, stream) DO NOTHING
            "#,
        )
        .bind(platform)
        .bind(&stream)
        .execute(&mut *tx)
        .await?;

        let current: i64 = sqlx::query_scalar(
            r#"
            SELECT last_committed_seq
            FROM ydp_stream_state
            WHERE platform = $1 AND stream = $2
            FOR UPDATE
            "#,
        )
        .bind(platform)
        .bind(&stream)
        .fetch_one(&mut *tx)
        .await?;

        if seq != current + 1 {
            return Err(StoreError::SequenceConflict {
                platform: platform.to_string(),
                stream,
                attempted: seq,
                current,
            });
        }

        for dataset in &commit.datasets {
            let name = dataset.dataset.as_str();

            for (ordinal, op) in dataset.ops.iter().enumerate() {
                match op {
                    MergeOp::Upsert { key, row, hash } => {
                        sqlx::query(
                            r#"
                            INSERT INTO ydp_merge_records
                                (platform, datastore, dataset, row_key, row_data, row_hash, batch_in)
                            VALUES ($1, $2, $3, $4, $5, $6, $7)
                            ON CONFLICT (platform, datastore, dataset, row_key)
                                WHERE batch_out = 9223372036854775807
                            DO UPDATE SET row_data = EXCLUDED.row_data,
                                          row_hash = EXCLUDED.row_hash,
                                          batch_in = EXCLUDED.batch_in
                            "#,
                        )
                        .bind(platform)
                        .bind(datastore)
                        .bind(name)
                        .bind(&key.0)
                        .bind(Json(row))
                        .bind(hash)
                        .bind(seq)
                        .execute(&mut *tx)
                        .await?;
                    },
                    MergeOp::Delete { key, .. } => {
                        sqlx::query(
                            r#"
                            DELETE FROM ydp_merge_records
                            WHERE platform = $1 AND datastore = $2 AND dataset = $3
                              AND row_key = $4 AND batch_out = 9223372036854775807
                            "#,
                        )
                        .bind(platform)
                        .bind(datastore)
                        .bind(name)
                        .bind(&key.0)
                        .execute(&mut *tx)
                        .await?;
                    },
                    MergeOp::OpenVersion { key, row, hash } => {
                        sqlx::query(
                            r#"
                            INSERT INTO ydp_merge_records
                                (platform, datastore, dataset, row_key, row_data, row_hash, batch_in)
                            VALUES ($1, $2, $3, $4, $5, $6, $7)
                            "#,
                        )
                        .bind(platform)
                        .bind(datastore)
                        .bind(name)
                        .bind(&key.0)
                        .bind(Json(row))
                        .bind(hash)
                        .bind(seq)
                        .execute(&mut *tx)
                        .await?;
                    },
                    MergeOp::CloseVersion { key, .. } => {
                        sqlx::query(
                            r#"
                            UPDATE ydp_merge_records
                            SET batch_out = $5
                            WHERE platform = $1 AND datastore = $2 AND dataset = $3
                              AND row_key = $4 AND batch_out = 9223372036854775807
                            "#,
                        )
                        .bind(platform)
                        .bind(datastore)
                        .bind(name)
                        .bind(&key.0)
                        .bind(seq)
                        .execute(&mut *tx)
                        .await?;
                    },
                }

                sqlx::query(
                    r#"
                    INSERT INTO ydp_change_log
                        (platform, datastore, dataset, stream, batch_seq, ordinal, row_key, kind, row_data)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                    "#,
                )
                .bind(platform)
                .bind(datastore)
                .bind(name)
                .bind(&stream)
                .bind(seq)
                .bind(ordinal as i32)
                .bind(&op.key().0)
                .bind(op.kind().as_str())
                .bind(Json(op.row()))
                .execute(&mut *tx)
                .await?;
            }

            sqlx::query(
                r#"
                INSERT INTO ydp_dataset_schemas (platform, datastore, dataset, schema_version, fingerprint)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (platform, datastore, dataset) DO UPDATE
                SET schema_version = EXCLUDED.schema_version,
                    fingerprint = EXCLUDED.fingerprint,
                    updated_at = NOW()
                "#,
            )
            .bind(platform)
            .bind(datastore)
            .bind(name)
            .bind(dataset.schema.version as i32)
            .bind(&dataset.schema.fingerprint)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            UPDATE ydp_stream_state
            SET last_committed_seq = $3, updated_at = NOW()
            WHERE platform = $1 AND stream = $2
            "#,
        )
        .bind(platform)
        .bind(&stream)
        .bind(seq)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO ydp_batches (platform, stream, seq, status, attempts, run_id, stats, finished_at)
            VALUES ($1, $2, $3, $4, 1, $5, $6, NOW())
            ON CONFLICT (platform, stream, seq) DO UPDATE
            SET status = EXCLUDED.status,
                stats = EXCLUDED.stats,
                error = NULL,
                finished_at = NOW()
            "#,
        )
        .bind(platform)
        .bind(&stream)
        .bind(seq)
        .bind(BatchStatus::Committed.as_str())
        .bind(Uuid::new_v4())
        .bind(Json(commit.stats()))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(())
    }

    async fn open_records(
        &self,
        platform: &str,
        datastore: &str,
        dataset: &str,
    ) -> Result<BTreeMap<RowKey, StoredRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT row_key, row_data, row_hash
            FROM ydp_merge_records
            WHERE platform = $1 AND datastore = $2 AND dataset = $3
              AND batch_out = 9223372036854775807
            "#,
        )
        .bind(platform)
        .bind(datastore)
        .bind(dataset)
        .fetch_all(&self.pool)
        .await?;

        let mut open = BTreeMap::new();
        for row in rows {
            let data: Json<Row> = row.try_get("row_data")?;
            open.insert(
                RowKey(row.try_get("row_key")?),
                StoredRecord {
                    row: data.0,
                    hash: row.try_get("row_hash")?,
                },
            );
        }
        Ok(open)
    }

    async fn versions(
        &self,
        platform: &str,
        datastore: &str,
        dataset: &str,
    ) -> Result<Vec<VersionRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT row_key, row_data, batch_in, batch_out
            FROM ydp_merge_records
            WHERE platform = $1 AND datastore = $2 AND dataset = $3
            ORDER BY row_key, batch_in
            "#,
        )
        .bind(platform)
        .bind(datastore)
        .bind(dataset)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<VersionRecord, StoreError> {
                let data: Json<Row> = row.try_get("row_data")?;
                Ok(VersionRecord {
                    key: RowKey(row.try_get("row_key")?),
                    row: data.0,
                    batch_in: row.try_get("batch_in")?,
                    batch_out: row.try_get("batch_out")?,
                })
            })
            .collect()
    }

    async fn schema_record(
        &self,
        platform: &str,
        datastore: &str,
        dataset: &str,
    ) -> Result<Option<SchemaRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT schema_version, fingerprint
            FROM ydp_dataset_schemas
            WHERE platform = $1 AND datastore = $2 AND dataset = $3
            "#,
        )
        .bind(platform)
        .bind(datastore)
        .bind(dataset)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| -> Result<SchemaRecord, StoreError> {
            Ok(SchemaRecord {
                version: r.try_get::<i32, _>("schema_version")? as u32,
                fingerprint: r.try_get("fingerprint")?,
            })
        })
        .transpose()
    }

    async fn changes_since(
        &self,
        platform: &str,
        datastore: &str,
        dataset: &str,
        after: i64,
        upto: i64,
    ) -> Result<Vec<ChangeEvent>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT batch_seq, ordinal, row_key, kind, row_data
            FROM ydp_change_log
            WHERE platform = $1 AND datastore = $2 AND dataset = $3
              AND batch_seq > $4 AND batch_seq <= $5
            ORDER BY batch_seq, ordinal
            "#,
        )
        .bind(platform)
        .bind(datastore)
        .bind(dataset)
        .bind(after)
        .bind(upto)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<ChangeEvent, StoreError> {
                let kind: String = row.try_get("kind")?;
                let data: Json<Row> = row.try_get("row_data")?;
                Ok(ChangeEvent {
                    batch: row.try_get("batch_seq")?,
                    ordinal: row.try_get("ordinal")?,
                    key: RowKey(row.try_get("row_key")?),
                    kind: kind.parse()?,
                    row: data.0,
                })
            })
            .collect()
    }

    async fn list_batches(&self, filter: &BatchFilter) -> Result<Vec<BatchRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT platform, stream, seq, status, attempts, run_id, error, stats,
                   started_at, finished_at
            FROM ydp_batches
            WHERE ($1::TEXT IS NULL OR platform = $1)
              AND ($2::TEXT IS NULL OR stream = $2)
              AND ($3::TEXT IS NULL OR status = $3)
            ORDER BY started_at DESC, seq DESC
            LIMIT $4
            "#,
        )
        .bind(filter.platform.as_deref())
        .bind(filter.stream.as_ref().map(|s| s.to_string()))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.limit.unwrap_or(DEFAULT_BATCH_LIMIT))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(batch_from_row).collect()
    }

    async fn stream_states(&self, platform: Option<&str>) -> Result<Vec<StreamState>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT platform, stream, last_committed_seq, updated_at
            FROM ydp_stream_state
            WHERE ($1::TEXT IS NULL OR platform = $1)
            ORDER BY platform, stream
            "#,
        )
        .bind(platform)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<StreamState, StoreError> {
                let stream: String = row.try_get("stream")?;
                Ok(StreamState {
                    platform: row.try_get("platform")?,
                    stream: stream.parse().map_err(corrupt)?,
                    last_committed: row.try_get("last_committed_seq")?,
                    updated_at: row.try_get("updated_at")?,
                })
            })
            .collect()
    }
}
