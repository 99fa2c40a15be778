//! Replica target seam
//!
//! A target applies one batch of rows to one table and advances that table's
//! watermark in the same target transaction. A rowset whose batch is at or
//! below the stored watermark is already reflected and is skipped, which makes
//! replay after a crash safe.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use ydp_common::model::{Column, Credential, DataContainer, Schema};

use super::dialect::SqlDialect;
use crate::records::Row;

#[derive(Error, Debug)]
pub enum TargetError {
    #[error("Target unreachable: {0}")]
    Unreachable(String),

    #[error("Credential rejected: {0}")]
    Auth(String),

    #[error("Statement failed: {0}")]
    Statement(String),

    #[error("Unsupported target: {0}")]
    Unsupported(String),
}

impl From<sqlx::Error> for TargetError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if matches!(db.code().as_deref(), Some("28000") | Some("28P01")) => {
                TargetError::Auth(db.message().to_string())
            },
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => TargetError::Unreachable(err.to_string()),
            _ => TargetError::Statement(err.to_string()),
        }
    }
}

/// How rows are written to a replica table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// One row per key, overwritten in place
    Upsert,
    /// Versions stamped with `[ydp_batch_in, ydp_batch_out)`
    AppendVersioned,
}

/// Column carrying a version's first batch
pub const BATCH_IN_COLUMN: &str = "ydp_batch_in";
/// Column carrying a version's closing batch
pub const BATCH_OUT_COLUMN: &str = "ydp_batch_out";

/// Target table layout
#[derive(Debug, Clone, PartialEq)]
pub struct TableSpec {
    pub name: String,
    pub columns: Vec<Column>,
    pub mode: WriteMode,
}

impl TableSpec {
    pub fn new(name: impl Into<String>, schema: &Schema, mode: WriteMode) -> Self {
        Self {
            name: name.into(),
            columns: schema.columns.clone(),
            mode,
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| c.primary_key)
    }

    pub fn non_keys(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| !c.primary_key)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// One row-level operation
#[derive(Debug, Clone, PartialEq)]
pub enum RowOp {
    Upsert(Row),
    /// Row holding at least the key columns
    Delete(Row),
    /// New current version opened at the rowset's batch
    Open(Row),
    /// Close the current version of this key at the rowset's batch
    Close(Row),
}

impl RowOp {
    pub fn name(&self) -> &'static str {
        match self {
            RowOp::Upsert(_) => "upsert",
            RowOp::Delete(_) => "delete",
            RowOp::Open(_) => "open",
            RowOp::Close(_) => "close",
        }
    }

    pub fn row(&self) -> &Row {
        match self {
            RowOp::Upsert(row) | RowOp::Delete(row) | RowOp::Open(row) | RowOp::Close(row) => row,
        }
    }
}

/// Rows of one batch for one table
#[derive(Debug, Clone, PartialEq)]
pub struct RowSet {
    pub batch: i64,
    pub ops: Vec<RowOp>,
}

impl RowSet {
    pub fn new(batch: i64, ops: Vec<RowOp>) -> Self {
        Self { batch, ops }
    }

    /// Watermark-only rowset
    pub fn empty(batch: i64) -> Self {
        Self::new(batch, Vec::new())
    }
}

/// Statement text and text-bound parameters of one row op
pub(crate) struct BoundOp<'a> {
    pub sql: &'a str,
    pub params: Vec<Option<String>>,
}

/// The four row statements of one table, rendered once per rowset
pub(crate) struct RowStatements<'t> {
    table: &'t TableSpec,
    upsert: String,
    delete: String,
    insert_version: String,
    close_version: String,
}

impl<'t> RowStatements<'t> {
    pub fn new(dialect: &dyn SqlDialect, table: &'t TableSpec) -> Self {
        Self {
            table,
            upsert: dialect.upsert(table),
            delete: dialect.delete(table),
            insert_version: dialect.insert_version(table),
            close_version: dialect.close_version(table),
        }
    }

    fn values<'c>(row: &Row, columns: impl Iterator<Item = &'c Column>) -> Vec<Option<String>> {
        columns.map(|c| row.value_or_null(&c.name).canonical()).collect()
    }

    pub fn bind(&self, batch: i64, op: &RowOp) -> Result<BoundOp<'_>, TargetError> {
        let versioned = self.table.mode == WriteMode::AppendVersioned;
        let bound = match (op, versioned) {
            (RowOp::Upsert(row), false) => BoundOp {
                sql: &self.upsert,
                params: Self::values(row, self.table.columns.iter()),
            },
            (RowOp::Delete(row), false) => BoundOp {
                sql: &self.delete,
                params: Self::values(row, self.table.keys()),
            },
            (RowOp::Open(row), true) => {
                let mut params = Self::values(row, self.table.columns.iter());
                params.push(Some(batch.to_string()));
                BoundOp {
                    sql: &self.insert_version,
                    params,
                }
            },
            (RowOp::Close(row), true) => {
                let mut params = vec![Some(batch.to_string())];
                params.extend(Self::values(row, self.table.keys()));
                BoundOp {
                    sql: &self.close_version,
                    params,
                }
            },
            (op, _) => {
                return Err(TargetError::Statement(format!(
                    "{} does not apply to {:?} table {}",
                    op.name(),
                    self.table.mode,
                    self.table.name
                )))
            },
        };
        Ok(bound)
    }
}

/// A consumer database reachable by the dispatcher and the transformer runner
#[async_trait]
pub trait ReplicaTarget: Send + Sync {
    fn name(&self) -> &str;

    fn dialect(&self) -> &dyn SqlDialect;

    /// Highest batch reflected in `table` (0 when never written)
    async fn watermark(&self, table: &str) -> Result<i64, TargetError>;

    /// Create `table` and the watermark table when missing
    async fn ensure_table(&self, table: &TableSpec) -> Result<(), TargetError>;

    /// Apply `rows` and advance the watermark to `rows.batch` atomically.
    /// Returns `false` when the batch was already reflected.
    async fn apply_rowset(&self, table: &TableSpec, rows: &RowSet) -> Result<bool, TargetError>;

    /// Upsert `rows` into `table` in one transaction, without touching the
    /// watermark (transformer output)
    async fn write_rows(&self, table: &TableSpec, rows: &[Row]) -> Result<(), TargetError>;

    /// Remove every row of `table`
    async fn clear_table(&self, table: &str) -> Result<(), TargetError> {
        self.execute(&self.dialect().delete_all(table)).await
    }

    /// Every row of `table`, values as text
    async fn fetch_rows(&self, table: &str, columns: &[String]) -> Result<Vec<Row>, TargetError>;

    /// Run a statement batch (the transformer connection handle)
    async fn execute(&self, sql: &str) -> Result<(), TargetError>;
}

/// Opens targets for replica-group containers
#[async_trait]
pub trait TargetProvider: Send + Sync {
    async fn connect(
        &self,
        container: &DataContainer,
        credential: &Credential,
    ) -> Result<Arc<dyn ReplicaTarget>, TargetError>;

    /// Discard any open connection to `container` after it failed
    fn invalidate(&self, _container: &str) {}
}
