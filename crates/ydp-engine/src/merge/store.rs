//! Merge store seam
//!
//! The merge store is the single point of mutation for a platform's view of a
//! datastore. A batch either commits in full (records, change log, schema and
//! stream state in one transaction) or leaves no trace beyond its FAILED row.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::batch::{BatchRecord, BatchStatus, MergeStats, StreamKey, StreamState};
use crate::records::{Row, RowKey};

/// `batch_out` of a version that is still current
pub const OPEN_BATCH: i64 = i64::MAX;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Sequence conflict on {platform}/{stream}: batch {attempted} cannot follow {current}")]
    SequenceConflict {
        platform: String,
        stream: String,
        attempted: i64,
        current: i64,
    },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Merge store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

/// Current (open) record for one primary key
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub row: Row,
    pub hash: String,
}

/// One stored version; `batch_out == OPEN_BATCH` while current
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub key: RowKey,
    pub row: Row,
    pub batch_in: i64,
    pub batch_out: i64,
}

impl VersionRecord {
    pub fn is_open(&self) -> bool {
        self.batch_out == OPEN_BATCH
    }
}

/// Declared schema as last recorded in the merge store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaRecord {
    pub version: u32,
    pub fingerprint: String,
}

/// Planned mutation of one primary key
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOp {
    /// Live-only insert or overwrite
    Upsert { key: RowKey, row: Row, hash: String },
    /// Live-only removal; `previous` is the removed row
    Delete { key: RowKey, previous: Row },
    /// Forensic: open a new current version at the batch
    OpenVersion { key: RowKey, row: Row, hash: String },
    /// Forensic: close the current version at the batch
    CloseVersion { key: RowKey, previous: Row },
}

impl MergeOp {
    pub fn key(&self) -> &RowKey {
        match self {
            MergeOp::Upsert { key, .. }
            | MergeOp::Delete { key, .. }
            | MergeOp::OpenVersion { key, .. }
            | MergeOp::CloseVersion { key, .. } => key,
        }
    }

    pub fn row(&self) -> &Row {
        match self {
            MergeOp::Upsert { row, .. } | MergeOp::OpenVersion { row, .. } => row,
            MergeOp::Delete { previous, .. } | MergeOp::CloseVersion { previous, .. } => previous,
        }
    }

    pub fn kind(&self) -> ChangeEventKind {
        match self {
            MergeOp::Upsert { .. } => ChangeEventKind::Upsert,
            MergeOp::Delete { .. } => ChangeEventKind::Delete,
            MergeOp::OpenVersion { .. } => ChangeEventKind::OpenVersion,
            MergeOp::CloseVersion { .. } => ChangeEventKind::CloseVersion,
        }
    }
}

/// Change-log event kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeEventKind {
    Upsert,
    Delete,
    OpenVersion,
    CloseVersion,
}

impl ChangeEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeEventKind::Upsert => "upsert",
            ChangeEventKind::Delete => "delete",
            ChangeEventKind::OpenVersion => "open_version",
            ChangeEventKind::CloseVersion => "close_version",
        }
    }
}

impl std::str::FromStr for ChangeEventKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upsert" => Ok(ChangeEventKind::Upsert),
            "delete" => Ok(ChangeEventKind::Delete),
            "open_version" => Ok(ChangeEventKind::OpenVersion),
            "close_version" => Ok(ChangeEventKind::CloseVersion),
            other => Err(StoreError::Corrupt(format!("unknown change kind {}", other))),
        }
    }
}

/// Ordered change-log entry, replayed by replication
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub batch: i64,
    pub ordinal: i32,
    pub key: RowKey,
    pub kind: ChangeEventKind,
    pub row: Row,
}

/// Everything one dataset contributes to a batch commit
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetCommit {
    pub dataset: String,
    pub ops: Vec<MergeOp>,
    pub schema: SchemaRecord,
    pub stats: MergeStats,
}

/// Atomic unit handed to `MergeStore::commit_batch`
#[derive(Debug, Clone, PartialEq)]
pub struct BatchCommit {
    pub platform: String,
    pub stream: StreamKey,
    pub sequence: i64,
    pub datasets: Vec<DatasetCommit>,
}

impl BatchCommit {
    pub fn stats(&self) -> MergeStats {
        let mut total = MergeStats::default();
        for dataset in &self.datasets {
            total.merge(&dataset.stats);
        }
        total
    }
}

/// Filter for batch listings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFilter {
    pub platform: Option<String>,
    pub stream: Option<StreamKey>,
    pub status: Option<BatchStatus>,
    pub limit: Option<i64>,
}

impl BatchFilter {
    pub fn matches(&self, record: &BatchRecord) -> bool {
        self.platform.as_ref().map_or(true, |p| *p == record.platform)
            && self.stream.as_ref().map_or(true, |s| *s == record.stream)
            && self.status.map_or(true, |s| s == record.status)
    }
}

/// Persistence seam for merge records, batches and the change log
#[async_trait]
pub trait MergeStore: Send + Sync {
    /// Last committed sequence of `stream` (0 before the first commit)
    async fn last_committed(&self, platform: &str, stream: &StreamKey) -> Result<i64, StoreError>;

    /// Record `sequence` as RUNNING, counting an attempt
    async fn begin_batch(
        &self,
        platform: &str,
        stream: &StreamKey,
        sequence: i64,
        run_id: Uuid,
    ) -> Result<(), StoreError>;

    /// Mark `sequence` FAILED; merge records are untouched
    async fn fail_batch(
        &self,
        platform: &str,
        stream: &StreamKey,
        sequence: i64,
        error: &str,
    ) -> Result<(), StoreError>;

    /// Apply every op, append the change log, record schemas and advance the
    /// stream, all atomically. Fails with `SequenceConflict` unless
    /// `commit.sequence` directly follows the stream's last commit.
    async fn commit_batch(&self, commit: &BatchCommit) -> Result<(), StoreError>;

    async fn open_records(
        &self,
        platform: &str,
        datastore: &str,
        dataset: &str,
    ) -> Result<BTreeMap<RowKey, StoredRecord>, StoreError>;

    async fn versions(
        &self,
        platform: &str,
        datastore: &str,
        dataset: &str,
    ) -> Result<Vec<VersionRecord>, StoreError>;

    async fn schema_record(
        &self,
        platform: &str,
        datastore: &str,
        dataset: &str,
    ) -> Result<Option<SchemaRecord>, StoreError>;

    /// Change-log events with `after < batch <= upto`, in batch then ordinal
    /// order
    async fn changes_since(
        &self,
        platform: &str,
        datastore: &str,
        dataset: &str,
        after: i64,
        upto: i64,
    ) -> Result<Vec<ChangeEvent>, StoreError>;

    async fn list_batches(&self, filter: &BatchFilter) -> Result<Vec<BatchRecord>, StoreError>;

    async fn stream_states(&self, platform: Option<&str>) -> Result<Vec<StreamState>, StoreError>;
}
