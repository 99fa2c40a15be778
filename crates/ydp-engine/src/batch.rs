//! Batch bookkeeping types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use ydp_common::model::{ConsistencyType, Datastore};

/// Batch lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Running,
    Committed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Running => "RUNNING",
            BatchStatus::Committed => "COMMITTED",
            BatchStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "RUNNING" => Ok(BatchStatus::Running),
            "COMMITTED" => Ok(BatchStatus::Committed),
            "FAILED" => Ok(BatchStatus::Failed),
            _ => Err(format!("Invalid batch status: {}", s)),
        }
    }
}

/// Sequence-numbered ingestion stream.
///
/// `MULTI_DATASET` stores have one stream per datastore (`Store1`);
/// `SINGLE_DATASET` stores have one per dataset (`Store1#customers`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamKey {
    pub datastore: String,
    pub dataset: Option<String>,
}

impl StreamKey {
    pub fn datastore(name: impl Into<String>) -> Self {
        Self {
            datastore: name.into(),
            dataset: None,
        }
    }

    pub fn dataset(datastore: impl Into<String>, dataset: impl Into<String>) -> Self {
        Self {
            datastore: datastore.into(),
            dataset: Some(dataset.into()),
        }
    }

    /// Streams a datastore is ingested through
    pub fn for_datastore(store: &Datastore) -> Vec<StreamKey> {
        match store.consistency() {
            ConsistencyType::MultiDataset => vec![StreamKey::datastore(&store.name)],
            ConsistencyType::SingleDataset => store
                .datasets
                .iter()
                .map(|d| StreamKey::dataset(&store.name, &d.name))
                .collect(),
        }
    }

    /// Stream that carries `dataset` of `store`
    pub fn carrying(store: &Datastore, dataset: &str) -> StreamKey {
        match store.consistency() {
            ConsistencyType::MultiDataset => StreamKey::datastore(&store.name),
            ConsistencyType::SingleDataset => StreamKey::dataset(&store.name, dataset),
        }
    }

    /// Dataset names this stream covers
    pub fn datasets<'a>(&'a self, store: &'a Datastore) -> Vec<&'a str> {
        match &self.dataset {
            Some(name) => vec![name.as_str()],
            None => store.datasets.iter().map(|d| d.name.as_str()).collect(),
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.dataset {
            Some(dataset) => write!(f, "{}#{}", self.datastore, dataset),
            None => f.write_str(&self.datastore),
        }
    }
}

impl std::str::FromStr for StreamKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('#') {
            Some((store, dataset)) if !store.is_empty() && !dataset.is_empty() => {
                Ok(StreamKey::dataset(store, dataset))
            },
            None if !s.is_empty() => Ok(StreamKey::datastore(s)),
            _ => Err(format!("Invalid stream: {}", s)),
        }
    }
}

/// Per-dataset merge counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStats {
    pub inserted: u64,
    pub updated: u64,
    pub closed: u64,
    pub unchanged: u64,
    pub deleted: u64,
}

impl MergeStats {
    pub fn inc_inserted(&mut self) {
        self.inserted += 1;
    }

    pub fn inc_updated(&mut self) {
        self.updated += 1;
    }

    pub fn inc_closed(&mut self) {
        self.closed += 1;
    }

    pub fn inc_unchanged(&mut self) {
        self.unchanged += 1;
    }

    pub fn inc_deleted(&mut self) {
        self.deleted += 1;
    }

    pub fn merge(&mut self, other: &MergeStats) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.closed += other.closed;
        self.unchanged += other.unchanged;
        self.deleted += other.deleted;
    }

    /// Rows whose merge-store state changed
    pub fn changed(&self) -> u64 {
        self.inserted + self.updated + self.deleted
    }
}

/// Outcome of one committed batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeResult {
    pub platform: String,
    pub stream: StreamKey,
    pub sequence: i64,
    pub datasets: BTreeMap<String, MergeStats>,
}

impl MergeResult {
    pub fn totals(&self) -> MergeStats {
        let mut total = MergeStats::default();
        for stats in self.datasets.values() {
            total.merge(stats);
        }
        total
    }
}

/// Persisted batch row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub platform: String,
    pub stream: StreamKey,
    pub sequence: i64,
    pub status: BatchStatus,
    pub attempts: i32,
    pub run_id: Uuid,
    pub error: Option<String>,
    pub stats: Option<MergeStats>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Last committed sequence of one stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamState {
    pub platform: String,
    pub stream: StreamKey,
    pub last_committed: i64,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_key_round_trip_text() {
        let multi: StreamKey = "Store1".parse().unwrap();
        assert_eq!(multi, StreamKey::datastore("Store1"));
        let single: StreamKey = "Store1#customers".parse().unwrap();
        assert_eq!(single.to_string(), "Store1#customers");
        assert!("#customers".parse::<StreamKey>().is_err());
        assert!("".parse::<StreamKey>().is_err());
    }

    #[test]
    fn test_status_text() {
        assert_eq!("committed".parse::<BatchStatus>().unwrap(), BatchStatus::Committed);
        assert_eq!(BatchStatus::Failed.to_string(), "FAILED");
        assert!("DONE".parse::<BatchStatus>().is_err());
    }

    #[test]
    fn test_stats_merge() {
        let mut a = MergeStats {
            inserted: 2,
            ..Default::default()
        };
        let mut b = MergeStats::default();
        b.inc_updated();
        b.inc_closed();
        b.inc_unchanged();
        a.merge(&b);
        assert_eq!(a.changed(), 3);
        assert_eq!(a.closed, 1);
        assert_eq!(a.unchanged, 1);
    }
}
