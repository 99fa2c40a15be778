//! In-process merge store
//!
//! Same contract as the Postgres store, held behind one mutex.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::store::{
    BatchCommit, BatchFilter, ChangeEvent, MergeOp, MergeStore, SchemaRecord, StoreError,
    StoredRecord, VersionRecord, OPEN_BATCH,
};
use crate::batch::{BatchRecord, BatchStatus, StreamKey, StreamState};
use crate::records::RowKey;

type DatasetId = (String, String, String);

#[derive(Default)]
struct Inner {
    streams: BTreeMap<(String, StreamKey), StreamState>,
    batches: BTreeMap<(String, StreamKey, i64), BatchRecord>,
    versions: HashMap<DatasetId, Vec<VersionRecord>>,
    hashes: HashMap<(DatasetId, RowKey, i64), String>,
    change_log: HashMap<DatasetId, Vec<ChangeEvent>>,
    schemas: HashMap<DatasetId, SchemaRecord>,
}

impl Inner {
    /// Remove the open version of `key` and its content hash
    fn drop_open(&mut self, ds: &DatasetId, key: &RowKey) {
        let Some(versions) = self.versions.get_mut(ds) else {
            return;
        };
        if let Some(i) = versions.iter().position(|v| v.key == *key && v.is_open()) {
            let removed = versions.swap_remove(i);
            self.hashes.remove(&(ds.clone(), key.clone(), removed.batch_in));
        }
    }
}

#[derive(Default)]
pub struct MemoryMergeStore {
    inner: Mutex<Inner>,
    fail_next_commit: AtomicBool,
}

fn id(platform: &str, datastore: &str, dataset: &str) -> DatasetId {
    (platform.to_string(), datastore.to_string(), dataset.to_string())
}

impl MemoryMergeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `commit_batch` fail before writing anything
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl MergeStore for MemoryMergeStore {
    async fn last_committed(&self, platform: &str, stream: &StreamKey) -> Result<i64, StoreError> {
        Ok(self
            .lock()
            .streams
            .get(&(platform.to_string(), stream.clone()))
            .map_or(0, |s| s.last_committed))
    }

    async fn begin_batch(
        &self,
        platform: &str,
        stream: &StreamKey,
        sequence: i64,
        run_id: Uuid,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let key = (platform.to_string(), stream.clone(), sequence);
        match inner.batches.get_mut(&key) {
            Some(existing) if existing.status == BatchStatus::Committed => {
                Err(StoreError::SequenceConflict {
                    platform: platform.to_string(),
                    stream: stream.to_string(),
                    attempted: sequence,
                    current: sequence,
                })
            },
            Some(existing) => {
                existing.status = BatchStatus::Running;
                existing.attempts += 1;
                existing.run_id = run_id;
                existing.error = None;
                existing.started_at = Utc::now();
                existing.finished_at = None;
                Ok(())
            },
            None => {
                inner.batches.insert(
                    key,
                    BatchRecord {
                        platform: platform.to_string(),
                        stream: stream.clone(),
                        sequence,
                        status: BatchStatus::Running,
                        attempts: 1,
                        run_id,
                        error: None,
                        stats: None,
                        started_at: Utc::now(),
                        finished_at: None,
                    },
                );
                Ok(())
            },
        }
    }

    async fn fail_batch(
        &self,
        platform: &str,
        stream: &StreamKey,
        sequence: i64,
        error: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if let Some(batch) = inner
            .batches
            .get_mut(&(platform.to_string(), stream.clone(), sequence))
        {
            if batch.status != BatchStatus::Committed {
                batch.status = BatchStatus::Failed;
                batch.error = Some(error.to_string());
                batch.finished_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn commit_batch(&self, commit: &BatchCommit) -> Result<(), StoreError> {
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected commit failure".to_string()));
        }

        let mut inner = self.lock();
        let stream_key = (commit.platform.clone(), commit.stream.clone());
        let current = inner.streams.get(&stream_key).map_or(0, |s| s.last_committed);
        if commit.sequence != current + 1 {
            return Err(StoreError::SequenceConflict {
                platform: commit.platform.clone(),
                stream: commit.stream.to_string(),
                attempted: commit.sequence,
                current,
            });
        }

        let seq = commit.sequence;
        for dataset in &commit.datasets {
            let ds = id(&commit.platform, &commit.stream.datastore, &dataset.dataset);

            for op in &dataset.ops {
                match op {
                    MergeOp::Upsert { key, row, hash } => {
                        inner.drop_open(&ds, key);
                        inner.versions.entry(ds.clone()).or_default().push(VersionRecord {
                            key: key.clone(),
                            row: row.clone(),
                            batch_in: seq,
                            batch_out: OPEN_BATCH,
                        });
                        inner.hashes.insert((ds.clone(), key.clone(), seq), hash.clone());
                    },
                    MergeOp::Delete { key, .. } => inner.drop_open(&ds, key),
                    MergeOp::OpenVersion { key, row, hash } => {
                        inner.versions.entry(ds.clone()).or_default().push(VersionRecord {
                            key: key.clone(),
                            row: row.clone(),
                            batch_in: seq,
                            batch_out: OPEN_BATCH,
                        });
                        inner.hashes.insert((ds.clone(), key.clone(), seq), hash.clone());
                    },
                    MergeOp::CloseVersion { key, .. } => {
                        let closed = inner
                            .versions
                            .get_mut(&ds)
                            .and_then(|vs| vs.iter_mut().find(|v| v.key == *key && v.is_open()))
                            .map(|v| {
                                v.batch_out = seq;
                                v.batch_in
                            });
                        if let Some(batch_in) = closed {
                            inner.hashes.remove(&(ds.clone(), key.clone(), batch_in));
                        }
                    },
                }
            }

            let log = inner.change_log.entry(ds.clone()).or_default();
            for (ordinal, op) in dataset.ops.iter().enumerate() {
                log.push(ChangeEvent {
                    batch: seq,
                    ordinal: ordinal as i32,
                    key: op.key().clone(),
                    kind: op.kind(),
                    row: op.row().clone(),
                });
            }

            inner.schemas.insert(ds, dataset.schema.clone());
        }

        inner.streams.insert(
            stream_key,
            StreamState {
                platform: commit.platform.clone(),
                stream: commit.stream.clone(),
                last_committed: seq,
                updated_at: Utc::now(),
            },
        );

        let stats = commit.stats();
        let batch = inner
            .batches
            .entry((commit.platform.clone(), commit.stream.clone(), seq))
            .or_insert_with(|| BatchRecord {
                platform: commit.platform.clone(),
                stream: commit.stream.clone(),
                sequence: seq,
                status: BatchStatus::Running,
                attempts: 1,
                run_id: Uuid::new_v4(),
                error: None,
                stats: None,
                started_at: Utc::now(),
                finished_at: None,
            });
        batch.status = BatchStatus::Committed;
        batch.error = None;
        batch.stats = Some(stats);
        batch.finished_at = Some(Utc::now());

        Ok(())
    }

    async fn open_records(
        &self,
        platform: &str,
        datastore: &str,
        dataset: &str,
    ) -> Result<BTreeMap<RowKey, StoredRecord>, StoreError> {
        let inner = self.lock();
        let ds = id(platform, datastore, dataset);
        let mut open = BTreeMap::new();
        for v in inner.versions.get(&ds).into_iter().flatten().filter(|v| v.is_open()) {
            let hash = inner
                .hashes
                .get(&(ds.clone(), v.key.clone(), v.batch_in))
                .cloned()
                .ok_or_else(|| StoreError::Corrupt(format!("no hash for {}", v.key)))?;
            open.insert(
                v.key.clone(),
                StoredRecord {
                    row: v.row.clone(),
                    hash,
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
        let mut versions = self
            .lock()
            .versions
            .get(&id(platform, datastore, dataset))
            .cloned()
            .unwrap_or_default();
        versions.sort_by(|a, b| (&a.key, a.batch_in).cmp(&(&b.key, b.batch_in)));
        Ok(versions)
    }

    async fn schema_record(
        &self,
        platform: &str,
        datastore: &str,
        dataset: &str,
    ) -> Result<Option<SchemaRecord>, StoreError> {
        Ok(self.lock().schemas.get(&id(platform, datastore, dataset)).cloned())
    }

    async fn changes_since(
        &self,
        platform: &str,
        datastore: &str,
        dataset: &str,
        after: i64,
        upto: i64,
    ) -> Result<Vec<ChangeEvent>, StoreError> {
        let mut events: Vec<ChangeEvent> = self
            .lock()
            .change_log
            .get(&id(platform, datastore, dataset))
            .into_iter()
            .flatten()
            .filter(|e| e.batch > after && e.batch <= upto)
            .cloned()
            .collect();
        events.sort_by_key(|e| (e.batch, e.ordinal));
        Ok(events)
    }

    async fn list_batches(&self, filter: &BatchFilter) -> Result<Vec<BatchRecord>, StoreError> {
        let inner = self.lock();
        let mut batches: Vec<BatchRecord> = inner
            .batches
            .values()
            .filter(|b| filter.matches(b))
            .cloned()
            .collect();
        batches.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.sequence.cmp(&a.sequence)));
        if let Some(limit) = filter.limit {
            batches.truncate(limit.max(0) as usize);
        }
        Ok(batches)
    }

    async fn stream_states(&self, platform: Option<&str>) -> Result<Vec<StreamState>, StoreError> {
        Ok(self
            .lock()
            .streams
            .values()
            .filter(|s| platform.map_or(true, |p| p == s.platform))
            .cloned()
            .collect())
    }
}
