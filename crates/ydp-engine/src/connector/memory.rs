//! Scriptable in-process source
//!
//! Holds table contents for snapshot stores and queued signals for change-set
//! stores. Failures can be injected per datastore.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use ydp_common::model::{CaptureMode, Datastore};

use super::{ConnectorError, SourceConnector};
use crate::records::{DatasetChanges, Row, RowChange};

#[derive(Default)]
struct Inner {
    tables: HashMap<(String, String), Vec<Row>>,
    pending: HashMap<(String, String), VecDeque<RowChange>>,
    failures: HashMap<String, VecDeque<ConnectorError>>,
    delays: BTreeMap<String, Duration>,
}

#[derive(Default)]
pub struct MemorySource {
    inner: Mutex<Inner>,
    captures: AtomicUsize,
}

fn key(store: &str, dataset: &str) -> (String, String) {
    (store.to_string(), dataset.to_string())
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace the current contents of a snapshot table
    pub fn set_rows(&self, store: &str, dataset: &str, rows: Vec<Row>) {
        self.lock().tables.insert(key(store, dataset), rows);
    }

    /// Queue change-set signals, delivered on the next capture
    pub fn push_changes(&self, store: &str, dataset: &str, changes: Vec<RowChange>) {
        self.lock()
            .pending
            .entry(key(store, dataset))
            .or_default()
            .extend(changes);
    }

    /// Fail the next capture of `store` with `error`
    pub fn fail_next(&self, store: &str, error: ConnectorError) {
        self.lock()
            .failures
            .entry(store.to_string())
            .or_default()
            .push_back(error);
    }

    /// Delay every capture of `store`
    pub fn set_delay(&self, store: &str, delay: Duration) {
        self.lock().delays.insert(store.to_string(), delay);
    }

    pub fn capture_count(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceConnector for MemorySource {
    async fn capture(
        &self,
        store: &Datastore,
        datasets: &[String],
    ) -> Result<Vec<DatasetChanges>, ConnectorError> {
        self.captures.fetch_add(1, Ordering::SeqCst);

        let capture = store
            .capture
            .as_ref()
            .ok_or_else(|| ConnectorError::Unsupported(format!("{} has no capture metadata", store.name)))?;

        let delay = {
            let mut inner = self.lock();
            if let Some(err) = inner.failures.get_mut(&store.name).and_then(VecDeque::pop_front) {
                return Err(err);
            }
            inner.delays.get(&store.name).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.lock();
        let captured = datasets
            .iter()
            .map(|name| match capture.mode {
                CaptureMode::Snapshot => DatasetChanges::snapshot(
                    name.as_str(),
                    inner.tables.get(&key(&store.name, name)).cloned().unwrap_or_default(),
                ),
                CaptureMode::ChangeSet => DatasetChanges::change_set(
                    name.as_str(),
                    inner
                        .pending
                        .remove(&key(&store.name, name))
                        .map(Vec::from)
                        .unwrap_or_default(),
                ),
            })
            .collect();
        Ok(captured)
    }
}
