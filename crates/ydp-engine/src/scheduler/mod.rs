//! Ingestion scheduler
//!
//! `fire` runs one capture of a datastore and merges it into every data
//! platform. Each datastore owns a slot guarding single-flight execution: a
//! firing that finds the slot busy is skipped and logged, never queued.
//!
//! Every platform keeps its own batch sequence per stream. A failed batch
//! leaves the merge store untouched and its sequence is retried by the next
//! firing.
//!
//! Change-set signals are consumed by the capture that reads them, so the
//! slot holds on to whatever a platform failed to commit and replays it ahead
//! of the next capture for that platform. A schema mismatch halts only the
//! stream it was found on.

mod cron;

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use ydp_common::model::{DataPlatform, Datastore, Ecosystem};

use crate::batch::{MergeResult, StreamKey};
use crate::connector::SourceConnector;
use crate::error::{PipelineError, Result};
use crate::merge::{CapturedBatch, MergeEngine};
use crate::records::DatasetChanges;

pub use cron::run_cron;

/// Outcome of one stream on one platform
#[derive(Debug)]
pub struct StreamRun {
    pub platform: String,
    pub stream: StreamKey,
    /// Batch sequence attempted; 0 when the sequence could not be read
    pub sequence: i64,
    pub result: Result<MergeResult>,
}

impl StreamRun {
    pub fn is_committed(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// A capture of the datastore is still running
    AlreadyRunning,
    /// A schema mismatch stopped automatic retries
    Halted(String),
}

#[derive(Debug)]
pub enum FireOutcome {
    Completed(Vec<StreamRun>),
    Skipped(SkipReason),
}

impl FireOutcome {
    pub fn runs(&self) -> &[StreamRun] {
        match self {
            FireOutcome::Completed(runs) => runs,
            FireOutcome::Skipped(_) => &[],
        }
    }
}

#[derive(Debug, Default)]
struct SlotState {
    halted: HashMap<StreamKey, String>,
    last_fired: Option<DateTime<Utc>>,
    /// Change-set signals not yet committed, per platform and stream
    held: HashMap<(String, StreamKey), Vec<DatasetChanges>>,
}

type Slot = Arc<tokio::sync::Mutex<SlotState>>;

pub struct IngestionScheduler {
    ecosystem: Arc<Ecosystem>,
    platforms: Vec<DataPlatform>,
    connector: Arc<dyn SourceConnector>,
    engine: MergeEngine,
    capture_timeout: Duration,
    slots: Mutex<HashMap<String, Slot>>,
}

impl IngestionScheduler {
    pub fn new(
        ecosystem: Arc<Ecosystem>,
        connector: Arc<dyn SourceConnector>,
        engine: MergeEngine,
        capture_timeout: Duration,
    ) -> Self {
        let platforms = ecosystem.psp().data_platforms.clone();
        Self {
            ecosystem,
            platforms,
            connector,
            engine,
            capture_timeout,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, datastore: &str) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.entry(datastore.to_string()).or_default().clone()
    }

    /// Clear every halt a schema mismatch left on the streams of
    /// `datastore`. Returns whether one was set.
    pub async fn resume(&self, datastore: &str) -> bool {
        let slot = self.slot(datastore);
        let mut state = slot.lock().await;
        let was_halted = !state.halted.is_empty();
        state.halted.clear();
        was_halted
    }

    /// Last firing time of `datastore` that acquired its slot
    pub async fn last_fired(&self, datastore: &str) -> Option<DateTime<Utc>> {
        let slot = self.slot(datastore);
        let state = slot.lock().await;
        state.last_fired
    }

    /// Capture `datastore` once and merge it into every platform
    #[instrument(skip(self, now))]
    pub async fn fire(&self, datastore: &str, now: DateTime<Utc>) -> Result<FireOutcome> {
        let store = self.ecosystem.datastore(datastore)?;
        if store.capture.is_none() {
            return Err(PipelineError::Config(format!(
                "datastore {} is produced by a transformer and is not captured",
                datastore
            )));
        }

        let slot = self.slot(datastore);
        let Ok(mut state) = slot.try_lock() else {
            info!("Capture still running, firing skipped");
            return Ok(FireOutcome::Skipped(SkipReason::AlreadyRunning));
        };

        let (streams, halted): (Vec<StreamKey>, Vec<StreamKey>) = StreamKey::for_datastore(store)
            .into_iter()
            .partition(|stream| !state.halted.contains_key(stream));
        for stream in &halted {
            warn!(stream = %stream, reason = %state.halted[stream], "Stream halted after schema mismatch, skipped");
        }
        if streams.is_empty() {
            let reason = halted
                .first()
                .and_then(|stream| state.halted.get(stream))
                .cloned()
                .unwrap_or_default();
            return Ok(FireOutcome::Skipped(SkipReason::Halted(reason)));
        }
        state.last_fired = Some(now);

        let mut runs = Vec::new();
        for stream in streams {
            let stream_runs = self.run_stream(&mut state, store, &stream).await;
            if let Some(mismatch) = stream_runs.iter().find_map(|r| match &r.result {
                Err(e @ PipelineError::SchemaMismatch { .. }) => Some(e.to_string()),
                _ => None,
            }) {
                state.halted.insert(stream, mismatch);
            }
            runs.extend(stream_runs);
        }

        let committed = runs.iter().filter(|r| r.is_committed()).count();
        info!(committed, failed = runs.len() - committed, "Firing finished");

        Ok(FireOutcome::Completed(runs))
    }

    async fn run_stream(&self, state: &mut SlotState, store: &Datastore, stream: &StreamKey) -> Vec<StreamRun> {
        let mut runs = Vec::new();
        let mut pending = Vec::new();
        let mut not_started = Vec::new();

        for platform in &self.platforms {
            let context = format!("{}/{}", platform.name, stream);
            let sequence = match self.engine.store().last_committed(&platform.name, stream).await {
                Ok(last) => last + 1,
                Err(e) => {
                    runs.push(StreamRun {
                        platform: platform.name.clone(),
                        stream: stream.clone(),
                        sequence: 0,
                        result: Err(PipelineError::store(&context)(e)),
                    });
                    not_started.push(platform);
                    continue;
                },
            };
            if let Err(e) = self
                .engine
                .store()
                .begin_batch(&platform.name, stream, sequence, Uuid::new_v4())
                .await
            {
                runs.push(StreamRun {
                    platform: platform.name.clone(),
                    stream: stream.clone(),
                    sequence,
                    result: Err(PipelineError::store(format!("{} batch {}", context, sequence))(e)),
                });
                not_started.push(platform);
                continue;
            }
            pending.push((platform, sequence));
        }

        if pending.is_empty() {
            return runs;
        }

        let datasets: Vec<String> = stream.datasets(store).into_iter().map(str::to_string).collect();
        let captured = self.capture(store, &datasets).await;

        if let Ok(changes) = &captured {
            for platform in not_started {
                let key = (platform.name.clone(), stream.clone());
                let carried = with_held(state.held.remove(&key), changes.clone());
                hold(state, key, carried);
            }
        }

        for (platform, sequence) in pending {
            let key = (platform.name.clone(), stream.clone());
            let result = match &captured {
                Ok(changes) => {
                    let changes = with_held(state.held.remove(&key), changes.clone());
                    let result = self
                        .engine
                        .apply(
                            CapturedBatch {
                                platform: &platform.name,
                                datastore: store,
                                stream: stream.clone(),
                                sequence,
                                changes: changes.clone(),
                            },
                            platform.milestone_strategy,
                        )
                        .await;
                    if result.is_err() {
                        hold(state, key, changes);
                    }
                    result
                },
                Err(reason) => Err(PipelineError::ConnectorUnavailable {
                    platform: platform.name.clone(),
                    stream: stream.clone(),
                    batch: sequence,
                    reason: reason.clone(),
                }),
            };

            if let Err(e) = &result {
                warn!(
                    platform = %platform.name,
                    stream = %stream,
                    batch = sequence,
                    kind = e.kind(),
                    error = %e,
                    "Batch failed"
                );
                if let Err(mark) = self
                    .engine
                    .store()
                    .fail_batch(&platform.name, stream, sequence, &e.to_string())
                    .await
                {
                    warn!(platform = %platform.name, batch = sequence, error = %mark, "Could not mark batch FAILED");
                }
            }

            runs.push(StreamRun {
                platform: platform.name.clone(),
                stream: stream.clone(),
                sequence,
                result,
            });
        }

        runs
    }

    async fn capture(
        &self,
        store: &Datastore,
        datasets: &[String],
    ) -> std::result::Result<Vec<DatasetChanges>, String> {
        match tokio::time::timeout(self.capture_timeout, self.connector.capture(store, datasets)).await {
            Ok(Ok(changes)) => Ok(changes),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("capture timed out after {:?}", self.capture_timeout)),
        }
    }
}

/// Put change-set signals a platform has not committed ahead of a fresh
/// capture. Snapshot datasets take the fresh capture as is.
fn with_held(held: Option<Vec<DatasetChanges>>, fresh: Vec<DatasetChanges>) -> Vec<DatasetChanges> {
    let Some(mut held) = held else {
        return fresh;
    };
    fresh
        .into_iter()
        .map(|capture| match held.iter().position(|h| h.dataset == capture.dataset) {
            Some(i) if !capture.snapshot => {
                let mut changes = held.swap_remove(i).changes;
                changes.extend(capture.changes);
                DatasetChanges::change_set(capture.dataset, changes)
            },
            _ => capture,
        })
        .collect()
}

fn hold(state: &mut SlotState, key: (String, StreamKey), changes: Vec<DatasetChanges>) {
    let signals: Vec<DatasetChanges> = changes
        .into_iter()
        .filter(|c| !c.snapshot && !c.changes.is_empty())
        .collect();
    if !signals.is_empty() {
        state.held.insert(key, signals);
    }
}
