//! Transformer runner
//!
//! Wraps one execution of a workspace's transformer in an output batch per
//! data platform. The body runs on the placement database; its output tables
//! are then read back and merged like a snapshot capture. A failed body marks
//! every output batch FAILED and leaves the merge store as it was.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use ydp_common::model::{DataPlatform, DataTransformer};

use super::{TransformerContext, TransformerRegistry};
use crate::batch::StreamKey;
use crate::error::{PipelineError, Result};
use crate::merge::{CapturedBatch, MergeEngine};
use crate::records::DatasetChanges;
use crate::replication::TargetProvider;
use crate::router::DatasetRouter;
use crate::scheduler::StreamRun;

#[derive(Debug)]
pub enum TransformOutcome {
    Completed(Vec<StreamRun>),
    /// The job is still running from a previous trigger
    Skipped,
}

impl TransformOutcome {
    pub fn runs(&self) -> &[StreamRun] {
        match self {
            TransformOutcome::Completed(runs) => runs,
            TransformOutcome::Skipped => &[],
        }
    }
}

pub struct TransformerRunner {
    router: Arc<DatasetRouter>,
    engine: MergeEngine,
    targets: Arc<dyn TargetProvider>,
    registry: Arc<TransformerRegistry>,
    timeout: Duration,
    running: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl TransformerRunner {
    pub fn new(
        router: Arc<DatasetRouter>,
        engine: MergeEngine,
        targets: Arc<dyn TargetProvider>,
        registry: Arc<TransformerRegistry>,
        timeout: Duration,
    ) -> Self {
        Self {
            router,
            engine,
            targets,
            registry,
            timeout,
            running: Mutex::new(HashMap::new()),
        }
    }

    fn job_lock(&self, workspace: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        running.entry(workspace.to_string()).or_default().clone()
    }

    /// Run the transformer of `workspace` once
    #[instrument(skip(self))]
    pub async fn run(&self, workspace: &str) -> Result<TransformOutcome> {
        let ecosystem = self.router.ecosystem().clone();
        let ws = ecosystem.workspace(workspace)?;
        let job = ws
            .transformer
            .as_ref()
            .ok_or_else(|| PipelineError::Config(format!("workspace {} has no transformer", workspace)))?;

        let lock = self.job_lock(workspace);
        let Ok(_running) = lock.try_lock() else {
            info!(job = %job.name, "Transformer still running, trigger skipped");
            return Ok(TransformOutcome::Skipped);
        };

        let mut runs = Vec::new();
        let mut pending = Vec::new();
        for platform in &ecosystem.psp().data_platforms {
            for stream in StreamKey::for_datastore(&job.store) {
                match self.begin(platform, &stream).await {
                    Ok(sequence) => pending.push((platform, stream, sequence)),
                    Err(e) => runs.push(StreamRun {
                        platform: platform.name.clone(),
                        stream,
                        sequence: 0,
                        result: Err(e),
                    }),
                }
            }
        }
        if pending.is_empty() {
            return Ok(TransformOutcome::Completed(runs));
        }

        let output = match tokio::time::timeout(self.timeout, self.execute(workspace, job)).await {
            Ok(result) => result,
            Err(_) => Err(format!("execution timed out after {:?}", self.timeout)),
        };

        for (platform, stream, sequence) in pending {
            let result = match &output {
                Ok(changes) => {
                    let carried: Vec<DatasetChanges> = changes
                        .iter()
                        .filter(|c| stream.dataset.as_ref().map_or(true, |d| *d == c.dataset))
                        .cloned()
                        .collect();
                    self.engine
                        .apply(
                            CapturedBatch {
                                platform: &platform.name,
                                datastore: &job.store,
                                stream: stream.clone(),
                                sequence,
                                changes: carried,
                            },
                            platform.milestone_strategy,
                        )
                        .await
                },
                Err(reason) => Err(PipelineError::TransformerExecutionFailure {
                    job: job.name.clone(),
                    batch: sequence,
                    reason: reason.clone(),
                }),
            };

            if let Err(e) = &result {
                warn!(job = %job.name, platform = %platform.name, batch = sequence, kind = e.kind(), error = %e, "Output batch failed");
                if let Err(mark) = self
                    .engine
                    .store()
                    .fail_batch(&platform.name, &stream, sequence, &e.to_string())
                    .await
                {
                    warn!(job = %job.name, batch = sequence, error = %mark, "Could not mark batch FAILED");
                }
            }

            runs.push(StreamRun {
                platform: platform.name.clone(),
                stream,
                sequence,
                result,
            });
        }

        let committed = runs.iter().filter(|r| r.is_committed()).count();
        info!(job = %job.name, committed, failed = runs.len() - committed, "Transformer run finished");
        Ok(TransformOutcome::Completed(runs))
    }

    async fn begin(&self, platform: &DataPlatform, stream: &StreamKey) -> Result<i64> {
        let context = format!("{}/{}", platform.name, stream);
        let store = self.engine.store();
        let sequence = store
            .last_committed(&platform.name, stream)
            .await
            .map_err(PipelineError::store(&context))?
            + 1;
        store
            .begin_batch(&platform.name, stream, sequence, Uuid::new_v4())
            .await
            .map_err(PipelineError::store(format!("{} batch {}", context, sequence)))?;
        Ok(sequence)
    }

    /// Run the body on its placement and read the output tables back
    async fn execute(&self, workspace: &str, job: &DataTransformer) -> std::result::Result<Vec<DatasetChanges>, String> {
        let ecosystem = self.router.ecosystem();
        let psp = ecosystem.psp();
        let hint = psp
            .hint_for(workspace)
            .ok_or_else(|| format!("workspace {} has no execution placement", workspace))?;
        let placement = &hint.execution_placement;
        let container = psp
            .replica_group(&placement.crg_name)
            .and_then(|g| g.container(&placement.dc_name))
            .ok_or_else(|| format!("placement {}/{} does not exist", placement.crg_name, placement.dc_name))?;

        let transformer = self.registry.resolve(&job.code).map_err(|e| e.to_string())?;
        let target = self
            .targets
            .connect(container, &job.credential)
            .await
            .map_err(|e| format!("placement {}: {}", container.name, e))?;

        let context = TransformerContext::new(workspace, &job.name, self.router.clone(), job.store.clone());
        let outputs = context.output_tables();
        for (_, spec) in &outputs {
            target.ensure_table(spec).await.map_err(|e| e.to_string())?;
            target.clear_table(&spec.name).await.map_err(|e| e.to_string())?;
        }

        transformer
            .execute(&context, target.as_ref())
            .await
            .map_err(|e| format!("{:#}", e))?;

        let mut changes = Vec::with_capacity(outputs.len());
        for (dataset, spec) in &outputs {
            let columns = spec.column_names();
            let rows = target.fetch_rows(&spec.name, &columns).await.map_err(|e| e.to_string())?;
            let mut snapshot = DatasetChanges::snapshot(dataset.clone(), rows);
            snapshot.observed_columns = columns;
            changes.push(snapshot);
        }

        info!(job = %job.name, placement = %container.name, datasets = changes.len(), "Transformer body finished");
        Ok(changes)
    }
}
