//! Pipeline wiring
//!
//! Builds the scheduler, dispatcher and transformer runner over one merge
//! store and one ecosystem, and drives them from cron loops.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use ydp_common::model::Ecosystem;

use crate::config::{SchedulerConfig, TimeoutConfig};
use crate::connector::SourceConnector;
use crate::error::{PipelineError, Result};
use crate::merge::{MergeEngine, MergeStore};
use crate::replication::{ReplicateOutcome, ReplicationDispatcher, TargetProvider};
use crate::router::DatasetRouter;
use crate::scheduler::{run_cron, FireOutcome, IngestionScheduler};
use crate::transformer::{TransformOutcome, TransformerRegistry, TransformerRunner};

pub struct Pipeline {
    ecosystem: Arc<Ecosystem>,
    router: Arc<DatasetRouter>,
    store: Arc<dyn MergeStore>,
    scheduler: IngestionScheduler,
    dispatcher: ReplicationDispatcher,
    runner: TransformerRunner,
}

pub struct PipelineBuilder {
    ecosystem: Arc<Ecosystem>,
    store: Arc<dyn MergeStore>,
    connector: Option<Arc<dyn SourceConnector>>,
    targets: Option<Arc<dyn TargetProvider>>,
    registry: TransformerRegistry,
    timeouts: TimeoutConfig,
}

impl PipelineBuilder {
    pub fn connector(mut self, connector: Arc<dyn SourceConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn targets(mut self, targets: Arc<dyn TargetProvider>) -> Self {
        self.targets = Some(targets);
        self
    }

    pub fn registry(mut self, registry: TransformerRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        let connector = self
            .connector
            .ok_or_else(|| PipelineError::Config("pipeline needs a source connector".to_string()))?;
        let targets = self
            .targets
            .ok_or_else(|| PipelineError::Config("pipeline needs a target provider".to_string()))?;

        let router = Arc::new(DatasetRouter::new(self.ecosystem.clone()));
        let engine = MergeEngine::new(self.store.clone(), self.timeouts.merge());

        Ok(Pipeline {
            scheduler: IngestionScheduler::new(
                self.ecosystem.clone(),
                connector,
                engine.clone(),
                self.timeouts.capture(),
            ),
            dispatcher: ReplicationDispatcher::new(
                router.clone(),
                self.store.clone(),
                targets.clone(),
                self.timeouts.replication(),
            ),
            runner: TransformerRunner::new(
                router.clone(),
                engine,
                targets,
                Arc::new(self.registry),
                self.timeouts.transformer(),
            ),
            ecosystem: self.ecosystem,
            router,
            store: self.store,
        })
    }
}

impl Pipeline {
    pub fn builder(ecosystem: Arc<Ecosystem>, store: Arc<dyn MergeStore>) -> PipelineBuilder {
        PipelineBuilder {
            ecosystem,
            store,
            connector: None,
            targets: None,
            registry: TransformerRegistry::new(),
            timeouts: TimeoutConfig::default(),
        }
    }

    pub fn ecosystem(&self) -> &Arc<Ecosystem> {
        &self.ecosystem
    }

    pub fn router(&self) -> &Arc<DatasetRouter> {
        &self.router
    }

    pub fn store(&self) -> &Arc<dyn MergeStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &IngestionScheduler {
        &self.scheduler
    }

    /// Every configuration problem that must be fixed before data moves
    pub fn validate(&self) -> Vec<PipelineError> {
        let mut problems = Vec::new();
        if let Err(e) = self.ecosystem.lint() {
            problems.push(PipelineError::Model(e));
        }
        problems.extend(self.router.validate_all());
        problems
    }

    pub async fn fire(&self, datastore: &str) -> Result<FireOutcome> {
        self.scheduler.fire(datastore, Utc::now()).await
    }

    pub async fn replicate(&self, group: &str) -> Result<ReplicateOutcome> {
        self.dispatcher.replicate(group).await
    }

    pub async fn transform(&self, workspace: &str) -> Result<TransformOutcome> {
        self.runner.run(workspace).await
    }

    /// Spawn one cron loop per captured datastore, replica group and
    /// transformer, as enabled. Loops end when `shutdown` flips to `true`.
    pub fn start(self: &Arc<Self>, enabled: SchedulerConfig, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut loops = Vec::new();

        if enabled.ingestion_enabled {
            for store in self.ecosystem.datastores() {
                let Some(capture) = &store.capture else {
                    continue;
                };
                let pipeline = self.clone();
                let name = store.name.clone();
                loops.push(tokio::spawn(run_cron(
                    name.clone(),
                    capture.trigger.clone(),
                    shutdown.clone(),
                    move |at| {
                        let pipeline = pipeline.clone();
                        let name = name.clone();
                        async move {
                            if let Err(e) = pipeline.scheduler.fire(&name, at).await {
                                error!(datastore = %name, kind = e.kind(), error = %e, "Firing failed");
                            }
                        }
                    },
                )));
            }
        }

        if enabled.replication_enabled {
            for group in &self.ecosystem.psp().consumer_replica_groups {
                let pipeline = self.clone();
                let name = group.name.clone();
                loops.push(tokio::spawn(run_cron(
                    name.clone(),
                    group.trigger.clone(),
                    shutdown.clone(),
                    move |_| {
                        let pipeline = pipeline.clone();
                        let name = name.clone();
                        async move {
                            if let Err(e) = pipeline.dispatcher.replicate(&name).await {
                                error!(group = %name, kind = e.kind(), error = %e, "Replication failed");
                            }
                        }
                    },
                )));
            }
        }

        if enabled.transformers_enabled {
            for workspace in self.ecosystem.workspaces() {
                let Some(job) = &workspace.transformer else {
                    continue;
                };
                let pipeline = self.clone();
                let name = workspace.name.clone();
                loops.push(tokio::spawn(run_cron(
                    job.name.clone(),
                    job.trigger.clone(),
                    shutdown.clone(),
                    move |_| {
                        let pipeline = pipeline.clone();
                        let name = name.clone();
                        async move {
                            if let Err(e) = pipeline.runner.run(&name).await {
                                error!(workspace = %name, kind = e.kind(), error = %e, "Transformer failed");
                            }
                        }
                    },
                )));
            }
        }

        info!(loops = loops.len(), "Pipeline started");
        loops
    }
}
