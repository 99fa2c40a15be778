//! Replication dispatcher
//!
//! `replicate(group)` brings every target of a consumer replica group up to
//! the merge store's last committed batch, one resolved dataset view at a
//! time. Each batch lands on a target together with that view's watermark, so
//! a crash or timeout mid-cycle is repaired by simply running again.
//!
//! Targets are independent: they run concurrently, may lag one another, and
//! an unreachable target only fails its own report.

use futures::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, instrument, warn};

use ydp_common::model::{ConsumerReplicaGroup, DataContainer, Dataset};

use super::target::{ReplicaTarget, RowOp, RowSet, TableSpec, TargetError, TargetProvider, WriteMode};
use crate::batch::StreamKey;
use crate::error::{PipelineError, Result};
use crate::merge::{ChangeEvent, ChangeEventKind, MergeStore};
use crate::router::{DatasetRouter, MilestoningView, ResolvedSink};

/// One view's catch-up on one target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewReport {
    pub table: String,
    pub platform: String,
    pub from: i64,
    pub to: i64,
    /// Rowsets that changed the target (including watermark-only ones)
    pub applied: usize,
}

#[derive(Debug)]
pub struct TargetReport {
    pub target: String,
    pub result: Result<Vec<ViewReport>>,
}

impl TargetReport {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Debug)]
pub enum ReplicateOutcome {
    Completed(Vec<TargetReport>),
    /// A previous cycle of the group is still running
    Skipped,
}

impl ReplicateOutcome {
    pub fn reports(&self) -> &[TargetReport] {
        match self {
            ReplicateOutcome::Completed(reports) => reports,
            ReplicateOutcome::Skipped => &[],
        }
    }

    pub fn report(&self, target: &str) -> Option<&TargetReport> {
        self.reports().iter().find(|r| r.target == target)
    }
}

/// A routed view with everything needed to replay it
#[derive(Debug, Clone)]
struct View {
    resolved: ResolvedSink,
    dataset: Dataset,
    stream: StreamKey,
}

impl View {
    fn spec(&self) -> TableSpec {
        let mode = match self.resolved.view {
            MilestoningView::Live => WriteMode::Upsert,
            MilestoningView::Forensic => WriteMode::AppendVersioned,
        };
        TableSpec::new(&self.resolved.table, &self.dataset.schema, mode)
    }
}

fn row_op(event: ChangeEvent) -> RowOp {
    match event.kind {
        ChangeEventKind::Upsert => RowOp::Upsert(event.row),
        ChangeEventKind::Delete => RowOp::Delete(event.row),
        ChangeEventKind::OpenVersion => RowOp::Open(event.row),
        ChangeEventKind::CloseVersion => RowOp::Close(event.row),
    }
}

/// Group ordered change events into one rowset per batch
fn rowsets(events: Vec<ChangeEvent>) -> Vec<RowSet> {
    let mut sets: Vec<RowSet> = Vec::new();
    for event in events {
        let batch = event.batch;
        match sets.last_mut() {
            Some(last) if last.batch == batch => last.ops.push(row_op(event)),
            _ => sets.push(RowSet::new(batch, vec![row_op(event)])),
        }
    }
    sets
}

pub struct ReplicationDispatcher {
    router: Arc<DatasetRouter>,
    store: Arc<dyn MergeStore>,
    targets: Arc<dyn TargetProvider>,
    timeout: Duration,
    running: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ReplicationDispatcher {
    pub fn new(
        router: Arc<DatasetRouter>,
        store: Arc<dyn MergeStore>,
        targets: Arc<dyn TargetProvider>,
        timeout: Duration,
    ) -> Self {
        Self {
            router,
            store,
            targets,
            timeout,
            running: Mutex::new(HashMap::new()),
        }
    }

    fn group_lock(&self, group: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        running.entry(group.to_string()).or_default().clone()
    }

    /// Views served by `group`, one per physical table
    fn views(&self, group: &ConsumerReplicaGroup) -> Result<Vec<View>> {
        let ecosystem = self.router.ecosystem();
        let mut by_table: BTreeMap<String, View> = BTreeMap::new();

        for ws_name in &group.workspace_names {
            let workspace = ecosystem.workspace(ws_name)?;
            for dsg in &workspace.dataset_groups {
                let resolution = match self.router.resolve(ws_name, &dsg.name) {
                    Ok(resolution) => resolution,
                    Err(e) => {
                        warn!(workspace = %ws_name, dataset_group = %dsg.name, error = %e, "Binding skipped");
                        continue;
                    },
                };
                for resolved in &resolution.sinks {
                    let store = ecosystem.datastore(&resolved.sink.datastore)?;
                    let dataset = ecosystem.dataset(&resolved.sink.datastore, &resolved.sink.dataset)?;
                    by_table.entry(resolved.table.clone()).or_insert_with(|| View {
                        resolved: resolved.clone(),
                        dataset: dataset.clone(),
                        stream: StreamKey::carrying(store, &resolved.sink.dataset),
                    });
                }
            }
        }

        Ok(by_table.into_values().collect())
    }

    /// Run one replication cycle for `group`
    #[instrument(skip(self))]
    pub async fn replicate(&self, group: &str) -> Result<ReplicateOutcome> {
        let crg = self
            .router
            .ecosystem()
            .psp()
            .replica_group(group)
            .ok_or_else(|| PipelineError::Config(format!("unknown consumer replica group {}", group)))?
            .clone();

        let lock = self.group_lock(group);
        let Ok(_running) = lock.try_lock() else {
            info!("Replication still running, trigger skipped");
            return Ok(ReplicateOutcome::Skipped);
        };

        let views = self.views(&crg)?;
        let cycles = crg
            .data_containers
            .iter()
            .map(|container| self.replicate_target(&crg, container, &views));
        let reports = join_all(cycles).await;

        let healthy = reports.iter().filter(|r| r.is_ok()).count();
        info!(
            targets = reports.len(),
            healthy,
            views = views.len(),
            "Replication cycle finished"
        );
        Ok(ReplicateOutcome::Completed(reports))
    }

    async fn replicate_target(
        &self,
        group: &ConsumerReplicaGroup,
        container: &DataContainer,
        views: &[View],
    ) -> TargetReport {
        let unavailable = |reason: String| PipelineError::ReplicationTargetUnavailable {
            group: group.name.clone(),
            target: container.name.clone(),
            reason,
        };

        let cycle = async {
            let target = self.targets.connect(container, &group.credential).await?;
            let mut reports = Vec::with_capacity(views.len());
            for view in views {
                reports.push(self.sync_view(target.as_ref(), view).await?);
            }
            Ok::<_, SyncError>(reports)
        };

        let result = match tokio::time::timeout(self.timeout, cycle).await {
            Ok(Ok(reports)) => Ok(reports),
            Ok(Err(SyncError::Target(e))) => {
                if matches!(e, TargetError::Unreachable(_)) {
                    self.targets.invalidate(&container.name);
                }
                Err(unavailable(e.to_string()))
            },
            Ok(Err(SyncError::Pipeline(e))) => Err(e),
            Err(_) => {
                self.targets.invalidate(&container.name);
                Err(unavailable(format!("cycle timed out after {:?}", self.timeout)))
            },
        };

        match &result {
            Ok(reports) => {
                let applied: usize = reports.iter().map(|r| r.applied).sum();
                info!(target = %container.name, applied, "Target caught up");
            },
            Err(e) => warn!(target = %container.name, kind = e.kind(), error = %e, "Target skipped until next trigger"),
        }

        TargetReport {
            target: container.name.clone(),
            result,
        }
    }

    async fn sync_view(&self, target: &dyn ReplicaTarget, view: &View) -> std::result::Result<ViewReport, SyncError> {
        let spec = view.spec();
        let platform = &view.resolved.platform;
        let sink = &view.resolved.sink;

        target.ensure_table(&spec).await?;
        let watermark = target.watermark(&spec.name).await?;
        let upto = self
            .store
            .last_committed(platform, &view.stream)
            .await
            .map_err(PipelineError::store(format!("{}/{}", platform, view.stream)))?;

        let mut report = ViewReport {
            table: spec.name.clone(),
            platform: platform.clone(),
            from: watermark,
            to: watermark,
            applied: 0,
        };
        if upto <= watermark {
            if upto < watermark {
                warn!(table = %spec.name, watermark, upto, "Target ahead of merge store, left untouched");
            }
            return Ok(report);
        }

        let events = self
            .store
            .changes_since(platform, &sink.datastore, &sink.dataset, watermark, upto)
            .await
            .map_err(PipelineError::store(format!("{}/{} change log", platform, sink)))?;

        let mut sets = rowsets(events);
        if sets.last().map_or(true, |last| last.batch < upto) {
            sets.push(RowSet::empty(upto));
        }

        for rows in &sets {
            if target.apply_rowset(&spec, rows).await? {
                report.applied += 1;
            }
            report.to = rows.batch;
        }

        Ok(report)
    }
}

/// Failure inside one target cycle
enum SyncError {
    Target(TargetError),
    Pipeline(PipelineError),
}

impl From<TargetError> for SyncError {
    fn from(e: TargetError) -> Self {
        SyncError::Target(e)
    }
}

impl From<PipelineError> for SyncError {
    fn from(e: PipelineError) -> Self {
        SyncError::Pipeline(e)
    }
}
