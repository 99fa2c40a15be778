//! Dataset router
//!
//! Binds each workspace dataset group to the data platform whose milestoning
//! strategy satisfies the group's retention requirement, and names the
//! physical table that view lives in. Resolution is pure; results are cached
//! per (workspace, group, platform set) until `invalidate`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use ydp_common::hash::hash_parts;
use ydp_common::model::{
    unsupported_replica_containers, ConsumerRetentionRequirements, DataMilestoningStrategy,
    DataPlatform, DatasetSink, Ecosystem, MilestoneStrategy,
};

use crate::error::{PipelineError, Result};

/// Which merge-store view a consumer reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MilestoningView {
    /// Current state only
    Live,
    /// Full batch-milestoned history
    Forensic,
}

impl From<MilestoneStrategy> for MilestoningView {
    fn from(strategy: MilestoneStrategy) -> Self {
        match strategy {
            MilestoneStrategy::LiveOnly => MilestoningView::Live,
            MilestoneStrategy::BatchMilestoned => MilestoningView::Forensic,
        }
    }
}

impl fmt::Display for MilestoningView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MilestoningView::Live => f.write_str("live"),
            MilestoningView::Forensic => f.write_str("forensic"),
        }
    }
}

/// One sink bound to a platform view and table
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResolvedSink {
    pub sink: DatasetSink,
    pub platform: String,
    pub view: MilestoningView,
    pub table: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub workspace: String,
    pub group: String,
    pub platform: String,
    pub view: MilestoningView,
    pub sinks: Vec<ResolvedSink>,
}

impl Resolution {
    pub fn sink(&self, datastore: &str, dataset: &str) -> Option<&ResolvedSink> {
        self.sinks
            .iter()
            .find(|s| s.sink.datastore == datastore && s.sink.dataset == dataset)
    }
}

/// Physical table of a dataset as materialised by `platform`
pub fn table_name(platform: &str, datastore: &str, dataset: &str) -> String {
    format!("{}_{}_{}", platform, datastore, dataset).to_lowercase()
}

fn satisfies(platform: &DataPlatform, requirement: &ConsumerRetentionRequirements) -> bool {
    let strategy_ok = match requirement.strategy {
        DataMilestoningStrategy::LiveOnly => platform.milestone_strategy == MilestoneStrategy::LiveOnly,
        DataMilestoningStrategy::Forensic => {
            platform.milestone_strategy == MilestoneStrategy::BatchMilestoned
        },
    };
    strategy_ok && platform.latency <= requirement.latency
}

/// Pick the platform for `requirement`: an exact strategy match that meets
/// the latency class, tightest first. No requirement means the first declared
/// platform.
pub fn choose_platform<'a>(
    platforms: &'a [DataPlatform],
    requirement: Option<&ConsumerRetentionRequirements>,
) -> Option<&'a DataPlatform> {
    match requirement {
        None => platforms.first(),
        Some(req) => platforms
            .iter()
            .filter(|p| satisfies(p, req))
            .min_by(|a, b| (a.latency, &a.name).cmp(&(b.latency, &b.name))),
    }
}

type CacheKey = (String, String, String);

pub struct DatasetRouter {
    ecosystem: Arc<Ecosystem>,
    platform_set: String,
    cache: Mutex<HashMap<CacheKey, Arc<Resolution>>>,
}

impl DatasetRouter {
    pub fn new(ecosystem: Arc<Ecosystem>) -> Self {
        let declared = serde_json::to_string(&ecosystem.psp().data_platforms).unwrap_or_default();
        let platform_set = hash_parts([declared.as_str()]);
        Self {
            ecosystem,
            platform_set,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn ecosystem(&self) -> &Arc<Ecosystem> {
        &self.ecosystem
    }

    /// Drop every cached resolution
    pub fn invalidate(&self) {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Resolve `group` of `workspace`
    pub fn resolve(&self, workspace: &str, group: &str) -> Result<Arc<Resolution>> {
        let key = (workspace.to_string(), group.to_string(), self.platform_set.clone());
        if let Some(hit) = self.cache.lock().unwrap_or_else(|e| e.into_inner()).get(&key) {
            return Ok(hit.clone());
        }

        let resolution = Arc::new(self.resolve_uncached(workspace, group)?);
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, resolution.clone());
        Ok(resolution)
    }

    fn resolve_uncached(&self, workspace: &str, group: &str) -> Result<Resolution> {
        let ws = self.ecosystem.workspace(workspace)?;
        let dsg = ws.dataset_group(group).ok_or_else(|| {
            PipelineError::Config(format!("workspace {} has no dataset group {}", workspace, group))
        })?;

        let platforms = &self.ecosystem.psp().data_platforms;
        let requirement = dsg.platform_chooser.as_ref();
        let platform = choose_platform(platforms, requirement).ok_or_else(|| {
            PipelineError::NoCompatiblePlatform {
                workspace: workspace.to_string(),
                group: group.to_string(),
                sink: dsg
                    .sinks
                    .first()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                required: requirement
                    .map(|r| format!("{} within {:?}", r.strategy, r.latency))
                    .unwrap_or_else(|| "any platform".to_string()),
            }
        })?;

        let view = MilestoningView::from(platform.milestone_strategy);
        let mut sinks = Vec::with_capacity(dsg.sinks.len());
        for sink in &dsg.sinks {
            self.ecosystem.dataset(&sink.datastore, &sink.dataset)?;
            sinks.push(ResolvedSink {
                sink: sink.clone(),
                platform: platform.name.clone(),
                view,
                table: table_name(&platform.name, &sink.datastore, &sink.dataset),
            });
        }

        Ok(Resolution {
            workspace: workspace.to_string(),
            group: group.to_string(),
            platform: platform.name.clone(),
            view,
            sinks,
        })
    }

    /// Resolve every group of every workspace
    pub fn resolve_all(&self) -> Vec<Result<Arc<Resolution>>> {
        self.ecosystem
            .workspaces()
            .flat_map(|w| w.dataset_groups.iter().map(move |g| (w.name.as_str(), g.name.as_str())))
            .map(|(w, g)| self.resolve(w, g))
            .collect()
    }

    /// Every configuration-time routing problem: unsatisfiable groups and
    /// replica containers without an adapter
    pub fn validate_all(&self) -> Vec<PipelineError> {
        let mut problems: Vec<PipelineError> =
            self.resolve_all().into_iter().filter_map(|r| r.err()).collect();

        for (group, container) in unsupported_replica_containers(&self.ecosystem) {
            problems.push(PipelineError::Config(format!(
                "replica group {} container {} is {}; no replica adapter exists for it",
                group, container.name, container.kind
            )));
        }
        problems
    }
}
