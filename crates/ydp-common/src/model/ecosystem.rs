//! Ecosystem declaration
//!
//! The declarative description of sources, consumers and the platform service
//! provider that runs the pipeline. Loaded from YAML; never mutated by the
//! engine.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use super::schema::Dataset;
use super::trigger::CronTrigger;
use crate::error::{Result, YdpError};

// ============================================================================
// Containers and credentials
// ============================================================================

/// Database product behind a data container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerKind {
    Postgres,
    #[serde(rename = "sqlserver")]
    SqlServer,
    Oracle,
    Db2,
}

impl std::fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerKind::Postgres => write!(f, "postgres"),
            ContainerKind::SqlServer => write!(f, "sqlserver"),
            ContainerKind::Oracle => write!(f, "oracle"),
            ContainerKind::Db2 => write!(f, "db2"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataContainer {
    pub name: String,
    pub kind: ContainerKind,
    pub host_port: HostPort,
    pub database: String,
    #[serde(default)]
    pub locations: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CredentialType {
    UserPassword,
    ApiToken,
}

/// Opaque credential handle; resolved by an external secret store
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Credential {
    pub name: String,
    pub kind: CredentialType,
}

// ============================================================================
// Sources
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsistencyType {
    /// Each dataset is captured and committed on its own
    SingleDataset,
    /// All datasets of a capture commit together or not at all
    MultiDataset,
}

/// What a capture returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    /// Full table contents; absent keys are deletions
    #[default]
    Snapshot,
    /// Explicit upsert/delete signals
    ChangeSet,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureMetadata {
    pub container: DataContainer,
    pub trigger: CronTrigger,
    pub consistency: ConsistencyType,
    pub credential: Credential,
    #[serde(default)]
    pub mode: CaptureMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Datastore {
    pub name: String,
    #[serde(default)]
    pub documentation: Option<String>,
    /// Absent for datastores produced by a transformer
    #[serde(default)]
    pub capture: Option<CaptureMetadata>,
    pub datasets: Vec<Dataset>,
}

impl Datastore {
    pub fn dataset(&self, name: &str) -> Option<&Dataset> {
        self.datasets.iter().find(|d| d.name == name)
    }

    /// Consistency type; transformer outputs always commit as one unit
    pub fn consistency(&self) -> ConsistencyType {
        self.capture
            .as_ref()
            .map(|c| c.consistency)
            .unwrap_or(ConsistencyType::MultiDataset)
    }
}

// ============================================================================
// Consumers
// ============================================================================

/// Consumer retention requirement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataMilestoningStrategy {
    LiveOnly,
    Forensic,
}

impl std::fmt::Display for DataMilestoningStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataMilestoningStrategy::LiveOnly => write!(f, "LIVE_ONLY"),
            DataMilestoningStrategy::Forensic => write!(f, "FORENSIC"),
        }
    }
}

/// Latency class, ordered from tightest to loosest
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataLatency {
    Seconds,
    #[default]
    Minutes,
    Hours,
    Days,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConsumerRetentionRequirements {
    pub strategy: DataMilestoningStrategy,
    #[serde(default)]
    pub latency: DataLatency,
    #[serde(default)]
    pub regulator: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DatasetSink {
    pub datastore: String,
    pub dataset: String,
}

impl DatasetSink {
    pub fn new(datastore: impl Into<String>, dataset: impl Into<String>) -> Self {
        Self {
            datastore: datastore.into(),
            dataset: dataset.into(),
        }
    }
}

impl std::fmt::Display for DatasetSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.datastore, self.dataset)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetGroup {
    pub name: String,
    pub sinks: Vec<DatasetSink>,
    /// `None` routes to the provider's default (first declared) platform
    #[serde(default)]
    pub platform_chooser: Option<ConsumerRetentionRequirements>,
}

/// Transformer code reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CodeArtifact {
    /// SQL script with `{{input:group/store/dataset}}` and `{{output:dataset}}`
    /// placeholders
    Sql { script: String },
    /// Implementation registered with the engine under `name`
    Registered { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataTransformer {
    pub name: String,
    pub code: CodeArtifact,
    pub credential: Credential,
    pub trigger: CronTrigger,
    /// Output datastore; re-enters the pipeline as an ordinary source
    pub store: Datastore,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub name: String,
    #[serde(default)]
    pub documentation: Option<String>,
    pub dataset_groups: Vec<DatasetGroup>,
    #[serde(default)]
    pub transformer: Option<DataTransformer>,
}

impl Workspace {
    pub fn dataset_group(&self, name: &str) -> Option<&DatasetGroup> {
        self.dataset_groups.iter().find(|g| g.name == name)
    }

    /// Datastores referenced by any sink of this workspace
    pub fn consumed_datastores(&self) -> BTreeSet<&str> {
        self.dataset_groups
            .iter()
            .flat_map(|g| g.sinks.iter().map(|s| s.datastore.as_str()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    pub name: String,
    #[serde(default)]
    pub datastores: Vec<Datastore>,
    #[serde(default)]
    pub workspaces: Vec<Workspace>,
}

// ============================================================================
// Platform service provider
// ============================================================================

/// Merge-store milestoning policy of a data platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MilestoneStrategy {
    /// Live records only, overwritten in place
    #[serde(rename = "SCD1")]
    LiveOnly,
    /// Batch milestoned full history
    #[serde(rename = "SCD2")]
    BatchMilestoned,
}

impl std::fmt::Display for MilestoneStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MilestoneStrategy::LiveOnly => write!(f, "SCD1"),
            MilestoneStrategy::BatchMilestoned => write!(f, "SCD2"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPlatform {
    pub name: String,
    pub milestone_strategy: MilestoneStrategy,
    /// Tightest latency class the platform delivers
    #[serde(default)]
    pub latency: DataLatency,
    #[serde(default)]
    pub documentation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlacement {
    pub crg_name: String,
    pub dc_name: String,
}

/// Where a workspace's transformer physically runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformerHint {
    pub workspace_name: String,
    pub execution_placement: ExecutionPlacement,
    #[serde(default)]
    pub kv: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerReplicaGroup {
    pub name: String,
    pub data_containers: Vec<DataContainer>,
    pub workspace_names: BTreeSet<String>,
    pub trigger: CronTrigger,
    pub credential: Credential,
}

impl ConsumerReplicaGroup {
    pub fn container(&self, name: &str) -> Option<&DataContainer> {
        self.data_containers.iter().find(|c| c.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformServiceProvider {
    pub name: String,
    pub merge_container: DataContainer,
    pub merge_credential: Credential,
    pub data_platforms: Vec<DataPlatform>,
    #[serde(default)]
    pub consumer_replica_groups: Vec<ConsumerReplicaGroup>,
    #[serde(default)]
    pub hints: Vec<TransformerHint>,
}

impl PlatformServiceProvider {
    pub fn platform(&self, name: &str) -> Option<&DataPlatform> {
        self.data_platforms.iter().find(|p| p.name == name)
    }

    pub fn replica_group(&self, name: &str) -> Option<&ConsumerReplicaGroup> {
        self.consumer_replica_groups.iter().find(|g| g.name == name)
    }

    pub fn hint_for(&self, workspace: &str) -> Option<&TransformerHint> {
        self.hints.iter().find(|h| h.workspace_name == workspace)
    }
}

// ============================================================================
// Ecosystem
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ecosystem {
    pub name: String,
    pub teams: Vec<Team>,
    pub platform_service_provider: PlatformServiceProvider,
}

impl Ecosystem {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    pub fn psp(&self) -> &PlatformServiceProvider {
        &self.platform_service_provider
    }

    /// Declared source datastores followed by transformer outputs
    pub fn datastores(&self) -> impl Iterator<Item = &Datastore> {
        let declared = self.teams.iter().flat_map(|t| t.datastores.iter());
        let produced = self
            .workspaces()
            .filter_map(|w| w.transformer.as_ref().map(|t| &t.store));
        declared.chain(produced)
    }

    pub fn workspaces(&self) -> impl Iterator<Item = &Workspace> {
        self.teams.iter().flat_map(|t| t.workspaces.iter())
    }

    pub fn datastore(&self, name: &str) -> Result<&Datastore> {
        self.datastores()
            .find(|d| d.name == name)
            .ok_or_else(|| YdpError::DatastoreNotFound(name.to_string()))
    }

    pub fn dataset(&self, datastore: &str, dataset: &str) -> Result<&Dataset> {
        self.datastore(datastore)?
            .dataset(dataset)
            .ok_or_else(|| YdpError::DatasetNotFound {
                datastore: datastore.to_string(),
                dataset: dataset.to_string(),
            })
    }

    pub fn workspace(&self, name: &str) -> Result<&Workspace> {
        self.workspaces()
            .find(|w| w.name == name)
            .ok_or_else(|| YdpError::WorkspaceNotFound(name.to_string()))
    }

    /// Workspace whose transformer produces `datastore`, if any
    pub fn producer_of(&self, datastore: &str) -> Option<&Workspace> {
        self.workspaces().find(|w| {
            w.transformer
                .as_ref()
                .is_some_and(|t| t.store.name == datastore)
        })
    }

    /// Datastores some workspace consumes, in name order
    pub fn consumed_datastores(&self) -> BTreeSet<&str> {
        self.workspaces()
            .flat_map(|w| w.consumed_datastores())
            .collect()
    }
}
