//! Common test utilities for YDP engine integration tests
//!
//! Most tests run the whole pipeline in-process over the starter ecosystem:
//! a scriptable [`MemorySource`], a [`MemoryMergeStore`] and in-memory replica
//! targets. Tests marked `#[ignore]` use a PostgreSQL testcontainer instead.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{customer, Harness};
//!
//! #[tokio::test]
//! async fn test_capture() {
//!     let h = Harness::starter();
//!     h.source.set_rows("Store1", "customers", vec![customer("1", "a@x.com")]);
//!     h.pipeline.fire("Store1").await.unwrap();
//! }
//! ```

#![allow(dead_code)]

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use testcontainers::{runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tracing::info;

use ydp_common::model::{Ecosystem, MilestoneStrategy};
use ydp_engine::config::TimeoutConfig;
use ydp_engine::connector::MemorySource;
use ydp_engine::merge::{MemoryMergeStore, MergeStore, VersionRecord};
use ydp_engine::records::Row;
use ydp_engine::replication::{MemoryReplicaTarget, MemoryTargetProvider};
use ydp_engine::transformer::TransformerRegistry;
use ydp_engine::Pipeline;

pub const LIVE: &str = "YellowLive";
pub const FORENSIC: &str = "YellowForensic";

/// Path of the starter ecosystem shipped with the repository
pub fn starter_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../demos/yellow_starter.yaml")
}

pub fn starter() -> Ecosystem {
    Ecosystem::from_yaml_file(starter_path()).expect("starter ecosystem loads")
}

/// A complete `customers` row of Store1
pub fn customer(id: &str, email: &str) -> Row {
    Row::new()
        .with("id", id)
        .with("firstname", "Ada")
        .with("lastname", "Lovelace")
        .with("dob", "1815-12-10")
        .with("email", email)
}

/// A complete `addresses` row of Store1
pub fn address(id: &str, customer: &str, city: &str) -> Row {
    Row::new()
        .with("id", id)
        .with("customerid", customer)
        .with("streetname", "1 Main St")
        .with("city", city)
}

/// Short deadlines so timeout paths finish quickly
pub fn fast_timeouts() -> TimeoutConfig {
    TimeoutConfig {
        capture_secs: 2,
        merge_secs: 2,
        replication_secs: 2,
        transformer_secs: 2,
    }
}

// ============================================================================
// In-process pipeline
// ============================================================================

pub struct Harness {
    pub pipeline: Arc<Pipeline>,
    pub source: Arc<MemorySource>,
    pub store: Arc<MemoryMergeStore>,
    pub targets: Arc<MemoryTargetProvider>,
}

impl Harness {
    pub fn starter() -> Self {
        Self::new(starter(), TransformerRegistry::new())
    }

    pub fn new(ecosystem: Ecosystem, registry: TransformerRegistry) -> Self {
        let source = Arc::new(MemorySource::new());
        let store = Arc::new(MemoryMergeStore::new());
        let targets = Arc::new(MemoryTargetProvider::new());

        let pipeline = Pipeline::builder(Arc::new(ecosystem), store.clone())
            .connector(source.clone())
            .targets(targets.clone())
            .registry(registry)
            .timeouts(fast_timeouts())
            .build()
            .expect("pipeline builds");

        Self {
            pipeline: Arc::new(pipeline),
            source,
            store,
            targets,
        }
    }

    /// Replica target for `container` of `group`, created on first use
    pub fn target(&self, group: &str, container: &str) -> Arc<MemoryReplicaTarget> {
        let dc = self
            .pipeline
            .ecosystem()
            .psp()
            .replica_group(group)
            .and_then(|g| g.container(container))
            .expect("container declared")
            .clone();
        self.targets.target(&dc)
    }

    pub async fn versions(&self, platform: &str, dataset: &str) -> Vec<VersionRecord> {
        self.store
            .versions(platform, "Store1", dataset)
            .await
            .expect("versions readable")
    }
}

/// Starter ecosystem with `Store1` restricted to one platform strategy
pub fn single_platform(strategy: MilestoneStrategy) -> Ecosystem {
    let mut eco = starter();
    eco.platform_service_provider
        .data_platforms
        .retain(|p| p.milestone_strategy == strategy);
    eco
}

// ============================================================================
// PostgreSQL Test Container
// ============================================================================

/// PostgreSQL container with the merge-store migrations applied
pub struct TestPostgres {
    _container: ContainerAsync<Postgres>,
    pool: PgPool,
    connection_string: String,
}

impl TestPostgres {
    pub async fn start() -> Result<Self> {
        info!("Starting PostgreSQL test container...");

        let container = Postgres::default()
            .with_tag("16-alpine")
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;

        let host = container.get_host().await.context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5432)
            .await
            .context("Failed to get container port")?;
        let connection_string = format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&connection_string)
            .await
            .context("Failed to connect to PostgreSQL")?;

        ydp_engine::merge::MIGRATOR
            .run(&pool)
            .await
            .context("Failed to run migrations")?;

        Ok(Self {
            _container: container,
            pool,
            connection_string,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }
}
