//! YDP Engine Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Milestoned change capture and multi-sink replication for the Yellow Data
//! Platform.
//!
//! # Overview
//!
//! - **Ingestion**: Cron-triggered captures of source datastores, one batch
//!   per data platform and stream
//! - **Merge**: Batches folded into the merge store as live (SCD1) or
//!   forensic (SCD2) history, committed atomically
//! - **Routing**: Each workspace's dataset groups bound to one platform and
//!   its milestoning view
//! - **Replication**: Committed history pushed to Postgres and SQL Server
//!   replica targets behind per-table watermarks
//! - **Transformers**: Workspace code whose output tables become the next
//!   batch of a derived datastore
//!
//! # Architecture
//!
//! Writes go through the [`merge::MergeEngine`]; operator reads go through
//! the query handlers in [`cqrs`]. Every external system sits behind a
//! trait ([`connector::SourceConnector`], [`replication::ReplicaTarget`],
//! [`merge::MergeStore`]) with an in-memory implementation for tests.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ydp_common::model::Ecosystem;
//! use ydp_engine::connector::MemorySource;
//! use ydp_engine::merge::MemoryMergeStore;
//! use ydp_engine::replication::MemoryTargetProvider;
//! use ydp_engine::Pipeline;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let ecosystem = Arc::new(Ecosystem::from_yaml_file("demos/yellow_starter.yaml")?);
//!     let pipeline = Pipeline::builder(ecosystem, Arc::new(MemoryMergeStore::new()))
//!         .connector(Arc::new(MemorySource::new()))
//!         .targets(Arc::new(MemoryTargetProvider::new()))
//!         .build()?;
//!
//!     pipeline.fire("Store1").await?;
//!     pipeline.replicate("SQLServer").await?;
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod cli;
pub mod config;
pub mod connector;
pub mod cqrs;
pub mod error;
pub mod merge;
pub mod pipeline;
pub mod records;
pub mod replication;
pub mod router;
pub mod scheduler;
pub mod transformer;

// Re-export commonly used types
pub use cli::{Cli, Commands};
pub use error::{PipelineError, Result};
pub use pipeline::Pipeline;
pub use scheduler::StreamRun;
