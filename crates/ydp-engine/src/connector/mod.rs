//! Source connectors
//!
//! A connector reads one consistent capture of a datastore's tables. It never
//! writes anywhere; sequencing and merging belong to the scheduler and the
//! merge engine.

mod credentials;
mod memory;
mod postgres;

use async_trait::async_trait;
use thiserror::Error;

use ydp_common::model::Datastore;

use crate::records::DatasetChanges;

pub use credentials::{user_password, CredentialStore, EnvCredentialStore, Secret, StaticCredentialStore};
pub use memory::MemorySource;
pub use postgres::PostgresSnapshotConnector;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectorError {
    #[error("Source unreachable: {0}")]
    Unreachable(String),

    #[error("Credential rejected: {0}")]
    Auth(String),

    #[error("Source query failed: {0}")]
    Query(String),

    #[error("Unsupported capture: {0}")]
    Unsupported(String),
}

/// Reads consistent captures from a source datastore
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// Capture `datasets` of `store` at one point in time.
    ///
    /// All returned datasets must come from the same consistent read.
    async fn capture(
        &self,
        store: &Datastore,
        datasets: &[String],
    ) -> Result<Vec<DatasetChanges>, ConnectorError>;
}
