//! Replication to consumer replica groups
//!
//! The dispatcher replays the merge-store change log above each target's
//! watermark. Targets speak through per-dialect adapters behind
//! [`ReplicaTarget`]; the dispatcher never sees SQL.

mod dialect;
mod dispatcher;
mod memory;
mod postgres;
mod sqlserver;
mod target;

use async_trait::async_trait;
use sqlx::postgres::PgConnectOptions;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ydp_common::model::{ContainerKind, Credential, DataContainer};

use crate::connector::{user_password, CredentialStore};

pub use dialect::{PostgresDialect, SqlDialect, SqlServerDialect, OPEN_VERSION, WATERMARK_TABLE};
pub use dispatcher::{ReplicateOutcome, ReplicationDispatcher, TargetReport, ViewReport};
pub use memory::{MemoryReplicaTarget, MemoryTargetProvider};
pub use postgres::PgReplicaTarget;
pub use sqlserver::SqlServerReplicaTarget;
pub use target::{
    ReplicaTarget, RowOp, RowSet, TableSpec, TargetError, TargetProvider, WriteMode, BATCH_IN_COLUMN,
    BATCH_OUT_COLUMN,
};

/// Connects Postgres and SQL Server containers, keeping one open target per
/// container
pub struct DatabaseTargetProvider {
    credentials: Arc<dyn CredentialStore>,
    connect_timeout: Duration,
    open: Mutex<HashMap<String, Arc<dyn ReplicaTarget>>>,
}

impl DatabaseTargetProvider {
    pub fn new(credentials: Arc<dyn CredentialStore>, connect_timeout: Duration) -> Self {
        Self {
            credentials,
            connect_timeout,
            open: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl TargetProvider for DatabaseTargetProvider {
    async fn connect(
        &self,
        container: &DataContainer,
        credential: &Credential,
    ) -> Result<Arc<dyn ReplicaTarget>, TargetError> {
        let cached = self
            .open
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&container.name)
            .cloned();
        if let Some(open) = cached {
            return Ok(open);
        }

        let secret = self
            .credentials
            .resolve(credential)
            .map_err(|e| TargetError::Auth(e.to_string()))?;
        let (user, password) = user_password(credential, secret).map_err(|e| TargetError::Auth(e.to_string()))?;

        let target: Arc<dyn ReplicaTarget> = match container.kind {
            ContainerKind::Postgres => {
                let options = PgConnectOptions::new()
                    .host(&container.host_port.host)
                    .port(container.host_port.port)
                    .database(&container.database)
                    .username(&user)
                    .password(&password);
                Arc::new(PgReplicaTarget::connect(&container.name, options, self.connect_timeout).await?)
            },
            ContainerKind::SqlServer => Arc::new(
                SqlServerReplicaTarget::connect(container, &user, &password, self.connect_timeout).await?,
            ),
            ContainerKind::Oracle | ContainerKind::Db2 => {
                return Err(TargetError::Unsupported(format!(
                    "{} container {} has no replica adapter",
                    container.kind, container.name
                )));
            },
        };

        self.open
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(container.name.clone(), target.clone());
        Ok(target)
    }

    fn invalidate(&self, container: &str) {
        self.open.lock().unwrap_or_else(|e| e.into_inner()).remove(container);
    }
}
