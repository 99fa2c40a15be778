//! Postgres snapshot connector
//!
//! Reads every requested table inside one `REPEATABLE READ, READ ONLY`
//! transaction, so a multi-dataset capture sees a single point in time. Values
//! are read as text and typed later against the declared schema.

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{Connection, Row as _};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

use ydp_common::model::{CaptureMode, ContainerKind, Datastore};

use super::credentials::{user_password, CredentialStore};
use super::{ConnectorError, SourceConnector};
use crate::records::{DatasetChanges, Row, Value};

pub struct PostgresSnapshotConnector {
    credentials: Arc<dyn CredentialStore>,
    connect_timeout: Duration,
}

impl PostgresSnapshotConnector {
    pub fn new(credentials: Arc<dyn CredentialStore>, connect_timeout: Duration) -> Self {
        Self {
            credentials,
            connect_timeout,
        }
    }
}

pub(crate) fn quote_pg(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Sort a sqlx failure into the connector taxonomy
pub(crate) fn classify(err: sqlx::Error) -> ConnectorError {
    match &err {
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some("28000") | Some("28P01") => ConnectorError::Auth(db.message().to_string()),
            _ => ConnectorError::Query(err.to_string()),
        },
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => ConnectorError::Unreachable(err.to_string()),
        _ => ConnectorError::Query(err.to_string()),
    }
}

async fn table_columns(conn: &mut PgConnection, table: &str) -> Result<Vec<String>, ConnectorError> {
    let columns: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT column_name::TEXT
        FROM information_schema.columns
        WHERE table_schema = current_schema() AND table_name = $1
        ORDER BY ordinal_position
        "#,
    )
    .bind(table)
    .fetch_all(&mut *conn)
    .await
    .map_err(classify)?;

    if columns.is_empty() {
        return Err(ConnectorError::Query(format!("table {} not found", table)));
    }
    Ok(columns)
}

async fn read_table(conn: &mut PgConnection, table: &str) -> Result<DatasetChanges, ConnectorError> {
    let columns = table_columns(conn, table).await?;
    let projection = columns
        .iter()
        .map(|c| format!("CAST({0} AS TEXT) AS {0}", quote_pg(c)))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!("SELECT {} FROM {}", projection, quote_pg(table));

    let rows = sqlx::query(&sql)
        .fetch_all(&mut *conn)
        .await
        .map_err(classify)?;

    let mut captured = Vec::with_capacity(rows.len());
    for pg_row in &rows {
        let mut row = Row::new();
        for (idx, column) in columns.iter().enumerate() {
            let text: Option<String> = pg_row.try_get(idx).map_err(classify)?;
            row.insert(column.clone(), text.map(Value::Text).unwrap_or(Value::Null));
        }
        captured.push(row);
    }

    let mut changes = DatasetChanges::snapshot(table, captured);
    changes.observed_columns = columns;
    Ok(changes)
}

#[async_trait]
impl SourceConnector for PostgresSnapshotConnector {
    #[instrument(skip_all, fields(datastore = %store.name))]
    async fn capture(
        &self,
        store: &Datastore,
        datasets: &[String],
    ) -> Result<Vec<DatasetChanges>, ConnectorError> {
        let capture = store
            .capture
            .as_ref()
            .ok_or_else(|| ConnectorError::Unsupported(format!("{} has no capture metadata", store.name)))?;
        if capture.container.kind != ContainerKind::Postgres {
            return Err(ConnectorError::Unsupported(format!(
                "{} source containers are not supported",
                capture.container.kind
            )));
        }
        if capture.mode == CaptureMode::ChangeSet {
            return Err(ConnectorError::Unsupported(
                "change-set capture needs a change feed; Postgres sources are snapshot only".to_string(),
            ));
        }

        let secret = self.credentials.resolve(&capture.credential)?;
        let (user, password) = user_password(&capture.credential, secret)?;
        let options = PgConnectOptions::new()
            .host(&capture.container.host_port.host)
            .port(capture.container.host_port.port)
            .database(&capture.container.database)
            .username(&user)
            .password(&password);

        let mut conn = tokio::time::timeout(self.connect_timeout, PgConnection::connect_with(&options))
            .await
            .map_err(|_| {
                ConnectorError::Unreachable(format!(
                    "connect to {} timed out after {:?}",
                    capture.container.name, self.connect_timeout
                ))
            })?
            .map_err(classify)?;

        let mut tx = conn.begin().await.map_err(classify)?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(classify)?;

        let mut captured = Vec::with_capacity(datasets.len());
        for name in datasets {
            let changes = read_table(&mut *tx, name).await?;
            debug!(dataset = %name, rows = changes.changes.len(), "Table captured");
            captured.push(changes);
        }

        tx.commit().await.map_err(classify)?;
        conn.close().await.map_err(classify)?;

        Ok(captured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_pg_escapes() {
        assert_eq!(quote_pg("customers"), "\"customers\"");
        assert_eq!(quote_pg("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_classify_io_as_unreachable() {
        let err = sqlx::Error::Io(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"));
        assert!(matches!(classify(err), ConnectorError::Unreachable(_)));
        assert!(matches!(classify(sqlx::Error::RowNotFound), ConnectorError::Query(_)));
    }
}
