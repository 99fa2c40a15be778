//! SQL Server replica target (tiberius)
//!
//! One TDS connection per target, serialised behind a mutex. Parameters go
//! over the wire as NVARCHAR and are cast in SQL, matching the Postgres path.

use async_trait::async_trait;
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use tiberius::{AuthMethod, Client, ColumnData, Config, ToSql};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, instrument, warn};

use ydp_common::model::DataContainer;

use super::dialect::{SqlDialect, SqlServerDialect};
use super::target::{ReplicaTarget, RowOp, RowSet, RowStatements, TableSpec, TargetError};
use crate::records::{Row, Value};

/// Login failed
const LOGIN_FAILED: u32 = 18456;

type TdsClient = Client<Compat<TcpStream>>;

/// Text-or-NULL parameter
struct TextParam(Option<String>);

impl ToSql for TextParam {
    fn to_sql(&self) -> ColumnData<'_> {
        ColumnData::String(self.0.as_deref().map(Cow::Borrowed))
    }
}

fn param_refs(params: &[TextParam]) -> Vec<&dyn ToSql> {
    params.iter().map(|p| p as &dyn ToSql).collect()
}

fn classify(err: tiberius::error::Error) -> TargetError {
    match &err {
        tiberius::error::Error::Server(token) if token.code() == LOGIN_FAILED => {
            TargetError::Auth(token.message().to_string())
        },
        tiberius::error::Error::Io { .. }
        | tiberius::error::Error::Tls(_)
        | tiberius::error::Error::Routing { .. } => TargetError::Unreachable(err.to_string()),
        _ => TargetError::Statement(err.to_string()),
    }
}

pub struct SqlServerReplicaTarget {
    name: String,
    client: Arc<Mutex<TdsClient>>,
    dialect: SqlServerDialect,
}

impl SqlServerReplicaTarget {
    /// Connect with SQL authentication
    pub async fn connect(
        container: &DataContainer,
        user: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<Self, TargetError> {
        let mut config = Config::new();
        config.host(&container.host_port.host);
        config.port(container.host_port.port);
        config.database(&container.database);
        config.authentication(AuthMethod::sql_server(user, password));
        config.trust_cert();

        let client = tokio::time::timeout(timeout, async {
            let tcp = TcpStream::connect(config.get_addr())
                .await
                .map_err(|e| TargetError::Unreachable(e.to_string()))?;
            tcp.set_nodelay(true).ok();
            Client::connect(config, tcp.compat_write()).await.map_err(classify)
        })
        .await
        .map_err(|_| {
            TargetError::Unreachable(format!("connect to {} timed out after {:?}", container.name, timeout))
        })??;

        Ok(Self {
            name: container.name.clone(),
            client: Arc::new(Mutex::new(client)),
            dialect: SqlServerDialect,
        })
    }

    async fn run(client: &mut TdsClient, sql: &str, params: Vec<Option<String>>) -> Result<u64, TargetError> {
        let params: Vec<TextParam> = params.into_iter().map(TextParam).collect();
        let refs = param_refs(&params);
        let result = client.execute(sql, &refs).await.map_err(classify)?;
        Ok(result.total())
    }

    async fn batch(client: &mut TdsClient, sql: &str) -> Result<(), TargetError> {
        client
            .simple_query(sql)
            .await
            .map_err(classify)?
            .into_results()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn rollback(client: &mut TdsClient) {
        if let Err(e) = Self::batch(client, "IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION").await {
            warn!(error = %e, "Rollback failed");
        }
    }

    async fn read_watermark(client: &mut TdsClient, sql: &str, table: &str) -> Result<i64, TargetError> {
        let params = [TextParam(Some(table.to_string()))];
        let refs = param_refs(&params);
        let rows = client
            .query(sql, &refs)
            .await
            .map_err(classify)?
            .into_first_result()
            .await
            .map_err(classify)?;
        match rows.first() {
            Some(row) => Ok(row.try_get::<i64, _>(0).map_err(classify)?.unwrap_or(0)),
            None => Ok(0),
        }
    }

    async fn apply_locked(
        &self,
        client: &mut TdsClient,
        table: &TableSpec,
        rows: &RowSet,
    ) -> Result<bool, TargetError> {
        let current =
            Self::read_watermark(client, &self.dialect.select_watermark_for_update(), &table.name).await?;
        if current >= rows.batch {
            return Ok(false);
        }

        let statements = RowStatements::new(&self.dialect, table);
        for op in &rows.ops {
            let bound = statements.bind(rows.batch, op)?;
            Self::run(client, bound.sql, bound.params).await?;
        }
        Self::run(
            client,
            &self.dialect.upsert_watermark(),
            vec![Some(table.name.clone()), Some(rows.batch.to_string())],
        )
        .await?;
        Ok(true)
    }
}

#[async_trait]
impl ReplicaTarget for SqlServerReplicaTarget {
    fn name(&self) -> &str {
        &self.name
    }

    fn dialect(&self) -> &dyn SqlDialect {
        &self.dialect
    }

    async fn watermark(&self, table: &str) -> Result<i64, TargetError> {
        let mut client = self.client.lock().await;
        Self::batch(&mut client, &self.dialect.watermark_ddl()).await?;
        Self::read_watermark(&mut client, &self.dialect.select_watermark(), table).await
    }

    async fn ensure_table(&self, table: &TableSpec) -> Result<(), TargetError> {
        let mut client = self.client.lock().await;
        Self::batch(&mut client, &self.dialect.watermark_ddl()).await?;
        Self::batch(&mut client, &self.dialect.create_table(table)).await
    }

    #[instrument(skip_all, fields(target = %self.name, table = %table.name, batch = rows.batch))]
    async fn apply_rowset(&self, table: &TableSpec, rows: &RowSet) -> Result<bool, TargetError> {
        let mut client = self.client.lock().await;
        Self::batch(&mut client, "BEGIN TRANSACTION").await?;

        match self.apply_locked(&mut client, table, rows).await {
            Ok(true) => {
                Self::batch(&mut client, "COMMIT TRANSACTION").await?;
                debug!(ops = rows.ops.len(), "Rowset applied");
                Ok(true)
            },
            Ok(false) => {
                Self::batch(&mut client, "ROLLBACK TRANSACTION").await?;
                debug!("Batch already reflected");
                Ok(false)
            },
            Err(e) => {
                Self::rollback(&mut client).await;
                Err(e)
            },
        }
    }

    async fn write_rows(&self, table: &TableSpec, rows: &[Row]) -> Result<(), TargetError> {
        let statements = RowStatements::new(&self.dialect, table);
        let mut client = self.client.lock().await;
        Self::batch(&mut client, "BEGIN TRANSACTION").await?;

        let mut written = Ok(());
        for row in rows {
            written = match statements.bind(0, &RowOp::Upsert(row.clone())) {
                Ok(bound) => Self::run(&mut client, bound.sql, bound.params).await.map(|_| ()),
                Err(e) => Err(e),
            };
            if written.is_err() {
                break;
            }
        }

        match written {
            Ok(()) => Self::batch(&mut client, "COMMIT TRANSACTION").await,
            Err(e) => {
                Self::rollback(&mut client).await;
                Err(e)
            },
        }
    }

    async fn fetch_rows(&self, table: &str, columns: &[String]) -> Result<Vec<Row>, TargetError> {
        let mut client = self.client.lock().await;
        let rows = client
            .query(self.dialect.select_text(table, columns), &[])
            .await
            .map_err(classify)?
            .into_first_result()
            .await
            .map_err(classify)?;

        let mut fetched = Vec::with_capacity(rows.len());
        for tds_row in &rows {
            let mut row = Row::new();
            for (idx, column) in columns.iter().enumerate() {
                let text = tds_row.try_get::<&str, _>(idx).map_err(classify)?;
                row.insert(column.clone(), text.map(Value::text).unwrap_or(Value::Null));
            }
            fetched.push(row);
        }
        Ok(fetched)
    }

    async fn execute(&self, sql: &str) -> Result<(), TargetError> {
        let mut client = self.client.lock().await;
        Self::batch(&mut client, sql).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_param_binds_nvarchar_or_null() {
        assert!(matches!(
            TextParam(Some("a@x.com".to_string())).to_sql(),
            ColumnData::String(Some(s)) if s == "a@x.com"
        ));
        assert!(matches!(TextParam(None).to_sql(), ColumnData::String(None)));
    }

    #[test]
    fn test_io_failure_is_unreachable() {
        let err = tiberius::error::Error::Io {
            kind: std::io::ErrorKind::ConnectionRefused,
            message: "refused".to_string(),
        };
        assert!(matches!(classify(err), TargetError::Unreachable(_)));
    }
}
